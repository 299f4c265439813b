//! Webhook delivery handler
//!
//! POSTs a `batch.completed` payload to the configured URL, signing the raw
//! body with HMAC-SHA-256. 2xx is delivered; 408/429/5xx retry; anything
//! else is permanent.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use kiln_core::models::wire::{RequestCounts, WebhookPayload};

use super::{HandlerContext, HandlerOutcome, ResultHandler};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

pub struct WebhookHandler {
    url: String,
    secret: String,
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(url: String, secret: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { url, secret, client }
    }

    /// Hex HMAC-SHA-256 of the raw request body.
    pub fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn payload(ctx: &HandlerContext<'_>) -> WebhookPayload {
        WebhookPayload {
            event: "batch.completed".to_string(),
            batch_id: ctx.job.id.clone(),
            output_file_id: ctx.output_file_id.to_string(),
            error_file_id: ctx.error_file_id.map(|s| s.to_string()),
            counts: RequestCounts {
                total: ctx.job.total_requests,
                completed: ctx.job.completed_requests,
                failed: ctx.job.failed_requests,
            },
            metadata: ctx.metadata.clone(),
        }
    }
}

#[async_trait]
impl ResultHandler for WebhookHandler {
    fn name(&self) -> &'static str {
        "webhook"
    }

    /// Clients can opt a single batch out via metadata.
    fn enabled(&self, metadata: &std::collections::HashMap<String, String>) -> bool {
        metadata.get("webhook").map(|v| v != "off").unwrap_or(true)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> HandlerOutcome {
        let payload = Self::payload(ctx);
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => return HandlerOutcome::Permanent(format!("payload encoding: {}", e)),
        };
        let signature = Self::sign(&self.secret, &body);

        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            // Timeouts and connection errors are worth another attempt
            Err(e) => return HandlerOutcome::Retryable(format!("request: {}", e)),
        };

        let status = resp.status();
        if status.is_success() {
            HandlerOutcome::Ok
        } else if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            HandlerOutcome::Retryable(format!("HTTP {}", status))
        } else {
            HandlerOutcome::Permanent(format!("HTTP {}", status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_hex() {
        let sig = WebhookHandler::sign("secret", b"{\"event\":\"batch.completed\"}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // Same input, same signature; retries carry identical payloads
        assert_eq!(sig, WebhookHandler::sign("secret", b"{\"event\":\"batch.completed\"}"));
        assert_ne!(sig, WebhookHandler::sign("other", b"{\"event\":\"batch.completed\"}"));
    }

    #[test]
    fn test_metadata_opt_out() {
        let h = WebhookHandler::new("http://x".into(), "s".into(), Duration::from_secs(1));
        let mut meta = std::collections::HashMap::new();
        assert!(h.enabled(&meta));
        meta.insert("webhook".to_string(), "off".to_string());
        assert!(!h.enabled(&meta));
    }
}
