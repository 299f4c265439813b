//! Downstream-import handler
//!
//! Streams batch results into an external task store. Each pushed item
//! carries its `(batch_id, custom_id)` key so the receiving side can upsert;
//! replaying a delivery is harmless.

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use kiln_core::models::wire::BatchResultLine;

use super::{HandlerContext, HandlerOutcome, ResultHandler};

/// Results pushed per request to the task store.
const PAGE_SIZE: usize = 100;

#[derive(Debug, Serialize)]
struct ImportItem<'a> {
    batch_id: &'a str,
    custom_id: String,
    result: BatchResultLine,
}

#[derive(Debug, Serialize)]
struct ImportPage<'a> {
    items: Vec<ImportItem<'a>>,
}

pub struct ImportHandler {
    base_url: String,
    client: reqwest::Client,
}

impl ImportHandler {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base_url, client }
    }

    async fn push_page(&self, page: &ImportPage<'_>) -> HandlerOutcome {
        let url = format!("{}/v1/import", self.base_url.trim_end_matches('/'));
        let resp = match self.client.post(&url).json(page).send().await {
            Ok(r) => r,
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

#[async_trait]
impl ResultHandler for ImportHandler {
    fn name(&self) -> &'static str {
        "downstream_import"
    }

    fn enabled(&self, metadata: &std::collections::HashMap<String, String>) -> bool {
        metadata.get("import").map(|v| v != "off").unwrap_or(true)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>) -> HandlerOutcome {
        let reader = match ctx.blobs.open_reader(ctx.output_blob_ref).await {
            Ok(r) => r,
            Err(e) => return HandlerOutcome::Permanent(format!("output blob: {}", e)),
        };
        let mut lines = BufReader::new(reader).lines();

        let mut page: Vec<ImportItem<'_>> = Vec::with_capacity(PAGE_SIZE);
        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    let result: BatchResultLine = match serde_json::from_str(&raw) {
                        Ok(r) => r,
                        Err(e) => return HandlerOutcome::Permanent(format!("output parse: {}", e)),
                    };
                    page.push(ImportItem {
                        batch_id: &ctx.job.id,
                        custom_id: result.custom_id.clone(),
                        result,
                    });
                    if page.len() == PAGE_SIZE {
                        let outcome =
                            self.push_page(&ImportPage { items: std::mem::take(&mut page) }).await;
                        if outcome != HandlerOutcome::Ok {
                            return outcome;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return HandlerOutcome::Permanent(format!("output read: {}", e)),
            }
        }

        if !page.is_empty() {
            let outcome = self.push_page(&ImportPage { items: page }).await;
            if outcome != HandlerOutcome::Ok {
                return outcome;
            }
        }

        HandlerOutcome::Ok
    }
}
