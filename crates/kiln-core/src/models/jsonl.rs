//! Batch input validation
//!
//! Scans a JSONL input line-by-line. A single bad line rejects the whole
//! file with its index; the same per-line check is reused by the worker
//! when translating lines into engine requests.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::wire::BatchRequestLine;

const SUPPORTED_METHOD: &str = "POST";
const SUPPORTED_URL: &str = "/v1/chat/completions";
const ROLES: [&str; 3] = ["system", "user", "assistant"];

/// Summary of a validated input file
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedInput {
    pub total_requests: usize,
    /// The single model shared by every line
    pub model: String,
}

/// Parse and validate one input line. `index` is zero-based and only used
/// for error messages.
pub fn parse_line(index: usize, raw: &str) -> Result<BatchRequestLine> {
    let line: BatchRequestLine = serde_json::from_str(raw)
        .map_err(|e| Error::validation(format!("line {}: invalid JSON: {}", index, e)))?;

    if line.custom_id.trim().is_empty() {
        return Err(Error::validation(format!("line {}: custom_id must be non-empty", index)));
    }
    if line.method != SUPPORTED_METHOD {
        return Err(Error::validation(format!(
            "line {}: method must be {}, got {}",
            index, SUPPORTED_METHOD, line.method
        )));
    }
    if line.url != SUPPORTED_URL {
        return Err(Error::validation(format!(
            "line {}: url must be {}, got {}",
            index, SUPPORTED_URL, line.url
        )));
    }
    if line.body.model.trim().is_empty() {
        return Err(Error::validation(format!("line {}: body.model must be non-empty", index)));
    }
    if line.body.messages.is_empty() {
        return Err(Error::validation(format!("line {}: body.messages must be non-empty", index)));
    }
    for (mi, msg) in line.body.messages.iter().enumerate() {
        if !ROLES.contains(&msg.role.as_str()) {
            return Err(Error::validation(format!(
                "line {}: messages[{}].role must be one of system|user|assistant",
                index, mi
            )));
        }
        if msg.content.is_empty() {
            return Err(Error::validation(format!(
                "line {}: messages[{}].content must be non-empty",
                index, mi
            )));
        }
    }

    Ok(line)
}

/// Incremental input validator: feed lines as they stream in, then
/// `finish()`. Enforces, beyond the per-line schema: at least one line,
/// unique `custom_id`s, and a single `body.model` across all lines.
#[derive(Debug, Default)]
pub struct Validator {
    seen_ids: HashSet<String>,
    model: Option<String>,
    index: usize,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, raw: &str) -> Result<()> {
        let index = self.index;
        if raw.trim().is_empty() {
            return Err(Error::validation(format!("line {}: empty line", index)));
        }
        let line = parse_line(index, raw)?;

        if !self.seen_ids.insert(line.custom_id.clone()) {
            return Err(Error::DuplicateCustomId(format!(
                "line {}: custom_id {:?} already used",
                index, line.custom_id
            )));
        }

        match &self.model {
            None => self.model = Some(line.body.model.clone()),
            Some(m) if *m != line.body.model => {
                return Err(Error::ModelMismatch(format!(
                    "line {}: model {:?} differs from {:?}",
                    index, line.body.model, m
                )));
            }
            Some(_) => {}
        }

        self.index += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<ValidatedInput> {
        let model = self.model.ok_or_else(|| Error::validation("input file has no lines"))?;
        Ok(ValidatedInput { total_requests: self.index, model })
    }
}

/// Validate a whole in-memory input file.
pub fn validate_input(content: &str) -> Result<ValidatedInput> {
    let mut validator = Validator::new();
    for raw in content.lines() {
        validator.push_line(raw)?;
    }
    validator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(custom_id: &str, model: &str) -> String {
        format!(
            r#"{{"custom_id":"{}","method":"POST","url":"/v1/chat/completions","body":{{"model":"{}","messages":[{{"role":"user","content":"hi"}}]}}}}"#,
            custom_id, model
        )
    }

    #[test]
    fn test_valid_file() {
        let content = format!("{}\n{}\n{}", line("a", "m1"), line("b", "m1"), line("c", "m1"));
        let v = validate_input(&content).unwrap();
        assert_eq!(v.total_requests, 3);
        assert_eq!(v.model, "m1");
    }

    #[test]
    fn test_empty_file_rejected() {
        let err = validate_input("").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_duplicate_custom_id() {
        let content = format!("{}\n{}", line("a", "m1"), line("a", "m1"));
        let err = validate_input(&content).unwrap_err();
        assert!(matches!(err, Error::DuplicateCustomId(_)));
    }

    #[test]
    fn test_model_mismatch() {
        let content = format!("{}\n{}", line("a", "m1"), line("b", "m2"));
        let err = validate_input(&content).unwrap_err();
        assert!(matches!(err, Error::ModelMismatch(_)));
    }

    #[test]
    fn test_bad_json_carries_line_index() {
        let content = format!("{}\nnot json", line("a", "m1"));
        let err = validate_input(&content).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_bad_role_rejected() {
        let raw = r#"{"custom_id":"a","method":"POST","url":"/v1/chat/completions","body":{"model":"m","messages":[{"role":"robot","content":"hi"}]}}"#;
        assert!(parse_line(0, raw).is_err());
    }

    #[test]
    fn test_wrong_url_rejected() {
        let raw = r#"{"custom_id":"a","method":"POST","url":"/v1/embeddings","body":{"model":"m","messages":[{"role":"user","content":"hi"}]}}"#;
        assert!(parse_line(0, raw).is_err());
    }
}
