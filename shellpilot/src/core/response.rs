//! Decoding of reasoning-backend responses into typed steps and verdicts.
//!
//! Backends emit free text. The JSON payload may be wrapped in a fenced code
//! block or preceded by `<think>` reasoning, so extraction is lenient while
//! validation against the embedded JSON Schemas is strict.

use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::types::{Step, ValidationOutcome};

const STEP_SCHEMA: &str = include_str!("../../schemas/step.schema.json");
const VALIDATION_SCHEMA: &str = include_str!("../../schemas/validation.schema.json");

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)\s*```").unwrap());

/// A backend response that does not carry the required structured fields.
#[derive(Debug, thiserror::Error)]
pub enum ResponseFormatError {
    #[error("{kind} response contains no JSON object: {preview:?}")]
    NoJson { kind: &'static str, preview: String },
    #[error("{kind} response is not valid JSON: {source}")]
    InvalidJson {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} response failed schema validation:\n- {}", .violations.join("\n- "))]
    Schema {
        kind: &'static str,
        violations: Vec<String>,
    },
}

/// Parse a planner response into a [`Step`].
pub fn parse_step(text: &str) -> Result<Step, ResponseFormatError> {
    decode("step", text, STEP_SCHEMA)
}

/// Parse a validator response into a [`ValidationOutcome`].
pub fn parse_validation(text: &str) -> Result<ValidationOutcome, ResponseFormatError> {
    let mut outcome: ValidationOutcome = decode("validation", text, VALIDATION_SCHEMA)?;
    if outcome
        .modification
        .as_deref()
        .is_some_and(|m| m.trim().is_empty())
    {
        outcome.modification = None;
    }
    Ok(outcome)
}

/// Pull the JSON object out of surrounding prose, fences, and `<think>` blocks.
pub fn extract_json(text: &str) -> Option<String> {
    let without_think = THINK_RE.replace_all(text, "");

    for caps in FENCE_RE.captures_iter(&without_think) {
        let body = caps.get(1).map_or("", |m| m.as_str()).trim();
        if body.starts_with('{') {
            return Some(body.to_string());
        }
    }

    let start = without_think.find('{')?;
    let end = without_think.rfind('}')?;
    (end > start).then(|| without_think[start..=end].to_string())
}

fn decode<T: DeserializeOwned>(
    kind: &'static str,
    text: &str,
    schema: &str,
) -> Result<T, ResponseFormatError> {
    let json = extract_json(text).ok_or_else(|| ResponseFormatError::NoJson {
        kind,
        preview: preview(text),
    })?;
    let mut value: Value = serde_json::from_str(&json)
        .map_err(|source| ResponseFormatError::InvalidJson { kind, source })?;

    let violations = schema_violations(&value, schema);
    if !violations.is_empty() {
        return Err(ResponseFormatError::Schema { kind, violations });
    }

    // Explicit nulls mean "not provided" so field defaults apply.
    if let Value::Object(map) = &mut value {
        map.retain(|_, v| !v.is_null());
    }
    serde_json::from_value(value)
        .map_err(|source| ResponseFormatError::InvalidJson { kind, source })
}

fn schema_violations(instance: &Value, schema_raw: &str) -> Vec<String> {
    let schema: Value = match serde_json::from_str(schema_raw) {
        Ok(schema) => schema,
        Err(err) => return vec![format!("embedded schema is invalid: {err}")],
    };
    let compiled = match jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
    {
        Ok(compiled) => compiled,
        Err(err) => return vec![format!("embedded schema failed to compile: {err}")],
    };
    compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
