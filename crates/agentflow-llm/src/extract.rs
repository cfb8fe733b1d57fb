// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Structured-output extraction from model text.

use agentflow_core::schema::OutputFormat;
use serde_json::Value;

/// Strip Markdown code fences around a JSON payload.
///
/// Models frequently wrap JSON in ```` ```json … ``` ```` even when
/// instructed otherwise.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();

    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Skip the optional language tag on the opening fence line.
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };

    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}

/// Locate and parse the first JSON object embedded in model text.
pub fn find_json_object(text: &str) -> Option<Value> {
    let cleaned = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        if value.is_object() {
            return Some(value);
        }
    }

    // Fall back to the outermost brace span.
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str::<Value>(&cleaned[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Parse model text into the declared schema. Returns `None` when no
/// JSON object can be located; field coercion itself never fails.
pub fn parse_structured(text: &str, schema: &OutputFormat) -> Option<Value> {
    find_json_object(text).map(|raw| schema.project(&raw))
}

/// Prompt suffix demanding the declared JSON shape.
pub fn schema_instruction(schema: &OutputFormat) -> String {
    format!(
        "\n\nRespond with a single JSON object of exactly this shape, no other text:\n{}",
        schema.shape_description()
    )
}

/// Reinforced instruction used for the one re-prompt after a parse
/// failure.
pub fn strict_reminder(schema: &OutputFormat) -> String {
    format!(
        "Your previous response could not be parsed. Return strictly the following JSON shape and nothing else:\n{}",
        schema.shape_description()
    )
}
