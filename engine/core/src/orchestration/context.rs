//! Context Assembly
//!
//! Renders a [`CollectionReport`] into the text context handed to answer
//! backends.

use serde_json::Value;

use super::collector::{CollectionReport, FetchStatus};

/// Context used when no source produced usable data
pub const EMPTY_CONTEXT: &str = "No context data available from sources.";

/// Most headlines rendered per source
const MAX_HEADLINES: usize = 3;

/// Render usable results as `=== SOURCE ===` sections in request order
#[must_use]
pub fn build_context(report: &CollectionReport) -> String {
    let mut parts = Vec::new();

    for result in report.iter() {
        let Some(payload) = result.payload.as_ref() else {
            continue;
        };

        let marker = if result.status == FetchStatus::Degraded {
            " (cached)"
        } else {
            ""
        };
        parts.push(format!(
            "\n=== {}{marker} ===",
            result.source_id.to_uppercase()
        ));
        render_payload(payload, &mut parts);
    }

    if parts.is_empty() {
        EMPTY_CONTEXT.to_string()
    } else {
        parts.join("\n")
    }
}

/// Render the fields known sources report; anything else as compact JSON
fn render_payload(payload: &Value, parts: &mut Vec<String>) {
    let first = parts.len();

    if let Some(summary) = payload.get("summary") {
        parts.push(display(summary));
    }
    if let Some(data) = payload.get("data").and_then(Value::as_object) {
        parts.extend(data.iter().map(|(key, value)| format!("{key}: {}", display(value))));
    }
    if let Some(price) = payload.get("price") {
        parts.push(format!("Price: {}", display(price)));
        if let Some(change) = payload.get("change") {
            parts.push(format!("Change: {}", display(change)));
        }
    }
    if let Some(forecast) = payload.get("forecast") {
        parts.push(format!("Weather: {}", display(forecast)));
    }
    if let Some(temperature) = payload.get("temperature") {
        parts.push(format!("Temperature: {}°C", display(temperature)));
    }
    if let Some(headlines) = payload.get("headlines").and_then(Value::as_array) {
        parts.push("Latest headlines:".to_string());
        parts.extend(
            headlines
                .iter()
                .take(MAX_HEADLINES)
                .map(|h| format!("- {}", display(h))),
        );
    }

    if parts.len() == first {
        parts.push(display(payload));
    }
}

/// Strings without quotes, everything else as JSON
fn display(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), str::to_string)
}
