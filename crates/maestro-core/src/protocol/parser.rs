//! Envelope extraction for the orchestrator response protocol.
//!
//! Implements a tolerant reader: free text around the markers is kept but
//! ignored, and no input ever produces an error. Every call resolves to one
//! of "not found", "found and valid" or "found but invalid".

use serde_json::Value;
use tracing::debug;

use super::types::{KNOWN_PHASES, ParsedResponse, PhaseData};
use super::validate::validate;

/// Opening marker of an envelope.
pub const START_MARKER: &str = "<<<MAESTRO_RESPONSE>>>";
/// Closing marker of an envelope.
pub const END_MARKER: &str = "<<<END_MAESTRO_RESPONSE>>>";

/// Parse the first envelope in `text`.
pub fn parse(text: &str) -> ParsedResponse {
    match locate(text, 0) {
        Some(span) => decode_span(text, &span),
        None => ParsedResponse::not_found(text),
    }
}

/// Parse every envelope in `text`, in document order.
///
/// `text_before` of each result holds the text between the previous
/// envelope (or the start) and this one; `text_after` holds the text up to
/// the next envelope (or the end).
pub fn parse_multiple(text: &str) -> Vec<ParsedResponse> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(span) = locate(text, cursor) {
        cursor = span.end;
        spans.push(span);
    }

    let mut results = Vec::with_capacity(spans.len());
    for (i, span) in spans.iter().enumerate() {
        let mut parsed = decode_span(text, span);
        let prev_end = if i == 0 { 0 } else { spans[i - 1].end };
        let next_start = spans.get(i + 1).map_or(text.len(), |s| s.start);
        parsed.text_before = text[prev_end..span.start].to_string();
        parsed.text_after = text[span.end..next_start].to_string();
        results.push(parsed);
    }
    results
}

/// Whether `text` contains at least one complete envelope.
pub fn has_envelope(text: &str) -> bool {
    locate(text, 0).is_some()
}

/// Wrap a payload in markers; used when composing example prompts.
pub fn wrap(data: &PhaseData) -> String {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    format!("{START_MARKER}\n{json}\n{END_MARKER}")
}

/// Byte offsets of one envelope: `start..end` spans both markers,
/// `body_start..body_end` the payload between them.
struct Span {
    start: usize,
    body_start: usize,
    body_end: usize,
    end: usize,
}

fn locate(text: &str, from: usize) -> Option<Span> {
    let start = from + text.get(from..)?.find(START_MARKER)?;
    let body_start = start + START_MARKER.len();
    let body_end = body_start + text[body_start..].find(END_MARKER)?;
    Some(Span {
        start,
        body_start,
        body_end,
        end: body_end + END_MARKER.len(),
    })
}

fn decode_span(text: &str, span: &Span) -> ParsedResponse {
    let raw = strip_code_fence(text[span.body_start..span.body_end].trim());
    let mut parsed = ParsedResponse {
        found: true,
        raw: Some(raw.to_string()),
        text_before: text[..span.start].to_string(),
        text_after: text[span.end..].to_string(),
        ..ParsedResponse::default()
    };

    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Envelope payload is not valid JSON");
            parsed.error = Some(format!("payload is not valid JSON: {e}"));
            return parsed;
        }
    };

    let Some(phase) = value
        .get("phase")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        parsed.error = Some("payload is missing a string 'phase' field".to_string());
        return parsed;
    };
    parsed.phase = Some(phase.clone());

    if !value.get("data").is_some_and(Value::is_object) {
        parsed.error = Some("payload is missing a 'data' object".to_string());
        return parsed;
    }
    if !KNOWN_PHASES.contains(&phase.as_str()) {
        parsed.error = Some(format!("unknown phase '{phase}'"));
        return parsed;
    }

    match serde_json::from_value::<PhaseData>(value) {
        Ok(data) => {
            parsed.violations = validate(&data);
            parsed.data = Some(data);
        }
        Err(e) => {
            debug!(phase = %phase, error = %e, "Envelope data does not match phase schema");
            parsed.error = Some(format!("'{phase}' data does not match schema: {e}"));
        }
    }
    parsed
}

/// Agents frequently wrap the JSON in a markdown fence inside the markers.
fn strip_code_fence(body: &str) -> &str {
    let Some(rest) = body.strip_prefix("```") else {
        return body;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
