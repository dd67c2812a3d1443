use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ExtractionKind;

/// Fields accepted as the title of a detail record.
const TITLE_FIELDS: &[&str] = &["title", "name", "headline", "judul"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(rename = "error")]
    pub message: String,
}

/// Validated output of a content extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtractionResult {
    Error(ErrorRecord),
    List(Vec<Value>),
    Detail(Map<String, Value>),
}

impl ExtractionResult {
    pub fn error(message: impl Into<String>) -> Self {
        ExtractionResult::Error(ErrorRecord {
            message: message.into(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExtractionResult::Error(_))
    }

    /// Title of a detail record, if any.
    pub fn title(&self) -> Option<&str> {
        match self {
            ExtractionResult::Detail(map) => title_of(map),
            _ => None,
        }
    }
}

/// Removes a Markdown code fence wrapping the whole reply, with or without
/// a language tag. Text that does not open with a fence is only trimmed.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the language tag on the opening line, if there is one.
    let body = match after_open.split_once('\n') {
        Some((tag, rest)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => rest,
        _ => after_open,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Slice from the first opening bracket of `open` to the last `close`.
pub(crate) fn bracketed_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn parse_lenient(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let body = strip_fences(trimmed);
    if let Ok(value) = serde_json::from_str(body) {
        return Some(value);
    }
    let object = bracketed_span(body, '{', '}');
    let array = bracketed_span(body, '[', ']');
    // Prefer whichever span starts first; it is the outermost value.
    let mut candidates: Vec<&str> = [object, array].into_iter().flatten().collect();
    candidates.sort_by_key(|span| span.as_ptr() as usize);
    candidates
        .into_iter()
        .find_map(|span| serde_json::from_str(span).ok())
}

fn title_of(map: &Map<String, Value>) -> Option<&str> {
    TITLE_FIELDS
        .iter()
        .filter_map(|field| map.get(*field))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|t| !t.is_empty())
}

/// Validates raw extraction output. Never fails; any structural problem
/// becomes an `ErrorRecord`.
pub fn normalize(raw: &str, kind: ExtractionKind) -> ExtractionResult {
    let Some(value) = parse_lenient(raw) else {
        tracing::warn!(kind = ?kind, "extraction output is not JSON");
        return ExtractionResult::error("extraction output is not valid JSON");
    };

    if let Value::Object(ref map) = value {
        if let Some(err) = map.get("error").filter(|e| !e.is_null()) {
            let message = err
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| err.to_string());
            return ExtractionResult::error(message);
        }
    }

    match (kind, value) {
        (ExtractionKind::Detail, Value::Object(map)) => {
            if title_of(&map).is_some() {
                ExtractionResult::Detail(map)
            } else {
                ExtractionResult::error("detail record has no title")
            }
        }
        (ExtractionKind::Detail, _) => ExtractionResult::error("detail record must be a JSON object"),
        (ExtractionKind::List, Value::Array(items)) => ExtractionResult::List(items),
        (ExtractionKind::List, _) => ExtractionResult::error("list extraction must be a JSON array"),
    }
}
