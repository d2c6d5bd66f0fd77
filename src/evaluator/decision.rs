use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;

const REPLY_PREVIEW_CHARS: usize = 160;

/// A model reply that could not be reduced to a decision object.
///
/// Covers every failure in the envelope/decode pipeline: no JSON object in
/// the reply, invalid JSON, or a missing required field. Carries a truncated
/// preview of the raw reply for the failure reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unparseable {
    preview: String,
}

impl Unparseable {
    fn new(reply: &str) -> Self {
        Self {
            preview: preview(reply),
        }
    }

    pub fn preview(&self) -> &str {
        &self.preview
    }
}

impl fmt::Display for Unparseable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reply is not a decision object: {}", self.preview)
    }
}

impl std::error::Error for Unparseable {}

/// Stage-1 decision: is the story worth a full evaluation?
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ScreeningDecision {
    pub relevant: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Stage-2 decision against the user criteria.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EvaluationDecision {
    pub matches: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub analysis: Option<String>,
}

pub fn decode_screening(reply: &str) -> Result<ScreeningDecision, Unparseable> {
    decode(reply)
}

pub fn decode_evaluation(reply: &str) -> Result<EvaluationDecision, Unparseable> {
    decode(reply)
}

/// Lenient on the envelope, strict on the schema: models wrap JSON in prose
/// or code fences routinely, so the object is carved out of the reply before
/// the typed decode. Unknown extra fields pass; a missing required field
/// does not.
fn decode<T: DeserializeOwned>(reply: &str) -> Result<T, Unparseable> {
    let object = extract_object(reply).ok_or_else(|| Unparseable::new(reply))?;
    serde_json::from_str(object).map_err(|_| Unparseable::new(reply))
}

fn extract_object(reply: &str) -> Option<&str> {
    let stripped = strip_fences(reply.trim());
    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&stripped[start..=end])
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Opening fences may carry a language tag on the same line.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    body.trim().strip_suffix("```").unwrap_or(body).trim()
}

fn preview(reply: &str) -> String {
    let flattened = reply.split_whitespace().collect::<Vec<_>>().join(" ");
    match flattened.char_indices().nth(REPLY_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &flattened[..cut]),
        None => flattened,
    }
}
