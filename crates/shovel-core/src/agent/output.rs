//! Extraction of the artifact object from the agent's final message.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static TAGGED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<SHOVEL_OUTPUT_JSON>\s*```(?:json)?\s*(\{.*?\})\s*```\s*</SHOVEL_OUTPUT_JSON>")
        .expect("static regex")
});

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```json\s*(\{.*?\})\s*```").expect("static regex"));

/// Pull the first JSON object out of `text`.
///
/// Tried in order: the tagged block, the first ```` ```json ```` fence, the
/// whole text, then a scan for the first `{` that starts a complete object.
/// Anything that parses but is not an object is ignored.
pub fn parse_output(text: &str) -> Option<Value> {
    let as_object = |candidate: &str| match serde_json::from_str::<Value>(candidate) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    };

    if let Some(found) = TAGGED_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| as_object(m.as_str()))
    {
        return Some(found);
    }

    if let Some(found) = FENCED_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| as_object(m.as_str()))
    {
        return Some(found);
    }

    if let Some(found) = as_object(text.trim()) {
        return Some(found);
    }

    for (idx, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(v @ Value::Object(_))) = stream.next() {
            return Some(v);
        }
    }

    None
}
