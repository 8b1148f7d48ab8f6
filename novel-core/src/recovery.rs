//! Recovery of structured data from free-form model output.
//!
//! Generated text is never trusted to be valid JSON on the first pass. The
//! recovery chain tries a fixed sequence of strategies, each more permissive
//! than the last, and stops at the first one that parses:
//!
//! 1. [`Strategy::Direct`]: parse the raw text.
//! 2. [`Strategy::Unwrapped`]: strip a fenced block, or slice from the first
//!    `{`/`[` to the last matching closer.
//! 3. [`Strategy::Sanitized`]: escape raw control characters and stray quotes
//!    inside strings.
//! 4. [`Strategy::CommaRepaired`]: insert separators missing between values
//!    that sit on consecutive lines.
//! 5. [`Strategy::Combined`]: comma repair followed by sanitizing.
//!
//! Every function here is pure and synchronous. Nothing panics; exhausting
//! the chain yields a [`RecoveryFailure`].

use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

lazy_static! {
    static ref THINK_BLOCK: Regex = Regex::new(r"(?s)<think>.*?</think>").expect("valid regex");
    // The language tag may run straight into the payload: ```json{...}```
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```[A-Za-z0-9_+-]*\s*(.*?)```").expect("valid regex");
    static ref MISSING_COMMA: Regex =
        Regex::new(r#"(["}\]]|\d|true|false|null)[ \t\r]*\n\s*(["{\[])"#).expect("valid regex");
}

/// Which step of the recovery chain produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    Unwrapped,
    Sanitized,
    CommaRepaired,
    Combined,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Unwrapped => "unwrapped",
            Strategy::Sanitized => "sanitized",
            Strategy::CommaRepaired => "comma_repaired",
            Strategy::Combined => "combined",
        }
    }

    /// Whether the value came out of the heuristic comma repair, which can
    /// alter string contents in rare cases.
    pub fn is_heuristic(&self) -> bool {
        matches!(self, Strategy::CommaRepaired | Strategy::Combined)
    }
}

/// A successfully recovered value.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub value: Value,
    pub strategy: Strategy,
}

/// Why recovery gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Nothing but whitespace (or reasoning blocks) was returned.
    Empty,
    /// The structure was cut off, most likely by a token limit.
    Truncated,
    /// The structure is complete but could not be repaired.
    Malformed,
    /// The value parsed but does not have the expected shape.
    Shape,
}

/// All recovery strategies were exhausted.
#[derive(Debug, Clone, Error)]
#[error("structured output recovery failed ({kind:?}): {detail}")]
pub struct RecoveryFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl RecoveryFailure {
    fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// The output was cut short; retrying with a larger token budget may help.
    pub fn is_truncation(&self) -> bool {
        self.kind == FailureKind::Truncated
    }
}

/// Recover a JSON value from raw model output.
pub fn recover(raw: &str) -> Result<Recovered, RecoveryFailure> {
    if raw.trim().is_empty() {
        return Err(RecoveryFailure::new(FailureKind::Empty, "empty output"));
    }

    let mut last_error = match serde_json::from_str::<Value>(raw) {
        Ok(value) => return Ok(found(value, Strategy::Direct)),
        Err(e) => e.to_string(),
    };

    let unwrapped = unwrap_fenced(raw);
    if unwrapped.is_empty() {
        return Err(RecoveryFailure::new(FailureKind::Empty, "no content after unwrapping"));
    }

    let sanitized = sanitize(&unwrapped);
    let comma_repaired = repair_missing_commas(&sanitized);
    let combined = sanitize(&repair_missing_commas(&unwrapped));
    let chain = [
        (Strategy::Unwrapped, &unwrapped),
        (Strategy::Sanitized, &sanitized),
        (Strategy::CommaRepaired, &comma_repaired),
        (Strategy::Combined, &combined),
    ];

    for (strategy, text) in chain {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => return Ok(found(value, strategy)),
            Err(e) => last_error = e.to_string(),
        }
    }

    let kind = if is_structurally_complete(raw) {
        FailureKind::Malformed
    } else {
        FailureKind::Truncated
    };
    debug!(?kind, error = %last_error, "all recovery strategies exhausted");
    Err(RecoveryFailure::new(kind, last_error))
}

/// Recover and deserialize into a typed payload.
///
/// Payload types are expected to mark optional fields with `#[serde(default)]`
/// so a partially filled object still yields a value.
pub fn recover_as<T: DeserializeOwned>(raw: &str) -> Result<T, RecoveryFailure> {
    let recovered = recover(raw)?;
    serde_json::from_value(recovered.value)
        .map_err(|e| RecoveryFailure::new(FailureKind::Shape, e.to_string()))
}

fn found(value: Value, strategy: Strategy) -> Recovered {
    if strategy.is_heuristic() {
        warn!(
            strategy = strategy.name(),
            "structured output recovered only after comma repair"
        );
    } else if strategy != Strategy::Direct {
        debug!(strategy = strategy.name(), "structured output recovered");
    }
    Recovered { value, strategy }
}

/// Remove `<think>…</think>` reasoning blocks some models emit.
pub fn strip_reasoning(raw: &str) -> String {
    THINK_BLOCK.replace_all(raw, "").trim().to_string()
}

/// Extract the structured payload from surrounding prose.
///
/// A fenced block (with an optional language tag) wins when its body opens
/// with `{` or `[`. Otherwise the text is sliced from the first `{` or `[` to
/// the last matching closer. When neither applies the fenced body, or failing
/// that the trimmed text, is returned unchanged.
pub fn unwrap_fenced(raw: &str) -> String {
    let text = strip_reasoning(raw);

    let fenced = fenced_block(&text).filter(|inner| !inner.is_empty());
    if let Some(inner) = fenced {
        if opens_structure(inner) {
            return inner.to_string();
        }
    }

    let Some(start) = structure_start(&text) else {
        return fenced.unwrap_or(&text).to_string();
    };
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    match text.rfind(closer) {
        Some(end) if end > start => text[start..=end].trim().to_string(),
        _ => fenced.unwrap_or(&text).to_string(),
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    FENCED_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|body| body.as_str().trim())
}

fn opens_structure(text: &str) -> bool {
    text.starts_with(|c: char| c == '{' || c == '[')
}

fn structure_start(text: &str) -> Option<usize> {
    text.find(|c: char| c == '{' || c == '[')
}

/// Escape raw control characters and stray quotes inside string literals.
///
/// A quote closes a string only when the next non-whitespace character is a
/// structural delimiter (`,` `:` `}` `]`) or the end of input; any other quote
/// is treated as part of the string and escaped.
pub fn sanitize(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 16);
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in chars.iter().enumerate() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }

        if escape_next {
            out.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' => {
                out.push(ch);
                escape_next = true;
            }
            '"' => {
                let next = chars[i + 1..]
                    .iter()
                    .find(|c| !matches!(c, ' ' | '\t' | '\r' | '\n'));
                match next {
                    None | Some(',') | Some(':') | Some('}') | Some(']') => {
                        in_string = false;
                        out.push('"');
                    }
                    Some(_) => out.push_str("\\\""),
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }

    out
}

/// Insert a comma where a closing token is followed, on the next line, by an
/// opening string, object, or array.
///
/// This is a textual heuristic and can alter a string value that happens to
/// contain such a sequence across a raw line break.
pub fn repair_missing_commas(raw: &str) -> String {
    MISSING_COMMA.replace_all(raw, "$1,\n$2").into_owned()
}

/// Check whether brackets balance and no string is left open.
///
/// Used to tell a length-limit cut-off apart from malformed output. A closed
/// fenced block is scanned on its own; otherwise the scan runs from the first
/// `{` or `[` to the end of the input, so a second value cut off after a
/// complete one still counts as truncated.
pub fn is_structurally_complete(raw: &str) -> bool {
    let stripped = strip_reasoning(raw);
    let text = match fenced_block(&stripped) {
        Some(inner) if opens_structure(inner) => inner,
        _ => match structure_start(&stripped) {
            Some(start) => &stripped[start..],
            None => stripped.trim(),
        },
    };
    if text.is_empty() {
        return false;
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => stack.push(ch),
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            _ => {}
        }
    }

    stack.is_empty() && !in_string
}

/// Read a numeric score that may have been emitted as a number or a string.
pub(crate) fn lenient_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

/// Field deserializers for model-authored payloads, which often quote
/// numbers, send `null`, or send a bare string where a list was asked for.
pub(crate) mod lenient {
    use super::lenient_number;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value
            .as_ref()
            .and_then(lenient_number)
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n.round() as u32))
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.as_ref().and_then(lenient_number).filter(|n| n.is_finite()))
    }

    pub fn bool_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(match value {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes"),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        })
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(match value {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.trim().is_empty())
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s],
            _ => Vec::new(),
        })
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(match value {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
