//! JSON framing for the bridge process.
//!
//! Requests are a single JSON object on the child's stdin. Responses are
//! expected to be a single envelope on stdout, but runtimes like to print
//! banners and warnings around it, so decoding searches the output for the
//! envelope instead of trusting it to be the only thing there.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound on how much raw child output is kept for diagnostics.
pub const MAX_DIAGNOSTIC_TAIL: usize = 4 * 1024;

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    command: &'a str,
    payload: &'a Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEnvelope {
    Success {
        payload: Value,
    },
    Failure {
        code: i64,
        error: String,
        details: String,
    },
}

impl BridgeEnvelope {
    pub fn is_success(&self) -> bool {
        matches!(self, BridgeEnvelope::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("failed to encode bridge request: {0}")]
    Encode(String),
    #[error("bridge exited cleanly without a response envelope; output tail: {tail}")]
    NoEnvelope { tail: String },
}

pub fn encode_request(command: &str, payload: &Value) -> Result<Vec<u8>, CodecError> {
    let mut bytes = serde_json::to_vec(&BridgeRequest { command, payload })
        .map_err(|err| CodecError::Encode(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Recover an envelope from a finished child.
///
/// A structured envelope wins over the exit status. Only when nothing can be
/// recovered does a non-zero (or signal) exit turn into a synthesized
/// failure carrying `fallback_code`.
pub fn decode_response(
    stdout: &[u8],
    stderr: &[u8],
    exit_code: Option<i32>,
    fallback_code: i64,
) -> Result<BridgeEnvelope, CodecError> {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    for stream in [stdout.as_ref(), stderr.as_ref()] {
        if let Some(envelope) = find_envelope(stream, fallback_code) {
            return Ok(envelope);
        }
    }

    let tail = combined_tail(&stdout, &stderr);
    match exit_code {
        Some(0) => Err(CodecError::NoEnvelope { tail }),
        Some(code) => Ok(BridgeEnvelope::Failure {
            code: fallback_code,
            error: format!("bridge exited with code {code}"),
            details: tail,
        }),
        None => Ok(BridgeEnvelope::Failure {
            code: fallback_code,
            error: "bridge terminated by signal".to_string(),
            details: tail,
        }),
    }
}

type Strategy = for<'a> fn(&'a str) -> Vec<Candidate<'a>>;

/// Recovery attempts in priority order.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("whole", whole_text),
    ("trailing_lines", json_lines_from_end),
    ("last_object", last_object),
    ("last_array", last_array),
];

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    text: &'a str,
    /// Substring candidates may be followed by noise after the JSON value.
    allow_trailing: bool,
}

fn find_envelope(raw: &str, fallback_code: i64) -> Option<BridgeEnvelope> {
    let text = raw.trim_start_matches('\u{feff}').trim();
    if text.is_empty() {
        return None;
    }
    for (name, strategy) in STRATEGIES {
        for candidate in strategy(text) {
            let Some(value) = parse_candidate(candidate) else {
                continue;
            };
            if let Some(envelope) = envelope_from_value(value, fallback_code) {
                tracing::trace!(
                    target: "lfs_bridge::bridge::codec",
                    strategy = name,
                    "recovered bridge envelope"
                );
                return Some(envelope);
            }
        }
    }
    None
}

fn whole_text(text: &str) -> Vec<Candidate<'_>> {
    vec![Candidate {
        text,
        allow_trailing: false,
    }]
}

fn json_lines_from_end(text: &str) -> Vec<Candidate<'_>> {
    text.lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') || line.starts_with('['))
        .map(|line| Candidate {
            text: line,
            allow_trailing: false,
        })
        .collect()
}

fn last_object(text: &str) -> Vec<Candidate<'_>> {
    from_last(text, '{')
}

fn last_array(text: &str) -> Vec<Candidate<'_>> {
    from_last(text, '[')
}

fn from_last(text: &str, opener: char) -> Vec<Candidate<'_>> {
    text.rfind(opener)
        .map(|index| Candidate {
            text: &text[index..],
            allow_trailing: true,
        })
        .into_iter()
        .collect()
}

fn parse_candidate(candidate: Candidate<'_>) -> Option<Value> {
    if candidate.allow_trailing {
        serde_json::Deserializer::from_str(candidate.text)
            .into_iter::<Value>()
            .next()?
            .ok()
    } else {
        serde_json::from_str(candidate.text).ok()
    }
}

fn envelope_from_value(value: Value, fallback_code: i64) -> Option<BridgeEnvelope> {
    let Value::Object(mut map) = value else {
        return None;
    };
    let ok = map.get("ok")?.as_bool()?;
    if ok {
        let payload = match map.remove("payload") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(payload @ Value::Object(_)) => payload,
            Some(_) => return None,
        };
        return Some(BridgeEnvelope::Success { payload });
    }

    let code = map.get("code").and_then(Value::as_i64);
    let error = map.get("error").and_then(Value::as_str).map(str::to_owned);
    if code.is_none() && error.is_none() {
        return None;
    }
    let details = match map.remove("details") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    };
    Some(BridgeEnvelope::Failure {
        code: code.unwrap_or(fallback_code),
        error: error.unwrap_or_else(|| "bridge reported a failure".to_string()),
        details: bounded_tail(&details, MAX_DIAGNOSTIC_TAIL).to_string(),
    })
}

fn combined_tail(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let combined = match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => return String::new(),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    };
    bounded_tail(&combined, MAX_DIAGNOSTIC_TAIL).to_string()
}

/// Last `max` bytes of `text`, moved forward to a char boundary.
pub fn bounded_tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
