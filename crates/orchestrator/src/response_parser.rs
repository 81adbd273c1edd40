//! Best-effort decoding of reasoning-service replies.
//!
//! Replies are supposed to be a JSON object with `explanation` and `code`
//! fields but regularly arrive wrapped in markdown fences, surrounded by
//! prose, or with broken escaping. Decoding runs in tiers and reports which
//! tier produced the result so callers can branch on confidence.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Number of raw characters echoed into a failure explanation.
const RAW_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
    pub explanation: String,
}

impl GeneratedCode {
    pub fn new(code: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            explanation: explanation.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReasoningResponse {
    /// Reply was a well-formed JSON object.
    Parsed(GeneratedCode),
    /// Fields were pulled out of a malformed reply.
    PartiallyRecovered(GeneratedCode),
    /// Nothing usable; `explanation` describes the failure.
    Failed { explanation: String, raw_excerpt: String },
}

impl ReasoningResponse {
    pub fn generated(&self) -> Option<&GeneratedCode> {
        match self {
            Self::Parsed(generated) | Self::PartiallyRecovered(generated) => Some(generated),
            Self::Failed { .. } => None,
        }
    }

    pub fn explanation(&self) -> &str {
        match self {
            Self::Parsed(generated) | Self::PartiallyRecovered(generated) => &generated.explanation,
            Self::Failed { explanation, .. } => explanation,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Self::Parsed(_) => 0.9,
            Self::PartiallyRecovered(_) => 0.7,
            Self::Failed { .. } => 0.0,
        }
    }
}

#[derive(Deserialize)]
struct RawReply {
    #[serde(default)]
    explanation: String,
    code: String,
}

fn explanation_field() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""explanation"\s*:\s*"((?:[^"\\]|\\.)*)""#)
            .expect("Invalid explanation regex pattern")
    })
}

fn code_field() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""code"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("Invalid code regex pattern")
    })
}

fn fenced_code() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:python|javascript|js)?[ \t]*\r?\n(.*?)\r?\n```")
            .expect("Invalid fenced code regex pattern")
    })
}

pub fn parse_reasoning_response(raw: &str) -> ReasoningResponse {
    let body = strip_fences(raw.trim());
    let candidate = outermost_object(body).unwrap_or(body);

    if let Ok(reply) = serde_json::from_str::<RawReply>(candidate) {
        return ReasoningResponse::Parsed(GeneratedCode::new(reply.code, reply.explanation));
    }

    recover_fields(raw)
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest
        .strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest);
    let rest = rest.trim_start();
    rest.strip_suffix("```").unwrap_or(rest).trim_end()
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn recover_fields(raw: &str) -> ReasoningResponse {
    let code = code_field()
        .captures(raw)
        .map(|caps| unescape(&caps[1]))
        .or_else(|| fenced_code().captures(raw).map(|caps| caps[1].to_string()));

    let Some(code) = code else {
        return ReasoningResponse::Failed {
            explanation: format!(
                "Reasoning response could not be parsed; raw response: {}...",
                excerpt(raw)
            ),
            raw_excerpt: excerpt(raw),
        };
    };

    let explanation = explanation_field()
        .captures(raw)
        .map(|caps| unescape(&caps[1]))
        .unwrap_or_else(|| leading_lines(raw));

    ReasoningResponse::PartiallyRecovered(GeneratedCode::new(code, explanation))
}

fn unescape(fragment: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{fragment}\"")).unwrap_or_else(|_| {
        fragment
            .replace("\\n", "\n")
            .replace("\\r", "\r")
            .replace("\\t", "\t")
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    })
}

fn leading_lines(raw: &str) -> String {
    let joined = raw
        .lines()
        .map(str::trim)
        .take_while(|line| !line.starts_with("```"))
        .filter(|line| !line.is_empty())
        .take(3)
        .collect::<Vec<_>>()
        .join(" ");
    joined.chars().take(RAW_EXCERPT_CHARS).collect()
}

fn excerpt(raw: &str) -> String {
    raw.chars().take(RAW_EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let parsed = parse_reasoning_response(
            r#"{"explanation": "Sum column X", "code": "result = df['X'].sum()"}"#,
        );
        assert_eq!(
            parsed,
            ReasoningResponse::Parsed(GeneratedCode::new(
                "result = df['X'].sum()",
                "Sum column X"
            ))
        );
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let raw = "```json\nHere you go: {\"explanation\": \"e\", \"code\": \"x = 1\"} done\n```";
        let parsed = parse_reasoning_response(raw);
        assert!(matches!(parsed, ReasoningResponse::Parsed(_)));
        assert_eq!(parsed.generated().unwrap().code, "x = 1");
    }

    #[test]
    fn test_regex_recovery_unescapes_code() {
        let raw = r#"{"explanation": "Step 1: load", "code": "a = 1\nb = \"x\"", broken"#;
        let parsed = parse_reasoning_response(raw);
        match parsed {
            ReasoningResponse::PartiallyRecovered(generated) => {
                assert_eq!(generated.code, "a = 1\nb = \"x\"");
                assert_eq!(generated.explanation, "Step 1: load");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fenced_code_block_recovery() {
        let raw = "I will sum the column.\n```python\ntotal = df['X'].sum()\n```";
        let parsed = parse_reasoning_response(raw);
        match parsed {
            ReasoningResponse::PartiallyRecovered(generated) => {
                assert_eq!(generated.code, "total = df['X'].sum()");
                assert_eq!(generated.explanation, "I will sum the column.");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unusable_reply_is_failed() {
        let parsed = parse_reasoning_response("Sorry, I cannot help with that.");
        assert!(parsed.generated().is_none());
        assert_eq!(parsed.confidence(), 0.0);
        assert!(parsed.explanation().contains("Sorry, I cannot help"));
    }

    #[test]
    fn test_json_without_code_falls_through() {
        let parsed = parse_reasoning_response(r#"{"explanation": "only words"}"#);
        assert!(matches!(parsed, ReasoningResponse::Failed { .. }));
    }
}
