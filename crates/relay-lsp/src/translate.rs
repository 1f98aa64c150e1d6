//! Engine reply parsing and diagnostic translation.

use serde::Deserialize;
use serde_json::Value;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range, Url};
use tracing::{debug, warn};

use crate::error::RelayError;

pub(crate) const DIAGNOSTIC_SOURCE: &str = "relay-lsp";

/// A parsed engine reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisVerdict {
    /// `{ "status": "error", "message": string }`
    Error(String),
    /// `{ "type": "success" }`
    Success,
    /// Well-formed JSON object of any other shape.
    Unrecognized(String),
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<Value>,
}

impl AnalysisVerdict {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| RelayError::MalformedPayload(err.to_string()))?;
        if !value.is_object() {
            return Err(RelayError::MalformedPayload(format!(
                "expected a JSON object, got `{raw}`"
            )));
        }
        let reply: RawReply = serde_json::from_value(value)
            .map_err(|err| RelayError::MalformedPayload(err.to_string()))?;

        if reply.status.as_ref().and_then(Value::as_str) == Some("error") {
            return match reply.message {
                Some(Value::String(message)) => Ok(AnalysisVerdict::Error(message)),
                _ => Err(RelayError::MalformedPayload(
                    "error reply without a string `message`".to_string(),
                )),
            };
        }
        if reply.kind.as_ref().and_then(Value::as_str) == Some("success") {
            return Ok(AnalysisVerdict::Success);
        }
        Ok(AnalysisVerdict::Unrecognized(raw.to_string()))
    }
}

/// Diagnostics issued against one document. An empty set clears the document.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticSet {
    pub uri: Url,
    pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSet {
    pub fn clear(uri: Url) -> Self {
        Self {
            uri,
            diagnostics: Vec::new(),
        }
    }
}

/// Translates an engine reply for `uri`.
///
/// Returns `None` when the diagnostics for the document should stay as they
/// are (malformed or unrecognized replies).
pub fn translate(raw: &str, uri: &Url, range: Range) -> Option<DiagnosticSet> {
    match AnalysisVerdict::parse(raw) {
        Ok(AnalysisVerdict::Error(message)) => Some(DiagnosticSet {
            uri: uri.clone(),
            diagnostics: vec![Diagnostic {
                range,
                severity: Some(DiagnosticSeverity::ERROR),
                source: Some(DIAGNOSTIC_SOURCE.to_string()),
                message,
                ..Default::default()
            }],
        }),
        Ok(AnalysisVerdict::Success) => Some(DiagnosticSet::clear(uri.clone())),
        Ok(AnalysisVerdict::Unrecognized(raw)) => {
            debug!("Unrecognized engine reply for {}: {}", uri, raw);
            None
        }
        Err(err) => {
            warn!("Error parsing engine reply for {}: {err}", uri);
            None
        }
    }
}

/// Range spanning `text` from its start to its end, in UTF-16 columns.
pub(crate) fn document_range(text: &str) -> Range {
    Range {
        start: Position::new(0, 0),
        end: end_position(text),
    }
}

fn end_position(text: &str) -> Position {
    let line = text.matches('\n').count();
    let last_line = text.rsplit('\n').next().unwrap_or("");
    Position::new(
        u32::try_from(line).unwrap_or(u32::MAX),
        u32::try_from(last_line.encode_utf16().count()).unwrap_or(u32::MAX),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    fn uri() -> Url {
        Url::parse("file:///work/sample.json").unwrap()
    }

    #[test]
    fn error_reply_yields_single_error_diagnostic() {
        let text = "bad input";
        let set = translate(
            r#"{"status":"error","message":"syntax error"}"#,
            &uri(),
            document_range(text),
        )
        .expect("diagnostics");
        assert_eq!(set.uri, uri());
        assert_eq!(set.diagnostics.len(), 1);
        let diagnostic = &set.diagnostics[0];
        assert_eq!(diagnostic.severity, Some(DiagnosticSeverity::ERROR));
        assert_eq!(diagnostic.message, "syntax error");
        assert_eq!(diagnostic.range.start, Position::new(0, 0));
        assert_eq!(diagnostic.range.end, Position::new(0, 9));
    }

    #[test]
    fn error_diagnostic_renders_as_lsp_json() {
        let set = translate(
            r#"{"status":"error","message":"Invalid JSON: Expecting value"}"#,
            &uri(),
            document_range("{\n  \"a\": \n}"),
        )
        .expect("diagnostics");
        let rendered = serde_json::to_string_pretty(&set.diagnostics).unwrap();
        expect![[r#"
            [
              {
                "range": {
                  "start": {
                    "line": 0,
                    "character": 0
                  },
                  "end": {
                    "line": 2,
                    "character": 1
                  }
                },
                "severity": 1,
                "source": "relay-lsp",
                "message": "Invalid JSON: Expecting value"
              }
            ]"#]]
        .assert_eq(&rendered);
    }

    #[test]
    fn success_reply_clears_diagnostics() {
        let set = translate(r#"{"type":"success"}"#, &uri(), document_range("{}"))
            .expect("diagnostics");
        assert!(set.diagnostics.is_empty());
    }

    #[test]
    fn malformed_and_unrecognized_replies_leave_diagnostics_unchanged() {
        let inputs = [
            "",
            "not json",
            "{\"status\":",
            "[1, 2, 3]",
            "\"error\"",
            "null",
            r#"{"status":"error"}"#,
            r#"{"status":"error","message":42}"#,
            r#"{"status":"success","message":"Valid JSON"}"#,
            r#"{"type":"failure"}"#,
            r#"{"Type":"success"}"#,
            r#"{}"#,
        ];
        for input in inputs {
            assert_eq!(
                translate(input, &uri(), document_range("x")),
                None,
                "input {input:?} should not change diagnostics"
            );
        }
    }

    #[test]
    fn verdict_classification() {
        assert_eq!(
            AnalysisVerdict::parse(r#"{"status":"error","message":"m"}"#).unwrap(),
            AnalysisVerdict::Error("m".to_string())
        );
        assert_eq!(
            AnalysisVerdict::parse(r#"{"type":"success","extra":true}"#).unwrap(),
            AnalysisVerdict::Success
        );
        assert!(matches!(
            AnalysisVerdict::parse(r#"{"hello":"world"}"#).unwrap(),
            AnalysisVerdict::Unrecognized(_)
        ));
        assert!(matches!(
            AnalysisVerdict::parse("{oops"),
            Err(RelayError::MalformedPayload(_))
        ));
    }

    #[test]
    fn document_range_counts_utf16_columns() {
        assert_eq!(document_range("").end, Position::new(0, 0));
        assert_eq!(document_range("ab\n").end, Position::new(1, 0));
        assert_eq!(document_range("a\n\u{1F600}x").end, Position::new(1, 3));
    }
}
