use serde::Serialize;

use crate::ast::SourceMap;
use super::Diagnostic;

#[derive(Serialize)]
struct JsonDiagnostic<'a> {
    severity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: &'a str,
    labels: Vec<JsonLabel<'a>>,
    notes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonLabel<'a> {
    start: usize,
    end: usize,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    col: Option<usize>,
}

/// One diagnostic as a single-line JSON object. Labels get `line`/`col`
/// only when the diagnostic carries its source text.
pub fn render(d: &Diagnostic) -> String {
    let labels = d
        .label
        .iter()
        .map(|l| {
            let position = d.source.as_deref().map(|source| SourceMap::new(source).lookup(l.span.start));
            JsonLabel {
                start: l.span.start,
                end: l.span.end,
                message: &l.message,
                line: position.map(|(line, _)| line),
                col: position.map(|(_, col)| col),
            }
        })
        .collect();

    let json = JsonDiagnostic {
        severity: "error",
        code: d.code,
        message: &d.message,
        labels,
        notes: &d.notes,
        suggestion: d.suggestion.as_deref(),
    };
    serde_json::to_string(&json)
        .unwrap_or_else(|_| r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error("stack overflow")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "stack overflow");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("code").is_none());
        assert!(v.get("suggestion").is_none());
    }

    #[test]
    fn render_with_code_span_and_source() {
        let d = Diagnostic::error("undefined variable: y")
            .with_code("ZEN-C001")
            .with_span(Span { start: 13, end: 14 }, "in this statement")
            .with_source("var x = 1;\n  y");
        let v = parse_json(&render(&d));
        assert_eq!(v["code"], "ZEN-C001");
        let label = &v["labels"][0];
        assert_eq!(label["start"], 13);
        assert_eq!(label["end"], 14);
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 3);
    }

    #[test]
    fn render_notes_and_suggestion() {
        let d = Diagnostic::error("bad")
            .with_note("while compiling a.zen")
            .with_note("second")
            .with_suggestion("try this instead");
        let v = parse_json(&render(&d));
        assert_eq!(v["notes"].as_array().unwrap().len(), 2);
        assert_eq!(v["notes"][0], "while compiling a.zen");
        assert_eq!(v["suggestion"], "try this instead");
    }

    #[test]
    fn label_without_source_has_no_position() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8 }, "here");
        let v = parse_json(&render(&d));
        assert_eq!(v["labels"].as_array().unwrap().len(), 1);
        assert_eq!(v["labels"][0]["start"], 5);
        assert!(v["labels"][0].get("line").is_none());
    }
}
