use std::fmt;

use crate::ast::SourceMap;
use super::{Diagnostic, Label};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    /// Heading line, then a source excerpt under the label, then notes and
    /// the suggestion as `=` lines.
    pub fn render(&self, d: &Diagnostic) -> String {
        Rendered { renderer: self, diagnostic: d }.to_string()
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, d: &Diagnostic) -> fmt::Result {
        let heading = match d.code {
            Some(code) => format!("error[{code}]"),
            None => "error".to_string(),
        };
        writeln!(f, "{}: {}", self.bold_red(&heading), self.bold(&d.message))?;

        if let (Some(label), Some(source)) = (&d.label, &d.source) {
            self.excerpt(f, &SourceMap::new(source), source, label)?;
        }

        let eq = self.dim("=");
        for note in &d.notes {
            writeln!(f, "  {eq} note: {note}")?;
        }
        if let Some(suggestion) = &d.suggestion {
            writeln!(f, "  {eq} suggestion: {suggestion}")?;
        }
        Ok(())
    }

    fn excerpt(&self, f: &mut fmt::Formatter<'_>, map: &SourceMap, source: &str, label: &Label) -> fmt::Result {
        let (line, col) = map.lookup(label.span.start);
        let text = map.line_text(source, line);

        let gutter = line.to_string().len();
        let pad = " ".repeat(gutter);
        let pipe = self.cyan("|");
        writeln!(f, "  {} {line}:{col}", self.cyan("-->"))?;
        writeln!(f, "{pad} {pipe}")?;
        writeln!(f, "{} {pipe} {text}", self.cyan(&format!("{line:>gutter$}")))?;

        // Spans running past the end of the line are cut at the line end.
        let start = col - 1;
        let width = label
            .span
            .end
            .saturating_sub(label.span.start)
            .min(text.len().saturating_sub(start))
            .max(1);
        let carets = self.bold_red(&"^".repeat(width));
        let indent = " ".repeat(start);
        if label.message.is_empty() {
            writeln!(f, "{pad} {pipe} {indent}{carets}")?;
        } else {
            writeln!(f, "{pad} {pipe} {indent}{carets} {}", self.bold_red(&label.message))?;
        }
        writeln!(f, "{pad} {pipe}")
    }
}

struct Rendered<'a> {
    renderer: &'a AnsiRenderer,
    diagnostic: &'a Diagnostic,
}

impl fmt::Display for Rendered<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.renderer.write(f, self.diagnostic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    const SOURCE: &str = "const x = 1;\nx = 2;";

    fn make_diag() -> Diagnostic {
        Diagnostic::error("cannot assign to constant 'x'")
            .with_code("ZEN-C002")
            .with_span(Span { start: 13, end: 18 }, "in this statement")
            .with_source(SOURCE)
            .with_note("while compiling main.zen")
            .with_suggestion("declare 'x' with 'var' to make it reassignable")
    }

    fn plain(d: &Diagnostic) -> String {
        AnsiRenderer { use_color: false }.render(d)
    }

    #[test]
    fn heading_carries_code() {
        let out = plain(&make_diag());
        assert!(out.starts_with("error[ZEN-C002]: cannot assign to constant 'x'\n"), "got:\n{out}");
    }

    #[test]
    fn snippet_points_at_second_line() {
        let out = plain(&make_diag());
        assert!(out.contains("--> 2:1"), "missing location in:\n{out}");
        assert!(out.contains("2 | x = 2;"), "missing source line in:\n{out}");
        assert!(out.contains("^^^^^ in this statement"), "missing carets in:\n{out}");
    }

    #[test]
    fn notes_and_suggestion_follow_snippet() {
        let out = plain(&make_diag());
        assert!(out.contains("note: while compiling main.zen"), "missing note in:\n{out}");
        assert!(out.contains("suggestion: declare 'x'"), "missing suggestion in:\n{out}");
    }

    #[test]
    fn no_source_no_snippet() {
        let out = plain(&Diagnostic::error("division by zero"));
        assert_eq!(out, "error: division by zero\n");
    }

    #[test]
    fn color_toggle() {
        let colored = AnsiRenderer { use_color: true }.render(&make_diag());
        assert!(colored.contains("\x1b["));
        assert!(!plain(&make_diag()).contains("\x1b["));
    }

    #[test]
    fn span_crossing_lines_is_cut_at_line_end() {
        let d = Diagnostic::error("bad").with_span(Span { start: 6, end: 16 }, "").with_source("x = 1 + \n2");
        let out = plain(&d);
        assert!(out.contains("|       ^^\n"), "got:\n{out}");
    }

    #[test]
    fn label_without_source_is_not_rendered() {
        let d = Diagnostic::error("bad").with_code("ZEN-P001").with_span(Span { start: 4, end: 5 }, "here");
        assert_eq!(plain(&d), "error[ZEN-P001]: bad\n");
    }

    #[test]
    fn empty_span_still_gets_one_caret() {
        let d = Diagnostic::error("bad").with_span(Span { start: 0, end: 0 }, "").with_source("abc");
        let out = plain(&d);
        assert!(out.contains("| ^\n"), "got:\n{out}");
    }
}
