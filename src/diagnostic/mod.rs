pub mod ansi;
pub mod json;

use crate::ast::Span;
use crate::compiler::{CompileError, CompileErrorKind};

/// A message attached to the region of source an error is about.
#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// Everything a renderer needs to report one error.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<&'static str>,
    pub message: String,
    pub label: Option<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    /// Source text the label span points into, when it is available.
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            message: message.into(),
            label: None,
            notes: vec![],
            suggestion: None,
            source: None,
        }
    }

    pub fn with_code(self, code: &'static str) -> Self {
        Diagnostic { code: Some(code), ..self }
    }

    pub fn with_span(self, span: Span, label: impl Into<String>) -> Self {
        Diagnostic { label: Some(Label { span, message: label.into() }), ..self }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(self, suggestion: impl Into<String>) -> Self {
        Diagnostic { suggestion: Some(suggestion.into()), ..self }
    }

    pub fn with_source(self, source: impl Into<String>) -> Self {
        Diagnostic { source: Some(source.into()), ..self }
    }
}

impl From<&crate::lexer::LexError> for Diagnostic {
    fn from(e: &crate::lexer::LexError) -> Self {
        let width = e.snippet.len().max(1);
        let d = Diagnostic::error(format!("unexpected token '{}'", e.snippet))
            .with_code("ZEN-L001")
            .with_span(Span::from(e.position..e.position + width), "not valid here");
        match e.suggestion.as_str() {
            "" => d,
            hint => d.with_suggestion(hint),
        }
    }
}

impl From<&crate::parser::ParseError> for Diagnostic {
    fn from(e: &crate::parser::ParseError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here")
    }
}

fn compile_code(kind: &CompileErrorKind) -> &'static str {
    match kind {
        CompileErrorKind::UndefinedVariable { .. } => "ZEN-C001",
        CompileErrorKind::ConstantReassignment { .. } => "ZEN-C002",
        CompileErrorKind::NotAssignable { .. } => "ZEN-C003",
        CompileErrorKind::InvalidAssignTarget => "ZEN-C004",
        CompileErrorKind::UnknownOperator { .. } => "ZEN-C005",
        CompileErrorKind::UnknownBuiltin { .. } => "ZEN-C006",
        CompileErrorKind::ArityMismatch { .. } => "ZEN-C007",
        CompileErrorKind::ReturnOutsideFunction | CompileErrorKind::OutsideLoop { .. } => "ZEN-C008",
        CompileErrorKind::OperandOverflow { .. } => "ZEN-C009",
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let mut d = Diagnostic::error(e.kind.to_string())
            .with_code(compile_code(&e.kind))
            .with_span(e.span, "in this statement")
            .with_note(format!("while compiling {}", e.file));
        match &e.kind {
            CompileErrorKind::ConstantReassignment { name } => {
                d = d.with_suggestion(format!("declare '{}' with 'var' to make it reassignable", name));
            }
            CompileErrorKind::UndefinedVariable { name } => {
                d = d.with_suggestion(format!("declare '{}' with 'var' or 'const' before using it", name));
            }
            _ => {}
        }
        d
    }
}

impl From<&crate::vm::VmError> for Diagnostic {
    fn from(e: &crate::vm::VmError) -> Self {
        Diagnostic::error(e.to_string()).with_code("ZEN-R001")
    }
}

impl From<&crate::bytecode::DecodeError> for Diagnostic {
    fn from(e: &crate::bytecode::DecodeError) -> Self {
        Diagnostic::error(e.to_string())
            .with_code("ZEN-B001")
            .with_suggestion("recompile the program with 'zen compile'")
    }
}

impl From<&crate::bytecode::EncodeError> for Diagnostic {
    fn from(e: &crate::bytecode::EncodeError) -> Self {
        Diagnostic::error(e.to_string()).with_code("ZEN-B002")
    }
}

impl From<&crate::Error> for Diagnostic {
    fn from(e: &crate::Error) -> Self {
        match e {
            crate::Error::Lex(e) => e.into(),
            crate::Error::Parse(e) => e.into(),
            crate::Error::Compile(e) => e.into(),
            crate::Error::Runtime(e) => e.into(),
            crate::Error::Decode(e) => e.into(),
            crate::Error::Encode(e) => e.into(),
        }
    }
}
