use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::SourceMap;

// ---- Spans ----

/// Half-open byte range `start..end` into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    /// Placeholder for nodes that did not come from source text.
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    /// Smallest span covering both.
    pub fn merge(self, other: Span) -> Span {
        Span { start: self.start.min(other.start), end: self.end.max(other.end) }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Span { start: range.start, end: range.end }
    }
}

/// A node plus where it came from. Serializes as the bare node; spans are
/// diagnostics-only and do not survive a JSON round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Spanned<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Spanned::new(T::deserialize(deserializer)?, Span::UNKNOWN))
    }
}

// ---- Core AST types ----

/// A `{ ... }` statement list.
pub type Block = Vec<Spanned<Stmt>>;

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `var name = expr` (mutable) or `const name = expr`
    Var {
        name: String,
        mutable: bool,
        value: Expr,
    },

    /// `target = expr` where target is `name`, `name[index]` or `name.field`
    Assign { target: Expr, value: Expr },

    /// `return` or `return expr`
    Return(Option<Expr>),

    /// `while (cond) { body }`
    While { condition: Expr, body: Block },

    Break,

    Continue,

    /// Expression as statement; its value is popped
    Expr(Expr),
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Integer(i64),
    Float(f64),
    Str(String),
    Boolean(bool),
    Null,

    /// Variable reference
    Ident(String),

    /// `-x`, `!x`
    Prefix { op: PrefixOp, right: Box<Expr> },

    /// `a + b`, `a && b`, ...
    Infix {
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// `if (cond) { ... } else { ... }`; `else if` nests another `If` in the alternative
    If {
        condition: Box<Expr>,
        consequence: Block,
        alternative: Option<Block>,
    },

    /// `func name(a, b) { ... }`; `name` is visible inside the body for recursion
    Function {
        name: Option<String>,
        params: Vec<String>,
        body: Block,
    },

    /// `callee(args...)`
    Call { function: Box<Expr>, args: Vec<Expr> },

    /// `left[index]`
    Index { left: Box<Expr>, index: Box<Expr> },

    /// `object.property`
    Member { object: Box<Expr>, property: String },

    /// `[a, b, c]`
    Array(Vec<Expr>),

    /// `{key: value, ...}`
    Hash(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefixOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfixOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Modulo,
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,
    And,
    Or,
}

impl std::fmt::Display for InfixOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InfixOp::Add => "+",
            InfixOp::Subtract => "-",
            InfixOp::Multiply => "*",
            InfixOp::Divide => "/",
            InfixOp::Power => "^",
            InfixOp::Modulo => "%",
            InfixOp::Equals => "==",
            InfixOp::NotEquals => "!=",
            InfixOp::LessThan => "<",
            InfixOp::GreaterThan => ">",
            InfixOp::LessOrEqual => "<=",
            InfixOp::GreaterOrEqual => ">=",
            InfixOp::And => "&&",
            InfixOp::Or => "||",
        };
        f.write_str(s)
    }
}

/// A complete program is a list of statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub statements: Block,
    #[serde(skip)]
    pub source: Option<String>,
}
