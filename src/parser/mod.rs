use crate::ast::*;
use crate::lexer::Token;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Or,
    And,
    Equals,
    LessGreater,
    Sum,
    Product,
    Power,
    Prefix,
    Call,
}

fn infix_precedence(tok: &Token) -> Precedence {
    match tok {
        Token::OrOr => Precedence::Or,
        Token::AndAnd => Precedence::And,
        Token::EqEq | Token::NotEq => Precedence::Equals,
        Token::Less | Token::Greater | Token::LessEq | Token::GreaterEq => Precedence::LessGreater,
        Token::Plus | Token::Minus => Precedence::Sum,
        Token::Star | Token::Slash | Token::Percent => Precedence::Product,
        Token::Caret => Precedence::Power,
        Token::LParen | Token::LBracket | Token::Dot => Precedence::Call,
        _ => Precedence::Lowest,
    }
}

fn infix_op(tok: &Token) -> Option<InfixOp> {
    Some(match tok {
        Token::Plus => InfixOp::Add,
        Token::Minus => InfixOp::Subtract,
        Token::Star => InfixOp::Multiply,
        Token::Slash => InfixOp::Divide,
        Token::Caret => InfixOp::Power,
        Token::Percent => InfixOp::Modulo,
        Token::EqEq => InfixOp::Equals,
        Token::NotEq => InfixOp::NotEquals,
        Token::Less => InfixOp::LessThan,
        Token::Greater => InfixOp::GreaterThan,
        Token::LessEq => InfixOp::LessOrEqual,
        Token::GreaterEq => InfixOp::GreaterOrEqual,
        Token::AndAnd => InfixOp::And,
        Token::OrOr => InfixOp::Or,
        _ => return None,
    })
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| self.prev_span())
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            return Span::UNKNOWN;
        }
        self.tokens
            .get(self.pos - 1)
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error("ZEN-P001", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("ZEN-P002", format!("expected {:?}, got EOF", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error("ZEN-P003", format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("ZEN-P004", "expected identifier, got EOF".into())),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError {
            code,
            position: self.pos,
            span: self.peek_span(),
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Statements ----

    pub fn parse_program(&mut self) -> Result<Program> {
        let mut statements = Vec::new();
        while !self.at_end() {
            statements.push(self.parse_stmt()?);
        }
        Ok(Program { statements, source: None })
    }

    fn parse_stmt(&mut self) -> Result<Spanned<Stmt>> {
        let start = self.peek_span();
        let stmt = match self.peek() {
            Some(Token::Var) | Some(Token::Const) => self.parse_var()?,
            Some(Token::Return) => self.parse_return()?,
            Some(Token::While) => self.parse_while()?,
            // A named declaration ends at its body; `func f() {} (x)` is two statements.
            Some(Token::Func) if matches!(self.tokens.get(self.pos + 1), Some((Token::Ident(_), _))) => {
                Stmt::Expr(self.parse_function()?)
            }
            Some(Token::Break) => {
                self.advance();
                Stmt::Break
            }
            Some(Token::Continue) => {
                self.advance();
                Stmt::Continue
            }
            _ => self.parse_expr_or_assign()?,
        };
        let span = start.merge(self.prev_span());
        self.eat(&Token::Semicolon);
        Ok(Spanned::new(stmt, span))
    }

    fn parse_var(&mut self) -> Result<Stmt> {
        let mutable = matches!(self.advance(), Some(Token::Var));
        let name = self.expect_ident()?;
        self.expect(&Token::Assign)?;
        let value = self.parse_expr(Precedence::Lowest)?;
        Ok(Stmt::Var { name, mutable, value })
    }

    fn parse_return(&mut self) -> Result<Stmt> {
        self.advance();
        if matches!(self.peek(), None | Some(Token::Semicolon) | Some(Token::RBrace)) {
            return Ok(Stmt::Return(None));
        }
        Ok(Stmt::Return(Some(self.parse_expr(Precedence::Lowest)?)))
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        self.advance();
        let condition = self.parse_expr(Precedence::Lowest)?;
        let body = self.parse_block()?;
        Ok(Stmt::While { condition, body })
    }

    fn parse_expr_or_assign(&mut self) -> Result<Stmt> {
        let expr = self.parse_expr(Precedence::Lowest)?;
        if self.eat(&Token::Assign) {
            if !matches!(expr, Expr::Ident(_) | Expr::Index { .. } | Expr::Member { .. }) {
                return Err(self.error("ZEN-P005", "invalid assignment target".into()));
            }
            let value = self.parse_expr(Precedence::Lowest)?;
            return Ok(Stmt::Assign { target: expr, value });
        }
        Ok(Stmt::Expr(expr))
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("ZEN-P002", "expected RBrace, got EOF".into()));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.advance();
        Ok(stmts)
    }

    // ---- Expressions ----

    fn parse_expr(&mut self, precedence: Precedence) -> Result<Expr> {
        let mut left = self.parse_prefix()?;

        while let Some(tok) = self.peek().cloned() {
            let next = infix_precedence(&tok);
            if next <= precedence {
                break;
            }
            left = match tok {
                Token::LParen => {
                    self.advance();
                    let args = self.parse_list(&Token::RParen)?;
                    Expr::Call { function: Box::new(left), args }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr(Precedence::Lowest)?;
                    self.expect(&Token::RBracket)?;
                    Expr::Index { left: Box::new(left), index: Box::new(index) }
                }
                Token::Dot => {
                    self.advance();
                    let property = self.expect_ident()?;
                    Expr::Member { object: Box::new(left), property }
                }
                _ => {
                    let Some(op) = infix_op(&tok) else { break };
                    self.advance();
                    // `^` is right-associative
                    let rhs_prec = if op == InfixOp::Power { Precedence::Product } else { next };
                    let right = self.parse_expr(rhs_prec)?;
                    Expr::Infix { op, left: Box::new(left), right: Box::new(right) }
                }
            };
        }

        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.error("ZEN-P006", "expected expression, got EOF".into()));
        };
        match tok {
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Integer(n))
            }
            Token::Float(n) => {
                self.advance();
                Ok(Expr::Float(n))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Boolean(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Boolean(false))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Expr::Ident(name))
            }
            Token::Minus | Token::Bang => {
                self.advance();
                let op = if tok == Token::Minus { PrefixOp::Negate } else { PrefixOp::Not };
                let right = self.parse_expr(Precedence::Prefix)?;
                Ok(Expr::Prefix { op, right: Box::new(right) })
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr(Precedence::Lowest)?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                self.advance();
                Ok(Expr::Array(self.parse_list(&Token::RBracket)?))
            }
            Token::LBrace => self.parse_hash(),
            Token::If => self.parse_if(),
            Token::Func => self.parse_function(),
            other => Err(self.error("ZEN-P006", format!("expected expression, got {:?}", other))),
        }
    }

    /// Comma-separated expressions up to `close`; the opening token is already consumed.
    fn parse_list(&mut self, close: &Token) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr(Precedence::Lowest)?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_hash(&mut self) -> Result<Expr> {
        self.expect(&Token::LBrace)?;
        let mut pairs = Vec::new();
        while !self.check(&Token::RBrace) {
            let key = self.parse_expr(Precedence::Lowest)?;
            self.expect(&Token::Colon)?;
            let value = self.parse_expr(Precedence::Lowest)?;
            pairs.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Hash(pairs))
    }

    fn parse_if(&mut self) -> Result<Expr> {
        self.expect(&Token::If)?;
        let condition = self.parse_expr(Precedence::Lowest)?;
        let consequence = self.parse_block()?;
        let alternative = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                let start = self.peek_span();
                let nested = self.parse_if()?;
                let span = start.merge(self.prev_span());
                Some(vec![Spanned::new(Stmt::Expr(nested), span)])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Expr::If { condition: Box::new(condition), consequence, alternative })
    }

    fn parse_function(&mut self) -> Result<Expr> {
        self.expect(&Token::Func)?;
        let name = match self.peek() {
            Some(Token::Ident(_)) => Some(self.expect_ident()?),
            _ => None,
        };
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }
        let body = self.parse_block()?;
        Ok(Expr::Function { name, params, body })
    }
}

/// Parse a lexed token stream into a program.
pub fn parse(tokens: Vec<(Token, std::ops::Range<usize>)>) -> Result<Program> {
    let tokens = tokens
        .into_iter()
        .map(|(t, r)| (t, Span { start: r.start, end: r.end }))
        .collect();
    Parser::new(tokens).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;

    fn parse_str(source: &str) -> Program {
        parse(lexer::lex(source).unwrap()).unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        parse(lexer::lex(source).unwrap()).unwrap_err()
    }

    fn only_expr(source: &str) -> Expr {
        let prog = parse_str(source);
        assert_eq!(prog.statements.len(), 1);
        match &prog.statements[0].node {
            Stmt::Expr(e) => e.clone(),
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    fn int(n: i64) -> Box<Expr> {
        Box::new(Expr::Integer(n))
    }

    #[test]
    fn parse_precedence() {
        assert_eq!(
            only_expr("1 + 2 * 3"),
            Expr::Infix {
                op: InfixOp::Add,
                left: int(1),
                right: Box::new(Expr::Infix { op: InfixOp::Multiply, left: int(2), right: int(3) }),
            }
        );
    }

    #[test]
    fn parse_power_is_right_associative() {
        assert_eq!(
            only_expr("2 ^ 3 ^ 2"),
            Expr::Infix {
                op: InfixOp::Power,
                left: int(2),
                right: Box::new(Expr::Infix { op: InfixOp::Power, left: int(3), right: int(2) }),
            }
        );
    }

    #[test]
    fn parse_var_and_const() {
        let prog = parse_str("var a = 1; const b = 2");
        assert_eq!(
            prog.statements[0].node,
            Stmt::Var { name: "a".into(), mutable: true, value: Expr::Integer(1) }
        );
        assert_eq!(
            prog.statements[1].node,
            Stmt::Var { name: "b".into(), mutable: false, value: Expr::Integer(2) }
        );
    }

    #[test]
    fn parse_statement_spans() {
        let prog = parse_str("var a = 1;\nvar bb = 22");
        assert_eq!(prog.statements[0].span, Span { start: 0, end: 9 });
        assert_eq!(prog.statements[1].span, Span { start: 11, end: 22 });
    }

    #[test]
    fn parse_named_function() {
        let expr = only_expr("func count(n) { return n }");
        match expr {
            Expr::Function { name, params, body } => {
                assert_eq!(name.as_deref(), Some("count"));
                assert_eq!(params, vec!["n".to_string()]);
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn named_function_statement_ends_at_its_body() {
        let prog = parse_str("func f(n) { n } [f(1), f(0)]");
        assert_eq!(prog.statements.len(), 2);
        assert!(matches!(&prog.statements[0].node, Stmt::Expr(Expr::Function { name: Some(_), .. })));
        assert!(matches!(&prog.statements[1].node, Stmt::Expr(Expr::Array(items)) if items.len() == 2));

        let prog = parse_str("func g() { 1 } (2)");
        assert_eq!(prog.statements.len(), 2);
        assert_eq!(prog.statements[1].node, Stmt::Expr(Expr::Integer(2)));
    }

    #[test]
    fn parse_immediately_called_closures() {
        let expr = only_expr("func(a) { func(b) { a + b } }(3)(4)");
        match expr {
            Expr::Call { function, args } => {
                assert_eq!(args, vec![Expr::Integer(4)]);
                assert!(matches!(*function, Expr::Call { .. }));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn parse_else_if_chain_nests() {
        let expr = only_expr("if (a) { 1 } else if (b) { 2 } else { 3 }");
        let Expr::If { alternative: Some(alt), .. } = expr else {
            panic!("expected if with alternative");
        };
        assert_eq!(alt.len(), 1);
        assert!(matches!(&alt[0].node, Stmt::Expr(Expr::If { alternative: Some(_), .. })));
    }

    #[test]
    fn parse_while_break_continue() {
        let prog = parse_str("while (i < 3) { if (i == 1) { break }; continue }");
        let Stmt::While { body, .. } = &prog.statements[0].node else {
            panic!("expected while");
        };
        assert_eq!(body.len(), 2);
        assert_eq!(body[1].node, Stmt::Continue);
    }

    #[test]
    fn parse_assignment_targets() {
        let prog = parse_str("a = 1; a[0] = 2; a.b = 3");
        assert!(matches!(&prog.statements[0].node, Stmt::Assign { target: Expr::Ident(_), .. }));
        assert!(matches!(&prog.statements[1].node, Stmt::Assign { target: Expr::Index { .. }, .. }));
        assert!(matches!(&prog.statements[2].node, Stmt::Assign { target: Expr::Member { .. }, .. }));
    }

    #[test]
    fn parse_hash_and_member() {
        let expr = only_expr(r#"{"a": 1, 2: [3]}.a"#);
        let Expr::Member { object, property } = expr else {
            panic!("expected member access");
        };
        assert_eq!(property, "a");
        assert!(matches!(*object, Expr::Hash(ref pairs) if pairs.len() == 2));
    }

    #[test]
    fn parse_bare_return() {
        let prog = parse_str("func() { return }");
        let Stmt::Expr(Expr::Function { body, .. }) = &prog.statements[0].node else {
            panic!("expected function");
        };
        assert_eq!(body[0].node, Stmt::Return(None));
    }

    #[test]
    fn parse_invalid_assignment_target() {
        let err = parse_err("1 + 2 = 3");
        assert_eq!(err.code, "ZEN-P005");
    }

    #[test]
    fn parse_unclosed_block() {
        let err = parse_err("while (true) { 1");
        assert!(err.message.contains("EOF"));
    }
}
