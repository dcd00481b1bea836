use crate::ast::source_map::SourceMap;
use crate::ast::{BinOp, Expr, Literal, Program, Span, Stmt, UnaryOp};
use crate::lexer::Token;

#[derive(Debug, thiserror::Error)]
#[error("parse error at {line}:{column}: expected {expected}, found {found}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub expected: String,
    pub found: String,
    pub span: Span,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Recursive-descent parser with precedence climbing for infix operators.
/// The first structural error aborts the unit; there is no recovery.
pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    map: SourceMap,
}

/// Binding power and AST operator for infix tokens. Higher binds tighter;
/// assignment is handled separately below all of these.
fn infix(token: &Token) -> Option<(u8, BinOp)> {
    Some(match token {
        Token::PipePipe => (1, BinOp::Or),
        Token::AmpAmp => (2, BinOp::And),
        Token::EqEq => (3, BinOp::Eq),
        Token::BangEq => (3, BinOp::Ne),
        Token::Lt => (4, BinOp::Lt),
        Token::LtEq => (4, BinOp::Le),
        Token::Gt => (4, BinOp::Gt),
        Token::GtEq => (4, BinOp::Ge),
        Token::Plus => (5, BinOp::Add),
        Token::Minus => (5, BinOp::Sub),
        Token::Star => (6, BinOp::Mul),
        Token::Slash => (6, BinOp::Div),
        Token::Percent => (6, BinOp::Mod),
        _ => return None,
    })
}

pub fn parse(tokens: Vec<(Token, Span)>, source: &str) -> Result<Program> {
    Parser::new(tokens, source).parse_program()
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>, source: &str) -> Self {
        Parser { tokens, pos: 0, map: SourceMap::new(source) }
    }

    // The lexer guarantees a terminal Eof token, so peeking never runs
    // past the stream.
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)].1
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, expected: &str) -> Result<Span> {
        if self.check(token) {
            let span = self.peek_span();
            self.advance();
            Ok(span)
        } else {
            Err(self.error(expected))
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(expected)),
        }
    }

    fn error(&self, expected: &str) -> ParseError {
        let span = self.peek_span();
        let pos = self.map.position(span.start);
        ParseError {
            line: pos.line,
            column: pos.column,
            expected: expected.to_string(),
            found: self.peek().to_string(),
            span,
        }
    }

    // ---- Statements ----

    pub fn parse_program(&mut self) -> Result<Program> {
        let mut statements = Vec::new();
        while !self.check(&Token::Eof) {
            statements.push(self.parse_stmt()?);
        }
        Ok(Program { statements })
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.peek() {
            Token::Let => self.parse_let(),
            Token::Fn => self.parse_fn(),
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::For => self.parse_for(),
            Token::Try => self.parse_try(),
            Token::Return => self.parse_return(),
            Token::Import => self.parse_import(),
            _ => {
                let expr = self.parse_expr()?;
                self.expect(&Token::Semi, "';'")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_let(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::Let, "'let'")?;
        let name = self.expect_ident("identifier")?;
        self.expect(&Token::Eq, "'='")?;
        let value = self.parse_expr()?;
        let end = self.expect(&Token::Semi, "';'")?;
        Ok(Stmt::Let { name, value, span: start.merge(end) })
    }

    fn parse_fn(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::Fn, "'fn'")?;
        let name = self.expect_ident("function name")?;
        self.expect(&Token::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                params.push(self.expect_ident("parameter name")?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, "')'")?;
        let body = self.parse_block()?;
        let span = start.merge(self.prev_span());
        Ok(Stmt::Function { name, params, body, span })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::If, "'if'")?;
        self.expect(&Token::LParen, "'('")?;
        let condition = self.parse_expr()?;
        self.expect(&Token::RParen, "')'")?;
        let then_body = self.parse_block()?;
        let else_body = if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                // `else if` chains as a single-statement else block
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        let span = start.merge(self.prev_span());
        Ok(Stmt::If { condition, then_body, else_body, span })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::While, "'while'")?;
        self.expect(&Token::LParen, "'('")?;
        let condition = self.parse_expr()?;
        self.expect(&Token::RParen, "')'")?;
        let body = self.parse_block()?;
        let span = start.merge(self.prev_span());
        Ok(Stmt::While { condition, body, span })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::For, "'for'")?;
        let binding = self.expect_ident("loop variable")?;
        self.expect(&Token::In, "'in'")?;
        let range_start = self.parse_expr()?;
        self.expect(&Token::DotDot, "'..'")?;
        let range_end = self.parse_expr()?;
        let body = self.parse_block()?;
        let span = start.merge(self.prev_span());
        Ok(Stmt::For { binding, start: range_start, end: range_end, body, span })
    }

    fn parse_try(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::Try, "'try'")?;
        let body = self.parse_block()?;
        self.expect(&Token::Catch, "'catch'")?;
        self.expect(&Token::LParen, "'('")?;
        let binding = self.expect_ident("catch binding")?;
        self.expect(&Token::RParen, "')'")?;
        let handler = self.parse_block()?;
        let span = start.merge(self.prev_span());
        Ok(Stmt::Try { body, binding, handler, span })
    }

    fn parse_return(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::Return, "'return'")?;
        let value = if self.check(&Token::Semi) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        let end = self.expect(&Token::Semi, "';'")?;
        Ok(Stmt::Return { value, span: start.merge(end) })
    }

    fn parse_import(&mut self) -> Result<Stmt> {
        let start = self.expect(&Token::Import, "'import'")?;
        let module = self.expect_ident("module name")?;
        let end = self.expect(&Token::Semi, "';'")?;
        Ok(Stmt::Import { module, span: start.merge(end) })
    }

    /// A block requires its closing brace; running out of input inside one
    /// is a fatal error, never an inferred close.
    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&Token::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.check(&Token::Eof) {
                return Err(self.error("'}'"));
            }
            body.push(self.parse_stmt()?);
        }
        self.expect(&Token::RBrace, "'}'")?;
        Ok(body)
    }

    // ---- Expressions ----

    fn parse_expr(&mut self) -> Result<Expr> {
        let left = self.parse_binary(0)?;
        if self.eat(&Token::Eq) {
            if !matches!(left, Expr::Ident { .. } | Expr::Index { .. }) {
                return Err(self.error("assignable target on the left of '='"));
            }
            // Right-associative: a = b = c
            let value = self.parse_expr()?;
            let span = left.span().merge(value.span());
            return Ok(Expr::Assign {
                target: Box::new(left),
                value: Box::new(value),
                span,
            });
        }
        Ok(left)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while let Some((prec, op)) = infix(self.peek()) {
            if prec < min_prec {
                break;
            }
            self.advance();
            // prec + 1: all binary operators are left-associative
            let right = self.parse_binary(prec + 1)?;
            let span = left.span().merge(right.span());
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Minus => Some(UnaryOp::Neg),
            Token::Bang => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let start = self.peek_span();
            self.advance();
            let operand = self.parse_unary()?;
            let span = start.merge(operand.span());
            return Ok(Expr::Unary { op, operand: Box::new(operand), span });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while self.check(&Token::LBracket) {
            self.advance();
            let index = self.parse_expr()?;
            let end = self.expect(&Token::RBracket, "']'")?;
            let span = expr.span().merge(end);
            expr = Expr::Index {
                object: Box::new(expr),
                index: Box::new(index),
                span,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.peek_span();
        match self.peek().clone() {
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Int(n), span })
            }
            Token::Float(x) => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Float(x), span })
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Str(s), span })
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Bool(true), span })
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Bool(false), span })
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Null, span })
            }
            Token::Ident(name) => {
                self.advance();
                if self.check(&Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self.expect(&Token::RParen, "')'")?;
                    return Ok(Expr::Call { callee: name, args, span: span.merge(end) });
                }
                Ok(Expr::Ident { name, span })
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(&Token::RBracket, "']'")?;
                Ok(Expr::Array { items, span: span.merge(end) })
            }
            _ => Err(self.error("expression")),
        }
    }
}
