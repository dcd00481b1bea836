use logos::{FilterResult, Logos};

use crate::ast::source_map::position_of;
use crate::ast::Span;

/// Why a token failed to lex. `Default` is what logos reports for bytes
/// that match no pattern at all.
#[derive(Debug, Clone, PartialEq, Default, thiserror::Error)]
pub enum LexErrorKind {
    #[default]
    #[error("unexpected character")]
    UnexpectedCharacter,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedBlockComment,
    #[error("integer literal out of range")]
    IntegerOverflow,
}

#[derive(Debug, thiserror::Error)]
#[error("lex error at {line}:{column}: {kind} '{snippet}'")]
pub struct LexError {
    pub line: usize,
    pub column: usize,
    pub kind: LexErrorKind,
    pub snippet: String,
}

/// Block comments are consumed in one bite; an unterminated one fails at
/// the opening `/*` so the report points where the construct began.
fn block_comment(lex: &mut logos::Lexer<Token>) -> FilterResult<(), LexErrorKind> {
    match lex.remainder().find("*/") {
        Some(i) => {
            lex.bump(i + 2);
            FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            FilterResult::Error(LexErrorKind::UnterminatedBlockComment)
        }
    }
}

fn int_literal(lex: &mut logos::Lexer<Token>) -> Result<i64, LexErrorKind> {
    lex.slice().parse::<i64>().map_err(|_| LexErrorKind::IntegerOverflow)
}

/// Translates the escape sequences inside a quoted literal. Unknown
/// escapes pass through with their backslash intact.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn string_body(lex: &mut logos::Lexer<Token>) -> String {
    let s = lex.slice();
    unescape(&s[1..s.len() - 1])
}

/// Anchors the `Eof` variant on a NUL byte while still reporting a NUL in
/// real source as an error. Broken out of the attribute so the `()` Ok type
/// is named rather than inferred.
fn eof_error(_: &mut logos::Lexer<Token>) -> Result<(), LexErrorKind> {
    Err(LexErrorKind::UnexpectedCharacter)
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(error = LexErrorKind)]
pub enum Token {
    // Keywords
    #[token("let")]
    Let,
    #[token("fn")]
    Fn,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("try")]
    Try,
    #[token("catch")]
    Catch,
    #[token("return")]
    Return,
    #[token("import")]
    Import,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // Literals
    #[regex(r"[0-9]+", int_literal)]
    Int(i64),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    // A terminated string wins on length; a lone quote means the literal
    // never closed on this line.
    #[regex(r#""(?:[^"\\\n]|\\.)*""#, string_body)]
    #[regex(r#"'(?:[^'\\\n]|\\.)*'"#, string_body)]
    #[token("\"", |_| Err(LexErrorKind::UnterminatedString))]
    #[token("'", |_| Err(LexErrorKind::UnterminatedString))]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("!")]
    Bang,
    #[token("=")]
    Eq,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token("..")]
    DotDot,

    #[token("/*", block_comment)]
    BlockComment,

    /// Appended by `lex` after the last scanned token. The NUL pattern
    /// only anchors the variant; a NUL byte in source is still an error,
    /// so the scanner itself never yields `Eof`.
    #[token("\0", eof_error)]
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Let => write!(f, "'let'"),
            Token::Fn => write!(f, "'fn'"),
            Token::If => write!(f, "'if'"),
            Token::Else => write!(f, "'else'"),
            Token::While => write!(f, "'while'"),
            Token::For => write!(f, "'for'"),
            Token::In => write!(f, "'in'"),
            Token::Try => write!(f, "'try'"),
            Token::Catch => write!(f, "'catch'"),
            Token::Return => write!(f, "'return'"),
            Token::Import => write!(f, "'import'"),
            Token::True => write!(f, "'true'"),
            Token::False => write!(f, "'false'"),
            Token::Null => write!(f, "'null'"),
            Token::Int(n) => write!(f, "integer {n}"),
            Token::Float(x) => write!(f, "float {x}"),
            Token::Str(_) => write!(f, "string literal"),
            Token::Ident(name) => write!(f, "identifier '{name}'"),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Percent => write!(f, "'%'"),
            Token::EqEq => write!(f, "'=='"),
            Token::BangEq => write!(f, "'!='"),
            Token::Lt => write!(f, "'<'"),
            Token::LtEq => write!(f, "'<='"),
            Token::Gt => write!(f, "'>'"),
            Token::GtEq => write!(f, "'>='"),
            Token::AmpAmp => write!(f, "'&&'"),
            Token::PipePipe => write!(f, "'||'"),
            Token::Bang => write!(f, "'!'"),
            Token::Eq => write!(f, "'='"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBrace => write!(f, "'{{'"),
            Token::RBrace => write!(f, "'}}'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Comma => write!(f, "','"),
            Token::Semi => write!(f, "';'"),
            Token::DotDot => write!(f, "'..'"),
            Token::BlockComment => write!(f, "comment"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// Lex source into a materialized token sequence with byte spans.
/// The sequence always ends with a single `Eof` token.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, Span::from(lexer.span()))),
            Err(kind) => {
                let span = lexer.span();
                let pos = position_of(source, span.start);
                return Err(LexError {
                    line: pos.line,
                    column: pos.column,
                    kind,
                    snippet: source[span].to_string(),
                });
            }
        }
    }

    tokens.push((Token::Eof, Span::new(source.len(), source.len())));
    Ok(tokens)
}
