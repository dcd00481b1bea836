use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::{Position, SourceMap};

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(r: std::ops::Range<usize>) -> Span {
        Span { start: r.start, end: r.end }
    }
}

// ---- Core AST types ----

/// Literal values as they appear in source. Integers and floats are kept
/// apart so the VM can apply promotion rules at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Arithmetic and comparison operators are the only ones the optimizer
    /// may fold; `And`/`Or` short-circuit and are lowered via jumps.
    pub fn is_foldable(self) -> bool {
        !matches!(self, BinOp::And | BinOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Expressions. Each node owns its children exclusively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal {
        value: Literal,
        #[serde(skip)]
        span: Span,
    },

    /// Variable reference.
    Ident {
        name: String,
        #[serde(skip)]
        span: Span,
    },

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
        #[serde(skip)]
        span: Span,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        #[serde(skip)]
        span: Span,
    },

    /// `target = value` — target is an identifier or an index expression.
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        #[serde(skip)]
        span: Span,
    },

    /// `callee(arg, ...)`
    Call {
        callee: String,
        args: Vec<Expr>,
        #[serde(skip)]
        span: Span,
    },

    /// `object[index]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        #[serde(skip)]
        span: Span,
    },

    /// `[a, b, c]`
    Array {
        items: Vec<Expr>,
        #[serde(skip)]
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. }
            | Expr::Ident { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Assign { span, .. }
            | Expr::Call { span, .. }
            | Expr::Index { span, .. }
            | Expr::Array { span, .. } => *span,
        }
    }
}

/// Statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `let name = value;`
    Let {
        name: String,
        value: Expr,
        #[serde(skip)]
        span: Span,
    },

    /// `fn name(params) { body }`
    Function {
        name: String,
        params: Vec<String>,
        body: Vec<Stmt>,
        #[serde(skip)]
        span: Span,
    },

    /// `if (cond) { } else { }` — else branch optional, may nest another if.
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
        #[serde(skip)]
        span: Span,
    },

    /// `while (cond) { body }`
    While {
        condition: Expr,
        body: Vec<Stmt>,
        #[serde(skip)]
        span: Span,
    },

    /// `for binding in start .. end { body }`
    For {
        binding: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
        #[serde(skip)]
        span: Span,
    },

    /// `try { body } catch (binding) { handler }` — parses, does not lower.
    Try {
        body: Vec<Stmt>,
        binding: String,
        handler: Vec<Stmt>,
        #[serde(skip)]
        span: Span,
    },

    /// `return;` or `return expr;`
    Return {
        value: Option<Expr>,
        #[serde(skip)]
        span: Span,
    },

    /// `import name;` — declares a compilation-unit dependency.
    Import {
        module: String,
        #[serde(skip)]
        span: Span,
    },

    /// Bare expression statement.
    Expr(Expr),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Let { span, .. }
            | Stmt::Function { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Try { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Import { span, .. } => *span,
            Stmt::Expr(e) => e.span(),
        }
    }
}

/// A complete parsed compilation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    /// Modules named by top-level `import` statements, in declaration order.
    pub fn imports(&self) -> Vec<&str> {
        self.statements
            .iter()
            .filter_map(|s| match s {
                Stmt::Import { module, .. } => Some(module.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_merge_takes_extremes() {
        let a = Span::new(5, 10);
        let b = Span::new(2, 15);
        assert_eq!(a.merge(b), Span::new(2, 15));
    }

    #[test]
    fn span_merge_non_overlapping() {
        let a = Span::new(0, 5);
        let b = Span::new(10, 20);
        assert_eq!(a.merge(b), Span::new(0, 20));
    }

    #[test]
    fn expr_span_reaches_variant_field() {
        let e = Expr::Binary {
            op: BinOp::Add,
            left: Box::new(Expr::Literal { value: Literal::Int(1), span: Span::new(0, 1) }),
            right: Box::new(Expr::Literal { value: Literal::Int(2), span: Span::new(4, 5) }),
            span: Span::new(0, 5),
        };
        assert_eq!(e.span(), Span::new(0, 5));
    }

    #[test]
    fn spans_not_serialized() {
        let s = Stmt::Let {
            name: "x".to_string(),
            value: Expr::Literal { value: Literal::Int(42), span: Span::new(8, 10) },
            span: Span::new(0, 10),
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("span"));
        assert!(json.contains("42"));
    }

    #[test]
    fn program_imports_in_order() {
        let prog = Program {
            statements: vec![
                Stmt::Import { module: "util".to_string(), span: Span::UNKNOWN },
                Stmt::Expr(Expr::Literal { value: Literal::Int(1), span: Span::UNKNOWN }),
                Stmt::Import { module: "math".to_string(), span: Span::UNKNOWN },
            ],
        };
        assert_eq!(prog.imports(), vec!["util", "math"]);
    }

    #[test]
    fn ast_json_round_trip() {
        let prog = Program {
            statements: vec![Stmt::Function {
                name: "double".to_string(),
                params: vec!["x".to_string()],
                body: vec![Stmt::Return {
                    value: Some(Expr::Binary {
                        op: BinOp::Mul,
                        left: Box::new(Expr::Ident { name: "x".to_string(), span: Span::UNKNOWN }),
                        right: Box::new(Expr::Literal { value: Literal::Int(2), span: Span::UNKNOWN }),
                        span: Span::UNKNOWN,
                    }),
                    span: Span::UNKNOWN,
                }],
                span: Span::UNKNOWN,
            }],
        };
        let json = serde_json::to_string_pretty(&prog).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back.statements.len(), 1);
    }
}
