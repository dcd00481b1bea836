//! AST-level optimization passes. Every pass is a semantics-preserving
//! rewrite: a pass that cannot prove a transformation safe leaves the
//! node untouched, so `optimize` never fails.

use std::collections::HashSet;

use crate::ast::{BinOp, Expr, Literal, Program, Span, Stmt, UnaryOp};
use crate::value::{self, Value};

/// How hard to try. `Basic` runs folding and dead-code elimination;
/// `Aggressive` adds inlining and loop unrolling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OptLevel {
    None,
    #[default]
    Basic,
    Aggressive,
}

/// Function bodies this small are inlining candidates.
const INLINE_STMT_LIMIT: usize = 3;
/// Constant ranges up to this many iterations are unrolled.
const UNROLL_ITER_LIMIT: i64 = 8;

pub fn optimize(program: Program, level: OptLevel) -> Program {
    if level == OptLevel::None {
        return program;
    }
    let mut stmts = dce_stmts(fold_stmts(program.statements));
    if level == OptLevel::Aggressive {
        stmts = unroll_stmts(inline_stmts(stmts));
        // Unrolling substitutes constants into cloned bodies and inlining
        // exposes argument literals; one more fold/sweep reaches the
        // fixpoint so running the whole sequence again changes nothing.
        stmts = dce_stmts(fold_stmts(stmts));
    }
    Program { statements: stmts }
}

// ---- Constant folding ----

fn fold_stmts(stmts: Vec<Stmt>) -> Vec<Stmt> {
    stmts.into_iter().map(fold_stmt).collect()
}

fn fold_stmt(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Let { name, value, span } => Stmt::Let { name, value: fold_expr(value), span },
        Stmt::Function { name, params, body, span } => {
            Stmt::Function { name, params, body: fold_stmts(body), span }
        }
        Stmt::If { condition, then_body, else_body, span } => Stmt::If {
            condition: fold_expr(condition),
            then_body: fold_stmts(then_body),
            else_body: else_body.map(fold_stmts),
            span,
        },
        Stmt::While { condition, body, span } => Stmt::While {
            condition: fold_expr(condition),
            body: fold_stmts(body),
            span,
        },
        Stmt::For { binding, start, end, body, span } => Stmt::For {
            binding,
            start: fold_expr(start),
            end: fold_expr(end),
            body: fold_stmts(body),
            span,
        },
        Stmt::Try { body, binding, handler, span } => Stmt::Try {
            body: fold_stmts(body),
            binding,
            handler: fold_stmts(handler),
            span,
        },
        Stmt::Return { value, span } => Stmt::Return { value: value.map(fold_expr), span },
        Stmt::Import { .. } => stmt,
        Stmt::Expr(e) => Stmt::Expr(fold_expr(e)),
    }
}

fn fold_expr(expr: Expr) -> Expr {
    match expr {
        Expr::Binary { op, left, right, span } => {
            let left = fold_expr(*left);
            let right = fold_expr(*right);
            if op.is_foldable() {
                if let (Some(a), Some(b)) = (literal_of(&left), literal_of(&right)) {
                    // The same arithmetic the VM runs; an operation that
                    // would fault at runtime (division by zero, type
                    // mismatch) is deliberately left unfolded.
                    if let Ok(v) = eval_binary(op, &a, &b) {
                        if let Some(lit) = value_to_literal(v) {
                            return Expr::Literal { value: lit, span };
                        }
                    }
                }
            }
            Expr::Binary { op, left: Box::new(left), right: Box::new(right), span }
        }
        Expr::Unary { op, operand, span } => {
            let operand = fold_expr(*operand);
            if let Some(a) = literal_of(&operand) {
                let folded = match op {
                    UnaryOp::Neg => value::neg(&a).ok(),
                    UnaryOp::Not => Some(Value::Bool(!a.is_truthy())),
                };
                if let Some(lit) = folded.and_then(value_to_literal) {
                    return Expr::Literal { value: lit, span };
                }
            }
            Expr::Unary { op, operand: Box::new(operand), span }
        }
        Expr::Assign { target, value, span } => Expr::Assign {
            target,
            value: Box::new(fold_expr(*value)),
            span,
        },
        Expr::Call { callee, args, span } => Expr::Call {
            callee,
            args: args.into_iter().map(fold_expr).collect(),
            span,
        },
        Expr::Index { object, index, span } => Expr::Index {
            object: Box::new(fold_expr(*object)),
            index: Box::new(fold_expr(*index)),
            span,
        },
        Expr::Array { items, span } => Expr::Array {
            items: items.into_iter().map(fold_expr).collect(),
            span,
        },
        Expr::Literal { .. } | Expr::Ident { .. } => expr,
    }
}

fn literal_of(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Literal { value, .. } => Some(match value {
            Literal::Int(n) => Value::Int(*n),
            Literal::Float(x) => Value::Float(*x),
            Literal::Str(s) => Value::str(s.as_str()),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Null => Value::Null,
        }),
        _ => None,
    }
}

fn value_to_literal(v: Value) -> Option<Literal> {
    Some(match v {
        Value::Int(n) => Literal::Int(n),
        Value::Float(x) => Literal::Float(x),
        Value::Str(s) => Literal::Str(s.to_string()),
        Value::Bool(b) => Literal::Bool(b),
        Value::Null => Literal::Null,
        Value::Array(_) => return None,
    })
}

fn eval_binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, value::ValueOpError> {
    match op {
        BinOp::Add => value::add(a, b),
        BinOp::Sub => value::sub(a, b),
        BinOp::Mul => value::mul(a, b),
        BinOp::Div => value::div(a, b),
        BinOp::Mod => value::rem(a, b),
        BinOp::Eq => Ok(Value::Bool(value::equals(a, b))),
        BinOp::Ne => Ok(Value::Bool(!value::equals(a, b))),
        BinOp::Lt => value::lt(a, b),
        BinOp::Le => value::le(a, b),
        BinOp::Gt => value::gt(a, b),
        BinOp::Ge => value::ge(a, b),
        BinOp::And | BinOp::Or => Err(value::ValueOpError::Type("short-circuit")),
    }
}

// ---- Dead code elimination ----

fn dce_stmts(stmts: Vec<Stmt>) -> Vec<Stmt> {
    // Recurse into nested bodies first, truncating each block at its
    // first unconditional return.
    let mut out: Vec<Stmt> = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        let is_return = matches!(stmt, Stmt::Return { .. });
        out.push(dce_stmt(stmt));
        if is_return {
            break;
        }
    }

    // Backward sweep: a `let` nothing downstream reads, whose value
    // cannot fault or produce side effects, disappears.
    let mut used: HashSet<String> = HashSet::new();
    let mut kept: Vec<Stmt> = Vec::new();
    for stmt in out.into_iter().rev() {
        match stmt {
            Stmt::Let { ref name, ref value, .. }
                if !used.contains(name) && removal_safe(value) =>
            {
                // dropped
            }
            Stmt::Let { name, value, span } => {
                used.remove(&name);
                collect_uses(&value, &mut used);
                kept.push(Stmt::Let { name, value, span });
            }
            other => {
                collect_stmt_uses(&other, &mut used);
                kept.push(other);
            }
        }
    }
    kept.reverse();
    kept
}

fn dce_stmt(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Function { name, params, body, span } => {
            Stmt::Function { name, params, body: dce_stmts(body), span }
        }
        Stmt::If { condition, then_body, else_body, span } => Stmt::If {
            condition,
            then_body: dce_stmts(then_body),
            else_body: else_body.map(dce_stmts),
            span,
        },
        Stmt::While { condition, body, span } => {
            Stmt::While { condition, body: dce_stmts(body), span }
        }
        Stmt::For { binding, start, end, body, span } => {
            Stmt::For { binding, start, end, body: dce_stmts(body), span }
        }
        Stmt::Try { body, binding, handler, span } => Stmt::Try {
            body: dce_stmts(body),
            binding,
            handler: dce_stmts(handler),
            span,
        },
        other => other,
    }
}

/// Safe to delete outright: evaluating it can neither fault nor touch
/// anything. Unfolded arithmetic stays — after constant folding, a
/// residual operation is one that faults or reads variables of unknown
/// type.
fn removal_safe(expr: &Expr) -> bool {
    match expr {
        Expr::Literal { .. } | Expr::Ident { .. } => true,
        Expr::Array { items, .. } => items.iter().all(removal_safe),
        Expr::Unary { op: UnaryOp::Not, operand, .. } => removal_safe(operand),
        _ => false,
    }
}

fn collect_stmt_uses(stmt: &Stmt, used: &mut HashSet<String>) {
    match stmt {
        Stmt::Let { value, .. } => collect_uses(value, used),
        Stmt::Function { body, .. } => {
            for s in body {
                collect_stmt_uses(s, used);
            }
        }
        Stmt::If { condition, then_body, else_body, .. } => {
            collect_uses(condition, used);
            for s in then_body {
                collect_stmt_uses(s, used);
            }
            if let Some(els) = else_body {
                for s in els {
                    collect_stmt_uses(s, used);
                }
            }
        }
        Stmt::While { condition, body, .. } => {
            collect_uses(condition, used);
            for s in body {
                collect_stmt_uses(s, used);
            }
        }
        Stmt::For { start, end, body, .. } => {
            collect_uses(start, used);
            collect_uses(end, used);
            for s in body {
                collect_stmt_uses(s, used);
            }
        }
        Stmt::Try { body, handler, .. } => {
            for s in body.iter().chain(handler) {
                collect_stmt_uses(s, used);
            }
        }
        Stmt::Return { value, .. } => {
            if let Some(v) = value {
                collect_uses(v, used);
            }
        }
        Stmt::Import { .. } => {}
        Stmt::Expr(e) => collect_uses(e, used),
    }
}

fn collect_uses(expr: &Expr, used: &mut HashSet<String>) {
    match expr {
        Expr::Literal { .. } => {}
        Expr::Ident { name, .. } => {
            used.insert(name.clone());
        }
        Expr::Binary { left, right, .. } => {
            collect_uses(left, used);
            collect_uses(right, used);
        }
        Expr::Unary { operand, .. } => collect_uses(operand, used),
        Expr::Assign { target, value, .. } => {
            collect_uses(target, used);
            collect_uses(value, used);
        }
        Expr::Call { args, .. } => {
            for a in args {
                collect_uses(a, used);
            }
        }
        Expr::Index { object, index, .. } => {
            collect_uses(object, used);
            collect_uses(index, used);
        }
        Expr::Array { items, .. } => {
            for i in items {
                collect_uses(i, used);
            }
        }
    }
}

// ---- Function inlining (aggressive) ----

/// A function whose whole body reduces to one call-free expression.
struct InlineCandidate {
    params: Vec<String>,
    /// Return expression with body-local `let`s already substituted in.
    expansion: Expr,
}

/// Inlining can create new candidates (a body whose only call was just
/// inlined away), so the pass runs to a fixpoint. Each round removes at
/// least one call site, which bounds the loop.
fn inline_stmts(mut stmts: Vec<Stmt>) -> Vec<Stmt> {
    loop {
        let mut candidates: Vec<(String, InlineCandidate)> = Vec::new();
        collect_candidates(&stmts, &mut candidates);
        if candidates.is_empty() {
            return stmts;
        }
        let rewritten: Vec<Stmt> = stmts
            .iter()
            .cloned()
            .map(|s| inline_stmt(s, &candidates))
            .collect();
        if rewritten == stmts {
            return stmts;
        }
        stmts = rewritten;
    }
}

fn collect_candidates(stmts: &[Stmt], out: &mut Vec<(String, InlineCandidate)>) {
    for stmt in stmts {
        if let Stmt::Function { name, params, body, .. } = stmt {
            if let Some(c) = candidate_of(params, body) {
                out.push((name.clone(), c));
            }
            collect_candidates(body, out);
        }
    }
}

/// Accepts bodies of at most three statements shaped as
/// `let a = pure; ... return expr;` where nothing in the body calls
/// (so inlining can never create new call sites, and recursion is
/// impossible by construction).
fn candidate_of(params: &[String], body: &[Stmt]) -> Option<InlineCandidate> {
    if body.is_empty() || body.len() > INLINE_STMT_LIMIT {
        return None;
    }
    let (last, lets) = body.split_last()?;
    let Stmt::Return { value: Some(ret), .. } = last else {
        return None;
    };

    let mut expansion = ret.clone();
    for stmt in lets.iter().rev() {
        let Stmt::Let { name, value, .. } = stmt else {
            return None;
        };
        if !effect_free(value) {
            return None;
        }
        // A binding the return expression never reads would vanish; that
        // is only sound when its value cannot fault either.
        if occurrences(&expansion, name) == 0 && !removal_safe(value) {
            return None;
        }
        expansion = substitute(expansion, name, value);
    }

    if !effect_free(&expansion) {
        return None;
    }
    // Every remaining free name must be a parameter; anything else would
    // change meaning when moved to the call site.
    let mut free = HashSet::new();
    collect_uses(&expansion, &mut free);
    if !free.iter().all(|n| params.contains(n)) {
        return None;
    }

    Some(InlineCandidate { params: params.to_vec(), expansion })
}

/// No calls, no assignments — duplicating or dropping the expression
/// cannot add or lose side effects. (It may still fault; fault-capable
/// subtrees are handled by the occurrence guard at the call site.)
fn effect_free(expr: &Expr) -> bool {
    match expr {
        Expr::Call { .. } | Expr::Assign { .. } => false,
        Expr::Literal { .. } | Expr::Ident { .. } => true,
        Expr::Binary { left, right, .. } => effect_free(left) && effect_free(right),
        Expr::Unary { operand, .. } => effect_free(operand),
        Expr::Index { object, index, .. } => effect_free(object) && effect_free(index),
        Expr::Array { items, .. } => items.iter().all(effect_free),
    }
}

fn occurrences(expr: &Expr, name: &str) -> usize {
    match expr {
        Expr::Ident { name: n, .. } => usize::from(n == name),
        Expr::Literal { .. } => 0,
        Expr::Binary { left, right, .. } => {
            occurrences(left, name) + occurrences(right, name)
        }
        Expr::Unary { operand, .. } => occurrences(operand, name),
        Expr::Assign { target, value, .. } => {
            occurrences(target, name) + occurrences(value, name)
        }
        Expr::Call { args, .. } => args.iter().map(|a| occurrences(a, name)).sum(),
        Expr::Index { object, index, .. } => {
            occurrences(object, name) + occurrences(index, name)
        }
        Expr::Array { items, .. } => items.iter().map(|i| occurrences(i, name)).sum(),
    }
}

fn substitute(expr: Expr, name: &str, replacement: &Expr) -> Expr {
    match expr {
        Expr::Ident { name: n, .. } if n == name => replacement.clone(),
        Expr::Ident { .. } | Expr::Literal { .. } => expr,
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(substitute(*left, name, replacement)),
            right: Box::new(substitute(*right, name, replacement)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(substitute(*operand, name, replacement)),
            span,
        },
        Expr::Assign { target, value, span } => Expr::Assign {
            target: Box::new(substitute(*target, name, replacement)),
            value: Box::new(substitute(*value, name, replacement)),
            span,
        },
        Expr::Call { callee, args, span } => Expr::Call {
            callee,
            args: args.into_iter().map(|a| substitute(a, name, replacement)).collect(),
            span,
        },
        Expr::Index { object, index, span } => Expr::Index {
            object: Box::new(substitute(*object, name, replacement)),
            index: Box::new(substitute(*index, name, replacement)),
            span,
        },
        Expr::Array { items, span } => Expr::Array {
            items: items.into_iter().map(|i| substitute(i, name, replacement)).collect(),
            span,
        },
    }
}

fn inline_stmt(stmt: Stmt, funcs: &[(String, InlineCandidate)]) -> Stmt {
    match stmt {
        Stmt::Let { name, value, span } => {
            Stmt::Let { name, value: inline_expr(value, funcs), span }
        }
        Stmt::Function { name, params, body, span } => Stmt::Function {
            name,
            params,
            body: body.into_iter().map(|s| inline_stmt(s, funcs)).collect(),
            span,
        },
        Stmt::If { condition, then_body, else_body, span } => Stmt::If {
            condition: inline_expr(condition, funcs),
            then_body: then_body.into_iter().map(|s| inline_stmt(s, funcs)).collect(),
            else_body: else_body.map(|b| b.into_iter().map(|s| inline_stmt(s, funcs)).collect()),
            span,
        },
        Stmt::While { condition, body, span } => Stmt::While {
            condition: inline_expr(condition, funcs),
            body: body.into_iter().map(|s| inline_stmt(s, funcs)).collect(),
            span,
        },
        Stmt::For { binding, start, end, body, span } => Stmt::For {
            binding,
            start: inline_expr(start, funcs),
            end: inline_expr(end, funcs),
            body: body.into_iter().map(|s| inline_stmt(s, funcs)).collect(),
            span,
        },
        Stmt::Try { body, binding, handler, span } => Stmt::Try {
            body: body.into_iter().map(|s| inline_stmt(s, funcs)).collect(),
            binding,
            handler: handler.into_iter().map(|s| inline_stmt(s, funcs)).collect(),
            span,
        },
        Stmt::Return { value, span } => {
            Stmt::Return { value: value.map(|v| inline_expr(v, funcs)), span }
        }
        Stmt::Import { .. } => stmt,
        Stmt::Expr(e) => Stmt::Expr(inline_expr(e, funcs)),
    }
}

fn inline_expr(expr: Expr, funcs: &[(String, InlineCandidate)]) -> Expr {
    match expr {
        Expr::Call { callee, args, span } => {
            let args: Vec<Expr> =
                args.into_iter().map(|a| inline_expr(a, funcs)).collect();
            if let Some((_, cand)) = funcs.iter().find(|(n, _)| *n == callee) {
                if let Some(expanded) = try_expand(cand, &args) {
                    return expanded;
                }
            }
            Expr::Call { callee, args, span }
        }
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(inline_expr(*left, funcs)),
            right: Box::new(inline_expr(*right, funcs)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(inline_expr(*operand, funcs)),
            span,
        },
        Expr::Assign { target, value, span } => Expr::Assign {
            target: Box::new(inline_expr(*target, funcs)),
            value: Box::new(inline_expr(*value, funcs)),
            span,
        },
        Expr::Index { object, index, span } => Expr::Index {
            object: Box::new(inline_expr(*object, funcs)),
            index: Box::new(inline_expr(*index, funcs)),
            span,
        },
        Expr::Array { items, span } => Expr::Array {
            items: items.into_iter().map(|i| inline_expr(i, funcs)).collect(),
            span,
        },
        Expr::Literal { .. } | Expr::Ident { .. } => expr,
    }
}

/// Substitute arguments for parameters. An argument that is not a bare
/// literal or identifier must land in exactly one place, or evaluation
/// count would change. All parameters are replaced in a single walk so a
/// caller variable that shares a parameter's name is never captured.
fn try_expand(cand: &InlineCandidate, args: &[Expr]) -> Option<Expr> {
    if args.len() != cand.params.len() {
        return None;
    }
    let mut non_atomic = 0;
    for (param, arg) in cand.params.iter().zip(args) {
        let atomic = matches!(arg, Expr::Literal { .. } | Expr::Ident { .. });
        if !atomic {
            non_atomic += 1;
            if occurrences(&cand.expansion, param) != 1 {
                return None;
            }
        }
    }
    // Two effectful arguments could evaluate in a different order inside
    // the expansion than the call would have evaluated them.
    if non_atomic > 1 {
        return None;
    }
    let subs: Vec<(&str, &Expr)> = cand
        .params
        .iter()
        .map(|p| p.as_str())
        .zip(args)
        .collect();
    Some(subst_many(cand.expansion.clone(), &subs))
}

/// Simultaneous substitution; replacements are not re-visited.
fn subst_many(expr: Expr, subs: &[(&str, &Expr)]) -> Expr {
    match expr {
        Expr::Ident { ref name, .. } => match subs.iter().find(|(n, _)| n == name) {
            Some((_, replacement)) => (*replacement).clone(),
            None => expr,
        },
        Expr::Literal { .. } => expr,
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(subst_many(*left, subs)),
            right: Box::new(subst_many(*right, subs)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(subst_many(*operand, subs)),
            span,
        },
        Expr::Assign { target, value, span } => Expr::Assign {
            target: Box::new(subst_many(*target, subs)),
            value: Box::new(subst_many(*value, subs)),
            span,
        },
        Expr::Call { callee, args, span } => Expr::Call {
            callee,
            args: args.into_iter().map(|a| subst_many(a, subs)).collect(),
            span,
        },
        Expr::Index { object, index, span } => Expr::Index {
            object: Box::new(subst_many(*object, subs)),
            index: Box::new(subst_many(*index, subs)),
            span,
        },
        Expr::Array { items, span } => Expr::Array {
            items: items.into_iter().map(|i| subst_many(i, subs)).collect(),
            span,
        },
    }
}

// ---- Loop unrolling (aggressive) ----

fn unroll_stmts(stmts: Vec<Stmt>) -> Vec<Stmt> {
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        unroll_into(stmt, &mut out);
    }
    out
}

fn unroll_into(stmt: Stmt, out: &mut Vec<Stmt>) {
    match stmt {
        Stmt::For { binding, start, end, body, span } => {
            let body = unroll_stmts(body);
            let bounds = match (&start, &end) {
                (
                    Expr::Literal { value: Literal::Int(a), .. },
                    Expr::Literal { value: Literal::Int(b), .. },
                ) => Some((*a, *b)),
                _ => None,
            };
            let iterations = bounds.and_then(|(a, b)| b.checked_sub(a));
            match (bounds, iterations) {
                (Some((a, b)), Some(n))
                    if n <= UNROLL_ITER_LIMIT && unrollable(&binding, &body) =>
                {
                    for i in a..b {
                        let replacement =
                            Expr::Literal { value: Literal::Int(i), span: Span::UNKNOWN };
                        for s in &body {
                            out.push(subst_stmt(s.clone(), &binding, &replacement));
                        }
                    }
                }
                _ => out.push(Stmt::For { binding, start, end, body, span }),
            }
        }
        Stmt::Function { name, params, body, span } => {
            out.push(Stmt::Function { name, params, body: unroll_stmts(body), span });
        }
        Stmt::If { condition, then_body, else_body, span } => {
            out.push(Stmt::If {
                condition,
                then_body: unroll_stmts(then_body),
                else_body: else_body.map(unroll_stmts),
                span,
            });
        }
        Stmt::While { condition, body, span } => {
            out.push(Stmt::While { condition, body: unroll_stmts(body), span });
        }
        Stmt::Try { body, binding, handler, span } => {
            out.push(Stmt::Try {
                body: unroll_stmts(body),
                binding,
                handler: unroll_stmts(handler),
                span,
            });
        }
        other => out.push(other),
    }
}

/// The body may read the loop variable but must not rebind or reassign
/// it, and must not declare functions (cloning those would collide).
fn unrollable(binding: &str, body: &[Stmt]) -> bool {
    body.iter().all(|s| stmt_keeps_binding(s, binding))
}

fn stmt_keeps_binding(stmt: &Stmt, binding: &str) -> bool {
    match stmt {
        Stmt::Let { name, value, .. } => name != binding && expr_keeps_binding(value, binding),
        Stmt::Function { .. } => false,
        Stmt::If { condition, then_body, else_body, .. } => {
            expr_keeps_binding(condition, binding)
                && then_body.iter().all(|s| stmt_keeps_binding(s, binding))
                && else_body
                    .as_ref()
                    .is_none_or(|b| b.iter().all(|s| stmt_keeps_binding(s, binding)))
        }
        Stmt::While { condition, body, .. } => {
            expr_keeps_binding(condition, binding)
                && body.iter().all(|s| stmt_keeps_binding(s, binding))
        }
        Stmt::For { binding: inner, start, end, body, .. } => {
            inner != binding
                && expr_keeps_binding(start, binding)
                && expr_keeps_binding(end, binding)
                && body.iter().all(|s| stmt_keeps_binding(s, binding))
        }
        Stmt::Try { body, handler, .. } => body
            .iter()
            .chain(handler)
            .all(|s| stmt_keeps_binding(s, binding)),
        Stmt::Return { value, .. } => value
            .as_ref()
            .is_none_or(|v| expr_keeps_binding(v, binding)),
        Stmt::Import { .. } => true,
        Stmt::Expr(e) => expr_keeps_binding(e, binding),
    }
}

fn expr_keeps_binding(expr: &Expr, binding: &str) -> bool {
    match expr {
        Expr::Assign { target, value, .. } => {
            !matches!(target.as_ref(), Expr::Ident { name, .. } if name == binding)
                && expr_keeps_binding(target, binding)
                && expr_keeps_binding(value, binding)
        }
        Expr::Binary { left, right, .. } => {
            expr_keeps_binding(left, binding) && expr_keeps_binding(right, binding)
        }
        Expr::Unary { operand, .. } => expr_keeps_binding(operand, binding),
        Expr::Call { args, .. } => args.iter().all(|a| expr_keeps_binding(a, binding)),
        Expr::Index { object, index, .. } => {
            expr_keeps_binding(object, binding) && expr_keeps_binding(index, binding)
        }
        Expr::Array { items, .. } => items.iter().all(|i| expr_keeps_binding(i, binding)),
        Expr::Literal { .. } | Expr::Ident { .. } => true,
    }
}

fn subst_stmt(stmt: Stmt, name: &str, replacement: &Expr) -> Stmt {
    match stmt {
        Stmt::Let { name: n, value, span } => {
            Stmt::Let { name: n, value: substitute(value, name, replacement), span }
        }
        Stmt::If { condition, then_body, else_body, span } => Stmt::If {
            condition: substitute(condition, name, replacement),
            then_body: then_body
                .into_iter()
                .map(|s| subst_stmt(s, name, replacement))
                .collect(),
            else_body: else_body.map(|b| {
                b.into_iter().map(|s| subst_stmt(s, name, replacement)).collect()
            }),
            span,
        },
        Stmt::While { condition, body, span } => Stmt::While {
            condition: substitute(condition, name, replacement),
            body: body.into_iter().map(|s| subst_stmt(s, name, replacement)).collect(),
            span,
        },
        Stmt::For { binding, start, end, body, span } => Stmt::For {
            binding,
            start: substitute(start, name, replacement),
            end: substitute(end, name, replacement),
            body: body.into_iter().map(|s| subst_stmt(s, name, replacement)).collect(),
            span,
        },
        Stmt::Try { body, binding, handler, span } => Stmt::Try {
            body: body.into_iter().map(|s| subst_stmt(s, name, replacement)).collect(),
            binding,
            handler: handler
                .into_iter()
                .map(|s| subst_stmt(s, name, replacement))
                .collect(),
            span,
        },
        Stmt::Return { value, span } => Stmt::Return {
            value: value.map(|v| substitute(v, name, replacement)),
            span,
        },
        Stmt::Expr(e) => Stmt::Expr(substitute(e, name, replacement)),
        Stmt::Function { .. } | Stmt::Import { .. } => stmt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse;

    fn opt(source: &str, level: OptLevel) -> Program {
        let program = parse(lex(source).unwrap(), source).unwrap();
        optimize(program, level)
    }

    fn int_lit(expr: &Expr) -> Option<i64> {
        match expr {
            Expr::Literal { value: Literal::Int(n), .. } => Some(*n),
            _ => None,
        }
    }

    #[test]
    fn folds_addition_to_single_literal() {
        let p = opt("10 + 20;", OptLevel::Basic);
        let Stmt::Expr(e) = &p.statements[0] else { panic!() };
        assert_eq!(int_lit(e), Some(30));
    }

    #[test]
    fn folding_is_idempotent() {
        let p1 = opt("10 + 20 * 3 < 100;", OptLevel::Basic);
        let p2 = optimize(p1.clone(), OptLevel::Basic);
        assert_eq!(p1, p2);
    }

    #[test]
    fn folds_comparisons() {
        let p = opt("1 < 2;", OptLevel::Basic);
        let Stmt::Expr(Expr::Literal { value: Literal::Bool(true), .. }) = &p.statements[0]
        else {
            panic!("expected folded true, got {:?}", p.statements[0]);
        };
    }

    #[test]
    fn division_by_zero_never_folds() {
        let p = opt("1 / 0;", OptLevel::Basic);
        assert!(matches!(&p.statements[0], Stmt::Expr(Expr::Binary { op: BinOp::Div, .. })));
    }

    #[test]
    fn calls_never_fold() {
        let p = opt("fn f() { return 1; } f() + 0;", OptLevel::Basic);
        assert!(matches!(&p.statements[1], Stmt::Expr(Expr::Binary { .. })));
    }

    #[test]
    fn statements_after_return_are_removed() {
        let p = opt("fn f() { return 1; f(); } ", OptLevel::Basic);
        let Stmt::Function { body, .. } = &p.statements[0] else { panic!() };
        assert_eq!(body.len(), 1);
        assert!(matches!(body[0], Stmt::Return { .. }));
    }

    #[test]
    fn unread_binding_is_removed() {
        let p = opt("let x = 1; 2;", OptLevel::Basic);
        assert_eq!(p.statements.len(), 1);
        assert!(matches!(&p.statements[0], Stmt::Expr(_)));
    }

    #[test]
    fn read_binding_is_kept() {
        let p = opt("let x = 1; x + 2;", OptLevel::Basic);
        assert_eq!(p.statements.len(), 2);
    }

    #[test]
    fn binding_with_call_value_is_kept() {
        let p = opt("fn f() { return 1; } let x = f(); 2;", OptLevel::Basic);
        assert!(p.statements.iter().any(|s| matches!(s, Stmt::Let { .. })));
    }

    #[test]
    fn shadowed_binding_use_analysis() {
        let p = opt("let x = 1; let x = x + 1; x;", OptLevel::Basic);
        // Both bindings feed the final read.
        assert_eq!(p.statements.len(), 3);
    }

    #[test]
    fn small_function_inlined_and_folded() {
        let p = opt("fn double(x) { return x * 2; } double(5);", OptLevel::Aggressive);
        let Stmt::Expr(e) = p.statements.last().unwrap() else { panic!() };
        assert_eq!(int_lit(e), Some(10));
    }

    #[test]
    fn inlining_keeps_single_evaluation_of_impure_args() {
        // f is recursive so f(2) survives as a call; g uses its parameter
        // twice, so passing a call through would double-evaluate it.
        let src = "fn f(n) { if (n > 0) { return f(n - 1); } return 0; }\n\
                   fn g(x) { return x + x; }\n\
                   g(f(2));";
        let p = opt(src, OptLevel::Aggressive);
        let Stmt::Expr(e) = p.statements.last().unwrap() else { panic!() };
        assert!(matches!(e, Expr::Call { callee, .. } if callee == "g"));
    }

    #[test]
    fn inlining_chains_through_wrappers() {
        // Round one rewrites g's body to `return y;`; round two inlines
        // g(3) itself, so the result is already at its fixpoint.
        let src = "fn f(x) { return x; } fn g(y) { return f(y); } g(3);";
        let p = opt(src, OptLevel::Aggressive);
        let Stmt::Expr(e) = p.statements.last().unwrap() else { panic!() };
        assert_eq!(int_lit(e), Some(3));
    }

    #[test]
    fn recursive_function_never_inlined() {
        let src = "fn fac(n) { if (n < 2) { return 1; } return n * fac(n - 1); } fac(5);";
        let p = opt(src, OptLevel::Aggressive);
        let Stmt::Expr(e) = p.statements.last().unwrap() else { panic!() };
        assert!(matches!(e, Expr::Call { callee, .. } if callee == "fac"));
    }

    #[test]
    fn basic_level_does_not_inline() {
        let p = opt("fn double(x) { return x * 2; } double(5);", OptLevel::Basic);
        let Stmt::Expr(e) = p.statements.last().unwrap() else { panic!() };
        assert!(matches!(e, Expr::Call { .. }));
    }

    #[test]
    fn small_constant_loop_unrolls() {
        let p = opt(
            "let s = 0; for i in 0 .. 3 { s = s + i; }",
            OptLevel::Aggressive,
        );
        assert!(!p.statements.iter().any(|s| matches!(s, Stmt::For { .. })));
        // let + three unrolled assignments
        assert_eq!(p.statements.len(), 4);
    }

    #[test]
    fn large_or_dynamic_loops_stay() {
        let p = opt("let s = 0; for i in 0 .. 100 { s = s + i; }", OptLevel::Aggressive);
        assert!(p.statements.iter().any(|s| matches!(s, Stmt::For { .. })));

        let p = opt(
            "let n = 4; let s = 0; for i in 0 .. n { s = s + i; }",
            OptLevel::Aggressive,
        );
        assert!(p.statements.iter().any(|s| matches!(s, Stmt::For { .. })));
    }

    #[test]
    fn loop_reassigning_binding_stays() {
        let p = opt("for i in 0 .. 2 { i = 5; }", OptLevel::Aggressive);
        assert!(p.statements.iter().any(|s| matches!(s, Stmt::For { .. })));
    }

    #[test]
    fn aggressive_pipeline_is_idempotent() {
        let src = "fn double(x) { return x * 2; }\n\
                   let s = 0;\n\
                   for i in 0 .. 4 { s = s + double(i); }\n\
                   if (s > 0) { s = s - 1; }\n\
                   s;";
        let p1 = opt(src, OptLevel::Aggressive);
        let p2 = optimize(p1.clone(), OptLevel::Aggressive);
        assert_eq!(p1, p2);
    }

    #[test]
    fn none_level_is_identity() {
        let src = "let x = 1 + 2; x;";
        let program = parse(lex(src).unwrap(), src).unwrap();
        let p = optimize(program.clone(), OptLevel::None);
        assert_eq!(p, program);
    }
}
