use crate::ast::{BinOp, Expr, Literal, Program, Span, Stmt, UnaryOp};
use crate::bytecode::{BytecodeError, Chunk, ChunkBuilder, CodeObject, Instruction, Op};
use crate::value::Value;

/// Default register-file size per call frame.
pub const DEFAULT_REGISTER_BUDGET: u16 = 256;

#[derive(Debug, thiserror::Error)]
pub enum CodeGenError {
    #[error("no bytecode lowering for {construct}")]
    Unsupported { construct: &'static str, span: Span },
    #[error("register budget of {budget} exceeded")]
    RegisterBudget { budget: u16, span: Span },
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String, span: Span },
    #[error("undefined function '{name}'")]
    UndefinedFunction { name: String, span: Span },
    #[error("function '{name}' redefined")]
    DuplicateFunction { name: String, span: Span },
    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    ArityMismatch { name: String, expected: u8, got: usize, span: Span },
    #[error("too many parameters for function '{name}'")]
    TooManyParams { name: String, span: Span },
    #[error("too many functions in one unit")]
    TooManyFunctions,
    #[error("constant pool limit exceeded")]
    TooManyConstants,
    #[error(transparent)]
    Emit(#[from] BytecodeError),
}

type Result<T> = std::result::Result<T, CodeGenError>;

/// Lower a parsed program to a code object with the default register
/// budget.
pub fn generate(program: &Program) -> Result<CodeObject> {
    generate_with_budget(program, DEFAULT_REGISTER_BUDGET)
}

pub fn generate_with_budget(program: &Program, budget: u16) -> Result<CodeObject> {
    let budget = budget.min(DEFAULT_REGISTER_BUDGET);

    // Pre-pass: collect every function so calls can reference forward
    // declarations. Chunk 0 is the unit body; functions follow in
    // declaration order.
    let mut funcs: Vec<(&str, &[String], &[Stmt], Span)> = Vec::new();
    collect_functions(&program.statements, &mut funcs)?;
    if funcs.len() > u8::MAX as usize {
        return Err(CodeGenError::TooManyFunctions);
    }

    let table: Vec<(String, u8)> = funcs
        .iter()
        .map(|(name, params, _, span)| {
            let arity = u8::try_from(params.len()).map_err(|_| CodeGenError::TooManyParams {
                name: name.to_string(),
                span: *span,
            })?;
            Ok((name.to_string(), arity))
        })
        .collect::<Result<_>>()?;

    let mut chunks = Vec::with_capacity(funcs.len() + 1);

    let mut main = FuncCompiler::new(None, 0, budget, &table);
    main.compile_main(&program.statements)?;
    chunks.push(main.finish()?);

    for (name, params, body, _) in &funcs {
        let mut fc = FuncCompiler::new(Some(name.to_string()), params.len() as u8, budget, &table);
        for (i, p) in params.iter().enumerate() {
            fc.locals.push((p.clone(), i as u8));
        }
        fc.compile_body(body)?;
        fc.emit_implicit_return()?;
        chunks.push(fc.finish()?);
    }

    Ok(CodeObject { chunks })
}

fn collect_functions<'a>(
    stmts: &'a [Stmt],
    out: &mut Vec<(&'a str, &'a [String], &'a [Stmt], Span)>,
) -> Result<()> {
    for stmt in stmts {
        match stmt {
            Stmt::Function { name, params, body, span } => {
                if out.iter().any(|(n, ..)| *n == name) {
                    return Err(CodeGenError::DuplicateFunction {
                        name: name.clone(),
                        span: *span,
                    });
                }
                out.push((name, params, body, *span));
                collect_functions(body, out)?;
            }
            Stmt::If { then_body, else_body, .. } => {
                collect_functions(then_body, out)?;
                if let Some(e) = else_body {
                    collect_functions(e, out)?;
                }
            }
            Stmt::While { body, .. } | Stmt::For { body, .. } => {
                collect_functions(body, out)?;
            }
            Stmt::Try { body, handler, .. } => {
                collect_functions(body, out)?;
                collect_functions(handler, out)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Per-chunk lowering state. Locals live directly in registers; a
/// variable reference costs no instruction. Registers above the live
/// locals are statement-scoped temporaries reclaimed on the fly, so
/// sibling blocks reuse the same window.
struct FuncCompiler<'a> {
    builder: ChunkBuilder,
    locals: Vec<(String, u8)>,
    next_reg: u16,
    max_reg: u16,
    budget: u16,
    funcs: &'a [(String, u8)],
}

impl<'a> FuncCompiler<'a> {
    fn new(name: Option<String>, arity: u8, budget: u16, funcs: &'a [(String, u8)]) -> Self {
        FuncCompiler {
            builder: ChunkBuilder::new(name, arity),
            locals: Vec::new(),
            next_reg: arity as u16,
            max_reg: arity as u16,
            budget,
            funcs,
        }
    }

    fn alloc_reg(&mut self, span: Span) -> Result<u8> {
        if self.next_reg >= self.budget {
            return Err(CodeGenError::RegisterBudget { budget: self.budget, span });
        }
        let r = self.next_reg as u8;
        self.next_reg += 1;
        self.max_reg = self.max_reg.max(self.next_reg);
        Ok(r)
    }

    /// Reserve `n` consecutive registers starting at `next_reg` without
    /// touching them (argument and array-element windows).
    fn reserve(&mut self, n: usize, span: Span) -> Result<u16> {
        let base = self.next_reg;
        let end = base as usize + n;
        if end > self.budget as usize {
            return Err(CodeGenError::RegisterBudget { budget: self.budget, span });
        }
        self.next_reg = end as u16;
        self.max_reg = self.max_reg.max(self.next_reg);
        Ok(base)
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals.iter().rev().find(|(n, _)| n == name).map(|(_, r)| *r)
    }

    fn konst(&mut self, value: Value) -> Result<u16> {
        if self.builder.const_count() >= u16::MAX as usize {
            return Err(CodeGenError::TooManyConstants);
        }
        Ok(self.builder.add_const(value))
    }

    fn finish(self) -> Result<Chunk> {
        Ok(self.builder.finish(self.max_reg)?)
    }

    // ---- Statements ----

    /// Top-level body: register 0 is the unit result slot, updated after
    /// every expression statement so halting yields the value of the
    /// last one evaluated.
    fn compile_main(&mut self, stmts: &[Stmt]) -> Result<()> {
        let result = self.alloc_reg(Span::UNKNOWN)?;
        let nil = self.konst(Value::Null)?;
        self.builder.emit(Instruction::abx(Op::LoadConst, result, nil));

        for stmt in stmts {
            if let Some(reg) = self.compile_stmt(stmt)? {
                if reg != result {
                    self.builder.emit(Instruction::abc(Op::Move, result, reg, 0));
                }
            }
        }

        // Always present, even after a trailing top-level `return`: forward
        // jumps out of a final `if` land here and must yield the result
        // slot, not fall off the end.
        self.builder.emit(Instruction::abc(Op::Return, result, 0, 0));
        Ok(())
    }

    fn compile_body(&mut self, stmts: &[Stmt]) -> Result<()> {
        let saved_locals = self.locals.len();
        let saved_reg = self.next_reg;
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        self.locals.truncate(saved_locals);
        self.next_reg = saved_reg;
        Ok(())
    }

    fn emit_implicit_return(&mut self) -> Result<()> {
        if self.builder.last_op() != Some(Op::Return) {
            let r = self.alloc_reg(Span::UNKNOWN)?;
            let nil = self.konst(Value::Null)?;
            self.builder.emit(Instruction::abx(Op::LoadConst, r, nil));
            self.builder.emit(Instruction::abc(Op::Return, r, 0, 0));
        }
        Ok(())
    }

    /// Returns the result register for expression statements so the
    /// caller can forward it; other statements yield nothing.
    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<Option<u8>> {
        match stmt {
            Stmt::Let { name, value, span } => {
                let saved = self.next_reg;
                let value_reg = self.compile_expr(value)?;
                // Pin the variable into the first free slot; temporaries
                // used while computing the value are reclaimed.
                self.next_reg = saved;
                let var_reg = self.alloc_reg(*span)?;
                if value_reg != var_reg {
                    self.builder.emit(Instruction::abc(Op::Move, var_reg, value_reg, 0));
                }
                self.locals.push((name.clone(), var_reg));
                Ok(None)
            }

            // Bodies were lowered to chunks in the pre-pass; the
            // declaration itself emits nothing.
            Stmt::Function { .. } => Ok(None),

            Stmt::If { condition, then_body, else_body, .. } => {
                let saved = self.next_reg;
                let cond = self.compile_expr(condition)?;
                self.next_reg = saved;
                let else_jump = self.builder.emit_jump_placeholder(Op::JumpIfFalse, cond);
                self.compile_body(then_body)?;
                match else_body {
                    Some(els) => {
                        let end_jump = self.builder.emit_jump_placeholder(Op::Jump, 0);
                        self.builder.patch_to_here(else_jump)?;
                        self.compile_body(els)?;
                        self.builder.patch_to_here(end_jump)?;
                    }
                    None => self.builder.patch_to_here(else_jump)?,
                }
                Ok(None)
            }

            Stmt::While { condition, body, .. } => {
                let loop_top = self.builder.here();
                let saved = self.next_reg;
                let cond = self.compile_expr(condition)?;
                self.next_reg = saved;
                let exit = self.builder.emit_jump_placeholder(Op::JumpIfFalse, cond);
                self.compile_body(body)?;
                self.builder.emit_jump_back(loop_top)?;
                self.builder.patch_to_here(exit)?;
                Ok(None)
            }

            Stmt::For { binding, start, end, body, span } => {
                let saved_locals = self.locals.len();
                let saved_reg = self.next_reg;

                // Loop state registers stay pinned for the loop's extent:
                // the binding, the limit, and the step constant.
                let tmp = self.compile_expr(start)?;
                self.next_reg = saved_reg;
                let var = self.alloc_reg(*span)?;
                if tmp != var {
                    self.builder.emit(Instruction::abc(Op::Move, var, tmp, 0));
                }
                self.locals.push((binding.clone(), var));

                let limit_tmp = self.compile_expr(end)?;
                self.next_reg = var as u16 + 1;
                let limit = self.alloc_reg(*span)?;
                if limit_tmp != limit {
                    self.builder.emit(Instruction::abc(Op::Move, limit, limit_tmp, 0));
                }

                let one = self.alloc_reg(*span)?;
                let one_k = self.konst(Value::Int(1))?;
                self.builder.emit(Instruction::abx(Op::LoadConst, one, one_k));

                let loop_top = self.builder.here();
                let cond = self.alloc_reg(*span)?;
                self.builder.emit(Instruction::abc(Op::Lt, cond, var, limit));
                let exit = self.builder.emit_jump_placeholder(Op::JumpIfFalse, cond);
                self.next_reg = cond as u16; // cond is per-iteration scratch

                self.compile_body(body)?;

                self.builder.emit(Instruction::abc(Op::Add, var, var, one));
                self.builder.emit_jump_back(loop_top)?;
                self.builder.patch_to_here(exit)?;

                self.locals.truncate(saved_locals);
                self.next_reg = saved_reg;
                Ok(None)
            }

            Stmt::Try { span, .. } => {
                Err(CodeGenError::Unsupported { construct: "try/catch", span: *span })
            }

            Stmt::Return { value, span } => {
                let saved = self.next_reg;
                let reg = match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => {
                        let r = self.alloc_reg(*span)?;
                        let nil = self.konst(Value::Null)?;
                        self.builder.emit(Instruction::abx(Op::LoadConst, r, nil));
                        r
                    }
                };
                self.builder.emit(Instruction::abc(Op::Return, reg, 0, 0));
                self.next_reg = saved;
                Ok(None)
            }

            // Dependency metadata for the incremental layer only.
            Stmt::Import { .. } => Ok(None),

            Stmt::Expr(expr) => {
                let saved = self.next_reg;
                let reg = self.compile_expr(expr)?;
                self.next_reg = saved;
                Ok(Some(reg))
            }
        }
    }

    // ---- Expressions ----

    fn compile_expr(&mut self, expr: &Expr) -> Result<u8> {
        match expr {
            Expr::Literal { value, span } => {
                let reg = self.alloc_reg(*span)?;
                let k = self.konst(literal_value(value))?;
                self.builder.emit(Instruction::abx(Op::LoadConst, reg, k));
                Ok(reg)
            }

            Expr::Ident { name, span } => self.resolve_local(name).ok_or_else(|| {
                CodeGenError::UndefinedVariable { name: name.clone(), span: *span }
            }),

            Expr::Binary { op: BinOp::And, left, right, span } => {
                self.compile_short_circuit(left, right, *span, Op::JumpIfFalse)
            }
            Expr::Binary { op: BinOp::Or, left, right, span } => {
                self.compile_short_circuit(left, right, *span, Op::JumpIfTrue)
            }

            Expr::Binary { op, left, right, span } => {
                let rb = self.compile_expr(left)?;
                let rc = self.compile_expr(right)?;
                let ra = self.alloc_reg(*span)?;
                let opcode = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    BinOp::Eq => Op::Eq,
                    BinOp::Ne => Op::Ne,
                    BinOp::Lt => Op::Lt,
                    BinOp::Le => Op::Le,
                    BinOp::Gt => Op::Gt,
                    BinOp::Ge => Op::Ge,
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                };
                self.builder.emit(Instruction::abc(opcode, ra, rb, rc));
                Ok(ra)
            }

            Expr::Unary { op, operand, span } => {
                let rb = self.compile_expr(operand)?;
                let ra = self.alloc_reg(*span)?;
                let opcode = match op {
                    UnaryOp::Neg => Op::Neg,
                    UnaryOp::Not => Op::Not,
                };
                self.builder.emit(Instruction::abc(opcode, ra, rb, 0));
                Ok(ra)
            }

            Expr::Assign { target, value, span } => match target.as_ref() {
                Expr::Ident { name, span: target_span } => {
                    let var_reg = self.resolve_local(name).ok_or_else(|| {
                        CodeGenError::UndefinedVariable { name: name.clone(), span: *target_span }
                    })?;
                    let saved = self.next_reg;
                    let val = self.compile_expr(value)?;
                    if val != var_reg {
                        self.builder.emit(Instruction::abc(Op::Move, var_reg, val, 0));
                    }
                    self.next_reg = saved;
                    Ok(var_reg)
                }
                Expr::Index { object, index, .. } => {
                    let obj = self.compile_expr(object)?;
                    let idx = self.compile_expr(index)?;
                    let val = self.compile_expr(value)?;
                    self.builder.emit(Instruction::abc(Op::SetIndex, obj, idx, val));
                    Ok(val)
                }
                _ => Err(CodeGenError::Unsupported {
                    construct: "assignment target",
                    span: *span,
                }),
            },

            Expr::Call { callee, args, span } => {
                let (func_idx, arity) = self
                    .funcs
                    .iter()
                    .position(|(n, _)| n == callee)
                    .map(|i| (i as u16 + 1, self.funcs[i].1))
                    .ok_or_else(|| CodeGenError::UndefinedFunction {
                        name: callee.clone(),
                        span: *span,
                    })?;
                if args.len() != arity as usize {
                    return Err(CodeGenError::ArityMismatch {
                        name: callee.clone(),
                        expected: arity,
                        got: args.len(),
                        span: *span,
                    });
                }

                let arg_regs: Vec<u8> =
                    args.iter().map(|a| self.compile_expr(a)).collect::<Result<_>>()?;

                let ra = self.alloc_reg(*span)?;
                let base = self.reserve(args.len(), *span)?;
                for (i, &arg) in arg_regs.iter().enumerate() {
                    let target = (base as usize + i) as u8;
                    if arg != target {
                        self.builder.emit(Instruction::abc(Op::Move, target, arg, 0));
                    }
                }

                let bx = (func_idx << 8) | args.len() as u16;
                self.builder.emit(Instruction::abx(Op::Call, ra, bx));

                // Only the result stays live after the call.
                self.next_reg = ra as u16 + 1;
                Ok(ra)
            }

            Expr::Index { object, index, span } => {
                let rb = self.compile_expr(object)?;
                let rc = self.compile_expr(index)?;
                let ra = self.alloc_reg(*span)?;
                self.builder.emit(Instruction::abc(Op::GetIndex, ra, rb, rc));
                Ok(ra)
            }

            Expr::Array { items, span } => {
                let item_regs: Vec<u8> =
                    items.iter().map(|e| self.compile_expr(e)).collect::<Result<_>>()?;

                let ra = self.alloc_reg(*span)?;
                let base = self.reserve(items.len(), *span)?;
                for (i, &item) in item_regs.iter().enumerate() {
                    let target = (base as usize + i) as u8;
                    if item != target {
                        self.builder.emit(Instruction::abc(Op::Move, target, item, 0));
                    }
                }
                self.builder.emit(Instruction::abx(Op::NewArray, ra, items.len() as u16));
                self.next_reg = ra as u16 + 1;
                Ok(ra)
            }
        }
    }

    /// `a && b` / `a || b` keep operand values: the result register takes
    /// the left value and is overwritten by the right only when the left
    /// does not decide.
    fn compile_short_circuit(
        &mut self,
        left: &Expr,
        right: &Expr,
        span: Span,
        jump: Op,
    ) -> Result<u8> {
        let lr = self.compile_expr(left)?;
        let result = self.alloc_reg(span)?;
        if lr != result {
            self.builder.emit(Instruction::abc(Op::Move, result, lr, 0));
        }
        let skip = self.builder.emit_jump_placeholder(jump, result);
        let saved = self.next_reg;
        let rr = self.compile_expr(right)?;
        if rr != result {
            self.builder.emit(Instruction::abc(Op::Move, result, rr, 0));
        }
        self.next_reg = saved;
        self.builder.patch_to_here(skip)?;
        Ok(result)
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(x) => Value::Float(*x),
        Literal::Str(s) => Value::str(s.as_str()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}
