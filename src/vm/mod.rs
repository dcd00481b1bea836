use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::bytecode::{CodeObject, Instruction, Op};
use crate::value::{self, Value, ValueOpError};

/// Per-execution tuning. The register budget itself is fixed at code
/// generation; the VM sizes each frame window from the chunk.
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Call frames beyond this depth fault with `StackOverflow`.
    pub max_call_depth: usize,
    /// Chunk entry count after which the pre-decoded fast path is
    /// installed for that chunk.
    pub hot_threshold: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions { max_call_depth: 256, hot_threshold: 32 }
    }
}

/// Unrecoverable execution errors, tagged with the faulting instruction
/// index. The VM does not resume after any of these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeFault {
    #[error("invalid opcode {byte:#04x} at instruction {index}")]
    InvalidOpcode { index: usize, byte: u8 },
    #[error("register r{register} out of range at instruction {index}")]
    RegisterOutOfRange { index: usize, register: u8 },
    #[error("constant k{constant} out of range at instruction {index}")]
    ConstantOutOfRange { index: usize, constant: u16 },
    #[error("jump target {target} out of range at instruction {index}")]
    JumpOutOfRange { index: usize, target: isize },
    #[error("division by zero at instruction {index}")]
    DivisionByZero { index: usize },
    #[error("call depth {depth} exceeded at instruction {index}")]
    StackOverflow { index: usize, depth: usize },
    #[error("array index {subscript} out of bounds (len {len}) at instruction {index}")]
    IndexOutOfBounds { index: usize, subscript: i64, len: usize },
    #[error("type error at instruction {index}: {message}")]
    Type { index: usize, message: String },
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("unknown call target #{target} at instruction {index}")]
    UnknownCallTarget { index: usize, target: u16 },
}

type VmResult<T> = Result<T, RuntimeFault>;

/// Instrumentation counters for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStats {
    pub instructions: u64,
    pub elapsed: Duration,
}

/// Execute a code object's top-level chunk; on normal halt the value of
/// the designated result register of the final return is produced.
pub fn execute(program: &CodeObject) -> VmResult<Value> {
    Vm::new(program).run()
}

/// Like [`execute`], but also reports how much work the run took.
pub fn execute_instrumented(program: &CodeObject) -> (VmResult<Value>, ExecStats) {
    let mut vm = Vm::new(program);
    let started = Instant::now();
    let result = vm.run();
    let stats = ExecStats { instructions: vm.instructions, elapsed: started.elapsed() };
    (result, stats)
}

/// A fully decoded instruction; what the dispatch loop actually consumes.
#[derive(Debug, Clone, Copy)]
struct Decoded {
    op: Op,
    a: u8,
    b: u8,
    c: u8,
    bx: u16,
    sbx: i16,
}

fn decode(inst: Instruction, index: usize) -> VmResult<Decoded> {
    let op = inst
        .op()
        .ok_or(RuntimeFault::InvalidOpcode { index, byte: inst.opcode_byte() })?;
    Ok(Decoded { op, a: inst.a(), b: inst.b(), c: inst.c(), bx: inst.bx(), sbx: inst.sbx() })
}

/// Pre-decoded instruction sequence for a hot chunk. Installed only for
/// chunks that pass static validation, so the fast path can skip opcode
/// and bounds re-checks without changing observable behavior.
struct FastChunk {
    code: Vec<Decoded>,
}

struct Frame {
    chunk_idx: usize,
    ip: usize,
    stack_base: usize,
    result_reg: u8,
}

/// One execution context: its own register stack, call frames and
/// hot-path counters. Nothing is shared between `Vm` instances.
pub struct Vm<'a> {
    program: &'a CodeObject,
    options: VmOptions,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    hot_counts: Vec<u32>,
    fast_paths: Vec<Option<Rc<FastChunk>>>,
    instructions: u64,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a CodeObject) -> Self {
        Vm::with_options(program, VmOptions::default())
    }

    pub fn with_options(program: &'a CodeObject, options: VmOptions) -> Self {
        let n = program.chunks.len();
        Vm {
            program,
            options,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            hot_counts: vec![0; n],
            fast_paths: (0..n).map(|_| None).collect(),
            instructions: 0,
        }
    }

    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }

    /// Run the top-level chunk from a clean state.
    pub fn run(&mut self) -> VmResult<Value> {
        self.stack.clear();
        self.frames.clear();
        self.enter_chunk(0, Vec::new(), 0, 0)?;
        self.execute_loop()
    }

    /// Invoke a named function chunk directly, reusing this context's
    /// stack and counters.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> VmResult<Value> {
        let idx = self
            .program
            .function_index(name)
            .ok_or_else(|| RuntimeFault::UnknownFunction { name: name.to_string() })?;
        self.stack.clear();
        self.frames.clear();
        self.enter_chunk(idx as usize, args, 0, 0)?;
        self.execute_loop()
    }

    fn enter_chunk(
        &mut self,
        chunk_idx: usize,
        args: Vec<Value>,
        result_reg: u8,
        at: usize,
    ) -> VmResult<()> {
        if self.frames.len() >= self.options.max_call_depth {
            return Err(RuntimeFault::StackOverflow { index: at, depth: self.frames.len() });
        }
        let chunk = &self.program.chunks[chunk_idx];
        let stack_base = self.stack.len();
        self.stack.extend(args);
        self.stack
            .resize(stack_base + chunk.reg_count as usize, Value::Null);

        // Hot-path bookkeeping: count entries, install the pre-decoded
        // form once the chunk proves hot and statically valid.
        self.hot_counts[chunk_idx] = self.hot_counts[chunk_idx].saturating_add(1);
        if self.hot_counts[chunk_idx] >= self.options.hot_threshold
            && self.fast_paths[chunk_idx].is_none()
            && chunk.validate()
        {
            let code = chunk
                .code
                .iter()
                .enumerate()
                .map(|(i, inst)| decode(*inst, i))
                .collect::<VmResult<Vec<_>>>()?;
            self.fast_paths[chunk_idx] = Some(Rc::new(FastChunk { code }));
        }

        self.frames.push(Frame { chunk_idx, ip: 0, stack_base, result_reg });
        Ok(())
    }

    fn reg(&self, base: usize, r: u8, regs: u16, at: usize) -> VmResult<&Value> {
        if r as u16 >= regs {
            return Err(RuntimeFault::RegisterOutOfRange { index: at, register: r });
        }
        Ok(&self.stack[base + r as usize])
    }

    fn set_reg(&mut self, base: usize, r: u8, regs: u16, at: usize, v: Value) -> VmResult<()> {
        if r as u16 >= regs {
            return Err(RuntimeFault::RegisterOutOfRange { index: at, register: r });
        }
        self.stack[base + r as usize] = v;
        Ok(())
    }

    fn execute_loop(&mut self) -> VmResult<Value> {
        let frame = self.frames.last().expect("execute_loop entered without a frame");
        let mut ci = frame.chunk_idx;
        let mut ip = frame.ip;
        let mut base = frame.stack_base;

        loop {
            let chunk = &self.program.chunks[ci];
            let regs = chunk.reg_count;

            // Falling off the end behaves like `return null`; generated
            // chunks always end in an explicit return, so this path only
            // serves hand-built code.
            if ip >= chunk.code.len() {
                match self.leave_frame(Value::Null)? {
                    Some((nci, nip, nbase)) => {
                        ci = nci;
                        ip = nip;
                        base = nbase;
                        continue;
                    }
                    None => return Ok(Value::Null),
                }
            }

            let at = ip;
            let d = match &self.fast_paths[ci] {
                Some(fast) => fast.code[ip],
                None => decode(chunk.code[ip], at)?,
            };
            ip += 1;
            self.instructions += 1;

            match d.op {
                Op::Move => {
                    let v = self.reg(base, d.b, regs, at)?.clone();
                    self.set_reg(base, d.a, regs, at, v)?;
                }

                Op::LoadConst => {
                    let v = chunk.constants.get(d.bx as usize).cloned().ok_or(
                        RuntimeFault::ConstantOutOfRange { index: at, constant: d.bx },
                    )?;
                    self.set_reg(base, d.a, regs, at, v)?;
                }

                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                    let lhs = self.reg(base, d.b, regs, at)?;
                    let rhs = self.reg(base, d.c, regs, at)?;
                    let result = match d.op {
                        Op::Add => value::add(lhs, rhs),
                        Op::Sub => value::sub(lhs, rhs),
                        Op::Mul => value::mul(lhs, rhs),
                        Op::Div => value::div(lhs, rhs),
                        _ => value::rem(lhs, rhs),
                    }
                    .map_err(|e| arith_fault(e, at))?;
                    self.set_reg(base, d.a, regs, at, result)?;
                }

                Op::Neg => {
                    let v = self.reg(base, d.b, regs, at)?;
                    let result = value::neg(v).map_err(|e| arith_fault(e, at))?;
                    self.set_reg(base, d.a, regs, at, result)?;
                }

                Op::Not => {
                    let truthy = self.reg(base, d.b, regs, at)?.is_truthy();
                    self.set_reg(base, d.a, regs, at, Value::Bool(!truthy))?;
                }

                Op::Eq | Op::Ne => {
                    let eq = value::equals(
                        self.reg(base, d.b, regs, at)?,
                        self.reg(base, d.c, regs, at)?,
                    );
                    let v = Value::Bool(if d.op == Op::Eq { eq } else { !eq });
                    self.set_reg(base, d.a, regs, at, v)?;
                }

                Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                    let lhs = self.reg(base, d.b, regs, at)?;
                    let rhs = self.reg(base, d.c, regs, at)?;
                    let result = match d.op {
                        Op::Lt => value::lt(lhs, rhs),
                        Op::Le => value::le(lhs, rhs),
                        Op::Gt => value::gt(lhs, rhs),
                        _ => value::ge(lhs, rhs),
                    }
                    .map_err(|e| arith_fault(e, at))?;
                    self.set_reg(base, d.a, regs, at, result)?;
                }

                Op::NewArray => {
                    let n = d.bx as usize;
                    let mut items = Vec::with_capacity(n);
                    for i in 0..n {
                        let r = window_reg(d.a, 1 + i, at)?;
                        items.push(self.reg(base, r, regs, at)?.clone());
                    }
                    self.set_reg(base, d.a, regs, at, Value::array(items))?;
                }

                Op::GetIndex => {
                    let object = self.reg(base, d.b, regs, at)?.clone();
                    let index = self.reg(base, d.c, regs, at)?.clone();
                    let v = index_get(&object, &index, at)?;
                    self.set_reg(base, d.a, regs, at, v)?;
                }

                Op::SetIndex => {
                    let object = self.reg(base, d.a, regs, at)?.clone();
                    let index = self.reg(base, d.b, regs, at)?.clone();
                    let v = self.reg(base, d.c, regs, at)?.clone();
                    index_set(&object, &index, v, at)?;
                }

                Op::Jump => {
                    ip = jump_target(ip, d.sbx, chunk.code.len(), at)?;
                }

                Op::JumpIfFalse => {
                    if !self.reg(base, d.a, regs, at)?.is_truthy() {
                        ip = jump_target(ip, d.sbx, chunk.code.len(), at)?;
                    }
                }

                Op::JumpIfTrue => {
                    if self.reg(base, d.a, regs, at)?.is_truthy() {
                        ip = jump_target(ip, d.sbx, chunk.code.len(), at)?;
                    }
                }

                Op::Call => {
                    let target = d.bx >> 8;
                    let nargs = (d.bx & 0xFF) as usize;
                    if target as usize >= self.program.chunks.len() {
                        return Err(RuntimeFault::UnknownCallTarget { index: at, target });
                    }

                    let mut args = Vec::with_capacity(nargs);
                    for i in 0..nargs {
                        let r = window_reg(d.a, 1 + i, at)?;
                        args.push(self.reg(base, r, regs, at)?.clone());
                    }

                    // Resume after the call instruction once the callee
                    // returns into our result register.
                    let frame = self.frames.last_mut().expect("running without a frame");
                    frame.ip = ip;

                    self.enter_chunk(target as usize, args, d.a, at)?;
                    let f = self.frames.last().expect("frame just pushed");
                    ci = f.chunk_idx;
                    ip = f.ip;
                    base = f.stack_base;
                }

                Op::Return => {
                    let result = self.reg(base, d.a, regs, at)?.clone();
                    match self.leave_frame(result.clone())? {
                        Some((nci, nip, nbase)) => {
                            ci = nci;
                            ip = nip;
                            base = nbase;
                        }
                        None => return Ok(result),
                    }
                }
            }
        }
    }

    /// Pop the current frame, deliver `result` into the caller's result
    /// register, and report where to resume; `None` means the outermost
    /// frame returned and the machine halts.
    fn leave_frame(&mut self, result: Value) -> VmResult<Option<(usize, usize, usize)>> {
        let done = self.frames.pop().expect("leave_frame without a frame");
        self.stack.truncate(done.stack_base);

        let Some(caller) = self.frames.last() else {
            return Ok(None);
        };
        let (ci, ip, base) = (caller.chunk_idx, caller.ip, caller.stack_base);
        let slot = base + done.result_reg as usize;
        if slot < self.stack.len() {
            self.stack[slot] = result;
        }
        Ok(Some((ci, ip, base)))
    }
}

/// Register at offset `off` above `a` in the current window; faulting
/// instead of wrapping if a hand-built chunk pushes past the u8 space.
fn window_reg(a: u8, off: usize, at: usize) -> VmResult<u8> {
    u8::try_from(a as usize + off)
        .map_err(|_| RuntimeFault::RegisterOutOfRange { index: at, register: a })
}

fn arith_fault(e: ValueOpError, index: usize) -> RuntimeFault {
    match e {
        ValueOpError::DivisionByZero => RuntimeFault::DivisionByZero { index },
        other => RuntimeFault::Type { index, message: other.to_string() },
    }
}

fn jump_target(ip: usize, sbx: i16, len: usize, at: usize) -> VmResult<usize> {
    let target = ip as isize + sbx as isize;
    if target < 0 || target > len as isize {
        return Err(RuntimeFault::JumpOutOfRange { index: at, target });
    }
    Ok(target as usize)
}

fn index_get(object: &Value, index: &Value, at: usize) -> VmResult<Value> {
    let Value::Array(items) = object else {
        return Err(RuntimeFault::Type {
            index: at,
            message: format!("cannot index a {}", object.type_name()),
        });
    };
    let Value::Int(i) = index else {
        return Err(RuntimeFault::Type {
            index: at,
            message: format!("array index must be an int, got {}", index.type_name()),
        });
    };
    let items = items.borrow();
    usize::try_from(*i)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .ok_or(RuntimeFault::IndexOutOfBounds { index: at, subscript: *i, len: items.len() })
}

fn index_set(object: &Value, index: &Value, v: Value, at: usize) -> VmResult<()> {
    let Value::Array(items) = object else {
        return Err(RuntimeFault::Type {
            index: at,
            message: format!("cannot index a {}", object.type_name()),
        });
    };
    let Value::Int(i) = index else {
        return Err(RuntimeFault::Type {
            index: at,
            message: format!("array index must be an int, got {}", index.type_name()),
        });
    };
    let mut items = items.borrow_mut();
    let len = items.len();
    let slot = usize::try_from(*i)
        .ok()
        .filter(|&i| i < len)
        .ok_or(RuntimeFault::IndexOutOfBounds { index: at, subscript: *i, len })?;
    items[slot] = v;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, ChunkBuilder};
    use crate::codegen::generate;
    use crate::lexer::lex;
    use crate::optimizer::{optimize, OptLevel};
    use crate::parser::parse;

    fn compile(source: &str) -> CodeObject {
        let program = parse(lex(source).unwrap(), source).unwrap();
        generate(&optimize(program, OptLevel::Basic)).unwrap()
    }

    fn run(source: &str) -> VmResult<Value> {
        execute(&compile(source))
    }

    #[test]
    fn add_round_trip() {
        assert_eq!(run("3 + 10;").unwrap(), Value::Int(13));
    }

    #[test]
    fn documented_example_42_plus_10() {
        assert_eq!(run("let a = 42; let b = 10; a + b;").unwrap(), Value::Int(52));
    }

    #[test]
    fn mixed_arithmetic_promotes() {
        assert_eq!(run("1 + 2.5;").unwrap(), Value::Float(3.5));
    }

    #[test]
    fn last_expression_is_the_result() {
        assert_eq!(run("1; 2; 3;").unwrap(), Value::Int(3));
        assert_eq!(run("let x = 9;").unwrap(), Value::Null);
    }

    #[test]
    fn control_flow_if_else() {
        assert_eq!(run("let x = 5; if (x > 3) { 1; } else { 2; }").unwrap(), Value::Int(1));
        assert_eq!(run("let x = 1; if (x > 3) { 1; } else { 2; }").unwrap(), Value::Int(2));
    }

    #[test]
    fn while_loop_sums() {
        let src = "let i = 0; let s = 0; while (i < 5) { s = s + i; i = i + 1; } s;";
        assert_eq!(run(src).unwrap(), Value::Int(10));
    }

    #[test]
    fn for_loop_sums() {
        let src = "let s = 0; for i in 0 .. 5 { s = s + i; } s;";
        assert_eq!(run(src).unwrap(), Value::Int(10));
    }

    #[test]
    fn function_calls_and_recursion() {
        let src = "fn fac(n) { if (n < 2) { return 1; } return n * fac(n - 1); } fac(6);";
        assert_eq!(run(src).unwrap(), Value::Int(720));
    }

    #[test]
    fn nested_calls() {
        let src = "fn add(a, b) { return a + b; }\n\
                   fn twice(x) { return add(x, x); }\n\
                   twice(21);";
        assert_eq!(run(src).unwrap(), Value::Int(42));
    }

    #[test]
    fn arrays_index_and_store() {
        let src = "let a = [1, 2, 3]; a[1] = 20; a[0] + a[1] + a[2];";
        assert_eq!(run(src).unwrap(), Value::Int(24));
    }

    #[test]
    fn short_circuit_keeps_operand_values() {
        assert_eq!(run("let a = false; a && true;").unwrap(), Value::Bool(false));
        assert_eq!(run("let a = 1; a || 2;").unwrap(), Value::Int(1));
        assert_eq!(run("let a = null; a || 2;").unwrap(), Value::Int(2));
    }

    #[test]
    fn short_circuit_skips_the_right_side() {
        // The right side divides by zero; `&&` must never reach it.
        let src = "let a = false; let d = 0; a && 1 / d;";
        assert_eq!(run(src).unwrap(), Value::Bool(false));
    }

    #[test]
    fn division_by_zero_faults_with_instruction_index() {
        let obj = compile("let d = 0; 1 / d;");
        let div_at = obj
            .main()
            .code
            .iter()
            .position(|i| i.op() == Some(Op::Div))
            .unwrap();
        match execute(&obj) {
            Err(RuntimeFault::DivisionByZero { index }) => assert_eq!(index, div_at),
            other => panic!("expected division fault, got {other:?}"),
        }
    }

    #[test]
    fn stack_overflow_on_unbounded_recursion() {
        let src = "fn loop_forever(n) { return loop_forever(n + 1); } loop_forever(0);";
        let obj = compile(src);
        let mut vm = Vm::with_options(&obj, VmOptions { max_call_depth: 64, ..Default::default() });
        match vm.run() {
            Err(RuntimeFault::StackOverflow { depth, .. }) => assert_eq!(depth, 64),
            other => panic!("expected stack overflow, got {other:?}"),
        }
    }

    #[test]
    fn index_out_of_bounds_faults() {
        assert!(matches!(
            run("let a = [1]; a[3];"),
            Err(RuntimeFault::IndexOutOfBounds { subscript: 3, len: 1, .. })
        ));
    }

    #[test]
    fn invalid_opcode_faults() {
        let chunk = Chunk {
            name: None,
            arity: 0,
            code: vec![Instruction::from_raw(0xEE00_0000)],
            constants: vec![],
            reg_count: 1,
        };
        let obj = CodeObject { chunks: vec![chunk] };
        assert!(matches!(
            execute(&obj),
            Err(RuntimeFault::InvalidOpcode { index: 0, byte: 0xEE })
        ));
    }

    #[test]
    fn out_of_range_register_faults() {
        let mut b = ChunkBuilder::new(None, 0);
        b.emit(Instruction::abc(Op::Move, 5, 0, 0));
        let chunk = b.finish(1).unwrap();
        let obj = CodeObject { chunks: vec![chunk] };
        assert!(matches!(
            execute(&obj),
            Err(RuntimeFault::RegisterOutOfRange { index: 0, register: 5 })
        ));
    }

    #[test]
    fn out_of_range_jump_faults() {
        let mut b = ChunkBuilder::new(None, 0);
        b.emit(Instruction::asbx(Op::Jump, 0, 40));
        let chunk = b.finish(1).unwrap();
        let obj = CodeObject { chunks: vec![chunk] };
        assert!(matches!(execute(&obj), Err(RuntimeFault::JumpOutOfRange { index: 0, .. })));
    }

    #[test]
    fn hot_path_is_invisible_to_results() {
        let src = "fn fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } fib(12);";
        let obj = compile(src);

        let cold = execute(&obj).unwrap();

        let mut vm = Vm::with_options(&obj, VmOptions { hot_threshold: 2, ..Default::default() });
        let hot = vm.run().unwrap();
        assert_eq!(cold, hot);
        // fib's chunk crossed the threshold and was specialized.
        let fib_idx = obj.function_index("fib").unwrap() as usize;
        assert!(vm.fast_paths[fib_idx].is_some());
    }

    #[test]
    fn instrumented_execution_counts_instructions() {
        let obj = compile("let s = 0; for i in 0 .. 10 { s = s + i; } s;");
        let (result, stats) = execute_instrumented(&obj);
        assert_eq!(result.unwrap(), Value::Int(45));
        assert!(stats.instructions > 10);
    }

    #[test]
    fn named_call_into_context() {
        let obj = compile("fn add(a, b) { return a + b; }");
        let mut vm = Vm::new(&obj);
        let out = vm.call("add", vec![Value::Int(2), Value::Int(40)]).unwrap();
        assert_eq!(out, Value::Int(42));
        assert!(matches!(
            vm.call("nope", vec![]),
            Err(RuntimeFault::UnknownFunction { .. })
        ));
    }
}
