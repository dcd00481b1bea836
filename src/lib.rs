//! kite — a small imperative language compiled to a register bytecode
//! and executed on a virtual machine, with an incremental compiler for
//! multi-file programs.
//!
//! The pipeline is lex → parse → optimize → generate; [`compile`] runs
//! it end to end and [`execute`] runs the artifact:
//!
//! ```
//! let code = kite::compile("let a = 42; let b = 10; a + b;").unwrap();
//! let result = kite::execute(&code).unwrap();
//! assert_eq!(result, kite::Value::Int(52));
//! ```

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod incremental;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod value;
pub mod vm;

pub use bytecode::CodeObject;
pub use codegen::CodeGenError;
pub use incremental::{CompileReport, CycleError, IncrementalCompiler, UnitOutcome};
pub use lexer::LexError;
pub use optimizer::OptLevel;
pub use parser::ParseError;
pub use value::Value;
pub use vm::{execute, execute_instrumented, ExecStats, RuntimeFault, Vm, VmOptions};

/// Any way a single unit can fail to compile. Each stage's error keeps
/// its own diagnostic payload.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    CodeGen(#[from] CodeGenError),
}

/// Compile one source text at the default optimization level.
pub fn compile(source: &str) -> Result<CodeObject, CompileError> {
    compile_with(source, OptLevel::default())
}

/// Compile one source text: lex, parse, optimize, generate.
pub fn compile_with(source: &str, level: OptLevel) -> Result<CodeObject, CompileError> {
    let tokens = lexer::lex(source)?;
    let program = parser::parse(tokens, source)?;
    let program = optimizer::optimize(program, level);
    Ok(codegen::generate(&program)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_and_execute_round_trip() {
        let code = compile("3 + 10;").unwrap();
        assert_eq!(execute(&code).unwrap(), Value::Int(13));
    }

    #[test]
    fn lex_errors_surface_through_compile() {
        assert!(matches!(compile("let s = \"oops"), Err(CompileError::Lex(_))));
    }

    #[test]
    fn parse_errors_surface_through_compile() {
        assert!(matches!(compile("let = 3;"), Err(CompileError::Parse(_))));
    }

    #[test]
    fn codegen_errors_surface_through_compile() {
        assert!(matches!(
            compile("try { 1; } catch (e) { 2; }"),
            Err(CompileError::CodeGen(_))
        ));
    }

    #[test]
    fn levels_agree_on_results() {
        let src = "fn double(x) { return x * 2; }\n\
                   let s = 0;\n\
                   for i in 0 .. 4 { s = s + double(i); }\n\
                   s;";
        for level in [OptLevel::None, OptLevel::Basic, OptLevel::Aggressive] {
            let code = compile_with(src, level).unwrap();
            assert_eq!(execute(&code).unwrap(), Value::Int(12), "level {level:?}");
        }
    }
}
