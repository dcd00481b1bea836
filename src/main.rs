use std::process::ExitCode;

use clap::Parser;

use kite::{compile_with, execute_instrumented, OptLevel, Value};

/// Run, inspect, or time kite programs.
#[derive(Parser)]
#[command(name = "kite", version, about)]
struct Cli {
    /// Source file, or inline code with --eval.
    input: String,

    /// Treat INPUT as source text instead of a path.
    #[arg(short, long)]
    eval: bool,

    /// Optimization level.
    #[arg(long, value_enum, default_value = "basic")]
    opt: OptLevel,

    /// Print an intermediate form instead of executing.
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// Report instruction count and elapsed time on stderr.
    #[arg(long)]
    time: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Emit {
    /// Parsed AST as JSON.
    Ast,
    /// Bytecode disassembly.
    Bytecode,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = if cli.eval {
        cli.input.clone()
    } else {
        match std::fs::read_to_string(&cli.input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error reading {}: {}", cli.input, e);
                return ExitCode::FAILURE;
            }
        }
    };

    if let Some(Emit::Ast) = cli.emit {
        return emit_ast(&source);
    }

    let code = match compile_with(&source, cli.opt) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(Emit::Bytecode) = cli.emit {
        print!("{code}");
        return ExitCode::SUCCESS;
    }

    let (result, stats) = execute_instrumented(&code);
    if cli.time {
        eprintln!(
            "{} instructions in {:?}",
            stats.instructions, stats.elapsed
        );
    }
    match result {
        Ok(Value::Null) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(fault) => {
            eprintln!("fault: {fault}");
            ExitCode::FAILURE
        }
    }
}

fn emit_ast(source: &str) -> ExitCode {
    let tokens = match kite::lexer::lex(source) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let program = match kite::parser::parse(tokens, source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&program) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("serialization error: {e}");
            ExitCode::FAILURE
        }
    }
}
