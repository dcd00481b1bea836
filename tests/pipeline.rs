//! End-to-end pipeline properties: source in, value (or precise error)
//! out, at every optimization level, plus the incremental multi-unit
//! flows.

use kite::incremental::{CompileStats, IncrementalCompiler, UnitOutcome};
use kite::{
    compile, compile_with, execute, execute_instrumented, CompileError, OptLevel, RuntimeFault,
    Value, Vm,
};

fn run(source: &str) -> Value {
    execute(&compile(source).unwrap()).unwrap()
}

fn run_at(source: &str, level: OptLevel) -> Value {
    execute(&compile_with(source, level).unwrap()).unwrap()
}

// --- Arithmetic and values ---

#[test]
fn arithmetic_round_trip() {
    assert_eq!(run("3 + 10;"), Value::Int(13));
    assert_eq!(run("2 + 3 * 4;"), Value::Int(14));
    assert_eq!(run("(2 + 3) * 4;"), Value::Int(20));
    assert_eq!(run("10 % 3;"), Value::Int(1));
    assert_eq!(run("-5 + 2;"), Value::Int(-3));
}

#[test]
fn float_promotion() {
    assert_eq!(run("1 / 2;"), Value::Int(0));
    assert_eq!(run("1.0 / 2;"), Value::Float(0.5));
    assert_eq!(run("1 + 0.5;"), Value::Float(1.5));
}

#[test]
fn strings_and_bools() {
    assert_eq!(run("\"foo\" + \"bar\";"), Value::str("foobar"));
    assert_eq!(run("1 < 2 && 2 < 3;"), Value::Bool(true));
    assert_eq!(run("!false;"), Value::Bool(true));
    assert_eq!(run("\"a\" == \"a\";"), Value::Bool(true));
}

// --- Programs ---

#[test]
fn fibonacci_all_levels() {
    let src = "fn fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } fib(15);";
    for level in [OptLevel::None, OptLevel::Basic, OptLevel::Aggressive] {
        assert_eq!(run_at(src, level), Value::Int(610), "level {level:?}");
    }
}

#[test]
fn array_program_all_levels() {
    let src = "let a = [0, 0, 0, 0];\n\
               for i in 0 .. 4 { a[i] = i * i; }\n\
               a[0] + a[1] + a[2] + a[3];";
    for level in [OptLevel::None, OptLevel::Basic, OptLevel::Aggressive] {
        assert_eq!(run_at(src, level), Value::Int(14), "level {level:?}");
    }
}

#[test]
fn while_and_assignment() {
    let src = "let n = 27; let steps = 0;\n\
               while (n != 1) {\n\
                 if (n % 2 == 0) { n = n / 2; } else { n = 3 * n + 1; }\n\
                 steps = steps + 1;\n\
               }\n\
               steps;";
    assert_eq!(run(src), Value::Int(111));
}

#[test]
fn optimizer_preserves_observable_results() {
    let cases = [
        "10 + 20;",
        "let x = 2; x * (3 + 4);",
        "fn sq(x) { return x * x; } sq(7) + sq(2);",
        "let s = 0; for i in 0 .. 6 { s = s + i; } s;",
        "let a = [1, 2]; a[0] = a[1] + 1; a[0];",
    ];
    for src in cases {
        let plain = run_at(src, OptLevel::None);
        let basic = run_at(src, OptLevel::Basic);
        let aggressive = run_at(src, OptLevel::Aggressive);
        assert_eq!(plain, basic, "basic differs on {src}");
        assert_eq!(plain, aggressive, "aggressive differs on {src}");
    }
}

// --- Error taxonomy ---

#[test]
fn lex_error_has_position() {
    let Err(CompileError::Lex(e)) = compile("let s = 'open") else {
        panic!("expected lex error");
    };
    assert_eq!((e.line, e.column), (1, 9));
}

#[test]
fn parse_error_has_expected_and_found() {
    let Err(CompileError::Parse(e)) = compile("let x 1;") else {
        panic!("expected parse error");
    };
    assert_eq!(e.expected, "'='");
    assert!(e.found.contains('1'));
}

#[test]
fn register_budget_error_not_silent_truncation() {
    // 300 pinned locals cannot fit a 256-register frame.
    let src: String = (0..300).map(|i| format!("let v{i} = {i}; v{i};\n")).collect();
    match compile(&src) {
        Err(CompileError::CodeGen(e)) => {
            assert!(e.to_string().contains("register budget"), "got: {e}");
        }
        other => panic!("expected codegen error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn division_by_zero_is_a_fault_not_a_crash() {
    let code = compile("let d = 0; 10 / d;").unwrap();
    match execute(&code) {
        Err(RuntimeFault::DivisionByZero { .. }) => {}
        other => panic!("expected division fault, got {other:?}"),
    }
}

#[test]
fn deep_recursion_faults_cleanly() {
    let code = compile("fn f(n) { return f(n + 1); } f(0);").unwrap();
    assert!(matches!(execute(&code), Err(RuntimeFault::StackOverflow { .. })));
}

// --- Instrumentation and contexts ---

#[test]
fn instrumented_run_reports_work() {
    let code = compile("let s = 0; for i in 0 .. 50 { s = s + i; } s;").unwrap();
    let (result, stats) = execute_instrumented(&code);
    assert_eq!(result.unwrap(), Value::Int(1225));
    assert!(stats.instructions > 100);
}

#[test]
fn vm_contexts_are_independent() {
    let code = compile("fn inc(x) { return x + 1; }").unwrap();
    let mut a = Vm::new(&code);
    let mut b = Vm::new(&code);
    assert_eq!(a.call("inc", vec![Value::Int(1)]).unwrap(), Value::Int(2));
    assert_eq!(b.call("inc", vec![Value::Int(10)]).unwrap(), Value::Int(11));
    assert_eq!(a.call("inc", vec![Value::Int(2)]).unwrap(), Value::Int(3));
}

// --- Incremental compilation ---

const LIB_UNIT: &str = "fn helper(x) { return x * 2; } helper(4);";
const APP_UNIT: &str = "import lib;\n40 + 2;";

#[test]
fn incremental_cold_then_warm_then_partial() {
    let mut inc = IncrementalCompiler::new();

    let cold = inc.compile_incremental([("lib", LIB_UNIT), ("app", APP_UNIT)]).unwrap();
    assert_eq!(cold.stats, CompileStats { compiled: 2, cache_hits: 0 });

    let warm = inc.compile_incremental([("lib", LIB_UNIT), ("app", APP_UNIT)]).unwrap();
    assert_eq!(warm.stats, CompileStats { compiled: 0, cache_hits: 2 });

    // Touch the dependency: both rebuild.
    let lib2 = "fn helper(x) { return x * 3; } helper(4);";
    let both = inc.compile_incremental([("lib", lib2), ("app", APP_UNIT)]).unwrap();
    assert_eq!(both.stats, CompileStats { compiled: 2, cache_hits: 0 });

    // Touch only the leaf: the dependency stays cached.
    let app2 = "import lib;\n40 + 3;";
    let leaf = inc.compile_incremental([("lib", lib2), ("app", app2)]).unwrap();
    assert_eq!(leaf.stats, CompileStats { compiled: 1, cache_hits: 1 });
}

#[test]
fn incremental_artifacts_execute() {
    let mut inc = IncrementalCompiler::new();
    let report = inc.compile_incremental([("lib", LIB_UNIT), ("app", APP_UNIT)]).unwrap();
    let app = report.units["app"].code().unwrap();
    assert_eq!(execute(app).unwrap(), Value::Int(42));
    let lib = report.units["lib"].code().unwrap();
    assert_eq!(execute(lib).unwrap(), Value::Int(8));
}

#[test]
fn incremental_cycle_reports_members() {
    let mut inc = IncrementalCompiler::new();
    let err = inc
        .compile_incremental([("x", "import y;\n1;"), ("y", "import x;\n2;")])
        .unwrap_err();
    assert_eq!(err.cycle, vec!["x".to_string(), "y".to_string()]);
    assert!(err.to_string().contains("x"));
    assert!(err.to_string().contains("y"));
}

#[test]
fn incremental_blocked_units_are_reported() {
    let mut inc = IncrementalCompiler::new();
    let report = inc
        .compile_incremental([
            ("bad", "fn ( { ;"),
            ("user", "import bad;\n1;"),
            ("other", "2;"),
        ])
        .unwrap();
    assert!(matches!(report.units["bad"], UnitOutcome::Failed(_)));
    assert!(matches!(report.units["user"], UnitOutcome::Blocked { .. }));
    assert!(matches!(report.units["other"], UnitOutcome::Compiled(_)));
}
