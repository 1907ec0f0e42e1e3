use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

fn zen() -> Command {
    Command::new(env!("CARGO_BIN_EXE_zen"))
}

fn write_program(dir: &TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, source).expect("failed to write program");
    path
}

fn run_zen(args: &[&str]) -> Output {
    zen().args(args).output().expect("failed to run zen")
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

const FIB: &str = "func fib(n) { if (n < 2) { return n } fib(n - 1) + fib(n - 2) }\nprint(fib(15));\n";

// --- run ---

#[test]
fn run_prints_program_output() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "fib.zen", FIB);
    let out = run_zen(&["run", arg(&file)]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "610");
}

#[test]
fn run_without_optimizer_matches() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "fib.zen", FIB);
    let plain = run_zen(&["run", arg(&file), "--no-opt"]);
    let rounds = run_zen(&["run", arg(&file), "--opt-rounds", "3"]);
    assert!(plain.status.success() && rounds.status.success());
    assert_eq!(stdout(&plain), stdout(&rounds));
}

#[test]
fn runtime_error_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "boom.zen", "print(\"before\"); [1, 2][5]");
    let out = run_zen(&["run", arg(&file), "--no-color"]);
    assert!(!out.status.success());
    assert_eq!(stdout(&out).trim(), "before");
    assert!(stderr(&out).contains("error[ZEN-R001]: index 5 out of bounds for length 2"), "stderr: {}", stderr(&out));
}

#[test]
fn compile_error_shows_source_excerpt() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "bad.zen", "const x = 1;\nx = 2;\n");
    let out = run_zen(&["run", arg(&file), "--no-color"]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[ZEN-C002]: cannot assign to constant 'x'"), "stderr: {}", err);
    assert!(err.contains("2 | x = 2;"), "stderr: {}", err);
}

#[test]
fn json_diagnostics() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "bad.zen", "missing + 1");
    let out = run_zen(&["--json", "run", arg(&file)]);
    assert!(!out.status.success());
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("stderr is JSON");
    assert_eq!(v["severity"], "error");
    assert_eq!(v["code"], "ZEN-C001");
    assert_eq!(v["labels"][0]["line"], 1);
}

#[test]
fn missing_file_is_reported() {
    let out = run_zen(&["run", "/definitely/not/here.zen", "--no-color"]);
    assert!(!out.status.success());
    assert!(stderr(&out).starts_with("error: /definitely/not/here.zen"), "stderr: {}", stderr(&out));
}

// --- disasm ---

#[test]
fn disasm_lists_instructions() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "sum.zen", "1 + 2 * 3");
    let out = run_zen(&["disasm", arg(&file), "--no-opt"]);
    assert!(out.status.success());
    assert_eq!(
        stdout(&out),
        "0000 OpConstant 0\n0003 OpConstant 1\n0006 OpConstant 2\n0009 OpMul\n0010 OpAdd\n0011 OpPop\n"
    );
}

#[test]
fn disasm_with_optimizer_folds_constants() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "sum.zen", "1 + 2 * 3");
    let out = run_zen(&["disasm", arg(&file)]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "0000 OpConstant 0\n0003 OpPop\n");
}

#[test]
fn disasm_indents_function_bodies() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "f.zen", "var f = func(x) { x }; f(1)");
    let out = run_zen(&["disasm", arg(&file), "--no-opt"]);
    let text = stdout(&out);
    assert!(text.contains("  fn#0 params=1 locals=1:"), "got:\n{}", text);
    assert!(text.contains("  0000 OpGetLocal 0"), "got:\n{}", text);
}

// --- compile / exec ---

#[test]
fn compile_then_exec() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "fib.zen", FIB);
    let binary = dir.path().join("fib.zenb");
    let out = run_zen(&["compile", arg(&file), "-o", arg(&binary)]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let bytes = std::fs::read(&binary).unwrap();
    assert_eq!(&bytes[..5], b"ZENB\x01");

    let out = run_zen(&["exec", arg(&binary)]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "610");
}

#[test]
fn exec_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "junk.zenb", "not bytecode at all");
    let out = run_zen(&["exec", arg(&file), "--no-color"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("ZEN-B001"), "stderr: {}", stderr(&out));
}

// --- ast ---

#[test]
fn ast_outputs_json() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, "a.zen", "var a = 1");
    let out = run_zen(&["ast", arg(&file)]);
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("AST JSON");
    assert!(v["statements"].is_array());
    assert_eq!(v["statements"].as_array().unwrap().len(), 1);
}
