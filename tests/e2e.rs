use std::path::Path;
use std::process::Command;

use strand::vm::{DataItem, Function, Instruction, Module};
use tempfile::TempDir;

fn run_strand(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_strand"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute strand");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn write_module(dir: &TempDir, name: &str, module: &Module) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, module.to_bytes()).unwrap();
    path_str(&path)
}

fn path_str(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

/// `print(7)` followed by `add(2, 40) -> globals[0]`.
fn sample_module() -> Module {
    let mut module = Module::new().with_globals(8);
    let print = module.op("print");
    let add = module.op("add");
    let seven = module.data(DataItem::I32(7));
    let a = module.data(DataItem::I64(2));
    let b = module.data(DataItem::I64(40));
    module.function(Function::new("main").exported().emit_all([
        Instruction::OpBegin,
        Instruction::DataAddress(seven),
        Instruction::Param,
        Instruction::OpEnd { op: print, result: 0 },
        Instruction::OpBegin,
        Instruction::DataAddress(a),
        Instruction::Param,
        Instruction::DataAddress(b),
        Instruction::Param,
        Instruction::GlobalsAddress(0),
        Instruction::Target,
        Instruction::OpEnd { op: add, result: 0 },
    ]));
    module
}

#[test]
fn test_run_traces_operations() {
    let dir = TempDir::new().unwrap();
    let file = write_module(&dir, "sample.strn", &sample_module());

    let (stdout, stderr, success) = run_strand(&["run", &file]);
    assert!(success, "run should succeed, stderr:\n{}", stderr);

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "stdout:\n{}", stdout);
    assert!(lines[0].starts_with("print params=[@"));
    assert!(lines[0].contains(": 07 00 00 00"));
    assert!(lines[0].ends_with("targets=[]"));
    assert!(lines[1].starts_with("add params=[@"));
    assert!(lines[1].contains("02 00 00 00 00 00 00 00"));
    assert!(lines[1].contains("28 00 00 00 00 00 00 00"));
    assert!(lines[1].contains("targets=[@"));
    assert_eq!(lines[2], "-- finished after 2 operations --");
}

#[test]
fn test_run_pause_every() {
    let dir = TempDir::new().unwrap();
    let file = write_module(&dir, "sample.strn", &sample_module());

    let (stdout, stderr, success) = run_strand(&["run", &file, "--pause-every", "1"]);
    assert!(success, "run should succeed, stderr:\n{}", stderr);
    assert_eq!(stdout.matches("-- paused after").count(), 1);
    assert!(stdout.contains("-- paused after 1 operations --"));
    assert!(stdout.ends_with("-- finished after 2 operations --\n"));
}

#[test]
fn test_run_with_config_file() {
    let dir = TempDir::new().unwrap();
    let file = write_module(&dir, "sample.strn", &sample_module());
    let config = dir.path().join("strand.toml");
    std::fs::write(&config, "stack_size = 128\nmemory_size = 128\n").unwrap();

    let (_, stderr, success) = run_strand(&["run", &file, "--config", &path_str(&config)]);
    assert!(success, "run should succeed, stderr:\n{}", stderr);

    // The command line wins over the file; globals and data no longer fit.
    let (_, stderr, success) = run_strand(&[
        "run",
        &file,
        "--config",
        &path_str(&config),
        "--memory",
        "16",
    ]);
    assert!(!success);
    assert!(stderr.starts_with("error: "), "stderr:\n{}", stderr);
    assert!(stderr.contains("out of memory"), "stderr:\n{}", stderr);
}

#[test]
fn test_run_errors() {
    let dir = TempDir::new().unwrap();
    let file = write_module(&dir, "sample.strn", &sample_module());

    let (_, stderr, success) = run_strand(&["run", &file, "--entry", "missing"]);
    assert!(!success);
    assert!(stderr.contains("entry function `missing` not found"), "stderr:\n{}", stderr);

    let (_, stderr, success) = run_strand(&["run", &file, "--stack", "6"]);
    assert!(!success);
    assert!(stderr.contains("multiples of 4"), "stderr:\n{}", stderr);

    let garbage = dir.path().join("garbage.strn");
    std::fs::write(&garbage, b"not bytecode").unwrap();
    let (_, stderr, success) = run_strand(&["run", &path_str(&garbage)]);
    assert!(!success);
    assert!(stderr.contains("invalid magic number"), "stderr:\n{}", stderr);

    let missing = dir.path().join("missing.strn");
    let (_, stderr, success) = run_strand(&["run", &path_str(&missing)]);
    assert!(!success);
    assert!(stderr.contains("failed to read"), "stderr:\n{}", stderr);
}

#[test]
fn test_dump() {
    let dir = TempDir::new().unwrap();
    let file = write_module(&dir, "sample.strn", &sample_module());

    let (stdout, stderr, success) = run_strand(&["dump", &file]);
    assert!(success, "dump should succeed, stderr:\n{}", stderr);
    assert!(stdout.contains("ops:"));
    assert!(stdout.contains("globals: 8 bytes"));
    assert!(stdout.contains("data: 20 bytes"));
    assert!(stdout.contains("main (export)"));
    assert!(stdout.contains("op_end 1 result=0"));

    let (stdout, stderr, success) = run_strand(&["dump", &file, "--json"]);
    assert!(success, "dump should succeed, stderr:\n{}", stderr);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["ops"][0], "print");
    assert_eq!(json["globals_size"], 8);
    assert_eq!(json["functions"][0]["name"], "main");
    assert_eq!(json["functions"][0]["code"][0]["op"], "op_begin");
}

#[test]
fn test_verbose_logs_to_stderr() {
    let dir = TempDir::new().unwrap();
    let file = write_module(&dir, "sample.strn", &sample_module());

    let (stdout, stderr, success) = run_strand(&["-v", "run", &file]);
    assert!(success);
    assert!(stderr.contains("context started"), "stderr:\n{}", stderr);
    assert!(!stdout.contains("context started"));
}
