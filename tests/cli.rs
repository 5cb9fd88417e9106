//! Integration tests for the stackshot and stackshot-inspect binaries.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Run stackshot with the given arguments, returning the full Output.
fn run_stackshot(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stackshot"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run stackshot")
}

/// Run stackshot-inspect with the given arguments, returning the full Output.
fn run_inspect(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stackshot-inspect"))
        .args(args)
        .output()
        .expect("Failed to run stackshot-inspect")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}",
            e,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("temp path should be utf-8")
}

#[test]
fn test_synthetic_capture_and_summary() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let out = dir.path().join("snap.kcdata");

    let output = run_stackshot(&["--synthetic", "5", "--seed", "3", "-o", path_str(&out)]);
    assert_success(&output);
    let result = stdout_json(&output);
    assert_eq!(result["status"], "success");
    let written = fs::metadata(&out).expect("buffer should be written").len();
    assert_eq!(result["bytes_traced"].as_u64(), Some(written));

    let output = run_inspect(&["verify", path_str(&out)]);
    assert_success(&output);
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("ok:"));

    let output = run_inspect(&["summary", path_str(&out), "--format", "json"]);
    assert_success(&output);
    let summary = stdout_json(&output);
    assert_eq!(summary["tasks"], 6);
    assert_eq!(summary["delta"], false);
    assert_eq!(summary["compressed"], false);
}

#[test]
fn test_saved_scenario_replays() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = dir.path().join("system.json");
    let out = dir.path().join("snap.kcdata");

    let output = run_stackshot(&[
        "--synthetic",
        "3",
        "--seed",
        "9",
        "--save-scenario",
        path_str(&scenario),
    ]);
    assert_success(&output);
    assert!(output.stdout.is_empty());

    let output = run_stackshot(&[
        "--scenario",
        path_str(&scenario),
        "--compress",
        "-o",
        path_str(&out),
    ]);
    assert_success(&output);

    let output = run_inspect(&["dump", path_str(&out), "--format", "json"]);
    assert_success(&output);
    let dump = stdout_json(&output);
    assert_eq!(dump["compressed"], true);

    let output = run_inspect(&["dump", path_str(&out)]);
    assert_success(&output);
    let tree = String::from_utf8_lossy(&output.stdout);
    assert!(tree.starts_with("stackshot (compressed)"));
}

#[test]
fn test_retained_capture_is_retrieved() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let out = dir.path().join("snap.kcdata");

    let output = run_stackshot(&["--synthetic", "2", "--retain", "-o", path_str(&out)]);
    assert_success(&output);
    assert!(out.exists());
}

#[test]
fn test_fixed_buffer_too_small_fails() {
    let output = run_stackshot(&["--synthetic", "4", "--fixed-size", "256"]);
    assert!(!output.status.success());
    let result = stdout_json(&output);
    assert_eq!(result["status"], "insufficient_buffer_size");
}

#[test]
fn test_missing_system_is_an_error() {
    let output = run_stackshot(&[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--scenario"), "stderr: {}", stderr);
}

#[test]
fn test_inspect_rejects_garbage() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let bad = dir.path().join("bad.kcdata");
    fs::write(&bad, [0xabu8; 64]).expect("Failed to write file");

    let output = run_inspect(&["verify", path_str(&bad)]);
    assert!(!output.status.success());

    let output = run_inspect(&["summary", path_str(&bad), "--format", "xml"]);
    assert!(!output.status.success());
}

#[test]
fn test_inspect_rejects_oversized_compress_header() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    for (total_out, total_in) in [(u64::MAX - 8, 0), (8, u64::MAX - 8)] {
        let mut buf = vec![0u8; 64];
        // BEGIN_COMPRESSED, then a zlib compress header.
        buf[..4].copy_from_slice(&0x434f_4d50u32.to_le_bytes());
        buf[16..20].copy_from_slice(&0x40u32.to_le_bytes());
        buf[20..24].copy_from_slice(&24u32.to_le_bytes());
        buf[32..40].copy_from_slice(&1u64.to_le_bytes());
        buf[40..48].copy_from_slice(&total_out.to_le_bytes());
        buf[48..56].copy_from_slice(&total_in.to_le_bytes());
        let bad = dir.path().join("crafted.kcdata");
        fs::write(&bad, &buf).expect("Failed to write file");

        for cmd in ["verify", "dump"] {
            let output = run_inspect(&[cmd, path_str(&bad)]);
            assert_eq!(
                output.status.code(),
                Some(1),
                "stderr: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            assert!(!String::from_utf8_lossy(&output.stderr).contains("panicked"));
        }
    }
}
