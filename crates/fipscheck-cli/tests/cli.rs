use std::path::Path;
use std::process::{Command, Output};

use fipscheck_contracts::FIPSCHECK_REPORT_SCHEMA_VERSION;

fn fips_checker(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fips-checker"))
        .args(args)
        .env("FIPSCHECK_LIBCRYPTO", "/nonexistent/libcrypto-for-tests.so")
        .output()
        .expect("run fips-checker")
}

fn root_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[test]
fn missing_root_exits_2() {
    let out = fips_checker(&["--root", "/nonexistent/fipscheck-root"]);
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("/nonexistent/fipscheck-root"), "{stderr}");
}

#[test]
fn empty_tree_is_not_compliant() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let out = fips_checker(&["--root", &root_arg(tmp.path())]);
    assert_eq!(out.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("No Go binaries found."), "{stdout}");
    assert!(stdout.contains("FIPS Capable: false"), "{stdout}");
}

#[test]
fn json_report_carries_schema_and_verdict() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let out = fips_checker(&["--root", &root_arg(tmp.path()), "--format", "json"]);
    assert_eq!(out.status.code(), Some(1));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json report");
    assert_eq!(v["schema_version"], FIPSCHECK_REPORT_SCHEMA_VERSION);
    assert_eq!(v["aggregate"]["total"], 0);
    assert_eq!(v["aggregate"]["verdict"]["status"], "not_compliant");
    assert_eq!(v["aggregate"]["verdict"]["reason"], "no_candidates");
    assert_eq!(v["host"]["fips_capable"], false);
}

#[test]
fn bad_flag_values_exit_2() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let out = fips_checker(&["--root", &root_arg(tmp.path()), "--workers", "0"]);
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("workers"), "{stderr}");
}

#[test]
fn config_file_is_applied() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cfg = tmp.path().join("scan.json");
    std::fs::write(
        &cfg,
        r#"{"schema_version":"fipscheck.config@0.1.0","workers":2,"hash_binaries":false}"#,
    )
    .expect("write config");
    let out = fips_checker(&[
        "--root",
        &root_arg(tmp.path()),
        "--config",
        &root_arg(&cfg),
        "--format",
        "json",
    ]);
    assert_eq!(out.status.code(), Some(1));

    std::fs::write(&cfg, r#"{"schema_version":"fipscheck.config@0.1.0","nope":1}"#)
        .expect("write config");
    let out = fips_checker(&["--root", &root_arg(tmp.path()), "--config", &root_arg(&cfg)]);
    assert_eq!(out.status.code(), Some(2));
}
