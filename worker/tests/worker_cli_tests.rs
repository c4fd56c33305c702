// Tests driving the worker binary as a subprocess

use common::worker::diagnostic::{Diagnostic, DiagnosticKind};
use std::io::Write;
use std::process::{Command, Stdio};

fn worker() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_worker"));
    command
        .arg("--config-dir")
        .arg(std::env::temp_dir().join("worker-cli-tests-no-config"))
        .env("QLESS__OBSERVABILITY__LOG_LEVEL", "error")
        .env("QLESS__REDIS__URL", "redis://127.0.0.1:1");
    command
}

#[test]
fn test_executor_reports_bad_snapshot_on_diagnostic_channel() {
    let mut child = worker()
        .arg("executor")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"definitely not a job")
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    let diagnostic = Diagnostic::parse_last(&output.stdout).unwrap();
    assert_eq!(diagnostic.kind, DiagnosticKind::Failure);
    assert!(diagnostic.message.contains("Invalid job snapshot"));
}

#[test]
fn test_run_fails_fast_without_backend() {
    let output = worker()
        .arg("run")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_watchdog_requires_jid_and_worker() {
    let output = worker()
        .arg("watchdog")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}
