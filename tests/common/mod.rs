#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use sas_console::SessionConfig;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A scripted stand-in for the engine honoring the same pipe contract:
/// `%put` text goes to the log stream (stderr), recognized body lines drive
/// canned responses, `endsas;` exits cleanly.
pub struct StubEngine {
    // Keeps the script directory alive for the session's lifetime.
    _dir: tempfile::TempDir,
    pub path: PathBuf,
}

pub const STUB_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    "show-table")
      printf '<!DOCTYPE html>\n<html><body><table><thead><tr><th style="text-align:left">Name</th><th>Age</th></tr></thead><tbody><tr><td rowspan="2">X</td><td>11</td></tr><tr><td>12</td></tr></tbody></table></body></html>\n' ;;
    "trigger-error")
      printf 'ERROR 180: Statement is not valid or it is used out of proper order.\n' >&2 ;;
    "trigger-warning")
      printf 'WARNING: Apparent symbolic reference FOO not resolved.\n' >&2 ;;
    "emit-graph")
      printf 'NOTE: Writing HTML Body file: /tmp/scatter.png\n' >&2 ;;
    "hang")
      sleep 30 ;;
    "quit-now")
      exit 3 ;;
    "endsas;")
      exit 0 ;;
    "%put "*";")
      text=${line#"%put "}
      text=${text%";"}
      printf '%s\n' "$text" >&2 ;;
  esac
done
"#;

#[cfg(unix)]
pub fn stub_engine() -> TestResult<StubEngine> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sas-stub");
    std::fs::write(&path, STUB_SCRIPT)?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(StubEngine { _dir: dir, path })
}

#[cfg(unix)]
pub fn stub_config(stub: &StubEngine) -> SessionConfig {
    SessionConfig {
        engine_path: Some(stub.path.clone()),
        completion_timeout: Duration::from_secs(20),
        poll_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(1),
        ..SessionConfig::default()
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
