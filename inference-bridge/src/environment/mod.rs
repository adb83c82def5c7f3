//! Interpreter discovery
//!
//! Enumerates the interpreters that could run the worker: the system
//! interpreter plus every environment an environment manager (conda) knows
//! about, found through its registry file, its `env list` command and the
//! conventional install directories. Each candidate is probed for the
//! required inference library.
//!
//! Discovery never fails: a candidate that cannot be probed is dropped or
//! marked as lacking the library, and an empty list is a valid outcome.

pub mod conda;
mod scanner;

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub(crate) use scanner::default_system_interpreter;
pub use scanner::{EnvironmentScanner, ScanConfig, DEFAULT_REQUIRED_MODULE};

/// Where an interpreter comes from
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// Resolved by name from the search path
    System,
    /// Self-contained environment created by an environment manager
    Isolated,
}

/// A candidate interpreter found on this host
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    pub name: String,
    pub interpreter_path: String,
    pub kind: EnvironmentKind,
    pub has_required_library: bool,
}

/// Scan the host with the default configuration
pub async fn scan_environments() -> Vec<RuntimeEnvironment> {
    EnvironmentScanner::new(ScanConfig::default()).scan().await
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let tail = out.components().next_back();
                let at_normal = matches!(tail, Some(Component::Normal(_)));
                let at_root = matches!(tail, Some(Component::RootDir | Component::Prefix(_)));
                if at_normal {
                    out.pop();
                } else if !at_root {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Interpreter executable inside an environment root
pub fn interpreter_in(root: &Path) -> PathBuf {
    if cfg!(windows) {
        root.join("python.exe")
    } else {
        root.join("bin").join("python")
    }
}

/// Run `program args...` with all stdio detached; true on exit status 0
/// within `timeout`. The child is killed if the timeout elapses.
pub(crate) async fn probe_succeeds(program: &str, args: &[&str], timeout: Duration) -> bool {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(timeout, status).await {
        Ok(Ok(status)) => {
            debug!(program = %program, code = ?status.code(), "Probe finished");
            status.success()
        }
        Ok(Err(e)) => {
            debug!(program = %program, error = %e, "Probe could not start");
            false
        }
        Err(_) => {
            debug!(program = %program, timeout_ms = timeout.as_millis(), "Probe timed out");
            false
        }
    }
}

/// Run `program args...` and capture stdout when it exits 0 within `timeout`
pub(crate) async fn probe_output(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(Ok(out)) => {
            debug!(program = %program, code = ?out.status.code(), "Command exited with failure");
            None
        }
        Ok(Err(e)) => {
            debug!(program = %program, error = %e, "Command could not start");
            None
        }
        Err(_) => {
            debug!(program = %program, timeout_ms = timeout.as_millis(), "Command timed out");
            None
        }
    }
}
