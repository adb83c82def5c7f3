//! Timeout budgets and worker-script lookup

use std::path::PathBuf;
use std::time::Duration;

/// Default worker script file name
pub const DEFAULT_WORKER_SCRIPT: &str = "inference_worker.py";

/// Environment variable overriding the worker script location
pub const WORKER_SCRIPT_ENV: &str = "INFERENCE_WORKER_SCRIPT";

/// Every bounded wait in the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// `<interpreter> --version` and `conda --version` probes
    pub version_probe: Duration,
    /// `<interpreter> -c "import <library>"` probe, per interpreter
    pub library_probe: Duration,
    /// `conda env list`
    pub manager_list: Duration,
    /// First line from the worker after launch
    pub handshake: Duration,
    /// Writing and flushing one request line
    pub write: Duration,
    /// Reading one response line
    pub read: Duration,
    /// Waiting for the worker to exit after `exit`
    pub exit_grace: Duration,
    /// Waiting for the OS after a forced kill
    pub kill_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            version_probe: Duration::from_secs(3),
            library_probe: Duration::from_secs(5),
            manager_list: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            write: Duration::from_secs(5),
            read: Duration::from_secs(30),
            exit_grace: Duration::from_secs(3),
            kill_wait: Duration::from_secs(1),
        }
    }
}

/// Find the worker script when the caller did not name one.
///
/// Checks `INFERENCE_WORKER_SCRIPT`, then the executable's directory and its
/// `src/` and `scripts/` siblings (one and two levels up, to cover
/// `target/<profile>/`), then the same under the current directory.
/// Returns `None` when no candidate exists.
pub fn locate_worker_script() -> Option<PathBuf> {
    if let Ok(p) = std::env::var(WORKER_SCRIPT_ENV) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| cwd.clone());

    let mut roots = vec![exe_dir.clone()];
    if let Some(up) = exe_dir.parent() {
        roots.push(up.to_path_buf());
        if let Some(up2) = up.parent() {
            roots.push(up2.to_path_buf());
        }
    }
    roots.push(cwd);

    roots
        .iter()
        .flat_map(|root| {
            [
                root.join(DEFAULT_WORKER_SCRIPT),
                root.join("src").join(DEFAULT_WORKER_SCRIPT),
                root.join("scripts").join(DEFAULT_WORKER_SCRIPT),
            ]
        })
        .find(|p| p.exists())
}
