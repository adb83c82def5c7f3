//! Worker process supervision
//!
//! [`ProcessSupervisor`] owns at most one worker subprocess. It resolves
//! which interpreter to launch, spawns the worker script with separate
//! stdin/stdout/stderr pipes, performs the startup handshake and shuts the
//! worker down again.
//!
//! # Lifecycle
//!
//! - `start`: spawn, then block for the first stdout line, which must be a
//!   `success: true` envelope. Any other outcome kills the child before the
//!   error is returned. A launch through `conda run` that fails is retried
//!   once with the bare system interpreter.
//! - `stop`: send `exit`, wait a grace period, then kill and reap. Safe to
//!   call repeatedly.
//!
//! stdout carries only protocol lines; stderr is forwarded to tracing.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use super::channel::{LineChannel, WireChannel};
use crate::config::Timeouts;
use crate::environment::{self, conda, interpreter_in};
use crate::error::{ChannelError, ProtocolFault, StartupError};
use crate::protocol::{Command as WorkerCommand, ResponseEnvelope};

/// conda environment tried when nothing else was selected
pub const DEFAULT_ENV_NAME: &str = "inference";

/// Tracing target for forwarded worker stderr
pub const WORKER_STDERR_TARGET: &str = "inference_bridge::worker_stderr";

/// How the worker gets launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// `<interpreter> <script>`
    Direct { interpreter: String },
    /// `<manager> run --no-capture-output -n <env> python <script>`
    ManagerRun { manager: String, env_name: String },
}

impl Launch {
    fn program(&self) -> &str {
        match self {
            Self::Direct { interpreter } => interpreter,
            Self::ManagerRun { manager, .. } => manager,
        }
    }

    fn args(&self, script: &Path) -> Vec<OsString> {
        match self {
            Self::Direct { .. } => vec![script.as_os_str().to_owned()],
            Self::ManagerRun { env_name, .. } => vec![
                "run".into(),
                "--no-capture-output".into(),
                "-n".into(),
                env_name.into(),
                "python".into(),
                script.as_os_str().to_owned(),
            ],
        }
    }

    /// Shell-like rendering for log lines
    pub fn describe(&self, script: &Path) -> String {
        let mut parts = vec![self.program().to_string()];
        parts.extend(self.args(script).iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    pub fn is_manager_run(&self) -> bool {
        matches!(self, Self::ManagerRun { .. })
    }
}

/// What the caller asked for when starting the worker
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Interpreter named explicitly for this start
    pub interpreter: Option<String>,
    /// Last interpreter the user selected; used only if it still exists
    pub stored: Option<String>,
    /// Worker script
    pub script: PathBuf,
}

/// How the supervisor resolves and launches interpreters
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bare interpreter name used as the last resort
    pub system_interpreter: String,
    /// Environment manager executable
    pub manager: String,
    /// Environment used with `<manager> run -n`
    pub default_env_name: String,
    /// `envs/` directories searched for `default_env_name`
    pub env_dirs: Vec<PathBuf>,
    pub timeouts: Timeouts,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            system_interpreter: environment::default_system_interpreter().to_string(),
            manager: "conda".to_string(),
            default_env_name: DEFAULT_ENV_NAME.to_string(),
            env_dirs: dirs::home_dir()
                .as_deref()
                .map(conda::fallback_env_dirs)
                .unwrap_or_default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// A worker the service facade can drive
///
/// [`ProcessSupervisor`] is the production implementation; tests swap in
/// scripted backends.
#[async_trait]
pub trait WorkerBackend: Send {
    /// Launch the worker and complete the handshake; a no-op when running
    async fn start(&mut self, request: &LaunchRequest) -> Result<(), StartupError>;

    /// Shut the worker down; a no-op when stopped
    async fn stop(&mut self);

    fn is_running(&mut self) -> bool;

    /// One request/response exchange with the running worker
    async fn send(&mut self, command: &WorkerCommand) -> Result<ResponseEnvelope, ChannelError>;
}

type ChildChannel = LineChannel<ChildStdin, BufReader<ChildStdout>>;

/// A spawned worker that passed its handshake
struct WorkerProcess {
    child: Child,
    channel: ChildChannel,
    launch: Launch,
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // kill_on_drop(true) on the Command terminates the child
        if let Some(pid) = self.child.id() {
            debug!(pid = pid, "Dropping worker process handle");
        }
    }
}

/// Owns the lifecycle of one worker subprocess
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    process: Option<WorkerProcess>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            process: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Process id of the running worker
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    /// How the running worker was launched
    pub fn launch(&self) -> Option<&Launch> {
        self.process.as_ref().map(|p| &p.launch)
    }

    /// Pick the launch for `request`.
    ///
    /// Priority: explicit interpreter, then the stored interpreter if it
    /// still exists on disk, then `conda run` when conda answers
    /// `--version`, then the default environment in a conventional install
    /// directory, then the bare system interpreter.
    pub async fn resolve_launch(&self, request: &LaunchRequest) -> Launch {
        if let Some(explicit) = request.interpreter.as_deref().filter(|s| !s.trim().is_empty()) {
            return Launch::Direct {
                interpreter: explicit.to_string(),
            };
        }

        if let Some(stored) = request.stored.as_deref().filter(|s| !s.trim().is_empty()) {
            // a bare name such as `python3` is the system entry, resolved via PATH
            let bare_name = Path::new(stored).components().count() == 1
                && !stored.contains(std::path::MAIN_SEPARATOR);
            if bare_name || Path::new(stored).exists() {
                return Launch::Direct {
                    interpreter: stored.to_string(),
                };
            }
            debug!(stored = %stored, "Stored interpreter no longer exists");
        }

        if environment::probe_succeeds(
            &self.config.manager,
            &["--version"],
            self.config.timeouts.version_probe,
        )
        .await
        {
            return Launch::ManagerRun {
                manager: self.config.manager.clone(),
                env_name: self.config.default_env_name.clone(),
            };
        }

        let in_env_dirs = self
            .config
            .env_dirs
            .iter()
            .map(|dir| interpreter_in(&dir.join(&self.config.default_env_name)))
            .find(|path| path.exists());
        if let Some(path) = in_env_dirs {
            return Launch::Direct {
                interpreter: path.to_string_lossy().into_owned(),
            };
        }

        self.system_launch()
    }

    fn system_launch(&self) -> Launch {
        Launch::Direct {
            interpreter: self.config.system_interpreter.clone(),
        }
    }

    /// Spawn the worker and run the handshake, killing the child on failure
    async fn spawn_worker(&self, launch: Launch, script: &Path) -> Result<WorkerProcess, StartupError> {
        let program = launch.program().to_string();
        info!(command = %launch.describe(script), "Starting inference worker");

        let mut child = Command::new(&program)
            .args(launch.args(script))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StartupError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(pid = ?pid, "Worker process spawned");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_and_reap(&mut child, &self.config.timeouts).await;
            return Err(StartupError::Spawn {
                program,
                source: std::io::Error::other("worker stdio was not captured"),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, pid);
        }

        let mut channel = LineChannel::new(stdin, BufReader::new(stdout), &self.config.timeouts);
        match handshake(&mut channel, &self.config.timeouts).await {
            Ok(message) => {
                info!(pid = ?pid, message = %message, "Worker handshake complete");
                Ok(WorkerProcess {
                    child,
                    channel,
                    launch,
                })
            }
            Err(e) => {
                error!(pid = ?pid, error = %e, "Worker handshake failed");
                kill_and_reap(&mut child, &self.config.timeouts).await;
                Err(e)
            }
        }
    }

    /// Launch the worker; see the module docs for the fallback rule
    pub async fn start(&mut self, request: &LaunchRequest) -> Result<(), StartupError> {
        if self.is_running() {
            info!(pid = ?self.pid(), "Worker already running");
            return Ok(());
        }
        // a previous worker that died on its own
        self.stop().await;

        let launch = self.resolve_launch(request).await;
        let via_manager = launch.is_manager_run();
        let process = match self.spawn_worker(launch, &request.script).await {
            Ok(process) => process,
            Err(e) if via_manager => {
                warn!(error = %e, "Launch through environment manager failed, retrying with system interpreter");
                self.spawn_worker(self.system_launch(), &request.script).await?
            }
            Err(e) => return Err(e),
        };
        self.process = Some(process);
        Ok(())
    }

    /// Ask the worker to exit, force-kill it after the grace period
    pub async fn stop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        let timeouts = self.config.timeouts;
        let pid = process.child.id();

        if matches!(process.child.try_wait(), Ok(None)) {
            if let Err(e) = process.channel.write_command(&WorkerCommand::Exit).await {
                debug!(pid = ?pid, error = %e, "Could not send exit command");
            }
            match tokio::time::timeout(timeouts.exit_grace, process.child.wait()).await {
                Ok(Ok(status)) => info!(pid = ?pid, status = %status, "Worker exited"),
                Ok(Err(e)) => {
                    warn!(pid = ?pid, error = %e, "Waiting for worker failed, killing");
                    kill_and_reap(&mut process.child, &timeouts).await;
                }
                Err(_) => {
                    warn!(
                        pid = ?pid,
                        grace_ms = timeouts.exit_grace.as_millis(),
                        "Worker ignored exit command, killing"
                    );
                    kill_and_reap(&mut process.child, &timeouts).await;
                }
            }
        } else {
            debug!(pid = ?pid, "Worker already exited, releasing handle");
        }
    }

    /// Check whether the worker process is still alive
    pub fn is_running(&mut self) -> bool {
        let Some(process) = self.process.as_mut() else {
            return false;
        };
        match process.child.try_wait() {
            Ok(None) => true, // Process still running
            Ok(Some(status)) => {
                info!(pid = ?process.child.id(), status = %status, "Worker exited on its own");
                // already reaped by try_wait
                self.process = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not query worker status");
                false
            }
        }
    }

    pub async fn send(&mut self, command: &WorkerCommand) -> Result<ResponseEnvelope, ChannelError> {
        match self.process.as_mut() {
            Some(process) => process.channel.send(command).await,
            None => Err(ProtocolFault::Eof.into()),
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

#[async_trait]
impl WorkerBackend for ProcessSupervisor {
    async fn start(&mut self, request: &LaunchRequest) -> Result<(), StartupError> {
        ProcessSupervisor::start(self, request).await
    }

    async fn stop(&mut self) {
        ProcessSupervisor::stop(self).await;
    }

    fn is_running(&mut self) -> bool {
        ProcessSupervisor::is_running(self)
    }

    async fn send(&mut self, command: &WorkerCommand) -> Result<ResponseEnvelope, ChannelError> {
        ProcessSupervisor::send(self, command).await
    }
}

/// First stdout line must be a `success: true` envelope; returns its message
async fn handshake(channel: &mut ChildChannel, timeouts: &Timeouts) -> Result<String, StartupError> {
    match channel.read_envelope(timeouts.handshake).await {
        Ok(envelope) if envelope.success => Ok(envelope.message),
        Ok(envelope) => Err(StartupError::HandshakeRejected(envelope.failure_message())),
        Err(ChannelError::Timeout { after, .. }) => Err(StartupError::HandshakeTimeout(after)),
        Err(e) => Err(StartupError::HandshakeProtocol(e)),
    }
}

/// Forced kill followed by a bounded wait for the OS to reclaim the child
async fn kill_and_reap(child: &mut Child, timeouts: &Timeouts) {
    let pid = child.id();
    if let Err(e) = child.start_kill() {
        debug!(pid = ?pid, error = %e, "Kill failed (process may have exited)");
    }
    match tokio::time::timeout(timeouts.kill_wait, child.wait()).await {
        Ok(Ok(status)) => debug!(pid = ?pid, status = %status, "Worker reaped"),
        Ok(Err(e)) => warn!(pid = ?pid, error = %e, "Error reaping worker"),
        Err(_) => warn!(pid = ?pid, "Worker not reaped within kill wait"),
    }
}

fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: WORKER_STDERR_TARGET, pid = ?pid, "{}", line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config_without_manager() -> SupervisorConfig {
        SupervisorConfig {
            system_interpreter: "python3".to_string(),
            manager: "no-such-environment-manager-1893".to_string(),
            default_env_name: DEFAULT_ENV_NAME.to_string(),
            env_dirs: Vec::new(),
            timeouts: Timeouts {
                version_probe: Duration::from_millis(500),
                ..Timeouts::default()
            },
        }
    }

    #[test]
    fn test_launch_args() {
        let script = Path::new("/srv/worker.py");
        let direct = Launch::Direct {
            interpreter: "/envs/a/bin/python".into(),
        };
        assert_eq!(direct.describe(script), "/envs/a/bin/python /srv/worker.py");

        let managed = Launch::ManagerRun {
            manager: "conda".into(),
            env_name: "vision".into(),
        };
        assert_eq!(
            managed.describe(script),
            "conda run --no-capture-output -n vision python /srv/worker.py"
        );
        assert!(managed.is_manager_run());
    }

    #[tokio::test]
    async fn test_explicit_interpreter_wins() {
        let supervisor = ProcessSupervisor::new(config_without_manager());
        let request = LaunchRequest {
            interpreter: Some("/custom/python".into()),
            stored: Some("/also/ignored".into()),
            script: PathBuf::from("w.py"),
        };
        assert_eq!(
            supervisor.resolve_launch(&request).await,
            Launch::Direct {
                interpreter: "/custom/python".into()
            }
        );
    }

    #[tokio::test]
    async fn test_stored_interpreter_only_if_present() {
        let dir = tempfile::tempdir().unwrap();
        let stored = dir.path().join("python");
        std::fs::write(&stored, "").unwrap();

        let supervisor = ProcessSupervisor::new(config_without_manager());
        let request = LaunchRequest {
            interpreter: None,
            stored: Some(stored.to_string_lossy().into_owned()),
            script: PathBuf::from("w.py"),
        };
        assert_eq!(
            supervisor.resolve_launch(&request).await,
            Launch::Direct {
                interpreter: stored.to_string_lossy().into_owned()
            }
        );

        let request = LaunchRequest {
            stored: Some(dir.path().join("gone").to_string_lossy().into_owned()),
            ..request
        };
        assert_eq!(
            supervisor.resolve_launch(&request).await,
            Launch::Direct {
                interpreter: "python3".into()
            }
        );
    }

    #[tokio::test]
    async fn test_default_env_in_install_dir() {
        let dir = tempfile::tempdir().unwrap();
        let python = interpreter_in(&dir.path().join(DEFAULT_ENV_NAME));
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::fs::write(&python, "").unwrap();

        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            env_dirs: vec![dir.path().to_path_buf()],
            ..config_without_manager()
        });
        assert_eq!(
            supervisor.resolve_launch(&LaunchRequest::default()).await,
            Launch::Direct {
                interpreter: python.to_string_lossy().into_owned()
            }
        );
    }

    #[tokio::test]
    async fn test_stop_when_never_started_is_noop() {
        let mut supervisor = ProcessSupervisor::new(config_without_manager());
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_send_without_worker_is_disconnect() {
        let mut supervisor = ProcessSupervisor::new(config_without_manager());
        let err = supervisor.send(&WorkerCommand::Exit).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_startup_error() {
        let mut supervisor = ProcessSupervisor::new(config_without_manager());
        let request = LaunchRequest {
            interpreter: Some("/definitely/not/an/interpreter".into()),
            stored: None,
            script: PathBuf::from("w.py"),
        };
        let err = supervisor.start(&request).await.unwrap_err();
        assert!(matches!(err, StartupError::Spawn { .. }));
        assert!(!supervisor.is_running());
    }
}
