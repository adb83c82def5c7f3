//! Error taxonomy for the inference bridge
//!
//! Each layer has its own error type:
//! - [`StartupError`] for spawning the worker and the startup handshake
//! - [`ChannelError`] for a single request/response exchange
//! - [`InferenceError`] for everything surfaced by the service facade
//! - [`SettingsError`] for the persisted settings file

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while launching the worker process
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Failed to spawn worker process `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Worker did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Worker rejected startup: {0}")]
    HandshakeRejected(String),

    #[error("Invalid handshake from worker: {0}")]
    HandshakeProtocol(#[source] ChannelError),
}

/// Which half of an exchange timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Write,
    Read,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write => f.write_str("write"),
            Self::Read => f.write_str("read"),
        }
    }
}

/// The ways a worker can break the line protocol
#[derive(Error, Debug)]
pub enum ProtocolFault {
    #[error("worker closed its output stream")]
    Eof,

    #[error("pipe error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response line: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors from a single request/response exchange
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Worker {stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolFault),
}

impl ChannelError {
    /// True when the worker's pipes are gone, i.e. the process most likely died.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Protocol(ProtocolFault::Eof | ProtocolFault::Io(_))
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when the worker can no longer be talked to: its pipes are gone,
    /// or a write timed out and may have left a partial request line in
    /// its stdin.
    pub fn requires_restart(&self) -> bool {
        self.is_disconnect()
            || matches!(
                self,
                Self::Timeout {
                    stage: Stage::Write,
                    ..
                }
            )
    }
}

/// Errors returned by every [`InferenceService`](crate::InferenceService) operation
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Worker startup failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Worker communication failed: {0}")]
    Channel(#[from] ChannelError),

    #[error("Inference service is not running")]
    ServiceNotRunning,

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Worker reported failure: {0}")]
    WorkerReportedFailure(String),
}

/// Errors reading or writing the persisted settings file
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("No per-user config directory available on this platform")]
    NoConfigDir,

    #[error("Settings I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Settings file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
