//! Worker process and wire channel
//!
//! This module contains the [`ProcessSupervisor`] that owns the worker
//! subprocess and the [`LineChannel`] that speaks the line-delimited JSON
//! protocol over its stdin/stdout.

mod channel;
mod supervisor;

pub use channel::{LineChannel, WireChannel};
pub use supervisor::{
    Launch, LaunchRequest, ProcessSupervisor, SupervisorConfig, WorkerBackend, DEFAULT_ENV_NAME,
    WORKER_STDERR_TARGET,
};
