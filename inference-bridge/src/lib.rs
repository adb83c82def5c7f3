//! Inference Bridge - worker sidecar for vision model inference
//!
//! This crate runs an inference worker in a separate interpreter process
//! and talks to it over its standard streams, one JSON line per message.
//!
//! # Architecture
//!
//! The model runs out of process so that:
//! - A crashing or hanging worker never takes the host down
//! - The user can pick any interpreter environment that has the library
//! - Heavy inference stays off the Tokio event loop
//!
//! Layers, bottom up: [`environment`] discovers interpreters, [`protocol`]
//! defines the wire messages, [`workers`] owns the child process and its
//! channel, and [`service::InferenceService`] is the public facade.
//!
//! # Example
//!
//! ```ignore
//! use inference_bridge::{DetectOptions, InferenceService, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut service = InferenceService::new(ServiceConfig::default());
//!     service.start(None, None).await?;
//!     service.load_model("yolov8n.pt", None).await?;
//!
//!     let result = service.detect("bus.jpg", &DetectOptions::default()).await?;
//!     println!("{} objects", result.detections.len());
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod protocol;
pub mod service;
pub mod settings;
pub mod workers;

// Re-export main types for convenience
pub use environment::{scan_environments, EnvironmentKind, EnvironmentScanner, RuntimeEnvironment, ScanConfig};
pub use error::{ChannelError, InferenceError, ProtocolFault, SettingsError, StartupError};
pub use events::ServiceEvent;
pub use protocol::{
    BoundingBox, ClassificationEntry, ClassificationResult, Detection, DetectionResult, Keypoint,
    KeypointDetection, KeypointResult, MaskPoint, ModelInfo,
};
pub use service::{DetectOptions, InferenceService, ServiceConfig, ServiceState};
pub use settings::SettingsStore;
pub use workers::{ProcessSupervisor, SupervisorConfig, WorkerBackend};
