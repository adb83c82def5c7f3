//! Inference service facade
//!
//! [`InferenceService`] is the public surface: start/stop the worker, load a
//! model, and run detect/segment/classify/keypoint calls. It owns the worker
//! backend and all service state; every operation returns a `Result` and
//! publishes exactly one [`ServiceEvent::Log`] line on failure.
//!
//! # States
//!
//! `Stopped -> Starting -> Ready -> Busy -> Ready -> ... -> Stopping -> Stopped`
//!
//! `model_loaded` is only ever true in `Ready`/`Busy` and is cleared whenever
//! the service returns to `Stopped`, including when the worker dies mid-call.

use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{locate_worker_script, DEFAULT_WORKER_SCRIPT};
use crate::error::{InferenceError, SettingsError};
use crate::events::{EventBus, ServiceEvent};
use crate::protocol::{
    decode_classifications, decode_detections, decode_keypoints, decode_model_info,
    ClassificationResult, Command, DetectionResult, InferenceParams, KeypointResult, ModelInfo,
    ResponseEnvelope, DEFAULT_CONF_THRESHOLD, DEFAULT_IMAGE_SIZE, DEFAULT_IOU_THRESHOLD,
};
use crate::settings::{BridgeSettings, SettingsStore};
use crate::workers::{LaunchRequest, ProcessSupervisor, SupervisorConfig, WorkerBackend};

/// Lifecycle of the worker as seen by the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Ready,
    Busy,
    Stopping,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Thresholds for detect, segment and keypoint calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub image_size: u32,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }
}

impl DetectOptions {
    fn params(&self, image_path: &str) -> InferenceParams {
        InferenceParams {
            image_path: image_path.to_string(),
            conf_threshold: self.conf_threshold,
            iou_threshold: self.iou_threshold,
            image_size: self.image_size,
        }
    }
}

/// Construction-time configuration of the facade
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Where the selected interpreter is persisted; `None` keeps it in memory
    pub settings: Option<SettingsStore>,
    /// Worker script; located automatically when `None`
    pub script_path: Option<PathBuf>,
    pub supervisor: SupervisorConfig,
}

/// Public surface of the inference bridge
pub struct InferenceService<W: WorkerBackend = ProcessSupervisor> {
    backend: W,
    state: ServiceState,
    model_loaded: bool,
    model_path: Option<String>,
    environment_path: Option<String>,
    settings: Option<SettingsStore>,
    script_path: Option<PathBuf>,
    events: EventBus,
}

impl InferenceService<ProcessSupervisor> {
    /// Service backed by a real worker subprocess
    pub fn new(config: ServiceConfig) -> Self {
        let supervisor = ProcessSupervisor::new(config.supervisor.clone());
        Self::with_backend(supervisor, config)
    }
}

impl<W: WorkerBackend> InferenceService<W> {
    /// Service over any backend; `start` re-reads the stored interpreter
    pub fn with_backend(backend: W, config: ServiceConfig) -> Self {
        let environment_path = config.settings.as_ref().and_then(|store| match store.load() {
            Ok(settings) => settings.interpreter_path,
            Err(e) => {
                warn!(error = %e, "Could not read bridge settings");
                None
            }
        });
        Self {
            backend,
            state: ServiceState::Stopped,
            model_loaded: false,
            model_path: None,
            environment_path,
            settings: config.settings,
            script_path: config.script_path,
            events: EventBus::new(),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model_loaded
    }

    /// Path of the currently loaded model
    pub fn model_path(&self) -> Option<&str> {
        self.model_path.as_deref()
    }

    pub fn backend(&self) -> &W {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut W {
        &mut self.backend
    }

    /// Interpreter the user selected last
    pub fn current_environment_path(&self) -> Option<&str> {
        self.environment_path.as_deref()
    }

    /// Pick up a selection persisted since the last read
    fn reload_environment_path(&mut self) {
        let Some(store) = &self.settings else {
            return;
        };
        match store.load() {
            Ok(settings) => self.environment_path = settings.interpreter_path,
            Err(e) => warn!(error = %e, "Could not read bridge settings, keeping previous selection"),
        }
    }

    /// Select an interpreter for the next `start` and persist the choice
    pub fn set_environment_path(&mut self, path: Option<String>) -> Result<(), SettingsError> {
        self.environment_path = path.filter(|p| !p.trim().is_empty());
        if let Some(store) = &self.settings {
            let settings = BridgeSettings {
                interpreter_path: self.environment_path.clone(),
            };
            store.save(&settings)?;
        }
        info!(interpreter = ?self.environment_path, "Interpreter selection updated");
        Ok(())
    }

    /// True while the worker process is alive. A worker found dead here
    /// moves the service to `Stopped`.
    pub fn is_running(&mut self) -> bool {
        let running = self.backend.is_running();
        if !running && self.state != ServiceState::Stopped {
            warn!(state = %self.state, "Worker exited while idle");
            self.enter_stopped();
        }
        running
    }

    /// Launch the worker.
    ///
    /// `interpreter` overrides the stored selection for this start only;
    /// `script` overrides the configured worker script.
    pub async fn start(&mut self, interpreter: Option<&str>, script: Option<&Path>) -> Result<(), InferenceError> {
        if self.is_running() {
            self.events.log("Inference service is already running");
            return Ok(());
        }
        self.reload_environment_path();

        let script = script
            .map(Path::to_path_buf)
            .or_else(|| self.script_path.clone())
            .or_else(locate_worker_script)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_SCRIPT));
        let request = LaunchRequest {
            interpreter: interpreter.map(str::to_string),
            stored: self.environment_path.clone(),
            script,
        };

        self.state = ServiceState::Starting;
        self.model_loaded = false;
        self.model_path = None;
        match self.backend.start(&request).await {
            Ok(()) => {
                self.state = ServiceState::Ready;
                info!(script = %request.script.display(), "Inference service started");
                self.events.log("Inference service started");
                self.events.emit(ServiceEvent::StateChanged { running: true });
                Ok(())
            }
            Err(e) => {
                self.state = ServiceState::Stopped;
                Err(self.report("Inference service start", e.into()))
            }
        }
    }

    /// Stop the worker; a no-op when already stopped
    pub async fn stop(&mut self) {
        if self.state == ServiceState::Stopped && !self.backend.is_running() {
            return;
        }
        self.state = ServiceState::Stopping;
        self.backend.stop().await;
        self.enter_stopped();
        info!("Inference service stopped");
        self.events.log("Inference service stopped");
    }

    /// Load a model (and optional label file) into the worker
    pub async fn load_model(&mut self, model_path: &str, labels_path: Option<&str>) -> Result<ModelInfo, InferenceError> {
        let command = Command::LoadModel {
            model_path: model_path.to_string(),
            labels_path: labels_path.filter(|p| !p.is_empty()).map(str::to_string),
        };

        match self.request(&command, false).await {
            Ok(envelope) => {
                self.model_loaded = true;
                self.model_path = Some(model_path.to_string());
                let info = decode_model_info(envelope.payload(), &envelope.message);
                info!(model = %model_path, classes = info.num_classes, "Model loaded");
                self.events.log(format!("Model loaded: {model_path}"));
                self.events.emit(ServiceEvent::ModelLoaded {
                    success: true,
                    message: envelope.message,
                });
                Ok(info)
            }
            Err(e) => {
                self.model_loaded = false;
                self.model_path = None;
                self.events.emit(ServiceEvent::ModelLoaded {
                    success: false,
                    message: e.to_string(),
                });
                Err(self.report("Model load", e))
            }
        }
    }

    /// Object detection
    pub async fn detect(&mut self, image_path: &str, options: &DetectOptions) -> Result<DetectionResult, InferenceError> {
        self.run_detection(Command::Detect(options.params(image_path)), "Detection")
            .await
    }

    /// Instance segmentation; detections carry mask polygons
    pub async fn segment(&mut self, image_path: &str, options: &DetectOptions) -> Result<DetectionResult, InferenceError> {
        self.run_detection(Command::Segment(options.params(image_path)), "Segmentation")
            .await
    }

    /// Image classification, `top_k` entries sorted by rank
    pub async fn classify(&mut self, image_path: &str, top_k: u32) -> Result<ClassificationResult, InferenceError> {
        let command = Command::Classify {
            image_path: image_path.to_string(),
            top_k,
        };
        let started = Instant::now();
        let envelope = match self.request(&command, true).await {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.report("Classification", e)),
        };

        let classifications = decode_classifications(envelope.payload());
        let result = ClassificationResult {
            top_prediction: classifications.first().cloned(),
            classifications,
            message: envelope.message,
            inference_time: started.elapsed(),
        };
        let summary = result.top_prediction.as_ref().map_or_else(
            || "no prediction".to_string(),
            |top| format!("{} ({:.0}%)", top.label, top.confidence * 100.0),
        );
        self.events.log(format!(
            "Classification complete: {summary}, {}ms",
            result.inference_time.as_millis()
        ));
        self.events.emit(ServiceEvent::ClassificationCompleted {
            top_label: result.top_prediction.as_ref().map(|t| t.label.clone()),
        });
        Ok(result)
    }

    /// Pose estimation
    pub async fn keypoint(&mut self, image_path: &str, options: &DetectOptions) -> Result<KeypointResult, InferenceError> {
        let command = Command::Keypoint(options.params(image_path));
        let started = Instant::now();
        let envelope = match self.request(&command, true).await {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.report("Keypoint detection", e)),
        };

        let result = KeypointResult {
            detections: decode_keypoints(envelope.payload()),
            message: envelope.message,
            inference_time: started.elapsed(),
        };
        self.events.log(format!(
            "Keypoint detection complete: {} instances, {}ms",
            result.detections.len(),
            result.inference_time.as_millis()
        ));
        self.events.emit(ServiceEvent::KeypointCompleted {
            count: result.detections.len(),
        });
        Ok(result)
    }

    async fn run_detection(&mut self, command: Command, what: &str) -> Result<DetectionResult, InferenceError> {
        let started = Instant::now();
        let envelope = match self.request(&command, true).await {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.report(what, e)),
        };

        let result = DetectionResult {
            detections: decode_detections(envelope.payload()),
            message: envelope.message,
            inference_time: started.elapsed(),
        };
        self.events.log(format!(
            "{what} complete: {} objects, {}ms",
            result.detections.len(),
            result.inference_time.as_millis()
        ));
        self.events.emit(ServiceEvent::DetectionCompleted {
            count: result.detections.len(),
        });
        Ok(result)
    }

    /// One exchange with the worker under the state rules: rejects calls
    /// when stopped or (for inference) without a model, holds `Busy` for
    /// the duration, and tears down on a lost worker.
    async fn request(&mut self, command: &Command, needs_model: bool) -> Result<ResponseEnvelope, InferenceError> {
        if self.state == ServiceState::Stopped {
            return Err(InferenceError::ServiceNotRunning);
        }
        if !self.is_running() {
            return Err(InferenceError::ServiceNotRunning);
        }
        if needs_model && !self.model_loaded {
            return Err(InferenceError::ModelNotLoaded);
        }

        self.state = ServiceState::Busy;
        let outcome = self.backend.send(command).await;
        self.state = ServiceState::Ready;

        match outcome {
            Ok(envelope) if envelope.success => Ok(envelope),
            Ok(envelope) => Err(InferenceError::WorkerReportedFailure(
                envelope.failure_message(),
            )),
            Err(e) => {
                if e.requires_restart() {
                    warn!(command = command.name(), error = %e, "Worker unusable mid-request");
                    self.worker_lost().await;
                }
                Err(e.into())
            }
        }
    }

    /// The worker's state is unknown: reap it and drop back to `Stopped`
    async fn worker_lost(&mut self) {
        self.state = ServiceState::Stopping;
        self.backend.stop().await;
        self.enter_stopped();
    }

    fn enter_stopped(&mut self) {
        self.state = ServiceState::Stopped;
        self.model_loaded = false;
        self.model_path = None;
        self.events.emit(ServiceEvent::StateChanged { running: false });
    }

    /// Log one failure line and hand the error back
    fn report(&self, what: &str, error: InferenceError) -> InferenceError {
        warn!(operation = what, error = %error, "Operation failed");
        self.events.log(format!("{what} failed: {error}"));
        debug!(state = %self.state, model_loaded = self.model_loaded, "State after failure");
        error
    }
}
