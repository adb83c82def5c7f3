//! Startup check for the inference bridge
//!
//! Lists every interpreter found on this host and, when a model is given,
//! starts the worker, loads the model and runs one inference.
//!
//! Configuration comes from the environment:
//! - `INFERENCE_PYTHON`: interpreter to launch (otherwise the stored selection or auto)
//! - `INFERENCE_WORKER_SCRIPT`: worker script location
//! - `INFERENCE_MODEL` / `INFERENCE_LABELS`: model weights and optional label file
//! - `INFERENCE_IMAGE`: image to run on
//! - `INFERENCE_TASK`: `detect` (default), `segment`, `classify` or `keypoint`

use anyhow::{bail, Context, Result};
use inference_bridge::protocol::DEFAULT_TOP_K;
use inference_bridge::{
    scan_environments, DetectOptions, InferenceService, ServiceConfig, ServiceEvent, SettingsStore,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Detect,
    Segment,
    Classify,
    Keypoint,
}

impl std::str::FromStr for Task {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detect" => Ok(Self::Detect),
            "segment" => Ok(Self::Segment),
            "classify" => Ok(Self::Classify),
            "keypoint" | "pose" => Ok(Self::Keypoint),
            other => bail!("unknown INFERENCE_TASK `{other}`"),
        }
    }
}

/// Settings read from environment variables
#[derive(Debug, Clone)]
struct CheckConfig {
    interpreter: Option<String>,
    model: Option<String>,
    labels: Option<String>,
    image: Option<String>,
    task: Task,
}

impl CheckConfig {
    fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let task = match var("INFERENCE_TASK") {
            Some(t) => t.parse()?,
            None => Task::Detect,
        };
        Ok(Self {
            interpreter: var("INFERENCE_PYTHON"),
            model: var("INFERENCE_MODEL"),
            labels: var("INFERENCE_LABELS"),
            image: var("INFERENCE_IMAGE"),
            task,
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("startup_check=info,inference_bridge=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = CheckConfig::from_env()?;

    let environments = scan_environments().await;
    if environments.is_empty() {
        warn!("No interpreters found");
    }
    println!("{}", serde_json::to_string_pretty(&environments)?);

    let Some(model) = config.model.as_deref() else {
        info!("INFERENCE_MODEL not set, skipping worker check");
        return Ok(());
    };

    let settings = match SettingsStore::default_location() {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "Settings unavailable, using defaults");
            None
        }
    };
    let mut service = InferenceService::new(ServiceConfig {
        settings,
        ..ServiceConfig::default()
    });

    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ServiceEvent::Log(line) = event {
                info!(target: "startup_check::events", "{}", line);
            }
        }
    });

    service
        .start(config.interpreter.as_deref(), None)
        .await
        .context("worker did not start")?;

    let outcome = run_check(&mut service, &config, model).await;
    service.stop().await;
    outcome
}

async fn run_check(service: &mut InferenceService, config: &CheckConfig, model: &str) -> Result<()> {
    let info = service
        .load_model(model, config.labels.as_deref())
        .await
        .with_context(|| format!("could not load {model}"))?;
    println!("model: {model} ({} classes)", info.num_classes);

    let Some(image) = config.image.as_deref() else {
        return Ok(());
    };
    let options = DetectOptions::default();
    match config.task {
        Task::Detect | Task::Segment => {
            let result = if config.task == Task::Detect {
                service.detect(image, &options).await?
            } else {
                service.segment(image, &options).await?
            };
            for d in &result.detections {
                println!(
                    "{:<16} {:>5.1}%  [{}, {}, {}x{}]  mask points: {}",
                    d.label,
                    d.confidence * 100.0,
                    d.bbox.x,
                    d.bbox.y,
                    d.bbox.width,
                    d.bbox.height,
                    d.mask_polygon.len()
                );
            }
            println!("{} objects in {:?}", result.detections.len(), result.inference_time);
        }
        Task::Classify => {
            let result = service.classify(image, DEFAULT_TOP_K).await?;
            for c in &result.classifications {
                println!("#{} {:<16} {:>5.1}%", c.rank, c.label, c.confidence * 100.0);
            }
            println!("classified in {:?}", result.inference_time);
        }
        Task::Keypoint => {
            let result = service.keypoint(image, &options).await?;
            for person in &result.detections {
                let visible = person.keypoints.iter().filter(|k| k.confidence > 0.5).count();
                println!(
                    "{:<16} {:>5.1}%  keypoints visible: {visible}/{}",
                    person.label,
                    person.confidence * 100.0,
                    person.keypoints.len()
                );
            }
            println!("{} people in {:?}", result.detections.len(), result.inference_time);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_parsing() {
        assert_eq!("detect".parse::<Task>().unwrap(), Task::Detect);
        assert_eq!(" Classify ".parse::<Task>().unwrap(), Task::Classify);
        assert_eq!("pose".parse::<Task>().unwrap(), Task::Keypoint);
        assert!("track".parse::<Task>().is_err());
    }
}
