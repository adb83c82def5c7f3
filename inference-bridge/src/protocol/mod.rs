//! Wire protocol spoken with the inference worker
//!
//! One JSON object per line in each direction, no length prefix:
//! - Request: a [`Command`], tagged by its `command` field
//! - Response: a [`ResponseEnvelope`] `{success, message, data}`
//!
//! The very first line a worker prints after launch is itself an envelope
//! and must carry `success: true` (the startup handshake).

mod results;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use results::{
    decode_classifications, decode_detections, decode_keypoints, decode_model_info,
    BoundingBox, ClassificationEntry, ClassificationResult, Detection, DetectionResult, Keypoint,
    KeypointDetection, KeypointResult, MaskPoint, ModelInfo, COCO_KEYPOINT_NAMES,
};

/// Default confidence threshold used by the worker
pub const DEFAULT_CONF_THRESHOLD: f32 = 0.25;

/// Default IoU threshold for non-maximum suppression
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Default square input size in pixels
pub const DEFAULT_IMAGE_SIZE: u32 = 640;

/// Default number of classification entries requested
pub const DEFAULT_TOP_K: u32 = 5;

/// Parameters shared by detect, segment and keypoint requests
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub image_path: String,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub image_size: u32,
}

impl InferenceParams {
    /// Parameters for `image_path` with the worker's default thresholds
    pub fn new(image_path: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }
}

/// Outgoing request to the worker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    LoadModel {
        model_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        labels_path: Option<String>,
    },
    Detect(InferenceParams),
    Segment(InferenceParams),
    Classify {
        image_path: String,
        top_k: u32,
    },
    Keypoint(InferenceParams),
    Exit,
}

impl Command {
    /// The value of the `command` tag on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadModel { .. } => "load_model",
            Self::Detect(_) => "detect",
            Self::Segment(_) => "segment",
            Self::Classify { .. } => "classify",
            Self::Keypoint(_) => "keypoint",
            Self::Exit => "exit",
        }
    }

    /// Decode a command from its JSON object form
    pub fn decode(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Encode a command as a JSON object
pub fn encode(command: &Command) -> Result<Value, serde_json::Error> {
    serde_json::to_value(command)
}

/// Encode a command as a single newline-terminated line
pub fn encode_line(command: &Command) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    Ok(line)
}

/// Response wrapper common to every worker reply
///
/// `success` is mandatory: a JSON object without it is a protocol error,
/// not a failure report. `data` is only meaningful when `success` is true.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub success: bool,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseEnvelope {
    /// Parse one response line (trailing newline and surrounding whitespace allowed).
    ///
    /// Only a JSON object is an envelope; serde's sequence form of the
    /// struct (e.g. `[true]`) is rejected.
    pub fn decode_line(line: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<Value>(line.trim())? {
            value @ Value::Object(_) => serde_json::from_value(value),
            other => Err(serde::de::Error::custom(format!(
                "response is not a JSON object: {other}"
            ))),
        }
    }

    /// The payload, only when the worker reported success
    pub fn payload(&self) -> Option<&Value> {
        if self.success {
            self.data.as_ref()
        } else {
            None
        }
    }

    /// The failure message, never empty
    pub fn failure_message(&self) -> String {
        if self.message.trim().is_empty() {
            "worker reported failure without a message".to_string()
        } else {
            self.message.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_command_wire_shape() {
        let cmd = Command::Detect(InferenceParams::new("/tmp/cat.jpg"));
        let line = encode_line(&cmd).unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["command"], "detect");
        assert_eq!(value["image_path"], "/tmp/cat.jpg");
        assert_eq!(value["image_size"], 640);
    }

    #[test]
    fn test_detect_command_round_trip_keeps_thresholds() {
        let cmd = Command::Detect(InferenceParams {
            image_path: "a.png".to_string(),
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            image_size: 640,
        });

        let line = encode_line(&cmd).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        let decoded = Command::decode(value).unwrap();

        let Command::Detect(params) = decoded else {
            panic!("expected detect command");
        };
        assert_eq!(params.conf_threshold, 0.25);
        assert_eq!(params.iou_threshold, 0.45);
        assert_eq!(params.image_size, 640);
        assert_eq!(params.image_path, "a.png");
    }

    #[test]
    fn test_load_model_omits_missing_labels() {
        let cmd = Command::LoadModel {
            model_path: "yolo.pt".to_string(),
            labels_path: None,
        };
        let value = encode(&cmd).unwrap();
        assert_eq!(value, json!({"command": "load_model", "model_path": "yolo.pt"}));

        let cmd = Command::LoadModel {
            model_path: "yolo.pt".to_string(),
            labels_path: Some("labels.txt".to_string()),
        };
        assert_eq!(encode(&cmd).unwrap()["labels_path"], "labels.txt");
    }

    #[test]
    fn test_exit_and_classify_encoding() {
        assert_eq!(encode(&Command::Exit).unwrap(), json!({"command": "exit"}));

        let cmd = Command::Classify {
            image_path: "dog.jpg".to_string(),
            top_k: 5,
        };
        assert_eq!(
            encode(&cmd).unwrap(),
            json!({"command": "classify", "image_path": "dog.jpg", "top_k": 5})
        );
        assert_eq!(cmd.name(), "classify");
    }

    #[test]
    fn test_envelope_requires_success_field() {
        assert!(ResponseEnvelope::decode_line(r#"{"message":"hi","data":{}}"#).is_err());
        assert!(ResponseEnvelope::decode_line("not json at all").is_err());
        assert!(ResponseEnvelope::decode_line("[true]").is_err());
        assert!(ResponseEnvelope::decode_line(r#"[true, "ok", null]"#).is_err());
        assert!(ResponseEnvelope::decode_line("true").is_err());
    }

    #[test]
    fn test_envelope_failure_ignores_data() {
        let env = ResponseEnvelope::decode_line(
            r#"{"success":false,"message":"model not loaded","data":{"detections":[]}}"#,
        )
        .unwrap();
        assert!(!env.success);
        assert!(env.payload().is_none());
        assert_eq!(env.failure_message(), "model not loaded");

        let env = ResponseEnvelope::decode_line(r#"{"success":false}"#).unwrap();
        assert!(!env.failure_message().is_empty());
    }

    #[test]
    fn test_envelope_success_without_message() {
        let env = ResponseEnvelope::decode_line("{\"success\":true}\n").unwrap();
        assert!(env.success);
        assert_eq!(env.message, "");
        assert!(env.payload().is_none());
    }
}
