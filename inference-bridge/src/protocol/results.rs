//! Typed inference results and their decoders
//!
//! Decoding is permissive: numbers are coerced between integer and float
//! forms, and a record missing one of its required fields (`x`, `y`,
//! `width`, `height`, `class_id`) is skipped without discarding its
//! siblings. Optional numeric fields default to `0.0`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Point names of the 17-point body model, indexed by keypoint id
pub const COCO_KEYPOINT_NAMES: [&str; 17] = [
    "nose",
    "left_eye",
    "right_eye",
    "left_ear",
    "right_ear",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
];

/// Axis-aligned box in pixels, top-left origin
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Vertex of a segmentation mask outline
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct MaskPoint {
    pub x: f32,
    pub y: f32,
}

/// One detected object (detect and segment)
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Detection {
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: i32,
    pub label: String,
    /// Empty unless the request was a segmentation
    pub mask_polygon: Vec<MaskPoint>,
}

/// One ranked classification entry
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClassificationEntry {
    /// 1-based
    pub rank: u32,
    pub class_id: i32,
    pub label: String,
    pub confidence: f32,
}

/// One skeleton point
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    /// Body-model name of this point, if the id is within the 17-point model
    pub fn name(&self) -> Option<&'static str> {
        COCO_KEYPOINT_NAMES.get(self.id as usize).copied()
    }
}

/// A detected instance with its skeleton
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct KeypointDetection {
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: i32,
    pub label: String,
    /// Ordered by keypoint id
    pub keypoints: Vec<Keypoint>,
}

/// Result of a detect or segment call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub message: String,
    pub inference_time: Duration,
}

/// Result of a classify call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassificationResult {
    /// Sorted by rank
    pub classifications: Vec<ClassificationEntry>,
    /// The entry with the lowest rank
    pub top_prediction: Option<ClassificationEntry>,
    pub message: String,
    pub inference_time: Duration,
}

/// Result of a keypoint call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeypointResult {
    pub detections: Vec<KeypointDetection>,
    pub message: String,
    pub inference_time: Duration,
}

/// What the worker reports after loading a model
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelInfo {
    pub num_classes: usize,
    /// The worker only reports a prefix of the class list
    pub class_names: Vec<String>,
    pub message: String,
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn int_field(obj: &Map<String, Value>, key: &str) -> Option<i32> {
    obj.get(key)
        .and_then(as_i64)
        .and_then(|v| i32::try_from(v).ok())
}

fn float_field(obj: &Map<String, Value>, key: &str) -> f32 {
    obj.get(key).and_then(as_f64).unwrap_or(0.0) as f32
}

fn label_field(obj: &Map<String, Value>) -> String {
    obj.get("label")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn records<'a>(data: Option<&'a Value>, key: &str) -> impl Iterator<Item = &'a Map<String, Value>> {
    data.and_then(|d| d.get(key))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

struct Header {
    bbox: BoundingBox,
    confidence: f32,
    class_id: i32,
    label: String,
}

fn decode_header(obj: &Map<String, Value>) -> Option<Header> {
    let bbox = BoundingBox {
        x: int_field(obj, "x")?,
        y: int_field(obj, "y")?,
        width: int_field(obj, "width")?,
        height: int_field(obj, "height")?,
    };
    Some(Header {
        bbox,
        confidence: float_field(obj, "confidence"),
        class_id: int_field(obj, "class_id")?,
        label: label_field(obj),
    })
}

/// Decode `data.detections` of a detect or segment response
pub fn decode_detections(data: Option<&Value>) -> Vec<Detection> {
    let mut detections = Vec::new();
    for obj in records(data, "detections") {
        let Some(header) = decode_header(obj) else {
            debug!(record = ?obj, "Skipping detection with missing required fields");
            continue;
        };
        let mask_polygon = obj
            .get("mask_polygon")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
            .map(|pt| MaskPoint {
                x: float_field(pt, "x"),
                y: float_field(pt, "y"),
            })
            .collect();
        detections.push(Detection {
            bbox: header.bbox,
            confidence: header.confidence,
            class_id: header.class_id,
            label: header.label,
            mask_polygon,
        });
    }
    detections
}

/// Decode `data.classifications` of a classify response, sorted by rank
pub fn decode_classifications(data: Option<&Value>) -> Vec<ClassificationEntry> {
    let mut entries = Vec::new();
    for (position, obj) in records(data, "classifications").enumerate() {
        let Some(class_id) = int_field(obj, "class_id") else {
            debug!(record = ?obj, "Skipping classification without class_id");
            continue;
        };
        let rank = int_field(obj, "rank")
            .and_then(|r| u32::try_from(r).ok())
            .unwrap_or(position as u32 + 1);
        entries.push(ClassificationEntry {
            rank,
            class_id,
            label: label_field(obj),
            confidence: float_field(obj, "confidence"),
        });
    }
    entries.sort_by_key(|e| e.rank);
    entries
}

/// Decode `data.detections` of a keypoint response
pub fn decode_keypoints(data: Option<&Value>) -> Vec<KeypointDetection> {
    let mut detections = Vec::new();
    for obj in records(data, "detections") {
        let Some(header) = decode_header(obj) else {
            debug!(record = ?obj, "Skipping keypoint detection with missing required fields");
            continue;
        };
        let mut keypoints: Vec<Keypoint> = obj
            .get("keypoints")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
            .enumerate()
            .map(|(position, kp)| Keypoint {
                id: int_field(kp, "id")
                    .and_then(|id| u32::try_from(id).ok())
                    .unwrap_or(position as u32),
                x: float_field(kp, "x"),
                y: float_field(kp, "y"),
                confidence: float_field(kp, "confidence"),
            })
            .collect();
        keypoints.sort_by_key(|kp| kp.id);
        detections.push(KeypointDetection {
            bbox: header.bbox,
            confidence: header.confidence,
            class_id: header.class_id,
            label: header.label,
            keypoints,
        });
    }
    detections
}

/// Decode the payload of a successful `load_model` response
pub fn decode_model_info(data: Option<&Value>, message: &str) -> ModelInfo {
    let class_names: Vec<String> = data
        .and_then(|d| d.get("class_names"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    let num_classes = data
        .and_then(|d| d.get("num_classes"))
        .and_then(as_i64)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(class_names.len());
    ModelInfo {
        num_classes,
        class_names,
        message: message.to_string(),
    }
}
