// src/types.rs

use crate::analysis::incident_detector::IncidentConfig;
use crate::analysis::object_tracker::TrackerConfig;
use crate::incident_recorder::RecorderConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::path::PathBuf;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub incident: IncidentConfig,
    pub recorder: RecorderConfig,
    pub source_retry: SourceRetryConfig,
    pub reporting: ReportingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub frame_width: usize,
    pub frame_height: usize,
    pub fps: f64,
    pub source: SourceConfig,
    /// Roadway polygon in pixel coordinates, used by the pedestrian-on-road rule
    pub roadway: Option<Vec<[f32; 2]>>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: "camera-0".to_string(),
            longitude: 0.0,
            latitude: 0.0,
            frame_width: 1280,
            frame_height: 720,
            fps: 30.0,
            source: SourceConfig::default(),
            roadway: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Recorded detection log (JSON lines) or a directory of them
    Replay { path: PathBuf },
    /// Video file, HLS playlist or RTSP URI (requires the `video` feature)
    Video { uri: String },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Replay {
            path: PathBuf::from("sessions"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: DetectorBackend,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorBackend {
    /// Detections embedded in a replayed session log
    #[default]
    Recorded,
    /// ONNX YOLOv8 model (requires the `yolo` feature)
    Yolo { model_path: String, confidence: f32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceRetryConfig {
    /// Consecutive failed reads before the source is released and reopened
    pub max_consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for SourceRetryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 30,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub clip_dir: String,
    pub api_url: Option<String>,
    pub reporter: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// JSON-lines dump of per-pair feature vectors for offline training
    pub features_path: Option<String>,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            clip_dir: "incidents".to_string(),
            api_url: None,
            reporter: "traffic-incident-detector".to_string(),
            request_timeout_secs: 10,
            max_retries: 3,
            retry_backoff_ms: 500,
            features_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "traffic_incident=info".to_string(),
        }
    }
}

// ============================================================================
// FRAMES
// ============================================================================

#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp_ms: f64,
    pub width: usize,
    pub height: usize,
    /// RGB8, row-major. Empty for replayed sessions that carry no imagery.
    pub data: Vec<u8>,
}

impl Frame {
    pub fn blank(index: u64, timestamp_ms: f64, width: usize, height: usize) -> Self {
        Self {
            index,
            timestamp_ms,
            width,
            height,
            data: Vec::new(),
        }
    }

    pub fn has_pixels(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() >= self.width * self.height * 3
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Pixel-space 2D vector, used for both positions and velocities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn dot(self, other: Vec2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    pub fn norm(self) -> f32 {
        self.dot(self).sqrt()
    }

    pub fn distance(self, other: Vec2) -> f32 {
        (self - other).norm()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Unsigned angle between two vectors in radians, `None` if either is ~zero.
    pub fn angle_to(self, other: Vec2) -> Option<f32> {
        let denom = self.norm() * other.norm();
        if denom < 1e-6 {
            return None;
        }
        Some((self.dot(other) / denom).clamp(-1.0, 1.0).acos())
    }
}

impl Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;
    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// Axis-aligned box, top-left origin. Serialized as `[x, y, width, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Box of the given size centered on `center`.
    pub fn centered(center: Vec2, width: f32, height: f32) -> Self {
        Self::new(center.x - width * 0.5, center.y - height * 0.5, width, height)
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Zero-area or non-finite boxes carry no usable position.
    pub fn is_degenerate(&self) -> bool {
        let finite = self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite();
        !finite || self.width <= 0.0 || self.height <= 0.0
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Euclidean distance between the two boxes' edges; 0 when they touch or overlap.
    pub fn edge_gap(&self, other: &BoundingBox) -> f32 {
        let dx = (other.x - self.right()).max(self.x - other.right()).max(0.0);
        let dy = (other.y - self.bottom()).max(self.y - other.bottom()).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}

// ============================================================================
// DETECTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Person,
    Car,
    Truck,
    Bus,
    Motorcycle,
    Bicycle,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Car => "car",
            Self::Truck => "truck",
            Self::Bus => "bus",
            Self::Motorcycle => "motorcycle",
            Self::Bicycle => "bicycle",
        }
    }

    pub fn is_vehicle(&self) -> bool {
        !matches!(self, Self::Person)
    }

    /// COCO class ids as emitted by YOLO models
    pub fn from_coco_id(class_id: usize) -> Option<Self> {
        match class_id {
            0 => Some(Self::Person),
            1 => Some(Self::Bicycle),
            2 => Some(Self::Car),
            3 => Some(Self::Motorcycle),
            5 => Some(Self::Bus),
            7 => Some(Self::Truck),
            _ => None,
        }
    }
}

/// One object observed in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: ObjectClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class: ObjectClass, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class,
            confidence,
            bbox,
        }
    }

    pub fn center(&self) -> Vec2 {
        self.bbox.center()
    }
}

// ============================================================================
// INCIDENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// One band up, capped at HIGH
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollisionKind {
    HeadOn,
    RearEnd,
    SideImpact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum IncidentType {
    Collision(CollisionKind),
    NearMiss,
    StoppedVehicle,
    PedestrianOnRoad,
    SpeedAnomaly,
}

impl IncidentType {
    /// Stable identifier used in clip ids and metadata. Never contains `_`.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Collision(CollisionKind::HeadOn) => "collision-head-on",
            Self::Collision(CollisionKind::RearEnd) => "collision-rear-end",
            Self::Collision(CollisionKind::SideImpact) => "collision-side-impact",
            Self::NearMiss => "near-miss",
            Self::StoppedVehicle => "stopped-vehicle",
            Self::PedestrianOnRoad => "pedestrian-on-road",
            Self::SpeedAnomaly => "speed-anomaly",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Some(match slug {
            "collision-head-on" => Self::Collision(CollisionKind::HeadOn),
            "collision-rear-end" => Self::Collision(CollisionKind::RearEnd),
            "collision-side-impact" => Self::Collision(CollisionKind::SideImpact),
            "near-miss" => Self::NearMiss,
            "stopped-vehicle" => Self::StoppedVehicle,
            "pedestrian-on-road" => Self::PedestrianOnRoad,
            "speed-anomaly" => Self::SpeedAnomaly,
            _ => return None,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Collision(CollisionKind::HeadOn) => "Head-on collision",
            Self::Collision(CollisionKind::RearEnd) => "Rear-end collision",
            Self::Collision(CollisionKind::SideImpact) => "Side-impact collision",
            Self::NearMiss => "Near miss",
            Self::StoppedVehicle => "Stopped vehicle",
            Self::PedestrianOnRoad => "Pedestrian on roadway",
            Self::SpeedAnomaly => "Speed anomaly",
        }
    }

    pub fn is_collision(&self) -> bool {
        matches!(self, Self::Collision(_))
    }
}

impl From<IncidentType> for String {
    fn from(t: IncidentType) -> Self {
        t.slug().to_string()
    }
}

impl TryFrom<String> for IncidentType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        IncidentType::from_slug(&value).ok_or_else(|| format!("unknown incident type '{}'", value))
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Inclusive range of frame indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub first: u64,
    pub last: u64,
}

impl FrameRange {
    pub fn len(&self) -> u64 {
        self.last.saturating_sub(self.first) + 1
    }

    pub fn contains(&self, frame_index: u64) -> bool {
        frame_index >= self.first && frame_index <= self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(50.0, 50.0, 100.0, 100.0);
        assert!((a.iou(&b) - 2500.0 / 17500.0).abs() < 0.01);
    }

    #[test]
    fn test_edge_gap() {
        let a = BoundingBox::new(0.0, 0.0, 50.0, 30.0);
        let right = BoundingBox::new(60.0, 0.0, 50.0, 30.0);
        let overlapping = BoundingBox::new(40.0, 10.0, 50.0, 30.0);
        let diagonal = BoundingBox::new(53.0, 34.0, 10.0, 10.0);

        assert!((a.edge_gap(&right) - 10.0).abs() < 1e-4);
        assert_eq!(a.edge_gap(&overlapping), 0.0);
        assert!((a.edge_gap(&diagonal) - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_degenerate_boxes() {
        assert!(BoundingBox::new(10.0, 10.0, 0.0, 30.0).is_degenerate());
        assert!(BoundingBox::new(10.0, 10.0, 20.0, -1.0).is_degenerate());
        assert!(BoundingBox::new(f32::NAN, 10.0, 20.0, 20.0).is_degenerate());
        assert!(!BoundingBox::new(10.0, 10.0, 20.0, 20.0).is_degenerate());
    }

    #[test]
    fn test_detection_json_shape() {
        let json = r#"{"class":"truck","confidence":0.7,"bbox":[10,20,50,30]}"#;
        let det: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(det.class, ObjectClass::Truck);
        assert_eq!(det.center(), Vec2::new(35.0, 35.0));
    }

    #[test]
    fn test_severity_ordering_and_escalation() {
        assert!(Severity::Low < Severity::Medium && Severity::Medium < Severity::High);
        assert_eq!(Severity::Low.escalate(), Severity::Medium);
        assert_eq!(Severity::High.escalate(), Severity::High);
    }

    #[test]
    fn test_incident_type_slugs_have_no_underscore() {
        let all = [
            IncidentType::Collision(CollisionKind::HeadOn),
            IncidentType::Collision(CollisionKind::RearEnd),
            IncidentType::Collision(CollisionKind::SideImpact),
            IncidentType::NearMiss,
            IncidentType::StoppedVehicle,
            IncidentType::PedestrianOnRoad,
            IncidentType::SpeedAnomaly,
        ];
        for t in all {
            assert!(!t.slug().contains('_'), "{} must be clip-id safe", t.slug());
            assert_eq!(IncidentType::from_slug(t.slug()), Some(t));
        }
    }
}
