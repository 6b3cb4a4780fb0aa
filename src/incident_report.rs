// src/incident_report.rs
//
// Incident record in the shape the incident API accepts.

use crate::clip::FinalizedClip;
use crate::types::CameraConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    #[default]
    Ongoing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// ISO 8601, UTC
    pub datetime: String,
    pub longitude: f64,
    pub latitude: f64,
    /// low | medium | high
    pub severity: String,
    #[serde(default)]
    pub status: IncidentStatus,
    pub reporter: String,
    pub camera_id: String,
    pub description: String,
    /// Clip identifier, lets the API side fetch frames from the clip store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_id: Option<String>,
}

impl IncidentRecord {
    pub fn from_clip(clip: &FinalizedClip, camera: &CameraConfig, reporter: &str) -> Self {
        let incident = &clip.incident;
        Self {
            datetime: clip
                .event_time()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            longitude: camera.longitude,
            latitude: camera.latitude,
            severity: incident.severity().as_str().to_string(),
            status: IncidentStatus::Ongoing,
            reporter: reporter.to_string(),
            camera_id: camera.id.clone(),
            description: format!(
                "{} detected by camera {} ({} object(s) involved, confidence {:.0}%)",
                incident.incident_type().label(),
                camera.id,
                incident.vehicles_involved(),
                incident.confidence() * 100.0
            ),
            clip_id: Some(clip.clip_id.to_string()),
        }
    }
}
