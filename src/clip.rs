// src/clip.rs
//
// Finalized incident clip and its identifier.
//
// Clip id layout: `{camera}_{YYYYMMDDTHHMMSS.mmmZ}_{incident-slug}`
// The timestamp and slug never contain `_`, so the id splits from the right
// even when the camera id itself contains underscores.

use crate::analysis::incident_detector::ConfirmedIncident;
use crate::frame_buffer::CapturedFrame;
use crate::incident_recorder::{EndReason, LayerCounters};
use crate::types::{FrameRange, IncidentType};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClipId {
    pub camera_id: String,
    pub event_time: DateTime<Utc>,
    pub incident_type: IncidentType,
}

#[derive(Debug, Error)]
pub enum ClipIdError {
    #[error("clip id '{0}' does not have camera, time and type parts")]
    Malformed(String),
    #[error("clip id timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("unknown incident type '{0}' in clip id")]
    UnknownType(String),
}

impl ClipId {
    pub fn new(camera_id: &str, event_time: DateTime<Utc>, incident_type: IncidentType) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            event_time,
            incident_type,
        }
    }

    pub fn parse(id: &str) -> Result<Self, ClipIdError> {
        let mut parts = id.rsplitn(3, '_');
        let (Some(slug), Some(time), Some(camera)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ClipIdError::Malformed(id.to_string()));
        };
        if camera.is_empty() {
            return Err(ClipIdError::Malformed(id.to_string()));
        }
        let incident_type =
            IncidentType::from_slug(slug).ok_or_else(|| ClipIdError::UnknownType(slug.to_string()))?;
        let event_time = NaiveDateTime::parse_from_str(time, TIME_FORMAT)?.and_utc();
        Ok(Self {
            camera_id: camera.to_string(),
            event_time,
            incident_type,
        })
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.camera_id,
            self.event_time.format(TIME_FORMAT),
            self.incident_type.slug()
        )
    }
}

/// A closed recording, ready for the writer and the classification/API side.
#[derive(Debug, Clone)]
pub struct FinalizedClip {
    pub clip_id: ClipId,
    pub incident: ConfirmedIncident,
    pub frames: Vec<Arc<CapturedFrame>>,
    pub frame_range: FrameRange,
    pub end_reason: EndReason,
    pub counters: LayerCounters,
    /// Further confirmations of the same event absorbed while recording
    pub reconfirmations: u32,
}

impl FinalizedClip {
    pub fn camera_id(&self) -> &str {
        &self.clip_id.camera_id
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.clip_id.event_time
    }

    pub fn metadata(&self) -> ClipMetadata {
        let incident = &self.incident;
        ClipMetadata {
            clip_id: self.clip_id.to_string(),
            camera_id: self.clip_id.camera_id.clone(),
            event_time: self.clip_id.event_time,
            incident_type: incident.incident_type(),
            description: incident.incident_type().label(),
            severity: incident.severity().as_str(),
            confidence: incident.confidence(),
            vehicles_involved: incident.vehicles_involved(),
            track_ids: incident.track_ids().to_vec(),
            location: [incident.location().x, incident.location().y],
            trigger_frame: incident.frame_index(),
            first_frame: self.frame_range.first,
            last_frame: self.frame_range.last,
            frame_count: self.frames.len(),
            end_reason: self.end_reason,
            layer_counters: self.counters,
            reconfirmations: self.reconfirmations,
        }
    }
}

/// `metadata.json` written next to the clip frames.
#[derive(Debug, Clone, Serialize)]
pub struct ClipMetadata {
    pub clip_id: String,
    pub camera_id: String,
    pub event_time: DateTime<Utc>,
    pub incident_type: IncidentType,
    pub description: &'static str,
    pub severity: &'static str,
    pub confidence: f32,
    pub vehicles_involved: usize,
    pub track_ids: Vec<u64>,
    pub location: [f32; 2],
    pub trigger_frame: u64,
    pub first_frame: u64,
    pub last_frame: u64,
    pub frame_count: usize,
    pub end_reason: EndReason,
    pub layer_counters: LayerCounters,
    pub reconfirmations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollisionKind;
    use chrono::TimeZone;

    #[test]
    fn test_clip_id_format_and_parse() {
        let time = Utc.with_ymd_and_hms(2026, 3, 14, 8, 5, 9).unwrap()
            + chrono::Duration::milliseconds(250);
        let id = ClipId::new(
            "north_gate_2",
            time,
            IncidentType::Collision(CollisionKind::RearEnd),
        );
        let text = id.to_string();
        assert_eq!(text, "north_gate_2_20260314T080509.250Z_collision-rear-end");

        let parsed = ClipId::parse(&text).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_clip_id_rejects_garbage() {
        assert!(matches!(ClipId::parse("nounderscores"), Err(ClipIdError::Malformed(_))));
        assert!(matches!(
            ClipId::parse("cam_20260314T080509.250Z_meteor-strike"),
            Err(ClipIdError::UnknownType(_))
        ));
        assert!(matches!(
            ClipId::parse("cam_yesterday_near-miss"),
            Err(ClipIdError::Timestamp(_))
        ));
    }
}
