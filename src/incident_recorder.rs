// src/incident_recorder.rs
//
// Incident lifecycle per spatial region:
//
//   IDLE ──confirmed──▶ TRIGGERED ──next frame──▶ RECORDING ──end──▶ COOLDOWN ──expiry──▶ IDLE
//
// - TRIGGERED seeds the clip from the lookback ring (pre-trigger frames).
// - RECORDING appends every frame until max duration, frame or byte cap, or
//   no layer activity on the involved tracks for the quiescence grace period.
// - COOLDOWN suppresses re-triggers near the same location (or sharing a
//   track) so one physical event yields one clip. Keyed per region: an
//   unrelated incident elsewhere in frame starts its own recording. While
//   the same tracks keep confirming, the cooldown keeps being pushed out, so
//   a long-lived event (a stalled car) never re-arms its region.
//
// Frames are held JPEG-encoded (see frame_buffer.rs).
//
// Re-confirmations of an event that is still RECORDING extend it instead of
// opening a second clip.
//
// All timing uses stream timestamps, never wall-clock, so replayed sessions
// behave exactly like live ones.

use crate::analysis::incident_detector::{Assessment, ConfirmedIncident};
use crate::analysis::layers::LayerKind;
use crate::clip::{ClipId, FinalizedClip};
use crate::frame_buffer::{CapturedFrame, FrameEncoder, LookbackBuffer};
use crate::types::{Frame, FrameRange, Vec2};
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Frames before the trigger copied into each clip
    pub pre_trigger_frames: usize,
    pub max_duration_s: f64,
    /// Seconds without layer activity on the involved tracks that end a clip
    pub quiescence_grace_s: f64,
    pub cooldown_s: f64,
    /// Dedup radius around an incident, as a fraction of frame width
    pub cooldown_radius_ratio: f32,
    /// Hard cap on frames held by one recording
    pub max_frames_per_clip: usize,
    /// Hard cap on encoded bytes held by one recording
    pub max_clip_bytes: usize,
    pub jpeg_quality: u8,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            pre_trigger_frames: 45, // 1.5s at 30fps
            max_duration_s: 12.0,
            quiescence_grace_s: 2.0,
            cooldown_s: 30.0,
            cooldown_radius_ratio: 0.12,
            max_frames_per_clip: 900,
            max_clip_bytes: 64 * 1024 * 1024,
            jpeg_quality: 85,
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_duration_s > 0.0) {
            bail!("recorder.max_duration_s must be positive");
        }
        if !(self.quiescence_grace_s > 0.0) {
            bail!("recorder.quiescence_grace_s must be positive");
        }
        if !(self.cooldown_s >= 0.0) {
            bail!("recorder.cooldown_s must not be negative");
        }
        if !(self.cooldown_radius_ratio > 0.0) {
            bail!("recorder.cooldown_radius_ratio must be positive");
        }
        if self.max_clip_bytes == 0 {
            bail!("recorder.max_clip_bytes must be positive");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("recorder.jpeg_quality must be within 1..=100");
        }
        if self.pre_trigger_frames >= self.max_frames_per_clip {
            bail!(
                "recorder.pre_trigger_frames ({}) must be below max_frames_per_clip ({})",
                self.pre_trigger_frames,
                self.max_frames_per_clip
            );
        }
        Ok(())
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecorderPhase {
    Idle,
    Triggered,
    Recording,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    MaxDuration,
    FrameLimit,
    SizeLimit,
    Quiescent,
    SourceFailed,
    Stopped,
    StreamEnded,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxDuration => "max_duration",
            Self::FrameLimit => "frame_limit",
            Self::SizeLimit => "size_limit",
            Self::Quiescent => "quiescent",
            Self::SourceFailed => "source_failed",
            Self::Stopped => "stopped",
            Self::StreamEnded => "stream_ended",
        }
    }
}

/// Layer activity seen on a recording's tracks. Only ever incremented
/// while the recording is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerCounters {
    pub trajectory: u32,
    pub closing_speed: u32,
    pub depth: u32,
    pub motion_anomaly: u32,
    pub confirmations: u32,
}

impl LayerCounters {
    fn bump(&mut self, kind: LayerKind) {
        match kind {
            LayerKind::Trajectory => self.trajectory += 1,
            LayerKind::ClosingSpeed => self.closing_speed += 1,
            LayerKind::Depth => self.depth += 1,
            LayerKind::MotionAnomaly => self.motion_anomaly += 1,
        }
    }
}

struct ActiveRecording {
    clip_id: ClipId,
    phase: RecorderPhase,
    incident: ConfirmedIncident,
    location: Vec2,
    track_ids: HashSet<u64>,
    started_ms: f64,
    last_activity_ms: f64,
    frames: Vec<Arc<CapturedFrame>>,
    encoded_bytes: usize,
    counters: LayerCounters,
    reconfirmations: u32,
}

impl ActiveRecording {
    fn first_frame(&self) -> u64 {
        self.frames
            .first()
            .map(|f| f.index)
            .unwrap_or(self.incident.frame_index())
    }

    fn last_frame(&self) -> u64 {
        self.frames
            .last()
            .map(|f| f.index)
            .unwrap_or(self.incident.frame_index())
    }
}

struct CooldownEntry {
    clip_id: ClipId,
    location: Vec2,
    track_ids: HashSet<u64>,
    until_ms: f64,
}

/// What one frame did to the recorder.
#[derive(Debug, Default)]
pub struct RecorderUpdate {
    pub started: Vec<ClipId>,
    pub extended: usize,
    pub suppressed: usize,
    pub finalized: Vec<FinalizedClip>,
}

// ============================================================================
// RECORDER
// ============================================================================

pub struct IncidentRecorder {
    camera_id: String,
    config: RecorderConfig,
    stream_start: DateTime<Utc>,
    dedup_radius: f32,
    encoder: FrameEncoder,
    lookback: LookbackBuffer,
    recordings: Vec<ActiveRecording>,
    cooldowns: Vec<CooldownEntry>,
    total_started: u64,
    total_suppressed: u64,
}

impl IncidentRecorder {
    pub fn new(
        camera_id: &str,
        config: RecorderConfig,
        frame_width: f32,
        stream_start: DateTime<Utc>,
    ) -> Self {
        let lookback = LookbackBuffer::with_capacity(config.pre_trigger_frames.max(1) * 2);
        Self {
            camera_id: camera_id.to_string(),
            dedup_radius: config.cooldown_radius_ratio * frame_width,
            encoder: FrameEncoder::new(config.jpeg_quality),
            config,
            stream_start,
            lookback,
            recordings: Vec::new(),
            cooldowns: Vec::new(),
            total_started: 0,
            total_suppressed: 0,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Most advanced phase across all regions.
    pub fn phase(&self) -> RecorderPhase {
        if self
            .recordings
            .iter()
            .any(|r| r.phase == RecorderPhase::Recording)
        {
            RecorderPhase::Recording
        } else if !self.recordings.is_empty() {
            RecorderPhase::Triggered
        } else if !self.cooldowns.is_empty() {
            RecorderPhase::Cooldown
        } else {
            RecorderPhase::Idle
        }
    }

    /// Phase of the region an incident at `location` would fall into.
    pub fn phase_at(&self, location: Vec2) -> RecorderPhase {
        if let Some(rec) = self
            .recordings
            .iter()
            .find(|r| r.location.distance(location) <= self.dedup_radius)
        {
            return rec.phase;
        }
        if self
            .cooldowns
            .iter()
            .any(|c| c.location.distance(location) <= self.dedup_radius)
        {
            return RecorderPhase::Cooldown;
        }
        RecorderPhase::Idle
    }

    pub fn active_recordings(&self) -> usize {
        self.recordings.len()
    }

    pub fn cooldowns(&self) -> usize {
        self.cooldowns.len()
    }

    pub fn total_started(&self) -> u64 {
        self.total_started
    }

    pub fn total_suppressed(&self) -> u64 {
        self.total_suppressed
    }

    /// Advance one frame. Must be called after the detector evaluated the
    /// same frame, for every frame, including frames with no incidents.
    pub fn process(&mut self, frame: &Frame, assessment: &Assessment) -> RecorderUpdate {
        let now_ms = assessment.timestamp_ms;
        let frame = Arc::new(self.encoder.capture(frame));
        let mut update = RecorderUpdate::default();

        self.expire_cooldowns(now_ms);

        for incident in &assessment.incidents {
            self.handle_incident(incident, now_ms, &mut update);
        }

        self.record_activity(assessment, now_ms);
        self.append_frame(&frame);
        self.lookback.push(frame);

        update.finalized = self.close_finished(now_ms);
        update
    }

    /// Close every open recording with whatever frames it holds.
    pub fn finalize_all(&mut self, reason: EndReason, now_ms: f64) -> Vec<FinalizedClip> {
        if !self.recordings.is_empty() {
            warn!(
                "[{}] Finalizing {} open recording(s): {}",
                self.camera_id,
                self.recordings.len(),
                reason.as_str()
            );
        }
        let open = std::mem::take(&mut self.recordings);
        open.into_iter()
            .map(|rec| self.finalize(rec, reason, now_ms))
            .collect()
    }

    fn expire_cooldowns(&mut self, now_ms: f64) {
        let camera = &self.camera_id;
        self.cooldowns.retain(|c| {
            if now_ms >= c.until_ms {
                debug!("[{}] Cooldown over for {}", camera, c.clip_id);
                return false;
            }
            true
        });
    }

    fn matches(&self, location: Vec2, track_ids: &HashSet<u64>, incident: &ConfirmedIncident) -> bool {
        location.distance(incident.location()) <= self.dedup_radius
            || incident.track_ids().iter().any(|id| track_ids.contains(id))
    }

    fn handle_incident(&mut self, incident: &ConfirmedIncident, now_ms: f64, update: &mut RecorderUpdate) {
        if let Some(i) = self
            .recordings
            .iter()
            .position(|r| self.matches(r.location, &r.track_ids, incident))
        {
            let rec = &mut self.recordings[i];
            rec.reconfirmations += 1;
            rec.counters.confirmations += 1;
            rec.last_activity_ms = now_ms;
            rec.track_ids.extend(incident.track_ids().iter().copied());
            debug!(
                "[{}] {} re-confirmed ({}), extending",
                self.camera_id,
                rec.clip_id,
                incident.incident_type()
            );
            update.extended += 1;
            return;
        }

        if let Some(i) = self
            .cooldowns
            .iter()
            .position(|c| self.matches(c.location, &c.track_ids, incident))
        {
            let cooldown = &mut self.cooldowns[i];
            // Same vehicles still confirming: the event is ongoing
            if incident.track_ids().iter().any(|id| cooldown.track_ids.contains(id)) {
                cooldown.until_ms = cooldown
                    .until_ms
                    .max(now_ms + self.config.cooldown_s * 1000.0);
            }
            debug!(
                "[{}] {} suppressed: cooling down after {} ({:.1}s left)",
                self.camera_id,
                incident.incident_type(),
                cooldown.clip_id,
                (cooldown.until_ms - now_ms) / 1000.0
            );
            self.total_suppressed += 1;
            update.suppressed += 1;
            return;
        }

        let clip_id = self.unique_clip_id(incident);

        let trigger = incident.frame_index();
        let evidence_span = trigger.saturating_sub(incident.evidence().first) as usize;
        let seed_len = self
            .config
            .pre_trigger_frames
            .max(evidence_span)
            .min(self.config.max_frames_per_clip.saturating_sub(1));
        let frames: Vec<Arc<CapturedFrame>> = self
            .lookback
            .recent(seed_len)
            .into_iter()
            .filter(|f| f.index < trigger)
            .collect();
        let encoded_bytes = frames.iter().map(|f| f.encoded_len()).sum();

        info!(
            "[{}] TRIGGERED {}: {} ({} pre-trigger frames)",
            self.camera_id,
            clip_id,
            incident.describe(),
            frames.len()
        );

        let mut counters = LayerCounters::default();
        counters.confirmations = 1;

        self.recordings.push(ActiveRecording {
            clip_id: clip_id.clone(),
            phase: RecorderPhase::Triggered,
            incident: incident.clone(),
            location: incident.location(),
            track_ids: incident.track_ids().iter().copied().collect(),
            started_ms: now_ms,
            last_activity_ms: now_ms,
            frames,
            encoded_bytes,
            counters,
            reconfirmations: 0,
        });
        self.total_started += 1;
        update.started.push(clip_id);
    }

    fn record_activity(&mut self, assessment: &Assessment, now_ms: f64) {
        for rec in &mut self.recordings {
            let mut active = false;
            for candidate in &assessment.candidates {
                let (a, b) = candidate.track_ids;
                if rec.track_ids.contains(&a) || rec.track_ids.contains(&b) {
                    rec.counters.bump(candidate.signal);
                    active = true;
                }
            }
            if active {
                rec.last_activity_ms = now_ms;
            }
        }
    }

    fn append_frame(&mut self, frame: &Arc<CapturedFrame>) {
        for rec in &mut self.recordings {
            if rec.phase == RecorderPhase::Triggered && frame.index > rec.incident.frame_index() {
                rec.phase = RecorderPhase::Recording;
                info!("[{}] RECORDING {}", self.camera_id, rec.clip_id);
            }
            if rec.frames.len() < self.config.max_frames_per_clip
                && rec.encoded_bytes < self.config.max_clip_bytes
            {
                rec.encoded_bytes += frame.encoded_len();
                rec.frames.push(Arc::clone(frame));
            }
        }
    }

    fn close_finished(&mut self, now_ms: f64) -> Vec<FinalizedClip> {
        let max_duration_ms = self.config.max_duration_s * 1000.0;
        let grace_ms = self.config.quiescence_grace_s * 1000.0;
        let max_frames = self.config.max_frames_per_clip;
        let max_bytes = self.config.max_clip_bytes;

        let mut finished = Vec::new();
        let mut still_open = Vec::with_capacity(self.recordings.len());
        for rec in std::mem::take(&mut self.recordings) {
            let reason = if now_ms - rec.started_ms >= max_duration_ms {
                Some(EndReason::MaxDuration)
            } else if rec.frames.len() >= max_frames {
                Some(EndReason::FrameLimit)
            } else if rec.encoded_bytes >= max_bytes {
                Some(EndReason::SizeLimit)
            } else if now_ms - rec.last_activity_ms >= grace_ms {
                Some(EndReason::Quiescent)
            } else {
                None
            };
            match reason {
                Some(reason) => finished.push((rec, reason)),
                None => still_open.push(rec),
            }
        }
        self.recordings = still_open;

        finished
            .into_iter()
            .map(|(rec, reason)| self.finalize(rec, reason, now_ms))
            .collect()
    }

    fn finalize(&mut self, rec: ActiveRecording, reason: EndReason, now_ms: f64) -> FinalizedClip {
        let frame_range = FrameRange {
            first: rec.first_frame(),
            last: rec.last_frame(),
        };
        info!(
            "[{}] FINALIZED {} ({}): {} frames ({} KB) [{}..={}], {} re-confirmations, cooldown {:.0}s",
            self.camera_id,
            rec.clip_id,
            reason.as_str(),
            rec.frames.len(),
            rec.encoded_bytes / 1024,
            frame_range.first,
            frame_range.last,
            rec.reconfirmations,
            self.config.cooldown_s
        );

        self.cooldowns.push(CooldownEntry {
            clip_id: rec.clip_id.clone(),
            location: rec.location,
            track_ids: rec.track_ids,
            until_ms: now_ms + self.config.cooldown_s * 1000.0,
        });

        FinalizedClip {
            clip_id: rec.clip_id,
            incident: rec.incident,
            frames: rec.frames,
            frame_range,
            end_reason: reason,
            counters: rec.counters,
            reconfirmations: rec.reconfirmations,
        }
    }

    /// Two same-type incidents confirmed on the same frame would share an
    /// id; later ones move forward a millisecond at a time.
    fn unique_clip_id(&self, incident: &ConfirmedIncident) -> ClipId {
        let mut clip_id = ClipId::new(
            &self.camera_id,
            self.event_time(incident.timestamp_ms()),
            incident.incident_type(),
        );
        while self
            .recordings
            .iter()
            .map(|r| &r.clip_id)
            .chain(self.cooldowns.iter().map(|c| &c.clip_id))
            .any(|id| *id == clip_id)
        {
            clip_id.event_time += Duration::milliseconds(1);
        }
        clip_id
    }

    fn event_time(&self, timestamp_ms: f64) -> DateTime<Utc> {
        let offset = if timestamp_ms.is_finite() {
            timestamp_ms.round() as i64
        } else {
            0
        };
        self.stream_start + Duration::milliseconds(offset)
    }
}

// ============================================================================
// TESTS
// ============================================================================
