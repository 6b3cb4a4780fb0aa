// src/pipeline/orchestrator.rs
//
// One pipeline per camera stream. Strictly sequential per frame:
//
//   read ─▶ detect ─▶ tracker.update ─▶ detector.evaluate ─▶ recorder.process ─▶ sink
//
// The loop blocks only at the frame source and at clip hand-off (the sink
// decides whether that is a channel send or inline work). Instances share
// nothing mutable; the detector is an `Arc<dyn Detector>` read by all.
//
// Failure policy:
//   - detector error on a frame   → that frame has no detections
//   - failed read                 → tracks coast, counter grows
//   - too many failed reads       → release + reopen with backoff
//   - reconnect exhausted / stop  → open recordings finalized, loop exits
//   - missing detector or source  → `PipelineError` from `build()`, no frames read

use crate::analysis::features::PairFeatures;
use crate::analysis::incident_detector::{IncidentConfig, IncidentDetector};
use crate::analysis::object_tracker::{ObjectTracker, TrackerConfig};
use crate::analysis::roadway::Roadway;
use crate::clip::FinalizedClip;
use crate::detector::Detector;
use crate::incident_recorder::{EndReason, IncidentRecorder, RecorderConfig};
use crate::pipeline::event_bus::{EventBus, PipelineEvent};
use crate::pipeline::frame_context::FrameContext;
use crate::pipeline::session_stats::{SessionStats, SessionSummary};
use crate::source::{FrameSource, ReadOutcome};
use crate::types::{CameraConfig, Frame, SourceRetryConfig};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no detector available for camera {0}")]
    NoDetector(String),

    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Cooperative stop flag, cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives pipeline output. Runs on the pipeline thread, so implementations
/// should hand heavy work elsewhere.
pub trait OutputSink {
    fn hand_off(&mut self, clip: FinalizedClip);

    fn features(&mut self, _frame_index: u64, _features: &[PairFeatures]) {}

    fn event(&mut self, _event: &PipelineEvent) {}
}

impl OutputSink for Vec<FinalizedClip> {
    fn hand_off(&mut self, clip: FinalizedClip) {
        self.push(clip);
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct PipelineBuilder {
    camera: CameraConfig,
    source: Option<Box<dyn FrameSource>>,
    detector: Option<Arc<dyn Detector>>,
    tracker: TrackerConfig,
    incident: IncidentConfig,
    recorder: RecorderConfig,
    retry: SourceRetryConfig,
    stream_start: Option<DateTime<Utc>>,
    stop: Option<StopHandle>,
}

impl PipelineBuilder {
    pub fn new(camera: CameraConfig) -> Self {
        Self {
            camera,
            source: None,
            detector: None,
            tracker: TrackerConfig::default(),
            incident: IncidentConfig::default(),
            recorder: RecorderConfig::default(),
            retry: SourceRetryConfig::default(),
            stream_start: None,
            stop: None,
        }
    }

    pub fn source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn tracker(mut self, config: TrackerConfig) -> Self {
        self.tracker = config;
        self
    }

    pub fn incident(mut self, config: IncidentConfig) -> Self {
        self.incident = config;
        self
    }

    pub fn recorder(mut self, config: RecorderConfig) -> Self {
        self.recorder = config;
        self
    }

    pub fn source_retry(mut self, config: SourceRetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Wall-clock time of stream timestamp 0. Defaults to now.
    pub fn stream_start(mut self, start: DateTime<Utc>) -> Self {
        self.stream_start = Some(start);
        self
    }

    /// Share an existing stop flag (e.g. one per process).
    pub fn stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Validate, open the source, and assemble the pipeline.
    pub fn build(self) -> Result<IncidentPipeline, PipelineError> {
        let camera_id = self.camera.id.clone();

        let invalid = |e: anyhow::Error| PipelineError::InvalidConfig(format!("{:#}", e));
        self.tracker.validate().map_err(invalid)?;
        self.incident.validate().map_err(invalid)?;
        self.recorder.validate().map_err(invalid)?;
        if self.camera.frame_width == 0 || self.camera.frame_height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "camera {} has a zero frame size",
                camera_id
            )));
        }

        let detector = self
            .detector
            .ok_or_else(|| PipelineError::NoDetector(camera_id.clone()))?;
        let mut source = self.source.ok_or_else(|| {
            PipelineError::SourceUnavailable(format!("no frame source for camera {}", camera_id))
        })?;
        if !source.open() {
            return Err(PipelineError::SourceUnavailable(source.describe()));
        }

        let roadway = match self.camera.roadway.as_deref() {
            Some(vertices) => {
                let roadway = Roadway::new(vertices);
                if roadway.is_none() {
                    warn!(
                        "[{}] Roadway polygon needs at least 3 vertices, pedestrian rule disabled",
                        camera_id
                    );
                }
                roadway
            }
            None => None,
        };

        let width = self.camera.frame_width as f32;
        let stream_start = self.stream_start.unwrap_or_else(Utc::now);

        info!(
            "🚗 Pipeline ready: camera {} | source {} | detector {}",
            camera_id,
            source.describe(),
            detector.name()
        );

        Ok(IncidentPipeline {
            tracker: ObjectTracker::new(self.tracker, width),
            incident_detector: IncidentDetector::new(self.incident, width, roadway),
            recorder: IncidentRecorder::new(&camera_id, self.recorder, width, stream_start),
            camera: self.camera,
            source,
            detector,
            retry: self.retry,
            events: EventBus::default(),
            stats: SessionStats::new(),
            stop: self.stop.unwrap_or_default(),
            last_timestamp_ms: 0.0,
        })
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct IncidentPipeline {
    camera: CameraConfig,
    source: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    tracker: ObjectTracker,
    incident_detector: IncidentDetector,
    recorder: IncidentRecorder,
    retry: SourceRetryConfig,
    events: EventBus,
    stats: SessionStats,
    stop: StopHandle,
    last_timestamp_ms: f64,
}

impl IncidentPipeline {
    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    pub fn recorder(&self) -> &IncidentRecorder {
        &self.recorder
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Start a fresh statistics session, returning the summary of the old one.
    pub fn reset_stats(&mut self) -> SessionSummary {
        let summary = self.stats.summary();
        self.stats = std::mem::take(&mut self.stats).reset();
        summary
    }

    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        self.events.drain()
    }

    /// Run one frame through detect → track → evaluate → record.
    pub fn process_frame(&mut self, frame: Frame) -> FrameContext {
        let (frame_index, timestamp_ms) = (frame.index, frame.timestamp_ms);
        self.last_timestamp_ms = timestamp_ms;

        let (detections, detector_failed) = match self.detector.detect(&frame) {
            Ok(detections) => (detections, false),
            Err(e) => {
                warn!(
                    "[{}] Detector failed on frame {}: {:#}",
                    self.camera.id, frame_index, e
                );
                (Vec::new(), true)
            }
        };

        let tracks = self.tracker.update(&detections, frame_index, timestamp_ms);
        let assessment = self
            .incident_detector
            .evaluate(tracks, frame_index, timestamp_ms);
        let tracks = tracks.to_vec();

        let update = self.recorder.process(&frame, &assessment);

        // Stats
        self.stats.frames_processed += 1;
        self.stats.detections += detections.len() as u64;
        if detector_failed {
            self.stats.detector_errors += 1;
        }
        if !detections.is_empty() {
            self.stats.frames_with_objects += 1;
        }
        self.stats.observe_tracks(tracks.len());
        self.stats.pairs_evaluated += assessment.pairs.len() as u64;
        self.stats.layer_skips += assessment
            .pairs
            .iter()
            .flat_map(|p| p.layers.iter())
            .filter(|(_, outcome)| outcome.is_skipped())
            .count() as u64;
        self.stats.candidates += assessment.candidates.len() as u64;
        self.stats.incidents_confirmed += assessment.incidents.len() as u64;
        self.stats.recordings_started += update.started.len() as u64;
        self.stats.recordings_suppressed += update.suppressed as u64;
        self.stats.clips_finalized += update.finalized.len() as u64;

        // Events
        for incident in &assessment.incidents {
            self.events.publish(PipelineEvent::IncidentConfirmed {
                frame_index,
                incident: incident.clone(),
            });
        }
        for clip_id in &update.started {
            self.events.publish(PipelineEvent::RecordingStarted {
                clip_id: clip_id.clone(),
                frame_index,
            });
        }
        if update.suppressed > 0 {
            self.events.publish(PipelineEvent::RecordingSuppressed {
                frame_index,
                count: update.suppressed,
            });
        }
        self.publish_finalized(&update.finalized);

        debug!(
            "[{}] Frame {}: {} detections, {} tracks, {} pairs, {} incidents",
            self.camera.id,
            frame_index,
            detections.len(),
            tracks.len(),
            assessment.pairs.len(),
            assessment.incidents.len()
        );

        FrameContext {
            frame_index,
            timestamp_ms,
            detections,
            detector_failed,
            tracks,
            phase: self.recorder.phase(),
            started: update.started,
            suppressed: update.suppressed,
            finalized: update.finalized,
            assessment,
        }
    }

    /// Pull frames until the source ends, fails for good, or a stop is requested.
    pub fn run(&mut self, sink: &mut dyn OutputSink) -> SessionSummary {
        info!("[{}] Pipeline running on {}", self.camera.id, self.source.describe());
        let mut consecutive_failures = 0u32;

        let reason = loop {
            if self.stop.is_stopped() {
                break EndReason::Stopped;
            }

            match self.source.read() {
                ReadOutcome::Frame(frame) => {
                    consecutive_failures = 0;
                    if self.source.is_new_scene() {
                        self.start_new_scene(frame.index, sink);
                    }
                    let mut ctx = self.process_frame(frame);
                    if !ctx.assessment.pairs.is_empty() {
                        sink.features(ctx.frame_index, &ctx.pair_features());
                    }
                    for clip in std::mem::take(&mut ctx.finalized) {
                        sink.hand_off(clip);
                    }
                }
                ReadOutcome::Failed => {
                    consecutive_failures += 1;
                    self.stats.frames_failed += 1;
                    self.tracker.coast();
                    if consecutive_failures >= self.retry.max_consecutive_failures {
                        warn!(
                            "[{}] {} consecutive read failures, reconnecting",
                            self.camera.id, consecutive_failures
                        );
                        self.events
                            .publish(PipelineEvent::SourceFailed { consecutive: consecutive_failures });
                        if !self.reconnect() {
                            break if self.stop.is_stopped() {
                                EndReason::Stopped
                            } else {
                                EndReason::SourceFailed
                            };
                        }
                        consecutive_failures = 0;
                    }
                }
                ReadOutcome::Ended => break EndReason::StreamEnded,
            }

            self.forward_events(sink);
        };

        match reason {
            EndReason::SourceFailed => error!(
                "[{}] Source {} lost after {} reconnect attempts",
                self.camera.id,
                self.source.describe(),
                self.retry.reconnect_attempts
            ),
            _ => info!("[{}] Pipeline stopping: {}", self.camera.id, reason.as_str()),
        }

        self.finalize_open(reason, sink);
        self.source.release();

        let summary = self.stats.summary();
        info!(
            "✓ [{}] {} frames ({} failed), {} incidents, {} clips, {:.1} fps",
            self.camera.id,
            summary.frames_processed,
            summary.frames_failed,
            summary.incidents_confirmed,
            summary.clips_finalized,
            summary.fps
        );
        summary
    }

    fn start_new_scene(&mut self, frame_index: u64, sink: &mut dyn OutputSink) {
        info!("[{}] New scene at frame {}", self.camera.id, frame_index);
        self.stats.scene_changes += 1;
        self.finalize_open(EndReason::StreamEnded, sink);
        self.tracker.reset();
        self.events.publish(PipelineEvent::NewScene { frame_index });
    }

    fn finalize_open(&mut self, reason: EndReason, sink: &mut dyn OutputSink) {
        let clips = self.recorder.finalize_all(reason, self.last_timestamp_ms);
        self.stats.clips_finalized += clips.len() as u64;
        self.publish_finalized(&clips);
        for clip in clips {
            sink.hand_off(clip);
        }
        self.forward_events(sink);
    }

    fn publish_finalized(&mut self, clips: &[FinalizedClip]) {
        for clip in clips {
            self.events.publish(PipelineEvent::ClipFinalized {
                clip_id: clip.clip_id.clone(),
                reason: clip.end_reason,
                frames: clip.frames.len(),
            });
        }
    }

    fn forward_events(&mut self, sink: &mut dyn OutputSink) {
        for event in self.events.drain() {
            sink.event(&event);
        }
    }

    /// Release and reopen the source, backing off linearly between attempts.
    fn reconnect(&mut self) -> bool {
        for attempt in 1..=self.retry.reconnect_attempts {
            if self.stop.is_stopped() {
                return false;
            }
            self.source.release();
            let backoff = self.retry.reconnect_backoff_ms.saturating_mul(attempt as u64);
            if backoff > 0 {
                std::thread::sleep(Duration::from_millis(backoff));
            }
            if self.source.open() {
                info!(
                    "[{}] Source reconnected on attempt {}",
                    self.camera.id, attempt
                );
                self.stats.reconnects += 1;
                self.events.publish(PipelineEvent::SourceReconnected { attempt });
                return true;
            }
            warn!(
                "[{}] Reconnect attempt {}/{} failed",
                self.camera.id, attempt, self.retry.reconnect_attempts
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Detection, ObjectClass};
    use anyhow::bail;
    use std::collections::VecDeque;

    struct ScriptedSource {
        script: VecDeque<ReadOutcome>,
        opens: u32,
        open_ok: bool,
    }

    impl ScriptedSource {
        fn new(script: Vec<ReadOutcome>) -> Self {
            Self {
                script: script.into(),
                opens: 0,
                open_ok: true,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn open(&mut self) -> bool {
            self.opens += 1;
            self.open_ok
        }

        fn read(&mut self) -> ReadOutcome {
            self.script.pop_front().unwrap_or(ReadOutcome::Ended)
        }

        fn release(&mut self) {}

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct FlakyDetector;

    impl Detector for FlakyDetector {
        fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            if frame.index % 2 == 1 {
                bail!("inference timeout");
            }
            Ok(vec![Detection::new(
                ObjectClass::Car,
                0.9,
                BoundingBox::new(100.0 + frame.index as f32 * 5.0, 100.0, 50.0, 30.0),
            )])
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn frames(n: u64) -> Vec<ReadOutcome> {
        (0..n)
            .map(|i| ReadOutcome::Frame(Frame::blank(i, i as f64 * 33.3, 1280, 720)))
            .collect()
    }

    fn build(script: Vec<ReadOutcome>) -> IncidentPipeline {
        PipelineBuilder::new(CameraConfig::default())
            .source(Box::new(ScriptedSource::new(script)))
            .detector(Arc::new(FlakyDetector))
            .source_retry(SourceRetryConfig {
                max_consecutive_failures: 2,
                reconnect_attempts: 1,
                reconnect_backoff_ms: 0,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_detector_fails_before_any_frame() {
        let err = PipelineBuilder::new(CameraConfig::default())
            .source(Box::new(ScriptedSource::new(frames(3))))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::NoDetector(ref id) if id == "camera-0"));
    }

    #[test]
    fn test_unopenable_source_fails_at_build() {
        let mut source = ScriptedSource::new(frames(3));
        source.open_ok = false;
        let err = PipelineBuilder::new(CameraConfig::default())
            .source(Box::new(source))
            .detector(Arc::new(FlakyDetector))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut tracker = TrackerConfig::default();
        tracker.miss_tolerance = 0;
        let err = PipelineBuilder::new(CameraConfig::default())
            .source(Box::new(ScriptedSource::new(frames(1))))
            .detector(Arc::new(FlakyDetector))
            .tracker(tracker)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_detector_error_means_no_detections() {
        let mut pipeline = build(Vec::new());
        let ok = pipeline.process_frame(Frame::blank(0, 0.0, 1280, 720));
        assert!(!ok.detector_failed);
        assert_eq!(ok.detections.len(), 1);

        let failed = pipeline.process_frame(Frame::blank(1, 33.3, 1280, 720));
        assert!(failed.detector_failed);
        assert!(failed.detections.is_empty());
        assert_eq!(failed.tracks.len(), 1, "track coasts through the failed frame");
        assert_eq!(pipeline.stats().detector_errors, 1);
    }

    #[test]
    fn test_run_survives_short_read_failures() {
        let mut script = frames(3);
        script.insert(1, ReadOutcome::Failed);
        let mut pipeline = build(script);
        let mut clips: Vec<FinalizedClip> = Vec::new();
        let summary = pipeline.run(&mut clips);

        assert_eq!(summary.frames_processed, 3);
        assert_eq!(summary.frames_failed, 1);
        assert_eq!(summary.reconnects, 0);
    }

    #[test]
    fn test_reconnect_after_failure_limit() {
        let mut script = vec![ReadOutcome::Failed, ReadOutcome::Failed];
        script.extend(frames(2));
        let mut pipeline = build(script);
        let summary = pipeline.run(&mut Vec::<FinalizedClip>::new());
        assert_eq!(summary.reconnects, 1);
        assert_eq!(summary.frames_processed, 2);
    }

    #[test]
    fn test_stop_before_run_processes_nothing() {
        let mut pipeline = build(frames(10));
        pipeline.stop_handle().stop();
        let summary = pipeline.run(&mut Vec::<FinalizedClip>::new());
        assert_eq!(summary.frames_processed, 0);
    }

    #[test]
    fn test_reset_stats_returns_previous_summary() {
        let mut pipeline = build(Vec::new());
        pipeline.process_frame(Frame::blank(0, 0.0, 1280, 720));
        let previous = pipeline.reset_stats();
        assert_eq!(previous.frames_processed, 1);
        assert_eq!(pipeline.stats().frames_processed, 0);
    }
}
