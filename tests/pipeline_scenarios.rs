// tests/pipeline_scenarios.rs
//
// End-to-end scenarios through the public pipeline API: scripted frame
// sources and per-frame detection maps stand in for a camera and a model.

use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use traffic_incident::clip::{ClipId, FinalizedClip};
use traffic_incident::detector::ReplayDetector;
use traffic_incident::incident_recorder::EndReason;
use traffic_incident::pipeline::{
    IncidentPipeline, OutputSink, PipelineBuilder, PipelineError, PipelineEvent, StopHandle,
};
use traffic_incident::source::{FrameSource, ReadOutcome, RecordedSession};
use traffic_incident::types::{
    BoundingBox, CameraConfig, CollisionKind, Detection, Frame, IncidentType, ObjectClass,
    Severity, SourceRetryConfig, Vec2,
};

const FRAME_MS: f64 = 1000.0 / 30.0;

// ============================================================================
// HARNESS
// ============================================================================

struct ScriptedSource {
    reads: VecDeque<ReadOutcome>,
    /// When false, only the first open succeeds
    reopenable: bool,
    opens: u32,
}

impl ScriptedSource {
    fn frames(count: u64) -> Self {
        Self::from_reads((0..count).map(|i| ReadOutcome::Frame(blank(i))).collect())
    }

    fn from_reads(reads: Vec<ReadOutcome>) -> Self {
        Self {
            reads: reads.into(),
            reopenable: true,
            opens: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> bool {
        self.opens += 1;
        self.opens == 1 || self.reopenable
    }

    fn read(&mut self) -> ReadOutcome {
        self.reads.pop_front().unwrap_or(ReadOutcome::Ended)
    }

    fn release(&mut self) {}

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn blank(i: u64) -> Frame {
    Frame::blank(i, i as f64 * FRAME_MS, 1280, 720)
}

fn car(x: f32, y: f32) -> Detection {
    Detection::new(
        ObjectClass::Car,
        0.9,
        BoundingBox::centered(Vec2::new(x, y), 50.0, 30.0),
    )
}

fn camera() -> CameraConfig {
    CameraConfig {
        id: "cam-test".to_string(),
        ..CameraConfig::default()
    }
}

fn detector(frames: Vec<Vec<Detection>>) -> Arc<ReplayDetector> {
    let map: HashMap<u64, Vec<Detection>> = frames
        .into_iter()
        .enumerate()
        .map(|(i, dets)| (i as u64, dets))
        .collect();
    Arc::new(ReplayDetector::new(Arc::new(map)))
}

fn pipeline(source: ScriptedSource, frames: Vec<Vec<Detection>>) -> IncidentPipeline {
    PipelineBuilder::new(camera())
        .source(Box::new(source))
        .detector(detector(frames))
        .source_retry(SourceRetryConfig {
            max_consecutive_failures: 3,
            reconnect_attempts: 2,
            reconnect_backoff_ms: 0,
        })
        .stream_start(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap())
        .build()
        .unwrap()
}

/// Two cars closing head-on at 20 px/frame each, then stopped in contact.
fn head_on(offset: Vec2, stationary_frames: usize) -> Vec<Vec<Detection>> {
    let mut frames: Vec<Vec<Detection>> = (0..4)
        .map(|i| {
            let step = 20.0 * i as f32;
            vec![
                car(offset.x + 80.0 + step, offset.y + 100.0),
                car(offset.x + 220.0 - step, offset.y + 100.0),
            ]
        })
        .collect();
    let rest = frames[3].clone();
    frames.extend(std::iter::repeat(rest).take(stationary_frames));
    frames
}

fn collisions(clips: &[FinalizedClip]) -> Vec<&FinalizedClip> {
    clips
        .iter()
        .filter(|c| c.incident.incident_type().is_collision())
        .collect()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn head_on_collision_yields_exactly_one_clip() {
    let frames = head_on(Vec2::ZERO, 120);
    let total = frames.len() as u64;
    let mut pipeline = pipeline(ScriptedSource::frames(total), frames);
    let mut clips: Vec<FinalizedClip> = Vec::new();
    let summary = pipeline.run(&mut clips);

    assert_eq!(clips.len(), 1, "one physical event, one clip: {:?}", clips.iter().map(|c| c.clip_id.to_string()).collect::<Vec<_>>());
    let clip = &clips[0];
    assert_eq!(
        clip.incident.incident_type(),
        IncidentType::Collision(CollisionKind::HeadOn)
    );
    assert_eq!(clip.incident.vehicles_involved(), 2);
    assert!(clip.incident.frame_index() <= 3);
    assert_eq!(clip.end_reason, EndReason::Quiescent);
    assert_eq!(clip.frames[0].index, 0, "pre-trigger frames seeded from lookback");
    assert!(clip.counters.closing_speed >= 1);

    let id = clip.clip_id.to_string();
    assert!(id.starts_with("cam-test_20260301T080000."), "{}", id);
    assert!(id.ends_with("_collision-head-on"), "{}", id);
    assert_eq!(ClipId::parse(&id).unwrap(), clip.clip_id);

    assert_eq!(summary.frames_processed, total);
    assert_eq!(summary.recordings_started, 1);
    assert_eq!(summary.clips_finalized, 1);
    assert!(summary.incidents_confirmed >= 1);
}

#[test]
fn parallel_traffic_never_records() {
    let frames: Vec<Vec<Detection>> = (0..120)
        .map(|i| {
            let x = 60.0 + 9.0 * i as f32;
            vec![car(x, 300.0), car(x, 328.0), car(x + 55.0, 300.0)]
        })
        .collect();
    let mut pipeline = pipeline(ScriptedSource::frames(120), frames);
    let mut clips: Vec<FinalizedClip> = Vec::new();
    let summary = pipeline.run(&mut clips);

    assert!(clips.is_empty());
    assert_eq!(summary.incidents_confirmed, 0);
    assert!(summary.pairs_evaluated > 0);
}

#[test]
fn unrelated_simultaneous_incidents_get_separate_clips() {
    let near = head_on(Vec2::ZERO, 0);
    let far = head_on(Vec2::new(800.0, 500.0), 0);
    let frames: Vec<Vec<Detection>> = near
        .into_iter()
        .zip(far)
        .map(|(mut a, b)| {
            a.extend(b);
            a
        })
        .collect();
    let mut pipeline = pipeline(ScriptedSource::frames(4), frames);
    let mut clips: Vec<FinalizedClip> = Vec::new();
    pipeline.run(&mut clips);

    let collisions = collisions(&clips);
    assert_eq!(collisions.len(), 2);
    assert_ne!(collisions[0].clip_id, collisions[1].clip_id);
    assert!(collisions
        .iter()
        .all(|c| c.end_reason == EndReason::StreamEnded && c.incident.vehicles_involved() == 2));
}

#[test]
fn stopped_vehicle_among_moving_traffic() {
    let frames: Vec<Vec<Detection>> = (0..300)
        .map(|i| {
            let x = 100.0 + (i % 100) as f32 * 8.0;
            vec![car(640.0, 500.0), car(x, 300.0)]
        })
        .collect();
    let mut pipeline = pipeline(ScriptedSource::frames(300), frames);
    let mut clips: Vec<FinalizedClip> = Vec::new();
    pipeline.run(&mut clips);

    assert_eq!(clips.len(), 1);
    let incident = &clips[0].incident;
    assert_eq!(incident.incident_type(), IncidentType::StoppedVehicle);
    assert_eq!(incident.severity(), Severity::Medium);
    assert_eq!(incident.track_ids(), [1]);
}

#[test]
fn vehicle_stalled_for_minutes_yields_one_clip() {
    // 2 minutes at 30fps: longer than max duration plus several cooldowns
    let frames: Vec<Vec<Detection>> = (0..3600)
        .map(|i| {
            let x = 100.0 + (i % 100) as f32 * 8.0;
            vec![car(640.0, 500.0), car(x, 300.0)]
        })
        .collect();
    let mut pipeline = pipeline(ScriptedSource::frames(3600), frames);
    let mut clips: Vec<FinalizedClip> = Vec::new();
    let summary = pipeline.run(&mut clips);

    let ids: Vec<String> = clips.iter().map(|c| c.clip_id.to_string()).collect();
    assert_eq!(clips.len(), 1, "one stalled vehicle, one clip: {:?}", ids);
    assert_eq!(clips[0].incident.incident_type(), IncidentType::StoppedVehicle);
    assert_eq!(clips[0].end_reason, EndReason::MaxDuration);
    assert_eq!(summary.recordings_started, 1);
    assert!(summary.recordings_suppressed > 0);
}

#[test]
fn source_failure_finalizes_partial_clip() {
    let mut reads: Vec<ReadOutcome> = (0..6).map(|i| ReadOutcome::Frame(blank(i))).collect();
    reads.extend((0..10).map(|_| ReadOutcome::Failed));
    let mut source = ScriptedSource::from_reads(reads);
    source.reopenable = false;

    let mut pipeline = pipeline(source, head_on(Vec2::ZERO, 2));
    let mut clips: Vec<FinalizedClip> = Vec::new();
    let summary = pipeline.run(&mut clips);

    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].end_reason, EndReason::SourceFailed);
    assert_eq!(clips[0].frame_range.last, 5, "every frame read before the loss is kept");
    assert_eq!(summary.frames_processed, 6);
    assert_eq!(summary.frames_failed, 3);
    assert_eq!(summary.reconnects, 0);
}

#[test]
fn reconnect_preserves_tracks() {
    let mut reads: Vec<ReadOutcome> = (0..3).map(|i| ReadOutcome::Frame(blank(i))).collect();
    reads.extend((0..3).map(|_| ReadOutcome::Failed));
    reads.extend((3..6).map(|i| ReadOutcome::Frame(blank(i))));

    let frames: Vec<Vec<Detection>> = (0..6).map(|i| vec![car(200.0 + 4.0 * i as f32, 400.0)]).collect();
    let mut pipeline = pipeline(ScriptedSource::from_reads(reads), frames);
    let summary = pipeline.run(&mut Vec::<FinalizedClip>::new());

    assert_eq!(summary.reconnects, 1);
    assert_eq!(summary.frames_processed, 6);
    assert_eq!(pipeline.tracker().tracks_created(), 1, "same identity across the reconnect");
}

struct StopOnIncident {
    stop: StopHandle,
    clips: Vec<FinalizedClip>,
}

impl OutputSink for StopOnIncident {
    fn hand_off(&mut self, clip: FinalizedClip) {
        self.clips.push(clip);
    }

    fn event(&mut self, event: &PipelineEvent) {
        if matches!(event, PipelineEvent::IncidentConfirmed { .. }) {
            self.stop.stop();
        }
    }
}

#[test]
fn stop_request_finalizes_open_recording() {
    let frames = head_on(Vec2::ZERO, 200);
    let total = frames.len() as u64;
    let mut pipeline = pipeline(ScriptedSource::frames(total), frames);
    let mut sink = StopOnIncident {
        stop: pipeline.stop_handle(),
        clips: Vec::new(),
    };
    let summary = pipeline.run(&mut sink);

    assert_eq!(sink.clips.len(), 1);
    assert_eq!(sink.clips[0].end_reason, EndReason::Stopped);
    assert!(summary.frames_processed <= 4, "stopped right after the confirming frame");
}

#[test]
fn track_count_stays_bounded_over_long_runs() {
    // A new object every 10 frames, each gone for good afterwards
    let frames: Vec<Vec<Detection>> = (0..10_000u64)
        .map(|i| {
            let k = i / 10;
            vec![car(100.0 + (k % 4) as f32 * 300.0, 200.0)]
        })
        .collect();
    let mut pipeline = pipeline(ScriptedSource::frames(10_000), frames);
    let summary = pipeline.run(&mut Vec::<FinalizedClip>::new());

    assert_eq!(summary.frames_processed, 10_000);
    assert_eq!(pipeline.tracker().tracks_created(), 1_000);
    assert!(summary.peak_active_tracks <= 2, "peak {}", summary.peak_active_tracks);
    assert!(pipeline.tracker().active_count() <= 2);
}

#[test]
fn missing_detector_is_a_start_failure() {
    let err = PipelineBuilder::new(camera())
        .source(Box::new(ScriptedSource::frames(5)))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::NoDetector(_)));
    assert!(err.to_string().contains("cam-test"));
}

#[test]
fn empty_recorded_session_is_a_start_failure() {
    let session = RecordedSession::parse("empty", "", 30.0).unwrap();
    let (source, detector) = session.split(1280, 720);
    let err = PipelineBuilder::new(camera())
        .source(Box::new(source))
        .detector(Arc::new(detector))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
}

#[test]
fn recorded_session_drives_the_whole_pipeline() {
    let mut log = String::new();
    for (i, dets) in head_on(Vec2::ZERO, 10).iter().enumerate() {
        let boxes: Vec<String> = dets
            .iter()
            .map(|d| {
                format!(
                    r#"{{"class": "car", "confidence": 0.9, "bbox": [{}, {}, {}, {}]}}"#,
                    d.bbox.x, d.bbox.y, d.bbox.width, d.bbox.height
                )
            })
            .collect();
        log.push_str(&format!(
            "{{\"frame\": {}, \"detections\": [{}]}}\n",
            i,
            boxes.join(", ")
        ));
    }
    let session = RecordedSession::parse("head-on", &log, 30.0).unwrap();
    let (source, detector) = session.split(1280, 720);
    let mut pipeline = PipelineBuilder::new(camera())
        .source(Box::new(source))
        .detector(Arc::new(detector))
        .build()
        .unwrap();

    let mut clips: Vec<FinalizedClip> = Vec::new();
    let summary = pipeline.run(&mut clips);
    assert_eq!(summary.frames_processed, 14);
    assert_eq!(collisions(&clips).len(), 1);
}
