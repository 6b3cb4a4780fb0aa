// src/source.rs
//
// Frame source contract and the recorded-session replay source.
//
// A recorded session is a JSON-lines log, one frame per line:
//
//   {"frame": 0, "timestamp_ms": 0.0, "detections": [{"class": "car", "confidence": 0.9, "bbox": [x, y, w, h]}]}
//   {"frame": 1, "dropped": true}
//
// `dropped` marks a failed read. The same log drives both the frame source
// and the detector (see `detector::ReplayDetector`), so the whole pipeline
// runs without a camera or a model.

use crate::detector::ReplayDetector;
use crate::types::{Detection, Frame};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

// ============================================================================
// CONTRACT
// ============================================================================

#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// Transient failure; the stream may recover
    Failed,
    /// No more frames will ever come
    Ended,
}

pub trait FrameSource: Send {
    fn open(&mut self) -> bool;
    fn read(&mut self) -> ReadOutcome;
    fn release(&mut self);
    fn describe(&self) -> String;

    /// True right after a read that crossed into an unrelated scene
    /// (a different recording, a camera that was re-aimed). Track state
    /// from before cannot be continued.
    fn is_new_scene(&self) -> bool {
        false
    }
}

// ============================================================================
// RECORDED SESSION
// ============================================================================

#[derive(Debug, Deserialize)]
struct SessionLine {
    frame: u64,
    #[serde(default)]
    timestamp_ms: Option<f64>,
    #[serde(default)]
    dropped: bool,
    #[serde(default)]
    detections: Vec<Detection>,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    frame: u64,
    timestamp_ms: f64,
    dropped: bool,
}

#[derive(Debug, Default)]
pub struct RecordedSession {
    name: String,
    entries: Vec<SessionEntry>,
    detections: HashMap<u64, Vec<Detection>>,
    scene_starts: HashSet<u64>,
}

impl RecordedSession {
    /// Parse one JSON-lines log. Missing timestamps are derived from `fps`.
    pub fn parse(name: &str, contents: &str, fps: f64) -> Result<Self> {
        let frame_ms = if fps > 0.0 { 1000.0 / fps } else { 1000.0 / 30.0 };
        let mut session = Self {
            name: name.to_string(),
            ..Default::default()
        };

        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed: SessionLine = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid session line", name, line_no + 1))?;

            if let Some(last) = session.entries.last() {
                if parsed.frame <= last.frame {
                    bail!(
                        "{}:{}: frame {} does not follow frame {}",
                        name,
                        line_no + 1,
                        parsed.frame,
                        last.frame
                    );
                }
            }

            let timestamp_ms = parsed
                .timestamp_ms
                .unwrap_or(parsed.frame as f64 * frame_ms);
            session.entries.push(SessionEntry {
                frame: parsed.frame,
                timestamp_ms,
                dropped: parsed.dropped,
            });
            if !parsed.dropped && !parsed.detections.is_empty() {
                session.detections.insert(parsed.frame, parsed.detections);
            }
        }

        if let Some(first) = session.entries.first() {
            session.scene_starts.insert(first.frame);
        }
        Ok(session)
    }

    pub fn load(path: &Path, fps: f64) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read session log {}", path.display()))?;
        Self::parse(&path.display().to_string(), &contents, fps)
    }

    /// A single log file, or every `*.jsonl` under a directory played back
    /// to back. Later logs are shifted so frame indices and timestamps keep
    /// increasing, and each log starts a new scene.
    pub fn load_path(path: &Path, fps: f64) -> Result<Self> {
        if path.is_file() {
            return Self::load(path, fps);
        }
        let logs = find_session_logs(path)?;
        if logs.is_empty() {
            bail!("No *.jsonl session logs under {}", path.display());
        }
        let frame_ms = if fps > 0.0 { 1000.0 / fps } else { 1000.0 / 30.0 };
        let mut combined = Self {
            name: path.display().to_string(),
            ..Default::default()
        };
        for log in &logs {
            let session = Self::load(log, fps)?;
            combined.append(session, frame_ms);
        }
        info!(
            "Loaded {} session log(s) from {} ({} frames)",
            logs.len(),
            path.display(),
            combined.len()
        );
        Ok(combined)
    }

    fn append(&mut self, other: RecordedSession, frame_ms: f64) {
        let (frame_offset, time_offset) = match (self.entries.last(), other.entries.first()) {
            (Some(last), Some(first)) => (
                (last.frame + 1).saturating_sub(first.frame),
                last.timestamp_ms + frame_ms - first.timestamp_ms,
            ),
            _ => (0, 0.0),
        };
        if let Some(first) = other.entries.first() {
            self.scene_starts.insert(first.frame + frame_offset);
        }
        self.entries
            .extend(other.entries.into_iter().map(|e| SessionEntry {
                frame: e.frame + frame_offset,
                timestamp_ms: e.timestamp_ms + time_offset,
                dropped: e.dropped,
            }));
        self.detections.extend(
            other
                .detections
                .into_iter()
                .map(|(frame, dets)| (frame + frame_offset, dets)),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Separate the frame stream from the recorded detections.
    pub fn split(self, width: usize, height: usize) -> (ReplaySource, ReplayDetector) {
        let detector = ReplayDetector::new(Arc::new(self.detections));
        let source = ReplaySource {
            name: self.name,
            entries: self.entries,
            scene_starts: self.scene_starts,
            cursor: 0,
            opened: false,
            new_scene: false,
            width,
            height,
        };
        (source, detector)
    }
}

/// Every `*.jsonl` file under `dir`, sorted by path.
pub fn find_session_logs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("Session path {} is not a directory", dir.display());
    }
    let mut logs: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!("Skipping unreadable entry: {}", err);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("jsonl"))
        .collect();
    logs.sort();
    Ok(logs)
}

// ============================================================================
// REPLAY SOURCE
// ============================================================================

pub struct ReplaySource {
    name: String,
    entries: Vec<SessionEntry>,
    scene_starts: HashSet<u64>,
    cursor: usize,
    opened: bool,
    new_scene: bool,
    width: usize,
    height: usize,
}

impl FrameSource for ReplaySource {
    fn open(&mut self) -> bool {
        if self.entries.is_empty() {
            warn!("Session {} has no frames", self.name);
            return false;
        }
        self.opened = true;
        debug!("Session {} opened at entry {}", self.name, self.cursor);
        true
    }

    fn read(&mut self) -> ReadOutcome {
        if !self.opened {
            return ReadOutcome::Failed;
        }
        let Some(entry) = self.entries.get(self.cursor) else {
            return ReadOutcome::Ended;
        };
        self.cursor += 1;
        self.new_scene = self.cursor > 1 && self.scene_starts.contains(&entry.frame);
        if entry.dropped {
            return ReadOutcome::Failed;
        }
        ReadOutcome::Frame(Frame::blank(entry.frame, entry.timestamp_ms, self.width, self.height))
    }

    fn release(&mut self) {
        self.opened = false;
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.name)
    }

    fn is_new_scene(&self) -> bool {
        self.new_scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Detector;

    const LOG: &str = r#"
{"frame": 0, "timestamp_ms": 0.0, "detections": [{"class": "car", "confidence": 0.9, "bbox": [10, 10, 50, 30]}]}
{"frame": 1, "dropped": true}
{"frame": 2, "detections": []}
"#;

    #[test]
    fn test_replay_reads_frames_and_drops() {
        let session = RecordedSession::parse("log", LOG, 10.0).unwrap();
        assert_eq!(session.len(), 3);
        let (mut source, detector) = session.split(1280, 720);

        assert!(matches!(source.read(), ReadOutcome::Failed), "not opened yet");
        assert!(source.open());

        let ReadOutcome::Frame(f0) = source.read() else {
            panic!("expected frame 0");
        };
        assert_eq!(detector.detect(&f0).unwrap().len(), 1);
        assert!(matches!(source.read(), ReadOutcome::Failed));

        let ReadOutcome::Frame(f2) = source.read() else {
            panic!("expected frame 2");
        };
        assert_eq!(f2.timestamp_ms, 200.0, "derived from fps");
        assert!(detector.detect(&f2).unwrap().is_empty());
        assert!(matches!(source.read(), ReadOutcome::Ended));
    }

    #[test]
    fn test_out_of_order_frames_rejected() {
        let log = "{\"frame\": 3}\n{\"frame\": 2}\n";
        assert!(RecordedSession::parse("bad", log, 30.0).is_err());
    }

    #[test]
    fn test_directory_sessions_play_back_to_back() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.jsonl"), "{\"frame\": 0}\n{\"frame\": 1}\n").unwrap();
        fs::create_dir(tmp.path().join("day2")).unwrap();
        fs::write(tmp.path().join("day2/b.jsonl"), "{\"frame\": 0}\n{\"frame\": 1}\n").unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let session = RecordedSession::load_path(tmp.path(), 10.0).unwrap();
        assert_eq!(session.len(), 4);

        let (mut source, _) = session.split(640, 480);
        source.open();
        let mut indices = Vec::new();
        let mut scene_breaks = Vec::new();
        while let ReadOutcome::Frame(f) = source.read() {
            if source.is_new_scene() {
                scene_breaks.push(f.index);
            }
            indices.push(f.index);
        }
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(scene_breaks, vec![2]);
    }
}
