// src/clip_writer.rs
//
// Persists finalized clips for the classification side:
//
//   <clip_dir>/<clip_id>/frame_00042.jpg   (frames captured with imagery)
//   <clip_dir>/<clip_id>/metadata.json
//
// Frames arrive already JPEG-encoded by the recorder. Blocking file I/O;
// callers run it off the pipeline thread.

use crate::clip::FinalizedClip;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ClipWriter {
    root: PathBuf,
}

impl ClipWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write one clip and return its directory.
    pub fn write(&self, clip: &FinalizedClip) -> Result<PathBuf> {
        let dir = self.root.join(clip.clip_id.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create clip directory {}", dir.display()))?;

        let mut written = 0usize;
        for frame in &clip.frames {
            let Some(jpeg) = &frame.jpeg else {
                continue;
            };
            let path = dir.join(format!("frame_{:05}.jpg", frame.index));
            fs::write(&path, jpeg).with_context(|| format!("Failed to write {}", path.display()))?;
            written += 1;
        }

        write_metadata(&dir, clip)?;
        info!(
            "💾 Clip {} written to {} ({} image(s), {} frame(s) total)",
            clip.clip_id,
            dir.display(),
            written,
            clip.frames.len()
        );
        Ok(dir)
    }
}

fn write_metadata(dir: &Path, clip: &FinalizedClip) -> Result<()> {
    let path = dir.join("metadata.json");
    let json = serde_json::to_string_pretty(&clip.metadata()).context("Failed to serialize clip metadata")?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Metadata written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::incident_detector::ConfirmedIncident;
    use crate::clip::ClipId;
    use crate::incident_recorder::{EndReason, LayerCounters};
    use crate::frame_buffer::{CapturedFrame, FrameEncoder};
    use crate::types::{CollisionKind, Frame, FrameRange, IncidentType, Severity, Vec2};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn clip(frames: Vec<Arc<CapturedFrame>>) -> FinalizedClip {
        let kind = IncidentType::Collision(CollisionKind::HeadOn);
        let incident = ConfirmedIncident::new(
            kind,
            Severity::High,
            0.9,
            &[(1, Vec2::new(10.0, 10.0)), (2, Vec2::new(20.0, 10.0))],
            FrameRange { first: 0, last: 1 },
            33.0,
        );
        FinalizedClip {
            clip_id: ClipId::new("cam-9", Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap(), kind),
            incident,
            frame_range: FrameRange { first: 0, last: frames.len().saturating_sub(1) as u64 },
            frames,
            end_reason: EndReason::Quiescent,
            counters: LayerCounters::default(),
            reconfirmations: 2,
        }
    }

    #[test]
    fn test_writes_frames_and_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let encoder = FrameEncoder::new(80);
        let frames: Vec<Arc<CapturedFrame>> = (0..3u64)
            .map(|i| {
                Arc::new(encoder.capture(&Frame {
                    index: i,
                    timestamp_ms: i as f64 * 33.0,
                    width: 8,
                    height: 6,
                    data: vec![128u8; 8 * 6 * 3],
                }))
            })
            .collect();
        let expected = frames[1].jpeg.clone().unwrap();
        let writer = ClipWriter::new(tmp.path());
        let dir = writer.write(&clip(frames)).unwrap();

        assert!(dir.ends_with("cam-9_20260203T040506.000Z_collision-head-on"));
        for i in 0..3 {
            assert!(dir.join(format!("frame_{:05}.jpg", i)).exists());
        }
        assert_eq!(fs::read(dir.join("frame_00001.jpg")).unwrap(), expected);

        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["incident_type"], "collision-head-on");
        assert_eq!(meta["severity"], "high");
        assert_eq!(meta["vehicles_involved"], 2);
        assert_eq!(meta["frame_count"], 3);
        assert_eq!(meta["end_reason"], "quiescent");
        assert_eq!(meta["reconfirmations"], 2);
    }

    #[test]
    fn test_replayed_frames_write_metadata_only() {
        let tmp = tempfile::tempdir().unwrap();
        let frames = vec![Arc::new(FrameEncoder::new(85).capture(&Frame::blank(0, 0.0, 1280, 720)))];
        let dir = ClipWriter::new(tmp.path()).write(&clip(frames)).unwrap();

        let files: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1, "only metadata.json");
        assert!(dir.join("metadata.json").exists());
    }
}
