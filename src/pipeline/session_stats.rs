// src/pipeline/session_stats.rs
//
// Per-pipeline session statistics. Owned by exactly one pipeline instance
// and mutated only from its thread, so plain counters suffice. Starting a
// new session replaces the struct wholesale via `reset`.

use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub frames_with_objects: u64,
    pub detections: u64,
    pub detector_errors: u64,
    pub pairs_evaluated: u64,
    pub layer_skips: u64,
    pub candidates: u64,
    pub incidents_confirmed: u64,
    pub recordings_started: u64,
    pub recordings_suppressed: u64,
    pub clips_finalized: u64,
    pub reconnects: u64,
    pub scene_changes: u64,
    pub peak_active_tracks: usize,
    pub started_at: Instant,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            frames_processed: 0,
            frames_failed: 0,
            frames_with_objects: 0,
            detections: 0,
            detector_errors: 0,
            pairs_evaluated: 0,
            layer_skips: 0,
            candidates: 0,
            incidents_confirmed: 0,
            recordings_started: 0,
            recordings_suppressed: 0,
            clips_finalized: 0,
            reconnects: 0,
            scene_changes: 0,
            peak_active_tracks: 0,
            started_at: Instant::now(),
        }
    }

    /// Consume this session and return a fresh one.
    pub fn reset(self) -> Self {
        Self::new()
    }

    pub fn observe_tracks(&mut self, active: usize) {
        self.peak_active_tracks = self.peak_active_tracks.max(active);
    }

    pub fn fps(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            self.frames_processed as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            frames_processed: self.frames_processed,
            frames_failed: self.frames_failed,
            frames_with_objects: self.frames_with_objects,
            detections: self.detections,
            detector_errors: self.detector_errors,
            pairs_evaluated: self.pairs_evaluated,
            layer_skips: self.layer_skips,
            candidates: self.candidates,
            incidents_confirmed: self.incidents_confirmed,
            recordings_started: self.recordings_started,
            recordings_suppressed: self.recordings_suppressed,
            clips_finalized: self.clips_finalized,
            reconnects: self.reconnects,
            scene_changes: self.scene_changes,
            peak_active_tracks: self.peak_active_tracks,
            fps: self.fps(),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub frames_with_objects: u64,
    pub detections: u64,
    pub detector_errors: u64,
    pub pairs_evaluated: u64,
    pub layer_skips: u64,
    pub candidates: u64,
    pub incidents_confirmed: u64,
    pub recordings_started: u64,
    pub recordings_suppressed: u64,
    pub clips_finalized: u64,
    pub reconnects: u64,
    pub scene_changes: u64,
    pub peak_active_tracks: usize,
    pub fps: f64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_returns_fresh_session() {
        let mut stats = SessionStats::new();
        stats.frames_processed = 42;
        stats.clips_finalized = 2;
        stats.observe_tracks(7);
        stats.observe_tracks(3);
        assert_eq!(stats.peak_active_tracks, 7);

        let fresh = stats.reset();
        let summary = fresh.summary();
        assert_eq!(summary.frames_processed, 0);
        assert_eq!(summary.clips_finalized, 0);
        assert_eq!(summary.peak_active_tracks, 0);
    }
}
