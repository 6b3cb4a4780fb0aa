// src/analysis/object_tracker.rs
//
// Centroid-distance multi-object tracker for fixed traffic cameras.
// Keeps a stable identity per physical object and a bounded history of
// (position, size, timestamp) samples used by the incident layers.
//
// Design:
//   - Greedy nearest-neighbour matching (sufficient for <50 objects per frame)
//   - Class agreement preferred through a distance penalty; people never
//     match vehicle tracks and vice versa
//   - Tracks coast through short detection gaps and are retired on their
//     `miss_tolerance`-th consecutive miss, so the table cannot grow without bound
//   - Identities are monotonically increasing and never reused

use crate::types::{BoundingBox, Detection, ObjectClass, Vec2};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum centroid jump between frames, as a fraction of frame width
    pub max_match_distance_ratio: f32,
    /// Distance multiplier applied when detection and track classes differ
    pub class_mismatch_penalty: f32,
    /// Consecutive missed frames after which a track is retired
    pub miss_tolerance: u32,
    /// Samples kept per track, oldest evicted first
    pub history_capacity: usize,
    /// Detections below this confidence are ignored
    pub min_confidence: f32,
    /// Position variance (px^2) over a full history window under which a
    /// track counts as stationary
    pub stationary_variance_px2: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_match_distance_ratio: 0.08, // ~100px at 1280 wide
            class_mismatch_penalty: 1.5,
            miss_tolerance: 5,
            history_capacity: 30, // 1s at 30fps
            min_confidence: 0.25,
            stationary_variance_px2: 4.0,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.miss_tolerance == 0 {
            bail!("tracker.miss_tolerance must be at least 1");
        }
        if self.history_capacity < 3 {
            bail!("tracker.history_capacity must be at least 3");
        }
        if !(self.max_match_distance_ratio > 0.0) {
            bail!("tracker.max_match_distance_ratio must be positive");
        }
        if self.class_mismatch_penalty < 1.0 {
            bail!("tracker.class_mismatch_penalty must be >= 1.0");
        }
        Ok(())
    }
}

// ============================================================================
// TRACK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSample {
    pub center: Vec2,
    pub width: f32,
    pub height: f32,
    pub timestamp_ms: f64,
    pub frame_index: u64,
}

impl TrackSample {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub class: ObjectClass,
    pub bbox: BoundingBox,
    pub last_seen_frame: u64,
    /// Consecutive frames without a matching detection
    pub misses: u32,
    /// Total frames this track was matched
    pub hits: u32,
    class_confidence: f32,
    history: VecDeque<TrackSample>,
    capacity: usize,
    stationary_since_ms: Option<f64>,
}

impl Track {
    fn new(id: u64, det: &Detection, frame_index: u64, timestamp_ms: f64, capacity: usize) -> Self {
        let mut track = Self {
            id,
            class: det.class,
            bbox: det.bbox,
            last_seen_frame: frame_index,
            misses: 0,
            hits: 0,
            class_confidence: det.confidence,
            history: VecDeque::with_capacity(capacity),
            capacity,
            stationary_since_ms: None,
        };
        track.push_sample(det, frame_index, timestamp_ms);
        track
    }

    pub fn position(&self) -> Vec2 {
        self.history
            .back()
            .map(|s| s.center)
            .unwrap_or_else(|| self.bbox.center())
    }

    pub fn class_confidence(&self) -> f32 {
        self.class_confidence
    }

    /// Samples in chronological order (oldest first)
    pub fn history(&self) -> &VecDeque<TrackSample> {
        &self.history
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn has_full_history(&self) -> bool {
        self.history.len() >= self.capacity
    }

    pub fn first_sample_frame(&self) -> u64 {
        self.history
            .front()
            .map(|s| s.frame_index)
            .unwrap_or(self.last_seen_frame)
    }

    /// Velocity (px/s) between the samples `back + 1` and `back` positions
    /// from the newest. `velocity_at(0)` is the latest estimate.
    pub fn velocity_at(&self, back: usize) -> Option<Vec2> {
        let n = self.history.len();
        if n < back + 2 {
            return None;
        }
        let newer = &self.history[n - 1 - back];
        let older = &self.history[n - 2 - back];
        let dt_s = ((newer.timestamp_ms - older.timestamp_ms) / 1000.0) as f32;
        if !(dt_s > 0.0) {
            return None;
        }
        let v = (newer.center - older.center) * (1.0 / dt_s);
        v.is_finite().then_some(v)
    }

    pub fn velocity(&self) -> Option<Vec2> {
        self.velocity_at(0)
    }

    pub fn speed(&self) -> Option<f32> {
        self.velocity().map(Vec2::norm)
    }

    /// Second difference of position (px/s^2)
    pub fn acceleration(&self) -> Option<Vec2> {
        let n = self.history.len();
        let v_new = self.velocity_at(0)?;
        let v_old = self.velocity_at(1)?;
        let dt_ms = (self.history[n - 1].timestamp_ms - self.history[n - 3].timestamp_ms) * 0.5;
        let dt_s = (dt_ms / 1000.0) as f32;
        if !(dt_s > 0.0) {
            return None;
        }
        Some((v_new - v_old) * (1.0 / dt_s))
    }

    /// Area now divided by area `window` samples ago (>1 = growing / approaching)
    pub fn area_ratio(&self, window: usize) -> Option<f32> {
        let n = self.history.len();
        if window == 0 || n < window + 1 {
            return None;
        }
        let old = self.history[n - 1 - window].area();
        let new = self.history[n - 1].area();
        if old <= 0.0 {
            return None;
        }
        Some(new / old)
    }

    /// Mean squared distance of the history positions to their centroid (px^2)
    pub fn position_variance(&self) -> f32 {
        let n = self.history.len();
        if n < 2 {
            return 0.0;
        }
        let sum = self
            .history
            .iter()
            .fold(Vec2::ZERO, |acc, s| acc + s.center);
        let mean = sum * (1.0 / n as f32);
        self.history
            .iter()
            .map(|s| {
                let d = s.center - mean;
                d.dot(d)
            })
            .sum::<f32>()
            / n as f32
    }

    pub fn is_stationary(&self) -> bool {
        self.stationary_since_ms.is_some()
    }

    /// How long the track has been continuously stationary at `now_ms`
    pub fn stationary_duration_ms(&self, now_ms: f64) -> Option<f64> {
        self.stationary_since_ms.map(|since| (now_ms - since).max(0.0))
    }

    fn push_sample(&mut self, det: &Detection, frame_index: u64, timestamp_ms: f64) {
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(TrackSample {
            center: det.center(),
            width: det.bbox.width,
            height: det.bbox.height,
            timestamp_ms,
            frame_index,
        });
        self.bbox = det.bbox;
        self.last_seen_frame = frame_index;
        self.misses = 0;
        self.hits += 1;
    }

    fn update_with_detection(
        &mut self,
        det: &Detection,
        frame_index: u64,
        timestamp_ms: f64,
        stationary_variance_px2: f32,
    ) {
        self.push_sample(det, frame_index, timestamp_ms);

        if det.class == self.class {
            self.class_confidence = self.class_confidence.max(det.confidence);
        } else if det.confidence > self.class_confidence {
            info!(
                "Track {} reclassified {} -> {} (conf {:.2} > {:.2})",
                self.id,
                self.class.as_str(),
                det.class.as_str(),
                det.confidence,
                self.class_confidence
            );
            self.class = det.class;
            self.class_confidence = det.confidence;
        }

        // Stationarity is judged over a full window only
        if self.has_full_history() && self.position_variance() < stationary_variance_px2 {
            if self.stationary_since_ms.is_none() {
                let since = self
                    .history
                    .front()
                    .map(|s| s.timestamp_ms)
                    .unwrap_or(timestamp_ms);
                debug!("Track {} stationary since {:.0}ms", self.id, since);
                self.stationary_since_ms = Some(since);
            }
        } else {
            self.stationary_since_ms = None;
        }
    }

    fn mark_missed(&mut self) {
        self.misses += 1;
    }
}

/// People and vehicles never swap identities; vehicle classes may flicker.
fn classes_compatible(a: ObjectClass, b: ObjectClass) -> bool {
    a.is_vehicle() == b.is_vehicle()
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct ObjectTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
    max_match_distance: f32,
    dropped_last_update: usize,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig, frame_width: f32) -> Self {
        let max_match_distance = frame_width * config.max_match_distance_ratio;
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
            max_match_distance,
            dropped_last_update: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Process one frame of detections. Returns the active tracks after retirement.
    ///
    /// An empty slice is a valid frame with no objects: every track accrues a miss.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame_index: u64,
        timestamp_ms: f64,
    ) -> &[Track] {
        let mut dropped = 0usize;
        let valid: Vec<&Detection> = detections
            .iter()
            .filter(|d| {
                if d.bbox.is_degenerate() {
                    warn!(
                        "Dropping degenerate {} detection at frame {}: {:?}",
                        d.class.as_str(),
                        frame_index,
                        d.bbox
                    );
                    dropped += 1;
                    return false;
                }
                if !(d.confidence >= self.config.min_confidence) {
                    debug!(
                        "Ignoring low-confidence {} ({:.2})",
                        d.class.as_str(),
                        d.confidence
                    );
                    return false;
                }
                true
            })
            .collect();
        self.dropped_last_update = dropped;

        // ── Greedy association: cheapest pairs first ──
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; valid.len()];

        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            let last = track.position();
            for (di, det) in valid.iter().enumerate() {
                if !classes_compatible(track.class, det.class) {
                    continue;
                }
                let dist = last.distance(det.center());
                if dist > self.max_match_distance {
                    continue;
                }
                let cost = if track.class == det.class {
                    dist
                } else {
                    dist * self.config.class_mismatch_penalty
                };
                pairs.push((ti, di, cost));
            }
        }
        pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, cost) in &pairs {
            if matched_tracks[*ti] || matched_dets[*di] {
                continue;
            }
            matched_tracks[*ti] = true;
            matched_dets[*di] = true;
            debug!(
                "Track {} <- det (cost={:.1}px, class={})",
                self.tracks[*ti].id,
                cost,
                valid[*di].class.as_str()
            );
            self.tracks[*ti].update_with_detection(
                valid[*di],
                frame_index,
                timestamp_ms,
                self.config.stationary_variance_px2,
            );
        }

        for (ti, matched) in matched_tracks.iter().enumerate() {
            if !matched {
                self.tracks[ti].mark_missed();
            }
        }

        for (di, matched) in matched_dets.iter().enumerate() {
            if !matched {
                let track = Track::new(
                    self.next_id,
                    valid[di],
                    frame_index,
                    timestamp_ms,
                    self.config.history_capacity,
                );
                info!(
                    "New track T{}: class={}, center=({:.0},{:.0})",
                    track.id,
                    track.class.as_str(),
                    track.position().x,
                    track.position().y
                );
                self.next_id += 1;
                self.tracks.push(track);
            }
        }

        self.retire();
        &self.tracks
    }

    /// Advance one frame without any observation (failed frame read).
    pub fn coast(&mut self) -> &[Track] {
        self.dropped_last_update = 0;
        for track in &mut self.tracks {
            track.mark_missed();
        }
        self.retire();
        &self.tracks
    }

    fn retire(&mut self) {
        let tolerance = self.config.miss_tolerance;
        self.tracks.retain(|t| {
            if t.misses >= tolerance {
                info!(
                    "Track T{} retired after {} missed frames ({} hits)",
                    t.id, t.misses, t.hits
                );
                return false;
            }
            true
        });
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    /// Number of identities handed out so far
    pub fn tracks_created(&self) -> u64 {
        self.next_id - 1
    }

    /// Degenerate detections dropped during the most recent update
    pub fn dropped_last_update(&self) -> usize {
        self.dropped_last_update
    }

    /// Forget all tracks. Identities keep increasing so none is ever reused.
    pub fn reset(&mut self) {
        info!("Tracker reset ({} tracks dropped)", self.tracks.len());
        self.tracks.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
