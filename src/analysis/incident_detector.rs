// src/analysis/incident_detector.rs
//
// Multi-layer incident detector.
//
// Evaluated statelessly every frame from the tracker's live tracks:
//
//   1. Collision pairs: the four layers are scored for every nearby pair and
//      fused. Confirmed pairs that share tracks are merged into one incident
//      per connected component (multi-vehicle pile-ups report once).
//   2. Stopped vehicle: a stationary vehicle past its dwell time while other
//      traffic nearby keeps moving.
//   3. Pedestrian on road: a person track inside the roadway polygon.
//   4. Speed anomaly: a vehicle far faster than the rest of the traffic.
//
// Rules 2-4 run against the track set directly and are not fused.

use crate::analysis::features::PairFeatures;
use crate::analysis::fusion::{self, FusionConfig, FusionResult, PairStage};
use crate::analysis::layers::{LayerConfig, LayerKind, LayerReport};
use crate::analysis::object_tracker::Track;
use crate::analysis::roadway::Roadway;
use crate::types::{CollisionKind, FrameRange, IncidentType, ObjectClass, Severity, Vec2};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppedVehicleConfig {
    pub enabled: bool,
    /// Seconds a vehicle must be stationary before it is reported
    pub dwell_s: f64,
    /// A neighbour at or above this speed (px/s) counts as moving traffic
    pub moving_speed_px_s: f32,
    /// Radius searched for moving traffic, as a fraction of frame width
    pub surrounding_radius_ratio: f32,
}

impl Default for StoppedVehicleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dwell_s: 8.0,
            moving_speed_px_s: 30.0,
            surrounding_radius_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PedestrianConfig {
    pub enabled: bool,
    /// Matched frames before a person track is trusted
    pub min_hits: u32,
}

impl Default for PedestrianConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_hits: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedAnomalyConfig {
    pub enabled: bool,
    pub min_speed_px_s: f32,
    /// Multiple of the median traffic speed that counts as anomalous
    pub median_factor: f32,
    /// Other moving vehicles needed before a median is meaningful
    pub min_reference_tracks: usize,
}

impl Default for SpeedAnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_speed_px_s: 400.0,
            median_factor: 2.5,
            min_reference_tracks: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    pub layers: LayerConfig,
    pub fusion: FusionConfig,
    /// Pairs further apart than this (fraction of frame width) are not evaluated
    pub pair_search_radius_ratio: f32,
    pub stopped_vehicle: StoppedVehicleConfig,
    pub pedestrian: PedestrianConfig,
    pub speed_anomaly: SpeedAnomalyConfig,
}

impl IncidentConfig {
    pub fn validate(&self) -> Result<()> {
        self.fusion.validate()?;
        let l = &self.layers;
        if !(l.lookahead_s > 0.0) {
            bail!("incident.layers.lookahead_s must be positive");
        }
        if l.depth_window == 0 {
            bail!("incident.layers.depth_window must be at least 1");
        }
        if !(l.max_speed_change_ratio > 0.0 && l.max_speed_change_ratio < 1.0) {
            bail!("incident.layers.max_speed_change_ratio must lie in (0, 1)");
        }
        if !(l.max_heading_change_deg > 0.0 && l.max_heading_change_deg < 180.0) {
            bail!("incident.layers.max_heading_change_deg must lie in (0, 180)");
        }
        if !(self.pair_search_radius_ratio > 0.0) {
            bail!("incident.pair_search_radius_ratio must be positive");
        }
        if !(self.stopped_vehicle.dwell_s > 0.0) {
            bail!("incident.stopped_vehicle.dwell_s must be positive");
        }
        if !(self.speed_anomaly.median_factor > 1.0) {
            bail!("incident.speed_anomaly.median_factor must be greater than 1");
        }
        Ok(())
    }
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            layers: LayerConfig::default(),
            fusion: FusionConfig::default(),
            pair_search_radius_ratio: 0.35,
            stopped_vehicle: StoppedVehicleConfig::default(),
            pedestrian: PedestrianConfig::default(),
            speed_anomaly: SpeedAnomalyConfig::default(),
        }
    }
}

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// One layer agreeing on one pair in one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentCandidate {
    pub track_ids: (u64, u64),
    pub signal: LayerKind,
    pub confidence: f32,
    pub frame_index: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairAssessment {
    pub track_a: u64,
    pub track_b: u64,
    pub layers: LayerReport,
    pub fusion: FusionResult,
    pub features: PairFeatures,
}

impl PairAssessment {
    pub fn stage(&self) -> PairStage {
        self.fusion.stage
    }
}

/// Sealed result of one confirmation. Fields are read-only once built.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmedIncident {
    incident_type: IncidentType,
    severity: Severity,
    confidence: f32,
    track_ids: Vec<u64>,
    positions: Vec<Vec2>,
    location: Vec2,
    frame_index: u64,
    timestamp_ms: f64,
    evidence: FrameRange,
}

impl ConfirmedIncident {
    /// `evidence.last` is the confirming frame.
    pub fn new(
        incident_type: IncidentType,
        severity: Severity,
        confidence: f32,
        involved: &[(u64, Vec2)],
        evidence: FrameRange,
        timestamp_ms: f64,
    ) -> Self {
        let positions: Vec<Vec2> = involved.iter().map(|(_, p)| *p).collect();
        let location = if positions.is_empty() {
            Vec2::ZERO
        } else {
            positions.iter().fold(Vec2::ZERO, |acc, p| acc + *p) * (1.0 / positions.len() as f32)
        };
        Self {
            incident_type,
            severity,
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            track_ids: involved.iter().map(|(id, _)| *id).collect(),
            positions,
            location,
            frame_index: evidence.last,
            timestamp_ms,
            evidence,
        }
    }

    pub fn incident_type(&self) -> IncidentType {
        self.incident_type
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Vehicles (and people) involved
    pub fn vehicles_involved(&self) -> usize {
        self.track_ids.len()
    }

    pub fn track_ids(&self) -> &[u64] {
        &self.track_ids
    }

    pub fn positions(&self) -> &[Vec2] {
        &self.positions
    }

    /// Centroid of the involved tracks, the key for spatial dedup
    pub fn location(&self) -> Vec2 {
        self.location
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.timestamp_ms
    }

    /// Frames that carry the evidence: earliest involved history sample
    /// through the confirming frame
    pub fn evidence(&self) -> FrameRange {
        self.evidence
    }

    pub fn describe(&self) -> String {
        format!(
            "{} involving {} object(s), severity {}, confidence {:.2}",
            self.incident_type.label(),
            self.vehicles_involved(),
            self.severity,
            self.confidence
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Assessment {
    pub frame_index: u64,
    pub timestamp_ms: f64,
    pub pairs: Vec<PairAssessment>,
    pub candidates: Vec<IncidentCandidate>,
    pub incidents: Vec<ConfirmedIncident>,
}

impl Assessment {
    pub fn empty(frame_index: u64, timestamp_ms: f64) -> Self {
        Self {
            frame_index,
            timestamp_ms,
            ..Default::default()
        }
    }

    /// Any layer agreeing on any pair this frame
    pub fn has_layer_activity(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Track ids on pairs with at least one agreeing layer
    pub fn active_track_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.candidates
            .iter()
            .flat_map(|c| [c.track_ids.0, c.track_ids.1])
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct IncidentDetector {
    config: IncidentConfig,
    frame_width: f32,
    roadway: Option<Roadway>,
}

impl IncidentDetector {
    pub fn new(config: IncidentConfig, frame_width: f32, roadway: Option<Roadway>) -> Self {
        Self {
            config,
            frame_width,
            roadway,
        }
    }

    pub fn config(&self) -> &IncidentConfig {
        &self.config
    }

    pub fn evaluate(&self, tracks: &[Track], frame_index: u64, timestamp_ms: f64) -> Assessment {
        let mut assessment = Assessment::empty(frame_index, timestamp_ms);

        // Coasting tracks carry a stale position; only this frame's matches take part
        let live: Vec<&Track> = tracks.iter().filter(|t| t.misses == 0).collect();

        self.evaluate_pairs(&live, &mut assessment);
        self.confirm_collisions(&live, &mut assessment);

        if self.config.stopped_vehicle.enabled {
            self.check_stopped_vehicles(&live, &mut assessment);
        }
        if self.config.pedestrian.enabled {
            self.check_pedestrians(&live, &mut assessment);
        }
        if self.config.speed_anomaly.enabled {
            self.check_speed_anomalies(&live, &mut assessment);
        }

        for incident in &assessment.incidents {
            info!(
                "Frame {}: CONFIRMED {} tracks={:?}",
                frame_index,
                incident.describe(),
                incident.track_ids()
            );
        }
        assessment
    }

    fn evaluate_pairs(&self, live: &[&Track], out: &mut Assessment) {
        let radius = self.config.pair_search_radius_ratio * self.frame_width;
        let cfg = &self.config;

        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                if a.class == ObjectClass::Person && b.class == ObjectClass::Person {
                    continue;
                }
                if a.position().distance(b.position()) > radius {
                    continue;
                }

                let layers = LayerReport::evaluate(a, b, &cfg.layers);
                let fusion = fusion::fuse(&layers, &cfg.fusion);

                for (kind, outcome) in layers.iter() {
                    if outcome.agrees(cfg.fusion.agreement_threshold) {
                        out.candidates.push(IncidentCandidate {
                            track_ids: (a.id, b.id),
                            signal: kind,
                            confidence: outcome.confidence(),
                            frame_index: out.frame_index,
                        });
                    }
                }

                if fusion.stage != PairStage::None {
                    debug!(
                        "Pair T{}/T{}: traj={:.2} close={:.2} depth={:.2} motion={:.2} -> {:.2} {:?}",
                        a.id,
                        b.id,
                        layers.trajectory.confidence(),
                        layers.closing_speed.confidence(),
                        layers.depth.confidence(),
                        layers.motion_anomaly.confidence(),
                        fusion.score,
                        fusion.stage
                    );
                }

                let features =
                    PairFeatures::compute(a, b, &layers, &fusion, &cfg.layers, out.frame_index);
                out.pairs.push(PairAssessment {
                    track_a: a.id,
                    track_b: b.id,
                    layers,
                    fusion,
                    features,
                });
            }
        }
    }

    /// One incident per connected component of confirmed pairs.
    fn confirm_collisions(&self, live: &[&Track], out: &mut Assessment) {
        let confirmed: Vec<&PairAssessment> =
            out.pairs.iter().filter(|p| p.fusion.confirmed).collect();
        if confirmed.is_empty() {
            return;
        }

        let mut components = Components::default();
        for pair in &confirmed {
            components.union(pair.track_a, pair.track_b);
        }

        // Best pair per component root
        let mut best: HashMap<u64, &PairAssessment> = HashMap::new();
        for pair in confirmed.iter().copied() {
            let root = components.find(pair.track_a);
            best.entry(root)
                .and_modify(|current| {
                    if pair.fusion.score > current.fusion.score {
                        *current = pair;
                    }
                })
                .or_insert(pair);
        }

        let mut roots: Vec<u64> = best.keys().copied().collect();
        roots.sort_unstable();

        let mut incidents = Vec::with_capacity(roots.len());
        for root in roots {
            let Some(pair) = best.get(&root) else {
                continue;
            };
            let mut ids = components.members(root);
            ids.sort_unstable();
            let involved: Vec<&Track> = live
                .iter()
                .copied()
                .filter(|t| ids.binary_search(&t.id).is_ok())
                .collect();
            let (Some(a), Some(b)) = (
                live.iter().find(|t| t.id == pair.track_a),
                live.iter().find(|t| t.id == pair.track_b),
            ) else {
                continue;
            };

            let incident_type = self.classify_pair(a, b);
            let severity = fusion::severity_for(pair.fusion.score, involved.len(), &self.config.fusion);
            incidents.push(build_incident(
                incident_type,
                severity,
                pair.fusion.score,
                &involved,
                out.frame_index,
                out.timestamp_ms,
            ));
        }
        out.incidents.extend(incidents);
    }

    /// Collision subtype from pre-impact headings, or near-miss when the
    /// boxes never got within contact tolerance.
    pub fn classify_pair(&self, a: &Track, b: &Track) -> IncidentType {
        let tolerance =
            self.config.layers.contact_tolerance_ratio * (a.bbox.width + b.bbox.width) * 0.5;
        let touched = a.bbox.iou(&b.bbox) > 0.0 || a.bbox.edge_gap(&b.bbox) <= tolerance;
        if !touched {
            return IncidentType::NearMiss;
        }

        let pre_impact = |t: &Track| t.velocity_at(1).or_else(|| t.velocity());
        let angle = match (pre_impact(a), pre_impact(b)) {
            (Some(va), Some(vb)) => va.angle_to(vb).map(f32::to_degrees),
            _ => None,
        };

        match angle {
            Some(deg) if deg > 150.0 => IncidentType::Collision(CollisionKind::HeadOn),
            Some(deg) if deg < 35.0 => IncidentType::Collision(CollisionKind::RearEnd),
            Some(_) => IncidentType::Collision(CollisionKind::SideImpact),
            // A standing party has no heading
            None => IncidentType::Collision(CollisionKind::SideImpact),
        }
    }

    fn check_stopped_vehicles(&self, live: &[&Track], out: &mut Assessment) {
        let cfg = &self.config.stopped_vehicle;
        let dwell_ms = cfg.dwell_s * 1000.0;
        let radius = cfg.surrounding_radius_ratio * self.frame_width;

        for track in live.iter().filter(|t| t.class.is_vehicle()) {
            let Some(stopped_ms) = track.stationary_duration_ms(out.timestamp_ms) else {
                continue;
            };
            if stopped_ms < dwell_ms {
                continue;
            }

            let traffic_moving = live.iter().any(|other| {
                other.id != track.id
                    && other.class.is_vehicle()
                    && other.position().distance(track.position()) <= radius
                    && other.speed().is_some_and(|s| s >= cfg.moving_speed_px_s)
            });
            if !traffic_moving {
                // Everyone stopped: congestion or a red light, not an incident
                continue;
            }

            let confidence = (0.5 + 0.5 * ((stopped_ms - dwell_ms) / dwell_ms) as f32).min(1.0);
            out.incidents.push(build_incident(
                IncidentType::StoppedVehicle,
                Severity::Medium,
                confidence,
                &[*track],
                out.frame_index,
                out.timestamp_ms,
            ));
        }
    }

    fn check_pedestrians(&self, live: &[&Track], out: &mut Assessment) {
        let Some(roadway) = &self.roadway else {
            return;
        };
        let min_hits = self.config.pedestrian.min_hits;

        for track in live.iter().filter(|t| t.class == ObjectClass::Person) {
            if track.hits < min_hits {
                continue;
            }
            // Feet, not torso: the box centre of a person near the kerb often
            // projects onto the road surface
            let feet = Vec2::new(track.bbox.x + track.bbox.width * 0.5, track.bbox.bottom());
            if !roadway.contains(feet) {
                continue;
            }
            out.incidents.push(build_incident(
                IncidentType::PedestrianOnRoad,
                Severity::Medium,
                track.class_confidence().clamp(0.0, 1.0),
                &[*track],
                out.frame_index,
                out.timestamp_ms,
            ));
        }
    }

    fn check_speed_anomalies(&self, live: &[&Track], out: &mut Assessment) {
        let cfg = &self.config.speed_anomaly;
        let moving_floor = self.config.stopped_vehicle.moving_speed_px_s;

        let speeds: Vec<(&Track, f32)> = live
            .iter()
            .filter(|t| t.class.is_vehicle())
            .filter_map(|t| t.speed().map(|s| (*t, s)))
            .filter(|(_, s)| *s >= moving_floor)
            .collect();

        for (track, speed) in &speeds {
            if *speed < cfg.min_speed_px_s {
                continue;
            }
            let mut reference: Vec<f32> = speeds
                .iter()
                .filter(|(other, _)| other.id != track.id)
                .map(|(_, s)| *s)
                .collect();
            if reference.len() < cfg.min_reference_tracks.max(1) {
                continue;
            }
            let median = median(&mut reference);
            if !(median > 0.0) {
                continue;
            }
            let ratio = speed / median;
            if ratio < cfg.median_factor {
                continue;
            }
            let confidence =
                (0.5 + 0.5 * (ratio - cfg.median_factor) / cfg.median_factor).min(1.0);
            out.incidents.push(build_incident(
                IncidentType::SpeedAnomaly,
                Severity::Low,
                confidence,
                &[*track],
                out.frame_index,
                out.timestamp_ms,
            ));
        }
    }
}

fn build_incident(
    incident_type: IncidentType,
    severity: Severity,
    confidence: f32,
    tracks: &[&Track],
    frame_index: u64,
    timestamp_ms: f64,
) -> ConfirmedIncident {
    let involved: Vec<(u64, Vec2)> = tracks.iter().map(|t| (t.id, t.position())).collect();
    let first = tracks
        .iter()
        .map(|t| t.first_sample_frame())
        .min()
        .unwrap_or(frame_index);
    let evidence = FrameRange {
        first: first.min(frame_index),
        last: frame_index,
    };
    ConfirmedIncident::new(incident_type, severity, confidence, &involved, evidence, timestamp_ms)
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) * 0.5
    }
}

/// Union-find over track ids.
#[derive(Default)]
struct Components {
    parent: HashMap<u64, u64>,
}

impl Components {
    fn find(&mut self, id: u64) -> u64 {
        let parent = *self.parent.entry(id).or_insert(id);
        if parent == id {
            return id;
        }
        let root = self.find(parent);
        self.parent.insert(id, root);
        root
    }

    fn union(&mut self, a: u64, b: u64) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Smaller id as root keeps component order stable
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(child, root);
        }
    }

    fn members(&mut self, root: u64) -> Vec<u64> {
        let ids: Vec<u64> = self.parent.keys().copied().collect();
        ids.into_iter().filter(|id| self.find(*id) == root).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::object_tracker::{ObjectTracker, TrackerConfig};
    use crate::types::{BoundingBox, Detection};

    const FRAME_MS: f64 = 1000.0 / 30.0;

    fn detector() -> IncidentDetector {
        IncidentDetector::new(IncidentConfig::default(), 1280.0, None)
    }

    fn car(x: f32, y: f32) -> Detection {
        Detection::new(ObjectClass::Car, 0.9, BoundingBox::centered(Vec2::new(x, y), 50.0, 30.0))
    }

    /// Runs frames through a tracker + detector, returning every assessment.
    fn drive(detector: &IncidentDetector, frames: &[Vec<Detection>]) -> Vec<Assessment> {
        let mut tracker = ObjectTracker::new(TrackerConfig::default(), 1280.0);
        frames
            .iter()
            .enumerate()
            .map(|(i, dets)| {
                let ts = i as f64 * FRAME_MS;
                let tracks = tracker.update(dets, i as u64, ts);
                detector.evaluate(tracks, i as u64, ts)
            })
            .collect()
    }

    #[test]
    fn test_head_on_pair_confirms_by_fourth_frame() {
        let frames: Vec<Vec<Detection>> = (0..4)
            .map(|i| {
                let step = 20.0 * i as f32;
                vec![car(80.0 + step, 100.0), car(220.0 - step, 100.0)]
            })
            .collect();
        let results = drive(&detector(), &frames);

        let first = results
            .iter()
            .position(|a| !a.incidents.is_empty())
            .expect("pair must confirm");
        assert!(first <= 3, "confirmed at frame {}", first);

        let incident = &results[first].incidents[0];
        assert_eq!(incident.vehicles_involved(), 2);
        assert_eq!(incident.incident_type(), IncidentType::Collision(CollisionKind::HeadOn));
        assert!(incident.confidence() > 0.0 && incident.confidence() <= 1.0);
        assert_eq!(incident.evidence().first, 0);
        assert_eq!(incident.evidence().last, first as u64);

        let signals: Vec<LayerKind> = results[first].candidates.iter().map(|c| c.signal).collect();
        assert!(signals.contains(&LayerKind::Trajectory));
        assert!(signals.contains(&LayerKind::ClosingSpeed));
    }

    #[test]
    fn test_parallel_traffic_never_confirms() {
        let frames: Vec<Vec<Detection>> = (0..120)
            .map(|i| {
                let x = 60.0 + 9.0 * i as f32;
                vec![car(x, 300.0), car(x, 328.0), car(x + 55.0, 300.0)]
            })
            .collect();
        for (i, a) in drive(&detector(), &frames).iter().enumerate() {
            assert!(a.incidents.is_empty(), "frame {} raised {:?}", i, a.incidents);
        }
    }

    #[test]
    fn test_oncoming_lanes_pass_without_incident() {
        // Adjacent opposite lanes: centres 30px apart, boxes 30px tall
        let frames: Vec<Vec<Detection>> = (0..80)
            .map(|i| {
                let step = 10.0 * i as f32;
                vec![car(200.0 + step, 300.0), car(1000.0 - step, 330.0)]
            })
            .collect();
        let results = drive(&detector(), &frames);
        for (i, a) in results.iter().enumerate() {
            assert!(a.incidents.is_empty(), "frame {} raised {:?}", i, a.incidents);
            for pair in &a.pairs {
                assert_eq!(pair.layers.trajectory.confidence(), 0.0, "frame {}", i);
            }
        }
    }

    #[test]
    fn test_trajectory_only_pair_not_confirmed() {
        // Converging at walking pace from far away: trajectory fires
        // (projected contact within the horizon) but nothing else does
        let frames: Vec<Vec<Detection>> = (0..4)
            .map(|i| {
                let step = 1.0 * i as f32;
                vec![car(400.0 + step, 300.0), car(460.0 - step, 300.0)]
            })
            .collect();
        let results = drive(&detector(), &frames);
        let last = results.last().unwrap();
        let pair = &last.pairs[0];
        assert!(pair.layers.trajectory.agrees(0.5));
        assert_eq!(pair.layers.closing_speed.confidence(), 0.0);
        assert!(!pair.fusion.confirmed);
        assert!(last.incidents.is_empty());
    }

    #[test]
    fn test_rear_end_classification() {
        // Fast follower runs into a slow leader on the same heading
        let frames: Vec<Vec<Detection>> = (0..4)
            .map(|i| {
                let t = i as f32;
                vec![car(100.0 + 25.0 * t, 300.0), car(190.0 + 5.0 * t, 300.0)]
            })
            .collect();
        let results = drive(&detector(), &frames);
        let incident = results
            .iter()
            .flat_map(|a| a.incidents.iter())
            .next()
            .expect("rear-end must confirm");
        assert_eq!(incident.incident_type(), IncidentType::Collision(CollisionKind::RearEnd));
    }

    #[test]
    fn test_near_miss_when_boxes_never_touch() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default(), 1280.0);
        for i in 0..3u64 {
            let dx = 10.0 * i as f32;
            tracker.update(&[car(100.0 + dx, 100.0), car(300.0 - dx, 100.0)], i, i as f64 * FRAME_MS);
        }
        let det = detector();
        let a = tracker.get(1).unwrap();
        let b = tracker.get(2).unwrap();
        assert_eq!(det.classify_pair(a, b), IncidentType::NearMiss);
    }

    #[test]
    fn test_three_car_pileup_reports_once_and_escalates() {
        let frames: Vec<Vec<Detection>> = (0..4)
            .map(|i| {
                let step = 20.0 * i as f32;
                vec![
                    car(80.0 + step, 100.0),
                    car(220.0 - step, 100.0),
                    // third car driving into the pair from below
                    car(150.0, 190.0 - step),
                ]
            })
            .collect();
        let results = drive(&detector(), &frames);
        let with_incident = results
            .iter()
            .find(|a| a.incidents.iter().any(|i| i.vehicles_involved() == 3))
            .expect("pile-up must merge into one 3-vehicle incident");

        let collisions: Vec<&ConfirmedIncident> = with_incident
            .incidents
            .iter()
            .filter(|i| i.incident_type().is_collision())
            .collect();
        assert_eq!(collisions.len(), 1);

        let cfg = FusionConfig::default();
        let base = fusion::severity_for_score(collisions[0].confidence(), &cfg.severity_bands);
        assert_eq!(collisions[0].severity(), base.escalate());
    }

    #[test]
    fn test_stopped_vehicle_with_moving_traffic() {
        let det = detector();
        let frames: Vec<Vec<Detection>> = (0..300)
            .map(|i| {
                // Moving lane well clear of the stalled car
                let x = 100.0 + (i % 100) as f32 * 8.0;
                vec![car(640.0, 500.0), car(x, 300.0)]
            })
            .collect();
        let results = drive(&det, &frames);

        let stopped: Vec<&ConfirmedIncident> = results
            .iter()
            .flat_map(|a| a.incidents.iter())
            .filter(|i| i.incident_type() == IncidentType::StoppedVehicle)
            .collect();
        assert!(!stopped.is_empty(), "stalled car must be reported");
        assert!(stopped.iter().all(|i| i.severity() == Severity::Medium));
        assert!(stopped.iter().all(|i| i.track_ids() == [1]));
        assert!(results
            .iter()
            .flat_map(|a| a.incidents.iter())
            .all(|i| !i.incident_type().is_collision()));
    }

    #[test]
    fn test_stopped_vehicle_ignored_in_congestion() {
        let det = detector();
        let frames: Vec<Vec<Detection>> =
            (0..300).map(|_| vec![car(640.0, 500.0), car(500.0, 500.0)]).collect();
        let results = drive(&det, &frames);
        assert!(results.iter().all(|a| a.incidents.is_empty()));
    }

    #[test]
    fn test_pedestrian_on_roadway() {
        let road = Roadway::new(&[[0.0, 400.0], [1280.0, 400.0], [1280.0, 720.0], [0.0, 720.0]]);
        let det = IncidentDetector::new(IncidentConfig::default(), 1280.0, road);
        let person = |y: f32| {
            Detection::new(ObjectClass::Person, 0.8, BoundingBox::centered(Vec2::new(600.0, y), 20.0, 50.0))
        };

        let sidewalk: Vec<Vec<Detection>> = (0..5).map(|_| vec![person(300.0)]).collect();
        assert!(drive(&det, &sidewalk).iter().all(|a| a.incidents.is_empty()));

        let road_frames: Vec<Vec<Detection>> = (0..5).map(|_| vec![person(500.0)]).collect();
        let results = drive(&det, &road_frames);
        assert!(results[1].incidents.is_empty(), "needs min_hits before reporting");
        assert_eq!(
            results[4].incidents[0].incident_type(),
            IncidentType::PedestrianOnRoad
        );
    }

    #[test]
    fn test_speed_anomaly_against_traffic_median() {
        let frames: Vec<Vec<Detection>> = (0..5)
            .map(|i| {
                let t = i as f32;
                vec![
                    car(100.0 + 4.0 * t, 100.0),
                    car(100.0 + 5.0 * t, 400.0),
                    car(100.0 + 4.0 * t, 600.0),
                    // ~1500 px/s against ~120 px/s traffic
                    car(300.0 + 50.0 * t, 250.0),
                ]
            })
            .collect();
        let results = drive(&detector(), &frames);
        let last = results.last().unwrap();
        let anomalies: Vec<&ConfirmedIncident> = last
            .incidents
            .iter()
            .filter(|i| i.incident_type() == IncidentType::SpeedAnomaly)
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].track_ids(), [4]);
        assert_eq!(anomalies[0].severity(), Severity::Low);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_config_defaults_validate() {
        assert!(IncidentConfig::default().validate().is_ok());
    }
}
