// src/analysis/features.rs
//
// Flat per-pair feature vector. Every evaluated pair produces one, whether
// or not it confirms, so the JSON-lines dump doubles as training data for an
// offline incident-probability model.

use crate::analysis::fusion::FusionResult;
use crate::analysis::layers::{LayerConfig, LayerReport, PairKinematics};
use crate::analysis::object_tracker::Track;
use crate::types::ObjectClass;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PairFeatures {
    pub frame_index: u64,
    pub track_a: u64,
    pub track_b: u64,
    pub class_a: ObjectClass,
    pub class_b: ObjectClass,
    pub distance: f32,
    pub edge_gap: f32,
    pub iou: f32,
    pub closing_speed: Option<f32>,
    pub relative_speed: Option<f32>,
    pub size_change_a: Option<f32>,
    pub size_change_b: Option<f32>,
    /// Speed lost between the last two velocity estimates (px/s^2, positive = slowing)
    pub deceleration_a: Option<f32>,
    pub deceleration_b: Option<f32>,
    pub heading_change_a_deg: Option<f32>,
    pub heading_change_b_deg: Option<f32>,
    pub trajectory: f32,
    pub closing: f32,
    pub depth: f32,
    pub motion_anomaly: f32,
    pub score: f32,
    pub confirmed: bool,
}

impl PairFeatures {
    pub fn compute(
        a: &Track,
        b: &Track,
        layers: &LayerReport,
        fusion: &FusionResult,
        cfg: &LayerConfig,
        frame_index: u64,
    ) -> Self {
        let kinematics = PairKinematics::of(a, b).ok();
        Self {
            frame_index,
            track_a: a.id,
            track_b: b.id,
            class_a: a.class,
            class_b: b.class,
            distance: a.position().distance(b.position()),
            edge_gap: a.bbox.edge_gap(&b.bbox),
            iou: a.bbox.iou(&b.bbox),
            closing_speed: kinematics.map(|k| k.closing_speed()),
            relative_speed: kinematics.map(|k| k.relative_velocity.norm()),
            size_change_a: a.area_ratio(cfg.depth_window),
            size_change_b: b.area_ratio(cfg.depth_window),
            deceleration_a: deceleration(a),
            deceleration_b: deceleration(b),
            heading_change_a_deg: heading_change_deg(a),
            heading_change_b_deg: heading_change_deg(b),
            trajectory: layers.trajectory.confidence(),
            closing: layers.closing_speed.confidence(),
            depth: layers.depth.confidence(),
            motion_anomaly: layers.motion_anomaly.confidence(),
            score: fusion.score,
            confirmed: fusion.confirmed,
        }
    }
}

fn deceleration(track: &Track) -> Option<f32> {
    let before = track.velocity_at(1)?.norm();
    let after = track.velocity_at(0)?.norm();
    let history = track.history();
    let n = history.len();
    let dt_s = ((history[n - 1].timestamp_ms - history[n - 2].timestamp_ms) / 1000.0) as f32;
    if !(dt_s > 0.0) {
        return None;
    }
    Some((before - after) / dt_s)
}

fn heading_change_deg(track: &Track) -> Option<f32> {
    let before = track.velocity_at(1)?;
    let after = track.velocity_at(0)?;
    before.angle_to(after).map(f32::to_degrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::fusion::{fuse, FusionConfig};
    use crate::analysis::object_tracker::{ObjectTracker, TrackerConfig};
    use crate::types::{BoundingBox, Detection, Vec2};

    #[test]
    fn test_features_for_braking_pair() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default(), 1280.0);
        let xs = [100.0, 130.0, 160.0, 170.0];
        for (i, x) in xs.iter().enumerate() {
            let dets = [
                Detection::new(ObjectClass::Car, 0.9, BoundingBox::centered(Vec2::new(*x, 200.0), 50.0, 30.0)),
                Detection::new(ObjectClass::Truck, 0.9, BoundingBox::centered(Vec2::new(400.0, 200.0), 80.0, 50.0)),
            ];
            tracker.update(&dets, i as u64, i as f64 * 100.0);
        }
        let a = tracker.get(1).unwrap();
        let b = tracker.get(2).unwrap();
        let cfg = LayerConfig::default();
        let layers = LayerReport::evaluate(a, b, &cfg);
        let fusion = fuse(&layers, &FusionConfig::default());
        let f = PairFeatures::compute(a, b, &layers, &fusion, &cfg, 3);

        assert_eq!((f.track_a, f.track_b), (1, 2));
        assert!((f.distance - 230.0).abs() < 1e-3);
        // 300 px/s -> 100 px/s over 0.1 s
        assert!((f.deceleration_a.unwrap() - 2000.0).abs() < 1.0);
        assert_eq!(f.deceleration_b, Some(0.0));
        assert_eq!(f.heading_change_a_deg, Some(0.0));
        assert!(f.heading_change_b_deg.is_none(), "a parked truck has no heading");
        assert!(!f.confirmed);

        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"class_b\":\"truck\""));
    }
}
