// src/analysis/layers.rs
//
// Independent collision signal layers evaluated on a pair of tracks.
//
//   trajectory      headings extrapolated over a short horizon make the
//                   boxes overlap; lanes that only brush edges do not count
//   closing speed   the pair is touching (or nearly) and the gap is closing
//                   fast; parallel traffic has ~zero closing speed
//   depth           both boxes change size abruptly at the same time, a
//                   coarse proxy for an impact along the camera axis
//   motion anomaly  a speed or heading discontinuity no vehicle inertia
//                   allows between consecutive samples
//
// Every layer returns a typed outcome. Missing history or non-finite
// arithmetic yields `Skipped`, which fusion scores as zero.

use crate::analysis::object_tracker::Track;
use crate::types::Vec2;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fmt;

const EPS: f32 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Trajectory extrapolation horizon (seconds)
    pub lookahead_s: f32,
    /// Projected separation counted as contact, as a fraction of the centre
    /// distance at which the two boxes touch along the approach direction
    pub convergence_proximity_ratio: f32,
    /// Relative speed (px/s) below which a pair has no usable common heading
    pub min_relative_speed_px_s: f32,
    /// Minimum closing speed (px/s) for the closing-speed layer
    pub min_closing_speed_px_s: f32,
    /// Edge gap still counted as near-overlap, as a multiple of mean box width
    pub contact_tolerance_ratio: f32,
    /// Samples between the compared box sizes in the depth layer
    pub depth_window: usize,
    /// Relative size change (0.25 = 25%) both boxes must show
    pub min_size_change: f32,
    /// Below this speed (px/s) a track cannot produce a motion anomaly
    pub anomaly_min_speed_px_s: f32,
    /// Fractional speed change between consecutive samples treated as non-physical
    pub max_speed_change_ratio: f32,
    /// Heading change between consecutive samples treated as non-physical
    pub max_heading_change_deg: f32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            lookahead_s: 1.0,
            convergence_proximity_ratio: 0.9,
            min_relative_speed_px_s: 20.0,
            min_closing_speed_px_s: 150.0,
            contact_tolerance_ratio: 0.25,
            depth_window: 3,
            min_size_change: 0.25,
            anomaly_min_speed_px_s: 60.0,
            max_speed_change_ratio: 0.5,
            max_heading_change_deg: 45.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Trajectory,
    ClosingSpeed,
    Depth,
    MotionAnomaly,
}

impl LayerKind {
    pub const ALL: [LayerKind; 4] = [
        LayerKind::Trajectory,
        LayerKind::ClosingSpeed,
        LayerKind::Depth,
        LayerKind::MotionAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trajectory => "trajectory",
            Self::ClosingSpeed => "closing_speed",
            Self::Depth => "depth",
            Self::MotionAnomaly => "motion_anomaly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientHistory { needed: usize, available: usize },
    NonFinite,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientHistory { needed, available } => {
                write!(f, "needs {} samples, has {}", needed, available)
            }
            Self::NonFinite => f.write_str("non-finite input"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerOutcome {
    /// Confidence in [0, 1]; 0 means the layer ran and saw nothing
    Scored(f32),
    Skipped(SkipReason),
}

impl LayerOutcome {
    pub fn confidence(&self) -> f32 {
        match self {
            Self::Scored(c) => *c,
            Self::Skipped(_) => 0.0,
        }
    }

    pub fn agrees(&self, threshold: f32) -> bool {
        matches!(self, Self::Scored(c) if *c >= threshold)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    fn from_result(result: Result<f32, SkipReason>) -> Self {
        match result {
            Ok(c) if c.is_finite() => Self::Scored(c.clamp(0.0, 1.0)),
            Ok(_) => Self::Skipped(SkipReason::NonFinite),
            Err(reason) => Self::Skipped(reason),
        }
    }
}

// ============================================================================
// SHARED PAIR GEOMETRY
// ============================================================================

fn require_history(track: &Track, needed: usize) -> Result<(), SkipReason> {
    let available = track.history_len();
    if available < needed {
        return Err(SkipReason::InsufficientHistory { needed, available });
    }
    Ok(())
}

fn velocity(track: &Track) -> Result<Vec2, SkipReason> {
    require_history(track, 2)?;
    track.velocity().ok_or(SkipReason::NonFinite)
}

fn finite(x: f32) -> Result<f32, SkipReason> {
    if x.is_finite() {
        Ok(x)
    } else {
        Err(SkipReason::NonFinite)
    }
}

fn mean_width(a: &Track, b: &Track) -> f32 {
    (a.bbox.width + b.bbox.width) * 0.5
}

/// Centre distance along unit `dir` at which the two boxes start to overlap.
fn touch_distance(a: &Track, b: &Track, dir: Vec2) -> f32 {
    let half_w = 0.5 * (a.bbox.width + b.bbox.width);
    let half_h = 0.5 * (a.bbox.height + b.bbox.height);
    let along_x = if dir.x.abs() > EPS { half_w / dir.x.abs() } else { f32::INFINITY };
    let along_y = if dir.y.abs() > EPS { half_h / dir.y.abs() } else { f32::INFINITY };
    along_x.min(along_y)
}

/// Relative kinematics of `b` as seen from `a`.
#[derive(Debug, Clone, Copy)]
pub struct PairKinematics {
    /// b - a position
    pub offset: Vec2,
    /// vb - va (px/s)
    pub relative_velocity: Vec2,
}

impl PairKinematics {
    pub fn of(a: &Track, b: &Track) -> Result<Self, SkipReason> {
        let va = velocity(a)?;
        let vb = velocity(b)?;
        let k = Self {
            offset: b.position() - a.position(),
            relative_velocity: vb - va,
        };
        if !k.offset.is_finite() || !k.relative_velocity.is_finite() {
            return Err(SkipReason::NonFinite);
        }
        Ok(k)
    }

    /// Rate at which the centre distance shrinks (px/s); negative when separating.
    pub fn closing_speed(&self) -> f32 {
        let dist = self.offset.norm();
        if dist > EPS {
            -self.offset.dot(self.relative_velocity) / dist
        } else {
            self.relative_velocity.norm()
        }
    }

    /// Minimum separation over `[0, horizon_s]` assuming constant velocities.
    pub fn closest_approach(&self, horizon_s: f32) -> (f32, f32) {
        let (separation, t) = self.closest_separation(horizon_s);
        (separation.norm(), t)
    }

    /// b - a position vector at the closest approach, and its time.
    pub fn closest_separation(&self, horizon_s: f32) -> (Vec2, f32) {
        let vv = self.relative_velocity.dot(self.relative_velocity);
        if vv < EPS {
            return (self.offset, 0.0);
        }
        let t = (-self.offset.dot(self.relative_velocity) / vv).clamp(0.0, horizon_s);
        (self.offset + self.relative_velocity * t, t)
    }
}

// ============================================================================
// LAYER 1: TRAJECTORY CONVERGENCE
// ============================================================================

pub fn trajectory_convergence(a: &Track, b: &Track, cfg: &LayerConfig) -> LayerOutcome {
    LayerOutcome::from_result(trajectory_inner(a, b, cfg))
}

fn trajectory_inner(a: &Track, b: &Track, cfg: &LayerConfig) -> Result<f32, SkipReason> {
    let k = PairKinematics::of(a, b)?;

    // Separating or co-moving pairs are not converging
    if k.relative_velocity.norm() < cfg.min_relative_speed_px_s
        || k.offset.dot(k.relative_velocity) >= 0.0
    {
        return Ok(0.0);
    }

    let (separation, _t) = k.closest_separation(cfg.lookahead_s);
    let d_min = finite(separation.norm())?;
    // Direct hit: any direction works, use the approach line
    let dir = if d_min > EPS {
        separation * (1.0 / d_min)
    } else {
        k.relative_velocity * (1.0 / k.relative_velocity.norm())
    };
    let contact = finite(cfg.convergence_proximity_ratio * touch_distance(a, b, dir))?;
    if d_min >= contact || contact <= 0.0 {
        return Ok(0.0);
    }
    finite(0.5 + 0.5 * (1.0 - d_min / contact))
}

// ============================================================================
// LAYER 2: RELATIVE VELOCITY / CLOSING SPEED
// ============================================================================

pub fn closing_speed(a: &Track, b: &Track, cfg: &LayerConfig) -> LayerOutcome {
    LayerOutcome::from_result(closing_inner(a, b, cfg))
}

fn closing_inner(a: &Track, b: &Track, cfg: &LayerConfig) -> Result<f32, SkipReason> {
    let k = PairKinematics::of(a, b)?;

    let tolerance = cfg.contact_tolerance_ratio * mean_width(a, b);
    let gap = finite(a.bbox.edge_gap(&b.bbox))?;
    if gap > tolerance {
        return Ok(0.0);
    }

    let closing = finite(k.closing_speed())?;
    let min = cfg.min_closing_speed_px_s.max(EPS);
    if closing < min {
        return Ok(0.0);
    }
    Ok((0.5 + 0.5 * (closing - min) / min).min(1.0))
}

// ============================================================================
// LAYER 3: DEPTH / SIZE PROXIMITY
// ============================================================================

pub fn depth_change(a: &Track, b: &Track, cfg: &LayerConfig) -> LayerOutcome {
    LayerOutcome::from_result(depth_inner(a, b, cfg))
}

fn depth_inner(a: &Track, b: &Track, cfg: &LayerConfig) -> Result<f32, SkipReason> {
    let needed = cfg.depth_window.max(1) + 1;
    require_history(a, needed)?;
    require_history(b, needed)?;

    // Both boxes must be in the same screen region
    let gap = finite(a.bbox.edge_gap(&b.bbox))?;
    if gap > 2.0 * cfg.contact_tolerance_ratio * mean_width(a, b) {
        return Ok(0.0);
    }

    let ra = a.area_ratio(cfg.depth_window).ok_or(SkipReason::NonFinite)?;
    let rb = b.area_ratio(cfg.depth_window).ok_or(SkipReason::NonFinite)?;
    let la = finite(ra.ln())?;
    let lb = finite(rb.ln())?;
    let threshold = (1.0 + cfg.min_size_change.max(EPS)).ln();

    if la.abs() < threshold || lb.abs() < threshold {
        return Ok(0.0);
    }

    let magnitude = la.abs().min(lb.abs()) / threshold;
    // One box growing while the other shrinks, or very uneven change, is the
    // impact signature; a graze changes both boxes alike.
    let asymmetric = la.signum() != lb.signum() || (la - lb).abs() > threshold;
    let mut confidence = 0.5 + 0.25 * (magnitude - 1.0).min(1.0);
    if asymmetric {
        confidence += 0.25;
    }
    Ok(confidence.min(1.0))
}

// ============================================================================
// LAYER 4: MOTION ANOMALY
// ============================================================================

pub fn motion_anomaly(a: &Track, b: &Track, cfg: &LayerConfig) -> LayerOutcome {
    LayerOutcome::from_result(motion_inner(a, b, cfg))
}

fn motion_inner(a: &Track, b: &Track, cfg: &LayerConfig) -> Result<f32, SkipReason> {
    let sa = track_anomaly(a, cfg)?;
    let sb = track_anomaly(b, cfg)?;
    Ok(sa.max(sb))
}

/// Anomaly score for one track from its last two velocity estimates.
pub fn track_anomaly(track: &Track, cfg: &LayerConfig) -> Result<f32, SkipReason> {
    require_history(track, 3)?;
    let previous = track.velocity_at(1).ok_or(SkipReason::NonFinite)?;
    let current = track.velocity_at(0).ok_or(SkipReason::NonFinite)?;

    let prev_speed = previous.norm();
    if prev_speed < cfg.anomaly_min_speed_px_s {
        return Ok(0.0);
    }

    let speed_change = finite((current.norm() - prev_speed).abs() / prev_speed)?;
    let max_ratio = cfg.max_speed_change_ratio.clamp(EPS, 1.0 - EPS);
    let speed_score = if speed_change > max_ratio {
        0.5 + 0.5 * ((speed_change - max_ratio) / (1.0 - max_ratio)).min(1.0)
    } else {
        0.0
    };

    let max_heading = cfg.max_heading_change_deg.to_radians().clamp(EPS, PI - EPS);
    let heading_score = match previous.angle_to(current) {
        Some(angle) if angle > max_heading => {
            0.5 + 0.5 * ((angle - max_heading) / (PI - max_heading)).min(1.0)
        }
        _ => 0.0,
    };

    finite(speed_score.max(heading_score))
}

/// All four layers for one pair, in a fixed shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayerReport {
    pub trajectory: LayerOutcome,
    pub closing_speed: LayerOutcome,
    pub depth: LayerOutcome,
    pub motion_anomaly: LayerOutcome,
}

impl LayerReport {
    pub fn evaluate(a: &Track, b: &Track, cfg: &LayerConfig) -> Self {
        Self {
            trajectory: trajectory_convergence(a, b, cfg),
            closing_speed: closing_speed(a, b, cfg),
            depth: depth_change(a, b, cfg),
            motion_anomaly: motion_anomaly(a, b, cfg),
        }
    }

    pub fn get(&self, kind: LayerKind) -> LayerOutcome {
        match kind {
            LayerKind::Trajectory => self.trajectory,
            LayerKind::ClosingSpeed => self.closing_speed,
            LayerKind::Depth => self.depth,
            LayerKind::MotionAnomaly => self.motion_anomaly,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerKind, LayerOutcome)> + '_ {
        LayerKind::ALL.into_iter().map(move |k| (k, self.get(k)))
    }

    pub fn agreeing(&self, threshold: f32) -> usize {
        self.iter().filter(|(_, o)| o.agrees(threshold)).count()
    }

    pub fn any_agrees(&self, threshold: f32) -> bool {
        self.agreeing(threshold) > 0
    }
}
