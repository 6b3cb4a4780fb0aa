// src/analysis/fusion.rs
//
// Weighted fusion of the collision layers into one pair decision.
//
// CONFIRMED needs both:
//   - weighted score (normalized by total weight) >= confirm_threshold
//   - at least `min_agreeing_layers` layers individually >= agreement_threshold
//
// The second condition stops any single noisy layer from confirming alone,
// however heavily it is weighted.

use crate::analysis::layers::LayerReport;
use crate::types::Severity;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerWeights {
    pub trajectory: f32,
    pub closing_speed: f32,
    pub depth: f32,
    pub motion_anomaly: f32,
}

impl Default for LayerWeights {
    fn default() -> Self {
        Self {
            trajectory: 0.30,
            closing_speed: 0.35, // the collision-vs-adjacency discriminator
            depth: 0.15,         // weakest proxy, noisy under bad video
            motion_anomaly: 0.20,
        }
    }
}

impl LayerWeights {
    pub fn total(&self) -> f32 {
        self.trajectory + self.closing_speed + self.depth + self.motion_anomaly
    }

    fn all(&self) -> [f32; 4] {
        [self.trajectory, self.closing_speed, self.depth, self.motion_anomaly]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityBands {
    /// Fused score from which an incident is at least MEDIUM
    pub medium_from: f32,
    /// Fused score from which an incident is HIGH
    pub high_from: f32,
}

impl Default for SeverityBands {
    fn default() -> Self {
        Self {
            medium_from: 0.65,
            high_from: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub weights: LayerWeights,
    pub confirm_threshold: f32,
    pub min_agreeing_layers: usize,
    /// Per-layer confidence at which a layer counts as agreeing
    pub agreement_threshold: f32,
    pub severity_bands: SeverityBands,
    /// Vehicles involved at which severity escalates one band
    pub escalation_vehicle_count: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            weights: LayerWeights::default(),
            confirm_threshold: 0.55,
            min_agreeing_layers: 2,
            agreement_threshold: 0.5,
            severity_bands: SeverityBands::default(),
            escalation_vehicle_count: 3,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<()> {
        let weights = self.weights.all();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            bail!("incident.fusion.weights must be finite and non-negative");
        }
        if !(self.weights.total() > 0.0) {
            bail!("incident.fusion.weights must not all be zero");
        }
        if self.min_agreeing_layers < 2 || self.min_agreeing_layers > 4 {
            bail!("incident.fusion.min_agreeing_layers must be between 2 and 4");
        }
        if !(0.0..=1.0).contains(&self.confirm_threshold)
            || !(0.0..=1.0).contains(&self.agreement_threshold)
        {
            bail!("incident.fusion thresholds must lie in [0, 1]");
        }
        let bands = &self.severity_bands;
        if !(bands.medium_from <= bands.high_from) {
            bail!(
                "incident.fusion.severity_bands out of order (medium_from {} > high_from {})",
                bands.medium_from,
                bands.high_from
            );
        }
        if self.escalation_vehicle_count < 2 {
            bail!("incident.fusion.escalation_vehicle_count must be at least 2");
        }
        Ok(())
    }
}

// ============================================================================
// PAIR STAGE
// ============================================================================

/// How far a pair got this frame: each step is one more agreeing layer,
/// whichever layers those are. Recomputed from live tracks every frame,
/// so a pair can fall back to `None` as soon as its layers go quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairStage {
    None,
    OneLayer,
    TwoLayers,
    ThreeLayers,
    AllLayers,
    /// Fused score and layer agreement both passed
    Confirmed,
}

impl PairStage {
    fn from_agreeing(agreeing: usize) -> Self {
        match agreeing {
            0 => Self::None,
            1 => Self::OneLayer,
            2 => Self::TwoLayers,
            3 => Self::ThreeLayers,
            _ => Self::AllLayers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionResult {
    /// Weighted score in [0, 1]
    pub score: f32,
    pub agreeing_layers: usize,
    pub confirmed: bool,
    pub stage: PairStage,
}

pub fn fuse(report: &LayerReport, cfg: &FusionConfig) -> FusionResult {
    let w = &cfg.weights;
    let total = w.total();
    let weighted = w.trajectory * report.trajectory.confidence()
        + w.closing_speed * report.closing_speed.confidence()
        + w.depth * report.depth.confidence()
        + w.motion_anomaly * report.motion_anomaly.confidence();

    let score = if total > 0.0 {
        (weighted / total).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let score = if score.is_finite() { score } else { 0.0 };

    let agreeing_layers = report.agreeing(cfg.agreement_threshold);
    let confirmed =
        score >= cfg.confirm_threshold && agreeing_layers >= cfg.min_agreeing_layers.max(2);

    let stage = if confirmed {
        PairStage::Confirmed
    } else {
        PairStage::from_agreeing(agreeing_layers)
    };

    FusionResult {
        score,
        agreeing_layers,
        confirmed,
        stage,
    }
}

// ============================================================================
// SEVERITY
// ============================================================================

/// Pure and monotonic in `score`.
pub fn severity_for_score(score: f32, bands: &SeverityBands) -> Severity {
    if score >= bands.high_from {
        Severity::High
    } else if score >= bands.medium_from {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Score band, escalated once when enough vehicles are involved.
pub fn severity_for(score: f32, vehicles_involved: usize, cfg: &FusionConfig) -> Severity {
    let base = severity_for_score(score, &cfg.severity_bands);
    if vehicles_involved >= cfg.escalation_vehicle_count {
        base.escalate()
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::layers::{LayerOutcome, SkipReason};

    fn report(t: f32, c: f32, d: f32, m: f32) -> LayerReport {
        LayerReport {
            trajectory: LayerOutcome::Scored(t),
            closing_speed: LayerOutcome::Scored(c),
            depth: LayerOutcome::Scored(d),
            motion_anomaly: LayerOutcome::Scored(m),
        }
    }

    #[test]
    fn test_single_layer_never_confirms() {
        let cfg = FusionConfig::default();
        let result = fuse(&report(1.0, 0.0, 0.0, 0.0), &cfg);
        assert!(!result.confirmed);
        assert_eq!(result.stage, PairStage::OneLayer);

        // Even if that one layer carried all the weight
        let mut heavy = cfg.clone();
        heavy.weights = LayerWeights {
            trajectory: 1.0,
            closing_speed: 0.0,
            depth: 0.0,
            motion_anomaly: 0.0,
        };
        let result = fuse(&report(1.0, 0.0, 0.0, 0.0), &heavy);
        assert_eq!(result.score, 1.0);
        assert!(!result.confirmed, "one layer must not confirm alone");
    }

    #[test]
    fn test_two_strong_layers_confirm() {
        let result = fuse(&report(1.0, 1.0, 0.0, 0.0), &FusionConfig::default());
        assert!((result.score - 0.65).abs() < 1e-5);
        assert!(result.confirmed);
        assert_eq!(result.stage, PairStage::Confirmed);
    }

    #[test]
    fn test_two_weak_layers_below_threshold() {
        let result = fuse(&report(0.0, 0.0, 0.6, 0.6), &FusionConfig::default());
        assert_eq!(result.agreeing_layers, 2);
        assert!(!result.confirmed, "score {} under threshold", result.score);
        assert_eq!(result.stage, PairStage::TwoLayers);
    }

    #[test]
    fn test_stage_counts_layers_regardless_of_which() {
        let cfg = FusionConfig::default();
        // Trajectory + closing speed, no depth: still two layers
        let mut unconfirming = cfg.clone();
        unconfirming.confirm_threshold = 1.1;
        let result = fuse(&report(0.9, 0.9, 0.0, 0.0), &unconfirming);
        assert_eq!(result.stage, PairStage::TwoLayers);
        let result = fuse(&report(0.0, 0.9, 0.9, 0.9), &unconfirming);
        assert_eq!(result.stage, PairStage::ThreeLayers);
        let result = fuse(&report(0.9, 0.9, 0.9, 0.9), &unconfirming);
        assert_eq!(result.stage, PairStage::AllLayers);
        assert!(PairStage::OneLayer < PairStage::TwoLayers && PairStage::AllLayers < PairStage::Confirmed);
    }

    #[test]
    fn test_skipped_layers_count_as_zero() {
        let skipped = LayerOutcome::Skipped(SkipReason::InsufficientHistory {
            needed: 4,
            available: 2,
        });
        let r = LayerReport {
            trajectory: LayerOutcome::Scored(1.0),
            closing_speed: LayerOutcome::Scored(1.0),
            depth: skipped,
            motion_anomaly: skipped,
        };
        let result = fuse(&r, &FusionConfig::default());
        assert!(result.confirmed);
        assert_eq!(result.agreeing_layers, 2);
    }

    #[test]
    fn test_severity_banding_is_monotonic() {
        let bands = SeverityBands::default();
        let mut previous = Severity::Low;
        for i in 0..=1000 {
            let s = severity_for_score(i as f32 / 1000.0, &bands);
            assert!(s >= previous, "severity dropped at score {}", i as f32 / 1000.0);
            previous = s;
        }
        assert_eq!(previous, Severity::High);
    }

    #[test]
    fn test_vehicle_count_escalates_one_band() {
        let cfg = FusionConfig::default();
        assert_eq!(severity_for(0.6, 2, &cfg), Severity::Low);
        assert_eq!(severity_for(0.6, 3, &cfg), Severity::Medium);
        assert_eq!(severity_for(0.9, 5, &cfg), Severity::High);
    }

    #[test]
    fn test_validation() {
        assert!(FusionConfig::default().validate().is_ok());

        let mut cfg = FusionConfig::default();
        cfg.weights.depth = -0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = FusionConfig::default();
        cfg.severity_bands = SeverityBands {
            medium_from: 0.9,
            high_from: 0.7,
        };
        assert!(cfg.validate().is_err());

        let mut cfg = FusionConfig::default();
        cfg.min_agreeing_layers = 1;
        assert!(cfg.validate().is_err());
    }
}
