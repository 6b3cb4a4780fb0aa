// src/analysis/mod.rs
//
// Incident analysis modules.
//
// Signal flow:
//   Detections → object_tracker → Track set ─┬→ layers (per pair) → fusion ─┐
//                                             │                              ├→ incident_detector → Assessment
//                                             └→ stopped / pedestrian / speed rules ─┘
//
// `features` flattens each evaluated pair for offline training;
// `roadway` is the polygon the pedestrian rule tests against.

pub mod features;
pub mod fusion;
pub mod incident_detector;
pub mod layers;
pub mod object_tracker;
pub mod roadway;

// Re-exports for ergonomic access from the pipeline
pub use features::PairFeatures;
pub use fusion::{FusionConfig, FusionResult, LayerWeights, PairStage, SeverityBands};
pub use incident_detector::{
    Assessment, ConfirmedIncident, IncidentCandidate, IncidentConfig, IncidentDetector,
    PairAssessment,
};
pub use layers::{LayerConfig, LayerKind, LayerOutcome, LayerReport, SkipReason};
pub use object_tracker::{ObjectTracker, Track, TrackerConfig};
pub use roadway::Roadway;
