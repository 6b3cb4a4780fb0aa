// src/pipeline/frame_context.rs
//
// Everything one frame produced, in pipeline order: detections, the
// post-update track set, the detector's assessment and the recorder's
// transitions. Every consumer reads the same snapshot.

use crate::analysis::features::PairFeatures;
use crate::analysis::incident_detector::Assessment;
use crate::analysis::object_tracker::Track;
use crate::clip::{ClipId, FinalizedClip};
use crate::incident_recorder::RecorderPhase;
use crate::types::Detection;

#[derive(Debug)]
pub struct FrameContext {
    pub frame_index: u64,
    pub timestamp_ms: f64,

    pub detections: Vec<Detection>,
    /// The detector returned an error; `detections` is empty
    pub detector_failed: bool,

    pub tracks: Vec<Track>,
    pub assessment: Assessment,

    // Recorder
    pub phase: RecorderPhase,
    pub started: Vec<ClipId>,
    pub suppressed: usize,
    pub finalized: Vec<FinalizedClip>,
}

impl FrameContext {
    pub fn pair_features(&self) -> Vec<PairFeatures> {
        self.assessment
            .pairs
            .iter()
            .map(|p| p.features.clone())
            .collect()
    }
}
