// src/detector.rs
//
// Object detector contract. One capability: frame in, detections out.
// Model formats and versions are adapter details behind this trait.
//
// Implementations are shared read-only between camera pipelines
// (`Arc<dyn Detector>`), hence `&self` and `Send + Sync`.

use crate::types::{Detection, Frame};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub trait Detector: Send + Sync {
    /// An `Err` is treated by the pipeline as "no detections this frame".
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;

    fn name(&self) -> &str;
}

/// Serves detections recorded alongside a replayed session, keyed by frame index.
#[derive(Clone)]
pub struct ReplayDetector {
    detections: Arc<HashMap<u64, Vec<Detection>>>,
}

impl ReplayDetector {
    pub fn new(detections: Arc<HashMap<u64, Vec<Detection>>>) -> Self {
        Self { detections }
    }

    pub fn frames_with_detections(&self) -> usize {
        self.detections.len()
    }
}

impl Detector for ReplayDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self
            .detections
            .get(&frame.index)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, ObjectClass};

    #[test]
    fn test_replay_detector_by_frame_index() {
        let mut map = HashMap::new();
        map.insert(
            5,
            vec![Detection::new(ObjectClass::Bus, 0.8, BoundingBox::new(0.0, 0.0, 10.0, 10.0))],
        );
        let det = ReplayDetector::new(Arc::new(map));
        assert_eq!(det.detect(&Frame::blank(5, 0.0, 1, 1)).unwrap().len(), 1);
        assert!(det.detect(&Frame::blank(6, 0.0, 1, 1)).unwrap().is_empty());
        assert_eq!(det.frames_with_detections(), 1);
    }
}
