// src/yolo.rs
//
// YOLOv8 ONNX detector adapter.
//
// Pre/post-processing (letterbox, output decode, NMS) is plain Rust and is
// always compiled; the ONNX session itself needs the `yolo` feature.
//
// YOLOv8 output layout: [1, 4 + 80, N], column-major per prediction:
//   rows 0..4  = cx, cy, w, h in letterboxed input pixels
//   rows 4..84 = per-class scores (COCO)

use crate::types::{BoundingBox, Detection, ObjectClass};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

pub const YOLO_INPUT_SIZE: usize = 640;
pub const YOLO_CLASSES: usize = 80;
const NMS_IOU: f32 = 0.45;

/// Mapping between source pixels and the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub src_w: usize,
    pub src_h: usize,
}

impl Letterbox {
    pub fn fit(src_w: usize, src_h: usize, target: usize) -> Self {
        let scale = (target as f32 / src_w.max(1) as f32).min(target as f32 / src_h.max(1) as f32);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;
        Self {
            scale,
            pad_x: (target.saturating_sub(scaled_w)) as f32 / 2.0,
            pad_y: (target.saturating_sub(scaled_h)) as f32 / 2.0,
            src_w,
            src_h,
        }
    }

    /// Model-space centre box back to a source-space box, clipped to the image.
    pub fn to_source(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let x1 = ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.src_w as f32);
        let y1 = ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.src_h as f32);
        let x2 = ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.src_w as f32);
        let y2 = ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.src_h as f32);
        BoundingBox::from_corners(x1, y1, x2, y2)
    }
}

/// Letterboxed, normalized CHW tensor data for an RGB8 frame.
pub fn preprocess(src: &[u8], src_w: usize, src_h: usize, lb: &Letterbox) -> Vec<f32> {
    let target = YOLO_INPUT_SIZE;
    // Gray padding, as the model was trained with
    let mut canvas = RgbImage::from_pixel(target as u32, target as u32, Rgb([114, 114, 114]));

    let len = src_w * src_h * 3;
    if let Some(image) = src
        .get(..len)
        .and_then(|px| RgbImage::from_raw(src_w as u32, src_h as u32, px.to_vec()))
    {
        let scaled_w = ((src_w as f32 * lb.scale) as u32).clamp(1, target as u32);
        let scaled_h = ((src_h as f32 * lb.scale) as u32).clamp(1, target as u32);
        let resized = imageops::resize(&image, scaled_w, scaled_h, FilterType::Triangle);
        imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);
    }

    // HWC u8 -> CHW f32 in [0, 1]
    let plane = target * target;
    let mut input = vec![0.0f32; 3 * plane];
    for (i, px) in canvas.pixels().enumerate() {
        for c in 0..3 {
            input[c * plane + i] = px[c] as f32 / 255.0;
        }
    }
    input
}

/// Decode raw model output into detections of the classes we track.
pub fn decode(output: &[f32], num_preds: usize, lb: &Letterbox, conf_thresh: f32) -> Vec<Detection> {
    if output.len() < (4 + YOLO_CLASSES) * num_preds {
        return Vec::new();
    }
    let at = |row: usize, i: usize| output[row * num_preds + i];

    let mut detections = Vec::new();
    for i in 0..num_preds {
        let (best_class, best_conf) = (0..YOLO_CLASSES)
            .map(|c| (c, at(4 + c, i)))
            .fold((0, 0.0f32), |best, cur| if cur.1 > best.1 { cur } else { best });

        if best_conf < conf_thresh {
            continue;
        }
        let Some(class) = ObjectClass::from_coco_id(best_class) else {
            continue;
        };
        let bbox = lb.to_source(at(0, i), at(1, i), at(2, i), at(3, i));
        if bbox.is_degenerate() {
            continue;
        }
        detections.push(Detection::new(class, best_conf, bbox));
    }
    nms(detections, NMS_IOU)
}

/// Greedy per-class non-maximum suppression.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        let suppressed = keep
            .iter()
            .any(|k| k.class == det.class && k.bbox.iou(&det.bbox) >= iou_threshold);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}

#[cfg(feature = "yolo")]
pub use model::YoloDetector;

#[cfg(feature = "yolo")]
mod model {
    use super::*;
    use crate::detector::Detector;
    use crate::types::Frame;
    use anyhow::{anyhow, bail, Result};
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use std::sync::Mutex;
    use tracing::{debug, info};

    pub struct YoloDetector {
        session: Mutex<Session>,
        confidence: f32,
        name: String,
    }

    impl YoloDetector {
        pub fn new(model_path: &str, confidence: f32) -> Result<Self> {
            info!("Loading YOLO model: {}", model_path);

            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(4)?
                .commit_from_file(model_path)?;

            info!("✓ YOLO detector initialized");
            Ok(Self {
                session: Mutex::new(session),
                confidence,
                name: format!("yolo:{}", model_path),
            })
        }

        fn infer(&self, input: Vec<f32>) -> Result<Vec<f32>> {
            let shape = [1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
            let input_value =
                ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow!("YOLO session lock poisoned"))?;
            let outputs = session.run(ort::inputs!["images" => input_value])?;
            let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
            Ok(data.to_vec())
        }
    }

    impl Detector for YoloDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
            if !frame.has_pixels() {
                bail!("frame {} carries no pixels", frame.index);
            }
            let lb = Letterbox::fit(frame.width, frame.height, YOLO_INPUT_SIZE);
            let input = preprocess(&frame.data, frame.width, frame.height, &lb);
            let output = self.infer(input)?;
            let num_preds = output.len() / (4 + YOLO_CLASSES);
            let detections = decode(&output, num_preds, &lb, self.confidence);
            debug!("Frame {}: {} detections", frame.index, detections.len());
            Ok(detections)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}
