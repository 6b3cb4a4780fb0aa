// src/frame_buffer.rs
//
// Captured frames and the lookback ring the recorder seeds clips from.
//
// Frames are JPEG-encoded once, on capture, and only the encoded bytes are
// kept: a 720p RGB frame is ~2.7 MB raw but well under 200 KB as JPEG, which
// is what lets the ring and every open recording hold seconds of video per
// camera. Captures are shared (`Arc`) between the ring and any recordings.

use crate::types::Frame;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

// ============================================================================
// CAPTURE
// ============================================================================

#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub index: u64,
    /// `None` for frames without imagery (replayed sessions) or that failed to encode
    pub jpeg: Option<Vec<u8>>,
}

impl CapturedFrame {
    pub fn encoded_len(&self) -> usize {
        self.jpeg.as_ref().map_or(0, Vec::len)
    }
}

/// Turns raw RGB frames into `CapturedFrame`s.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn capture(&self, frame: &Frame) -> CapturedFrame {
        let jpeg = if frame.has_pixels() {
            match self.encode(frame) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Frame {} could not be encoded: {}", frame.index, e);
                    None
                }
            }
        } else {
            None
        };
        CapturedFrame {
            index: frame.index,
            jpeg,
        }
    }

    fn encode(&self, frame: &Frame) -> image::ImageResult<Vec<u8>> {
        let pixels = &frame.data[..frame.width * frame.height * 3];
        let mut out = Vec::with_capacity(pixels.len() / 10);
        JpegEncoder::new_with_quality(&mut out, self.quality).write_image(
            pixels,
            frame.width as u32,
            frame.height as u32,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

// ============================================================================
// LOOKBACK RING
// ============================================================================

pub struct LookbackBuffer {
    frames: VecDeque<Arc<CapturedFrame>>,
    capacity: usize,
}

impl LookbackBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Arc<CapturedFrame>) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Up to `n` most recent frames, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<CapturedFrame>> {
        let skip = self.frames.len().saturating_sub(n);
        self.frames.iter().skip(skip).cloned().collect()
    }
}
