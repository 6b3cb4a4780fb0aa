// src/video_source.rs
//
// OpenCV-backed frame source for video files, HLS playlists and RTSP URIs.
// Frames are converted BGR -> RGB8 on read.
//
// Timestamps come from the capture position (CAP_PROP_POS_MSEC), so a live
// stream that stalls still advances stream time. Stream time never goes
// backwards across a reopen; a file reopened after frames were read starts
// over from its first frame and is reported as a new scene.

use crate::source::{FrameSource, ReadOutcome};
use crate::types::Frame;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use std::path::Path;
use tracing::{info, warn};

/// Monotonic stream time across reopens.
#[derive(Debug, Default)]
struct StreamClock {
    base_ms: f64,
    last_ms: Option<f64>,
    frames_since_open: u64,
}

impl StreamClock {
    fn reopened(&mut self, frame_interval_ms: f64) {
        if let Some(last) = self.last_ms {
            self.base_ms = last + frame_interval_ms;
        }
        self.frames_since_open = 0;
    }

    /// `position_ms` is the capture's own position, 0 or NaN when the backend has none.
    fn stamp(&mut self, position_ms: f64, frame_interval_ms: f64) -> f64 {
        let since_open = if position_ms.is_finite() && position_ms > 0.0 {
            position_ms
        } else {
            self.frames_since_open as f64 * frame_interval_ms
        };
        self.frames_since_open += 1;

        let mut ts = self.base_ms + since_open;
        if let Some(last) = self.last_ms {
            if ts <= last {
                ts = last + frame_interval_ms;
            }
        }
        self.last_ms = Some(ts);
        ts
    }
}

pub struct VideoSource {
    uri: String,
    fallback_fps: f64,
    cap: Option<VideoCapture>,
    fps: f64,
    total_frames: i64,
    next_index: u64,
    clock: StreamClock,
    scene_pending: bool,
    new_scene: bool,
}

impl VideoSource {
    pub fn new(uri: &str, fallback_fps: f64) -> Self {
        Self {
            uri: uri.to_string(),
            fallback_fps,
            cap: None,
            fps: fallback_fps,
            total_frames: 0,
            next_index: 0,
            clock: StreamClock::default(),
            scene_pending: false,
            new_scene: false,
        }
    }

    fn is_file(&self) -> bool {
        Path::new(&self.uri).is_file()
    }

    fn frame_interval_ms(&self) -> f64 {
        1000.0 / self.fps
    }

    fn try_open(&mut self) -> opencv::Result<bool> {
        let cap = VideoCapture::from_file(&self.uri, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Ok(false);
        }
        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        self.fps = if fps > 0.0 { fps } else { self.fallback_fps };
        self.total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i64;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)?;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)?;

        if self.next_index > 0 {
            self.clock.reopened(self.frame_interval_ms());
            // A file plays again from its start
            self.scene_pending = self.is_file();
        }

        info!(
            "Video opened: {} ({}x{} @ {:.1} fps, {} frames)",
            self.uri, width, height, self.fps, self.total_frames
        );
        self.cap = Some(cap);
        Ok(true)
    }

    fn read_frame(&mut self) -> opencv::Result<Option<Frame>> {
        let Some(cap) = self.cap.as_mut() else {
            return Ok(None);
        };
        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }
        let position_ms = VideoCaptureTraitConst::get(&*cap, videoio::CAP_PROP_POS_MSEC)?;

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;
        let data = rgb_mat.data_bytes()?.to_vec();

        let interval = self.frame_interval_ms();
        let index = self.next_index;
        self.next_index += 1;
        self.new_scene = std::mem::take(&mut self.scene_pending);
        Ok(Some(Frame {
            index,
            timestamp_ms: self.clock.stamp(position_ms, interval),
            width: rgb_mat.cols() as usize,
            height: rgb_mat.rows() as usize,
            data,
        }))
    }
}

impl FrameSource for VideoSource {
    fn open(&mut self) -> bool {
        match self.try_open() {
            Ok(opened) => {
                if !opened {
                    warn!("Could not open video source {}", self.uri);
                }
                opened
            }
            Err(e) => {
                warn!("Could not open video source {}: {}", self.uri, e);
                false
            }
        }
    }

    fn read(&mut self) -> ReadOutcome {
        self.new_scene = false;
        match self.read_frame() {
            Ok(Some(frame)) => ReadOutcome::Frame(frame),
            Ok(None) => {
                // Files end; live streams only stall
                let played = self.clock.frames_since_open as i64;
                if self.is_file() && self.total_frames > 0 && played >= self.total_frames {
                    ReadOutcome::Ended
                } else {
                    ReadOutcome::Failed
                }
            }
            Err(e) => {
                warn!("Frame read failed on {}: {}", self.uri, e);
                ReadOutcome::Failed
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            if let Err(e) = cap.release() {
                warn!("Releasing {} failed: {}", self.uri, e);
            }
        }
    }

    fn describe(&self) -> String {
        format!("video:{}", self.uri)
    }

    fn is_new_scene(&self) -> bool {
        self.new_scene
    }
}
