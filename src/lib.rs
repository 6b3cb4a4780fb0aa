// src/lib.rs
//
// Traffic incident detection: object tracking, multi-layer collision
// fusion and incident clip recording, one pipeline per camera stream.

pub mod analysis;
pub mod api_client;
pub mod clip;
pub mod clip_writer;
pub mod config;
pub mod detector;
pub mod frame_buffer;
pub mod incident_recorder;
pub mod incident_report;
pub mod pipeline;
pub mod source;
pub mod types;
#[cfg(feature = "video")]
pub mod video_source;
pub mod yolo;
