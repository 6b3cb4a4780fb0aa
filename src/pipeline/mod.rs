// src/pipeline/mod.rs

pub mod event_bus;
pub mod frame_context;
pub mod orchestrator;
pub mod session_stats;

pub use event_bus::{EventBus, PipelineEvent};
pub use frame_context::FrameContext;
pub use orchestrator::{IncidentPipeline, OutputSink, PipelineBuilder, PipelineError, StopHandle};
pub use session_stats::{SessionStats, SessionSummary};
