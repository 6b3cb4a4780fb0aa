// src/pipeline/event_bus.rs
//
// Decoupled event stream out of one pipeline instance. The pipeline
// publishes; the run loop drains once per frame and forwards to the sink.
// Bounded: a stalled consumer loses the oldest events, never the pipeline.

use crate::analysis::incident_detector::ConfirmedIncident;
use crate::clip::ClipId;
use crate::incident_recorder::EndReason;
use std::collections::VecDeque;
use tracing::warn;

const DEFAULT_MAX_PENDING: usize = 256;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    IncidentConfirmed {
        frame_index: u64,
        incident: ConfirmedIncident,
    },

    RecordingStarted {
        clip_id: ClipId,
        frame_index: u64,
    },

    /// Confirmations absorbed by an open recording or a cooldown
    RecordingSuppressed {
        frame_index: u64,
        count: usize,
    },

    ClipFinalized {
        clip_id: ClipId,
        reason: EndReason,
        frames: usize,
    },

    SourceFailed {
        consecutive: u32,
    },

    SourceReconnected {
        attempt: u32,
    },

    NewScene {
        frame_index: u64,
    },
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
