use std::sync::Arc;

use crate::{streaming::sse::SseEvent, sync::SyncCore};

/// Kind of a streamed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventKind {
    /// Initial hydration sent right after the connection is established.
    Connected,
    /// Incremental or full update.
    Updated,
    /// Anything else. Dropped without touching any state.
    Unknown(String),
}

impl StreamEventKind {
    pub fn from_type(event_type: &str) -> StreamEventKind {
        match event_type {
            "unleash-connected" => StreamEventKind::Connected,
            "unleash-updated" => StreamEventKind::Updated,
            other => StreamEventKind::Unknown(other.to_owned()),
        }
    }
}

/// A message received over the streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub data: String,
}

impl From<SseEvent> for StreamEvent {
    fn from(event: SseEvent) -> StreamEvent {
        StreamEvent {
            kind: StreamEventKind::from_type(&event.event),
            data: event.data,
        }
    }
}

/// Routes stream events to the backup file and the engine.
///
/// Errors are handled per event: they are logged and the next event is processed normally.
pub struct EventProcessor {
    core: Arc<SyncCore>,
}

impl EventProcessor {
    pub fn new(core: Arc<SyncCore>) -> EventProcessor {
        EventProcessor { core }
    }

    /// Process `event` regardless of the streaming lifecycle.
    pub fn process_event(&self, event: &StreamEvent) {
        self.dispatch(None, event);
    }

    /// Process `event` received on the connection with `generation`. The event is dropped when
    /// that connection has been stopped or replaced by the time the lock is acquired.
    pub(crate) fn process_connection_event(&self, generation: u64, event: &StreamEvent) {
        self.dispatch(Some(generation), event);
    }

    fn dispatch(&self, generation: Option<u64>, event: &StreamEvent) {
        match &event.kind {
            StreamEventKind::Connected | StreamEventKind::Updated => {
                log::debug!(target: "flagsync", kind:? = event.kind; "processing stream event");
            }
            StreamEventKind::Unknown(event_type) => {
                log::debug!(target: "flagsync", event_type = event_type.as_str(); "ignoring unknown stream event");
                return;
            }
        }

        let guard = self.core.lock();
        if let Some(generation) = generation {
            if !guard.accepts(generation) {
                log::debug!(target: "flagsync", generation = generation; "dropping event from a closed stream");
                return;
            }
        }

        if let Err(err) = self.core.apply_streamed(&guard, &event.data) {
            log::warn!(target: "flagsync", kind:? = event.kind; "unable to apply stream event: {err}");
        }
    }
}
