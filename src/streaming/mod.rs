//! Push synchronization over Server-Sent Events.
//!
//! [`StreamingExecutor`] owns the connection lifecycle, [`EventSource`] runs the connection and
//! [`EventProcessor`] turns received events into backup writes and engine updates. The transport
//! is compiled in with the `streaming` feature; without it [`StreamingExecutor::start`] fails with
//! [`Error::StreamingUnavailable`](crate::Error::StreamingUnavailable).
mod event_source;
mod executor;
mod processor;
mod sse;

pub use event_source::EventSource;
pub use executor::StreamingExecutor;
pub use processor::{EventProcessor, StreamEvent, StreamEventKind};
