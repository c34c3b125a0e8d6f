use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    streaming::{EventProcessor, EventSource},
    sync::{Lifecycle, SyncCore},
    Result,
};

/// Drives the streaming connection through `Idle → Connecting → Running → Stopped`.
///
/// Transitions happen under the [`SyncCore`] lock, the same one every apply takes.
pub struct StreamingExecutor {
    core: Arc<SyncCore>,
    processor: Arc<EventProcessor>,
    generations: AtomicU64,
}

impl StreamingExecutor {
    pub fn new(core: Arc<SyncCore>) -> StreamingExecutor {
        StreamingExecutor {
            processor: Arc::new(EventProcessor::new(core.clone())),
            core,
            generations: AtomicU64::new(0),
        }
    }

    /// Open the stream. Does nothing if it is already running or the client is disabled.
    ///
    /// # Errors
    ///
    /// - [`Error::StreamingUnavailable`](crate::Error::StreamingUnavailable) when the crate was
    ///   built without the `streaming` feature. The state is left unchanged and the caller is
    ///   expected to fall back to polling.
    /// - [`Error::InvalidUrl`](crate::Error::InvalidUrl) or
    ///   [`Error::Transport`](crate::Error::Transport) when the connection cannot be set up.
    pub fn start(&self) -> Result<()> {
        let mut state = self.core.lock();
        if self.core.context().config.disable_client || matches!(*state, Lifecycle::Running(_)) {
            return Ok(());
        }

        let previous = std::mem::replace(&mut *state, Lifecycle::Connecting);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        match self.create_event_source(generation) {
            Ok(source) => {
                log::debug!(target: "flagsync", generation = generation; "streaming started");
                *state = Lifecycle::Running(source);
                Ok(())
            }
            Err(err) => {
                *state = previous;
                Err(err)
            }
        }
    }

    /// Close the stream. Safe to call in any state; never waits on the network.
    pub fn stop(&self) {
        let mut state = self.core.lock();
        if let Lifecycle::Running(source) = std::mem::replace(&mut *state, Lifecycle::Stopped) {
            source.close();
            log::debug!(target: "flagsync", generation = source.generation(); "streaming stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.core.lock(), Lifecycle::Running(_))
    }

    /// Processor shared by every connection opened by this executor.
    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    fn create_event_source(&self, generation: u64) -> Result<EventSource> {
        let context = self.core.context();
        let processor = self.processor.clone();

        EventSource::connect(
            generation,
            context.config.streaming_uri()?,
            context.http_headers().clone(),
            context.config.streaming.clone(),
            move |event| processor.process_connection_event(generation, &event),
            move |err| {
                log::warn!(target: "flagsync", generation = generation; "stream error, reconnecting: {err}");
            },
        )
    }
}

impl Drop for StreamingExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::StreamingExecutor;
    use crate::{
        streaming::{StreamEvent, StreamEventKind},
        sync::SyncCore,
        ClientConfig, Context, SdkContext, StreamingConfig, ToggleEngine,
    };

    fn executor(url: String, dir: &tempfile::TempDir, disabled: bool) -> StreamingExecutor {
        let config = ClientConfig::new(url, "stream-test")
            .backup_file(dir.path().join("backup.json"))
            .streaming(
                StreamingConfig::default()
                    .with_reconnect_delay(Duration::from_millis(50))
                    .with_read_timeout(Duration::from_secs(5)),
            )
            .disable_client(disabled);
        StreamingExecutor::new(Arc::new(SyncCore::new(
            Arc::new(SdkContext::new(config)),
            Arc::new(ToggleEngine::new()),
        )))
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn disabled_client_never_starts() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor("http://localhost:4242/api".to_owned(), &dir, true);

        executor.start().unwrap();
        assert!(!executor.is_running());
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor("http://localhost:4242/api".to_owned(), &dir, false);

        executor.stop();
        executor.stop();
        assert!(!executor.is_running());
    }

    #[cfg(feature = "streaming")]
    #[test]
    fn applies_streamed_hydration() {
        use httpmock::{Method::GET, MockServer};

        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/client/streaming");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    ": keep-alive\n\n",
                    "event: unleash-connected\n",
                    "data: {\"version\":1,\"features\":[{\"name\":\"A\",\"enabled\":true},",
                    "{\"name\":\"B\",\"enabled\":true}]}\n\n",
                    "event: heartbeat\n",
                    "data: {\"version\":2,\"features\":[]}\n\n",
                ));
        });
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(server.url("/api"), &dir, false);
        let context = Context::new();

        executor.start().unwrap();
        executor.start().unwrap();
        assert!(executor.is_running());

        let engine = executor.core.engine().clone();
        assert!(wait_until(|| engine.is_enabled("A", &context)
            && engine.is_enabled("B", &context)));
        assert!(mock.hits() >= 1);

        executor.stop();
        assert!(!executor.is_running());
        executor.stop();

        let backup = executor.core.backup().read().unwrap();
        assert!(backup.contains("\"B\""));
    }

    #[cfg(feature = "streaming")]
    #[test]
    fn events_from_stopped_connection_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        // nothing listens here, the connection keeps failing and retrying
        let executor = executor("http://127.0.0.1:9/api".to_owned(), &dir, false);

        executor.start().unwrap();
        executor.stop();

        executor.processor().process_connection_event(
            1,
            &StreamEvent {
                kind: StreamEventKind::Updated,
                data: r#"{"version":1,"features":[{"name":"A","enabled":true}]}"#.to_owned(),
            },
        );
        assert!(!executor.core.engine().is_enabled("A", &Context::new()));
        assert_eq!(executor.core.backup().read(), None);
    }

    #[cfg(feature = "streaming")]
    #[test]
    fn can_restart_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor("http://127.0.0.1:9/api".to_owned(), &dir, false);

        executor.start().unwrap();
        executor.stop();
        executor.start().unwrap();
        assert!(executor.is_running());

        // the first connection's events no longer apply, the second one's do
        let event = StreamEvent {
            kind: StreamEventKind::Updated,
            data: r#"{"version":1,"features":[{"name":"A","enabled":true}]}"#.to_owned(),
        };
        executor.processor().process_connection_event(1, &event);
        assert!(!executor.core.engine().is_enabled("A", &Context::new()));
        executor.processor().process_connection_event(2, &event);
        assert!(executor.core.engine().is_enabled("A", &Context::new()));

        executor.stop();
    }

    #[cfg(not(feature = "streaming"))]
    #[test]
    fn start_fails_fast_without_transport() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor("http://localhost:4242/api".to_owned(), &dir, false);

        assert!(matches!(
            executor.start(),
            Err(crate::Error::StreamingUnavailable)
        ));
        assert!(!executor.is_running());
    }
}
