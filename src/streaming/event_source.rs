//! The push connection: one thread per connection, reconnecting until closed.
#[cfg(feature = "streaming")]
use std::time::Duration;

use reqwest::{header::HeaderMap, Url};
use tokio::sync::watch;

use crate::{config::StreamingConfig, streaming::StreamEvent, Error, Result};

/// Handle to a running connection. Closing it (or dropping it) signals the connection thread and
/// returns immediately; the thread exits at its next suspension point.
#[derive(Debug)]
pub struct EventSource {
    generation: u64,
    stop: watch::Sender<bool>,
}

impl EventSource {
    /// Open a connection to `url` on a dedicated thread.
    ///
    /// `on_event` is called on the connection thread for every decoded event, in order.
    /// `on_error` is called for every failed attempt before the reconnect delay.
    #[cfg(feature = "streaming")]
    pub(crate) fn connect(
        generation: u64,
        url: Url,
        headers: HeaderMap,
        config: StreamingConfig,
        on_event: impl Fn(StreamEvent) + Send + 'static,
        on_error: impl Fn(&Error) + Send + 'static,
    ) -> Result<EventSource> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .default_headers(headers)
            .build()?;
        let (stop, stop_receiver) = watch::channel(false);

        std::thread::Builder::new()
            .name(format!("flagsync-stream-{generation}"))
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            on_error(&Error::from(err));
                            return;
                        }
                    };
                    runtime.block_on(run(client, url, config, stop_receiver, &on_event, &on_error));
                }));

                if result.is_err() {
                    log::error!(target: "flagsync", generation = generation; "stream thread panicked");
                }
            })?;

        Ok(EventSource { generation, stop })
    }

    /// Without the `streaming` feature there is no transport to connect with.
    #[cfg(not(feature = "streaming"))]
    pub(crate) fn connect(
        generation: u64,
        url: Url,
        headers: HeaderMap,
        config: StreamingConfig,
        on_event: impl Fn(StreamEvent) + Send + 'static,
        on_error: impl Fn(&Error) + Send + 'static,
    ) -> Result<EventSource> {
        let _ = (generation, url, headers, config, on_event, on_error);
        Err(Error::StreamingUnavailable)
    }

    /// Identifies the connection among the ones opened by an executor.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signal the connection thread to exit. Does not wait for it.
    pub fn close(&self) {
        // Err means the thread is already gone.
        let _ = self.stop.send(true);
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "streaming")]
enum StreamEnd {
    Stopped,
    Closed,
}

#[cfg(feature = "streaming")]
async fn run(
    client: reqwest::Client,
    url: Url,
    config: StreamingConfig,
    mut stop: watch::Receiver<bool>,
    on_event: &(impl Fn(StreamEvent) + Send),
    on_error: &(impl Fn(&Error) + Send),
) {
    loop {
        if *stop.borrow() {
            return;
        }

        match read_stream(&client, &url, config.read_timeout, &mut stop, on_event).await {
            Ok(StreamEnd::Stopped) => return,
            Ok(StreamEnd::Closed) => {
                log::debug!(target: "flagsync", "stream closed by server");
            }
            Err(err) => on_error(&err),
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = stop.changed() => return,
        }
    }
}

#[cfg(feature = "streaming")]
async fn read_stream(
    client: &reqwest::Client,
    url: &Url,
    read_timeout: Duration,
    stop: &mut watch::Receiver<bool>,
    on_event: &(impl Fn(StreamEvent) + Send),
) -> Result<StreamEnd> {
    use reqwest::header::ACCEPT;

    use crate::streaming::sse::SseDecoder;

    log::debug!(target: "flagsync", url:% = url; "opening stream");
    let request = client
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .send();

    let mut response = tokio::select! {
        response = tokio::time::timeout(read_timeout, request) => {
            response.map_err(|_| Error::ReadTimeout(read_timeout))??
        }
        _ = stop.changed() => return Ok(StreamEnd::Stopped),
    };

    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus(status));
    }
    log::debug!(target: "flagsync", "stream connected");

    let mut decoder = SseDecoder::new();
    loop {
        let chunk = tokio::select! {
            chunk = tokio::time::timeout(read_timeout, response.chunk()) => chunk,
            _ = stop.changed() => return Ok(StreamEnd::Stopped),
        };

        let Ok(chunk) = chunk else {
            return Err(Error::ReadTimeout(read_timeout));
        };
        let Some(bytes) = chunk? else {
            return Ok(StreamEnd::Closed);
        };

        for event in decoder.feed(&bytes) {
            on_event(StreamEvent::from(event));
        }
    }
}
