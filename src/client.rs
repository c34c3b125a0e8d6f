use std::sync::Arc;

use derive_more::From;

use crate::{
    engine::{Engine, ToggleEngine, Variant},
    fetcher::ToggleFetcher,
    impact_metrics::ImpactMetrics,
    metrics_reporter::{MetricsReporter, ReporterThread},
    poller::{PollerThread, PollerThreadConfig},
    streaming::StreamingExecutor,
    sync::SyncCore,
    ClientConfig, Context, Error, Result, SdkContext, SyncMode,
};

/// The source keeping the snapshot current after initialization.
#[derive(From)]
enum LiveSource {
    Streaming(StreamingExecutor),
    Polling(PollerThread),
}

/// A feature flag client.
///
/// Construction installs the initial snapshot (bootstrap, else backup file), then starts the live
/// source and the metrics reporter in the background. Evaluations only read the engine and never
/// wait on the network.
///
/// # Examples
/// ```no_run
/// # use flagsync::{Client, ClientConfig, Context};
/// let client = Client::new(ClientConfig::new("https://flags.example.com/api", "checkout"))?;
/// if client.is_enabled("new-checkout", &Context::new().with_user_id("42")) {
///     // ...
/// }
/// client.shutdown()?;
/// # Ok::<(), flagsync::Error>(())
/// ```
pub struct Client {
    core: Arc<SyncCore>,
    live: Option<LiveSource>,
    reporter: Option<ReporterThread>,
    impact_metrics: ImpactMetrics,
}

impl Client {
    /// Create a client backed by the built-in [`ToggleEngine`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if the configured url cannot be used.
    /// - [`Error::Io`] if a background thread could not be spawned.
    pub fn new(config: ClientConfig) -> Result<Client> {
        Client::with_engine(config, Arc::new(ToggleEngine::new()))
    }

    /// Create a client evaluating flags with `engine`.
    pub fn with_engine(config: ClientConfig, engine: Arc<dyn Engine>) -> Result<Client> {
        let context = Arc::new(SdkContext::new(config));
        let core = Arc::new(SyncCore::new(context.clone(), engine.clone()));

        let source = core.initialize();
        log::debug!(target: "flagsync", source:? = source; "client initialized");

        let config = &context.config;
        let live = if config.disable_client {
            None
        } else {
            Some(start_live_source(&core)?)
        };

        let reporter = if config.disable_client || config.disable_metrics {
            None
        } else {
            let reporter = MetricsReporter::new(context.clone(), engine.clone())?;
            Some(ReporterThread::start(reporter, config.metrics_interval)?)
        };

        Ok(Client {
            impact_metrics: ImpactMetrics::new(engine, context),
            core,
            live,
            reporter,
        })
    }

    /// Whether `toggle` is enabled for `context`. Unknown toggles are disabled.
    pub fn is_enabled(&self, toggle: &str, context: &Context) -> bool {
        let engine = self.core.engine();
        let enabled = engine.is_enabled(toggle, context);
        engine.count_toggle(toggle, enabled);

        log::trace!(target: "flagsync", toggle, enabled, context:serde; "evaluated a flag");
        enabled
    }

    /// Variant of `toggle` for `context`.
    pub fn get_variant(&self, toggle: &str, context: &Context) -> Variant {
        let engine = self.core.engine();
        let variant = engine.get_variant(toggle, context);
        engine.count_toggle(toggle, variant.feature_enabled);
        engine.count_variant(toggle, &variant.name);

        log::trace!(target: "flagsync",
                    toggle,
                    context:serde,
                    variant = variant.name.as_str();
                    "evaluated a variant");
        variant
    }

    /// Handle to define and record impact metrics.
    pub fn impact_metrics(&self) -> &ImpactMetrics {
        &self.impact_metrics
    }

    /// Whether updates currently arrive over the streaming connection.
    pub fn is_streaming(&self) -> bool {
        matches!(&self.live, Some(LiveSource::Streaming(executor)) if executor.is_running())
    }

    /// Block until the first poll completed. Returns immediately when not polling.
    pub fn wait_for_configuration(&self) -> Result<()> {
        match &self.live {
            Some(LiveSource::Polling(poller)) => poller.wait_for_configuration(),
            _ => Ok(()),
        }
    }

    /// Stop the live source and flush metrics one last time.
    pub fn shutdown(self) -> Result<()> {
        let live = match self.live {
            Some(LiveSource::Streaming(executor)) => {
                executor.stop();
                Ok(())
            }
            Some(LiveSource::Polling(poller)) => poller.shutdown(),
            None => Ok(()),
        };
        let reporter = match self.reporter {
            Some(reporter) => reporter.shutdown(),
            None => Ok(()),
        };
        live.and(reporter)
    }
}

fn start_live_source(core: &Arc<SyncCore>) -> Result<LiveSource> {
    let config = &core.context().config;

    if config.mode == SyncMode::Streaming {
        let executor = StreamingExecutor::new(core.clone());
        match executor.start() {
            Ok(()) => return Ok(executor.into()),
            Err(Error::StreamingUnavailable) => {
                log::warn!(target: "flagsync", "streaming is not available, falling back to polling");
            }
            Err(err) => return Err(err),
        }
    }

    let fetcher = ToggleFetcher::new(core.clone())?;
    let poller = PollerThread::start(
        fetcher,
        PollerThreadConfig {
            interval: config.refresh_interval,
            jitter: config.refresh_jitter,
        },
    )?;
    Ok(poller.into())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::{Method::GET, MockServer};

    use super::Client;
    use crate::{
        BackupStore, BootstrapConfig, ClientConfig, Context, Engine, MetricFlagContext,
        MetricSample, SyncMode,
    };

    const SNAPSHOT_F: &str = r#"{"version":1,"features":[{"name":"F","enabled":true}]}"#;

    fn offline_config(dir: &tempfile::TempDir) -> ClientConfig {
        ClientConfig::new("http://localhost:4242/api", "client-test")
            .backup_file(dir.path().join("backup.json"))
            .disable_client(true)
    }

    #[test]
    fn bootstrap_is_used_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(
            offline_config(&dir).bootstrap(BootstrapConfig::data(SNAPSHOT_F)),
        )
        .unwrap();

        assert!(client.is_enabled("F", &Context::new()));
        assert!(!client.core.context().has_pending_bootstrap());
        client.shutdown().unwrap();
    }

    #[test]
    fn invalid_bootstrap_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        BackupStore::new(dir.path().join("backup.json")).save(SNAPSHOT_F);

        let client = Client::new(
            offline_config(&dir).bootstrap(BootstrapConfig::data("[not a snapshot")),
        )
        .unwrap();

        assert!(client.is_enabled("F", &Context::new()));
        assert!(!client.is_enabled("G", &Context::new()));
    }

    #[test]
    fn evaluations_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(
            offline_config(&dir).bootstrap(BootstrapConfig::data(SNAPSHOT_F)),
        )
        .unwrap();
        let context = Context::new();

        client.is_enabled("F", &context);
        client.is_enabled("missing", &context);
        let variant = client.get_variant("F", &context);
        assert_eq!(variant.name, "disabled");
        assert!(variant.feature_enabled);

        let bucket = client.core.engine().get_metrics().unwrap();
        assert_eq!(bucket.toggles["F"].yes, 2);
        assert_eq!(bucket.toggles["F"].variants["disabled"], 1);
        assert_eq!(bucket.toggles["missing"].no, 1);
    }

    #[test]
    fn impact_metrics_are_labelled_with_flag_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(
            offline_config(&dir)
                .custom_http_header("Authorization", "project:production.abc123")
                .bootstrap(BootstrapConfig::data(SNAPSHOT_F)),
        )
        .unwrap();

        let metrics = client.impact_metrics();
        metrics.define_counter("purchases", "purchases made");
        metrics.increment_counter(
            "purchases",
            1,
            Some(&MetricFlagContext::new(["F", "G"], Context::new())),
        );

        let collected = client.core.engine().collect_impact_metrics().unwrap();
        let MetricSample::Value { labels, value } = &collected[0].samples[0] else {
            panic!("expected a counter sample");
        };
        assert_eq!(*value, 1.0);
        assert_eq!(labels["appName"], "client-test");
        assert_eq!(labels["environment"], "production");
        assert_eq!(labels["F"], "enabled");
        assert_eq!(labels["G"], "disabled");
    }

    #[tokio::test]
    async fn url_bootstrap_works_inside_async_runtime() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/boot");
                then.status(200).body(SNAPSHOT_F);
            })
            .await;
        let dir = tempfile::tempdir().unwrap();

        let client = Client::new(
            offline_config(&dir).bootstrap(BootstrapConfig::url(server.url("/boot"))),
        )
        .unwrap();

        assert!(client.is_enabled("F", &Context::new()));
        mock.assert_async().await;
        client.shutdown().unwrap();
    }

    #[test]
    fn polls_and_persists_snapshot() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/client/features");
            then.status(200).body(SNAPSHOT_F);
        });
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup.json");
        let client = Client::new(
            ClientConfig::new(server.url("/api"), "client-test")
                .backup_file(&backup)
                .refresh_interval(Duration::from_millis(100))
                .disable_metrics(true),
        )
        .unwrap();

        client.wait_for_configuration().unwrap();
        assert!(client.is_enabled("F", &Context::new()));
        assert!(!client.is_streaming());
        assert_eq!(BackupStore::new(backup).read().as_deref(), Some(SNAPSHOT_F));
        client.shutdown().unwrap();
    }

    #[cfg(feature = "streaming")]
    #[test]
    fn streams_when_configured() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/client/streaming");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(format!("event: unleash-connected\ndata: {SNAPSHOT_F}\n\n"));
        });
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(
            ClientConfig::new(server.url("/api"), "client-test")
                .backup_file(dir.path().join("backup.json"))
                .mode(SyncMode::Streaming)
                .disable_metrics(true),
        )
        .unwrap();

        assert!(client.is_streaming());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !client.is_enabled("F", &Context::new()) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(client.is_enabled("F", &Context::new()));
        client.shutdown().unwrap();
    }

    #[cfg(not(feature = "streaming"))]
    #[test]
    fn streaming_mode_falls_back_to_polling() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/client/features");
            then.status(200).body(SNAPSHOT_F);
        });
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(
            ClientConfig::new(server.url("/api"), "client-test")
                .backup_file(dir.path().join("backup.json"))
                .mode(SyncMode::Streaming)
                .disable_metrics(true),
        )
        .unwrap();

        client.wait_for_configuration().unwrap();
        assert!(!client.is_streaming());
        assert!(client.is_enabled("F", &Context::new()));
        client.shutdown().unwrap();
    }
}
