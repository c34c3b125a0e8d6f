use std::{path::PathBuf, time::Duration};

use reqwest::Url;

use crate::{bootstrap::BootstrapConfig, Error, Result};

/// How the client keeps its snapshot current after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Periodically pull the full snapshot over HTTP.
    #[default]
    Polling,
    /// Keep a Server-Sent Events connection open and apply pushed payloads.
    Streaming,
}

/// When a streamed payload is written to the backup file.
///
/// [`BackupPolicy::PersistSeen`] writes the raw payload before the engine sees it, so the backup
/// always holds the most recent payload received, even one the engine rejected. The backup and
/// the in-memory state can then diverge until the next good payload arrives.
/// [`BackupPolicy::PersistApplied`] only writes payloads the engine accepted, keeping the two in
/// step at the cost of losing the rejected payload.
///
/// Under both policies an accepted payload is followed by a write of the engine's full state, so
/// incremental events never leave a partial backup behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupPolicy {
    /// Persist, then apply.
    #[default]
    PersistSeen,
    /// Apply, then persist on success.
    PersistApplied,
}

/// Connection parameters for the streaming transport.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// The connection is recycled when nothing (not even a heartbeat) arrives within this window.
    pub read_timeout: Duration,
    /// Fixed delay before reconnecting after the connection drops.
    pub reconnect_delay: Duration,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
}

impl StreamingConfig {
    /// Default value for [`StreamingConfig::read_timeout`].
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default value for [`StreamingConfig::reconnect_delay`].
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
    /// Default value for [`StreamingConfig::connect_timeout`].
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Update read timeout with `read_timeout`.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> StreamingConfig {
        self.read_timeout = read_timeout;
        self
    }

    /// Update reconnect delay with `reconnect_delay`.
    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> StreamingConfig {
        self.reconnect_delay = reconnect_delay;
        self
    }

    /// Update connect timeout with `connect_timeout`.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> StreamingConfig {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for StreamingConfig {
    fn default() -> StreamingConfig {
        StreamingConfig {
            read_timeout: StreamingConfig::DEFAULT_READ_TIMEOUT,
            reconnect_delay: StreamingConfig::DEFAULT_RECONNECT_DELAY,
            connect_timeout: StreamingConfig::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Configuration for [`Client`](crate::Client).
///
/// # Examples
/// ```
/// # use flagsync::{ClientConfig, SyncMode};
/// let config = ClientConfig::new("https://flags.example.com/api", "checkout")
///     .environment("production")
///     .custom_http_header("Authorization", "checkout:production.4f1c")
///     .mode(SyncMode::Streaming);
/// ```
pub struct ClientConfig {
    pub(crate) url: String,
    pub(crate) app_name: String,
    pub(crate) instance_id: String,
    pub(crate) connection_id: String,
    pub(crate) environment: String,
    pub(crate) custom_http_headers: Vec<(String, String)>,
    pub(crate) refresh_interval: Duration,
    pub(crate) refresh_jitter: Duration,
    pub(crate) metrics_interval: Duration,
    pub(crate) metrics_grace_period: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) backup_file: Option<PathBuf>,
    pub(crate) bootstrap: Option<BootstrapConfig>,
    pub(crate) mode: SyncMode,
    pub(crate) streaming: StreamingConfig,
    pub(crate) backup_policy: BackupPolicy,
    pub(crate) disable_client: bool,
    pub(crate) disable_metrics: bool,
}

impl ClientConfig {
    /// Default value for the environment label when the `Authorization` header does not carry one.
    pub const DEFAULT_ENVIRONMENT: &'static str = "default";
    /// Default interval between polling fetches.
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
    /// Default jitter subtracted from the refresh interval.
    pub const DEFAULT_REFRESH_JITTER: Duration = Duration::from_secs(1);
    /// Default interval between metrics flushes.
    pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);
    /// Longest time the reporter stays silent when there is nothing to report.
    pub const DEFAULT_METRICS_GRACE_PERIOD: Duration = Duration::from_secs(600);
    /// Default timeout for fetch and report requests.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a configuration for the server at `url` identifying as `app_name`.
    pub fn new(url: impl Into<String>, app_name: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            app_name: app_name.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            environment: ClientConfig::DEFAULT_ENVIRONMENT.to_owned(),
            custom_http_headers: Vec::new(),
            refresh_interval: ClientConfig::DEFAULT_REFRESH_INTERVAL,
            refresh_jitter: ClientConfig::DEFAULT_REFRESH_JITTER,
            metrics_interval: ClientConfig::DEFAULT_METRICS_INTERVAL,
            metrics_grace_period: ClientConfig::DEFAULT_METRICS_GRACE_PERIOD,
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            backup_file: None,
            bootstrap: None,
            mode: SyncMode::default(),
            streaming: StreamingConfig::default(),
            backup_policy: BackupPolicy::default(),
            disable_client: false,
            disable_metrics: false,
        }
    }

    /// Override the instance identifier reported to the server.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Fallback environment label, used when the `Authorization` header does not name one.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Add a header sent with every request.
    pub fn custom_http_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_http_headers.push((name.into(), value.into()));
        self
    }

    /// Interval between polling fetches.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Random jitter subtracted from each refresh interval. This helps to avoid many instances
    /// synchronizing and producing spiky load.
    pub fn refresh_jitter(mut self, jitter: Duration) -> Self {
        self.refresh_jitter = jitter;
        self
    }

    /// Interval between metrics flushes. Also sent to the server in the interval header.
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Longest time without a report. When elapsed, an empty heartbeat report is sent.
    pub fn metrics_grace_period(mut self, grace_period: Duration) -> Self {
        self.metrics_grace_period = grace_period;
        self
    }

    /// Timeout applied to fetch and report requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Path of the backup file.
    pub fn backup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_file = Some(path.into());
        self
    }

    /// Initial snapshot source consulted once, before the backup file and the network.
    pub fn bootstrap(mut self, bootstrap: BootstrapConfig) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Live source used after initialization.
    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Streaming connection parameters.
    pub fn streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// See [`BackupPolicy`].
    pub fn backup_policy(mut self, policy: BackupPolicy) -> Self {
        self.backup_policy = policy;
        self
    }

    /// Do not start any network source. Bootstrap and backup are still loaded.
    pub fn disable_client(mut self, disable: bool) -> Self {
        self.disable_client = disable;
        self
    }

    /// Do not start the metrics reporter.
    pub fn disable_metrics(mut self, disable: bool) -> Self {
        self.disable_metrics = disable;
        self
    }

    pub(crate) fn resolved_backup_file(&self) -> PathBuf {
        self.backup_file.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("flagsync-repo-{}.json", self.app_name))
        })
    }

    pub(crate) fn features_uri(&self) -> Result<Url> {
        self.endpoint("client/features")
    }

    pub(crate) fn streaming_uri(&self) -> Result<Url> {
        self.endpoint("client/streaming")
    }

    pub(crate) fn metrics_uri(&self) -> Result<Url> {
        self.endpoint("client/metrics")
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}", self.url.trim_end_matches('/'), path))
            .map_err(Error::InvalidUrl)
    }
}

#[cfg(test)]
mod tests {
    use super::ClientConfig;

    #[test]
    fn endpoints_ignore_trailing_slash() {
        let with_slash = ClientConfig::new("http://flags.test/api/", "app");
        let without_slash = ClientConfig::new("http://flags.test/api", "app");

        assert_eq!(
            with_slash.features_uri().unwrap().as_str(),
            "http://flags.test/api/client/features"
        );
        assert_eq!(
            without_slash.streaming_uri().unwrap().as_str(),
            "http://flags.test/api/client/streaming"
        );
        assert_eq!(
            without_slash.metrics_uri().unwrap().as_str(),
            "http://flags.test/api/client/metrics"
        );
    }

    #[test]
    fn rejects_invalid_url() {
        let config = ClientConfig::new("not a url", "app");
        assert!(config.features_uri().is_err());
    }

    #[test]
    fn backup_file_defaults_to_temp_dir() {
        let config = ClientConfig::new("http://flags.test", "my-app");
        let path = config.resolved_backup_file();
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.ends_with("flagsync-repo-my-app.json"));
    }

    #[test]
    fn connection_ids_are_unique_per_config() {
        let a = ClientConfig::new("http://flags.test", "app");
        let b = ClientConfig::new("http://flags.test", "app");
        assert_ne!(a.connection_id, b.connection_id);
    }
}
