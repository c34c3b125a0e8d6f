//! Snapshot synchronization for feature flag clients.
//!
//! # Overview
//!
//! A [`Client`] keeps an in-memory flag snapshot current and answers evaluation queries from it
//! without ever waiting on the network. The snapshot comes from, in order:
//!
//! 1. a [`BootstrapConfig`] supplied by the application, used once;
//! 2. the backup file written by previous runs (see [`BackupStore`]);
//! 3. the server, either polled periodically or pushed over a Server-Sent Events stream
//!    (see [`SyncMode`]).
//!
//! Every snapshot received from the server is also written to the backup file, so a restarted
//! process can serve flags before the network responds.
//!
//! Flag usage and application defined impact metrics (see [`ImpactMetrics`]) are reported back to
//! the server in the background.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Synchronization failures never reach the
//! evaluation path: they are logged, and the client keeps serving the last snapshot it managed to
//! apply.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with target `flagsync`.
//! Consider integrating a `log`-compatible logger implementation for better visibility into
//! synchronization.
//!
//! # Features
//!
//! - `streaming` (default): the Server-Sent Events transport. Without it, [`SyncMode::Streaming`]
//!   falls back to polling.

#![warn(rustdoc::missing_crate_level_docs)]

mod backup;
mod bootstrap;
mod client;
mod config;
mod context;
mod engine;
mod environment;
mod error;
mod fetcher;
mod impact_metrics;
mod metrics_reporter;
mod poller;
mod snapshot;
mod snapshot_store;
pub mod streaming;
mod sync;

pub use backup::BackupStore;
pub use bootstrap::BootstrapConfig;
pub use client::Client;
pub use config::{BackupPolicy, ClientConfig, StreamingConfig, SyncMode};
pub use context::{Context, SdkContext};
pub use engine::{Engine, MetricsBucket, ToggleCount, ToggleEngine, Variant};
pub use environment::environment_from_headers;
pub use error::{Error, ParseError, Result};
pub use fetcher::{FetchOutcome, ToggleFetcher};
pub use impact_metrics::{
    BucketCount, CollectedMetric, ImpactMetrics, Labels, MetricFlagContext, MetricSample,
    MetricType, MetricsRegistry, DEFAULT_BUCKETS,
};
pub use metrics_reporter::{MetricsReporter, ReportOutcome, ReporterThread};
pub use poller::{PollerThread, PollerThreadConfig};
pub use snapshot::{Feature, Payload, Segment, ToggleSet, VariantDefinition};
pub use sync::{InitialSource, SyncCore};

/// Version of the client specification this crate implements, sent with metrics reports.
pub const CLIENT_SPEC_VERSION: &str = "5.2.0";
