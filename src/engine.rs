//! The evaluation engine boundary.
//!
//! Synchronization only ever hands the engine raw snapshot payloads through
//! [`Engine::take_state`]; everything else on the trait is what the client surface and the
//! metrics reporter need from it. [`ToggleEngine`] is the engine used unless the application
//! brings its own.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    impact_metrics::{CollectedMetric, Labels, MetricsRegistry},
    snapshot::{Payload, ToggleSet},
    snapshot_store::SnapshotStore,
    Context, ParseError, Result,
};

/// Outcome of a variant query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// A named variant was selected.
    pub enabled: bool,
    /// The flag itself is enabled.
    pub feature_enabled: bool,
}

impl Variant {
    /// The variant returned when no named variant applies.
    pub fn disabled(feature_enabled: bool) -> Variant {
        Variant {
            name: "disabled".to_owned(),
            payload: None,
            enabled: false,
            feature_enabled,
        }
    }
}

/// Usage counts for one flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleCount {
    pub yes: u64,
    pub no: u64,
    #[serde(default)]
    pub variants: HashMap<String, u64>,
}

/// Flag usage counts over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub toggles: HashMap<String, ToggleCount>,
}

impl MetricsBucket {
    /// A bucket with no usage, used for heartbeat reports.
    pub fn empty(start: DateTime<Utc>, stop: DateTime<Utc>) -> MetricsBucket {
        MetricsBucket {
            start,
            stop,
            toggles: HashMap::new(),
        }
    }
}

/// Evaluation engine as seen by the synchronization core.
///
/// All methods take `&self`: the engine is shared between the evaluation path and the
/// synchronization threads and must synchronize internally. Evaluation methods must not block on
/// I/O.
pub trait Engine: Send + Sync {
    /// Replace the engine state with the snapshot in `raw`. On error, the previous state must be
    /// left untouched.
    fn take_state(&self, raw: &str) -> std::result::Result<(), ParseError>;

    /// Export the current state as a full snapshot that [`Engine::take_state`] accepts on an
    /// empty engine. This is what the backup file holds after incremental updates.
    fn get_state(&self) -> std::result::Result<String, ParseError>;

    /// Whether `toggle` is enabled for `context`. Unknown toggles are disabled.
    fn is_enabled(&self, toggle: &str, context: &Context) -> bool;

    /// Variant of `toggle` for `context`.
    fn get_variant(&self, toggle: &str, context: &Context) -> Variant;

    /// Record a flag evaluation in the usage bucket.
    fn count_toggle(&self, toggle: &str, enabled: bool);

    /// Record a variant evaluation in the usage bucket.
    fn count_variant(&self, toggle: &str, variant: &str);

    /// Take the usage bucket accumulated since the last call. `None` when nothing was counted.
    fn get_metrics(&self) -> Option<MetricsBucket>;

    fn define_counter(&self, name: &str, help: &str);
    fn inc_counter(&self, name: &str, value: f64, labels: Labels);
    fn define_gauge(&self, name: &str, help: &str);
    fn set_gauge(&self, name: &str, value: f64, labels: Labels);
    fn define_histogram(&self, name: &str, help: &str, buckets: Option<Vec<f64>>);
    fn observe_histogram(&self, name: &str, value: f64, labels: Labels);

    /// Drain impact metrics accumulated since the last collection.
    fn collect_impact_metrics(&self) -> Result<Vec<CollectedMetric>>;

    /// Put back impact metrics that could not be delivered.
    fn restore_impact_metrics(&self, metrics: Vec<CollectedMetric>);
}

#[derive(Debug)]
struct UsageWindow {
    start: DateTime<Utc>,
    toggles: HashMap<String, ToggleCount>,
}

/// Minimal engine: a flag is enabled when its definition says so, and its variant is the first
/// one defined. Strategy and constraint evaluation are not implemented.
#[derive(Debug)]
pub struct ToggleEngine {
    store: SnapshotStore,
    usage: Mutex<UsageWindow>,
    impact: MetricsRegistry,
}

impl Default for ToggleEngine {
    fn default() -> Self {
        ToggleEngine::new()
    }
}

impl ToggleEngine {
    /// Create an engine with no flags.
    pub fn new() -> ToggleEngine {
        ToggleEngine {
            store: SnapshotStore::new(),
            usage: Mutex::new(UsageWindow {
                start: Utc::now(),
                toggles: HashMap::new(),
            }),
            impact: MetricsRegistry::new(),
        }
    }

    /// Version of the active snapshot.
    pub fn version(&self) -> u64 {
        self.store.get().version
    }

    fn with_usage(&self, toggle: &str, f: impl FnOnce(&mut ToggleCount)) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        f(usage.toggles.entry(toggle.to_owned()).or_default());
    }
}

impl Engine for ToggleEngine {
    fn take_state(&self, raw: &str) -> std::result::Result<(), ParseError> {
        let next = self.store.get().apply(raw)?;
        self.store.set(next);
        Ok(())
    }

    fn get_state(&self) -> std::result::Result<String, ParseError> {
        self.store.get().to_snapshot()
    }

    fn is_enabled(&self, toggle: &str, _context: &Context) -> bool {
        self.store
            .get()
            .features
            .get(toggle)
            .is_some_and(|feature| feature.enabled)
    }

    fn get_variant(&self, toggle: &str, _context: &Context) -> Variant {
        let toggles = self.store.get();
        let Some(feature) = toggles.features.get(toggle) else {
            return Variant::disabled(false);
        };
        if !feature.enabled {
            return Variant::disabled(false);
        }

        match feature.variants.first() {
            Some(variant) => Variant {
                name: variant.name.clone(),
                payload: variant.payload.clone(),
                enabled: true,
                feature_enabled: true,
            },
            None => Variant::disabled(true),
        }
    }

    fn count_toggle(&self, toggle: &str, enabled: bool) {
        self.with_usage(toggle, |count| {
            if enabled {
                count.yes += 1;
            } else {
                count.no += 1;
            }
        });
    }

    fn count_variant(&self, toggle: &str, variant: &str) {
        self.with_usage(toggle, |count| {
            *count.variants.entry(variant.to_owned()).or_insert(0) += 1;
        });
    }

    fn get_metrics(&self) -> Option<MetricsBucket> {
        let now = Utc::now();
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let window = std::mem::replace(
            &mut *usage,
            UsageWindow {
                start: now,
                toggles: HashMap::new(),
            },
        );

        if window.toggles.is_empty() {
            // Keep the window open so the next bucket covers the idle time too.
            usage.start = window.start;
            return None;
        }

        Some(MetricsBucket {
            start: window.start,
            stop: now,
            toggles: window.toggles,
        })
    }

    fn define_counter(&self, name: &str, help: &str) {
        self.impact.define_counter(name, help);
    }

    fn inc_counter(&self, name: &str, value: f64, labels: Labels) {
        self.impact.inc_counter(name, value, labels);
    }

    fn define_gauge(&self, name: &str, help: &str) {
        self.impact.define_gauge(name, help);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels) {
        self.impact.set_gauge(name, value, labels);
    }

    fn define_histogram(&self, name: &str, help: &str, buckets: Option<Vec<f64>>) {
        self.impact.define_histogram(name, help, buckets);
    }

    fn observe_histogram(&self, name: &str, value: f64, labels: Labels) {
        self.impact.observe_histogram(name, value, labels);
    }

    fn collect_impact_metrics(&self) -> Result<Vec<CollectedMetric>> {
        Ok(self.impact.collect())
    }

    fn restore_impact_metrics(&self, metrics: Vec<CollectedMetric>) {
        self.impact.restore(metrics);
    }
}
