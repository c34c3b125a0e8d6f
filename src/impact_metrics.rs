//! Application-defined counters, gauges and histograms, labelled with the flags a user was
//! exposed to.
//!
//! [`MetricsRegistry`] accumulates samples between flushes. [`ImpactMetrics`] is the facade
//! handed to applications: it resolves the label set of every sample before passing it on.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{engine::Engine, Context, SdkContext};

/// Label set of a sample. Ordered, so equal sets compare equal regardless of insertion order.
pub type Labels = BTreeMap<String, String>;

/// Default histogram bucket upper bounds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// A metric with the samples accumulated since the last collection, in wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedMetric {
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub samples: Vec<MetricSample>,
}

/// One labelled sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricSample {
    Histogram {
        labels: Labels,
        count: u64,
        sum: f64,
        buckets: Vec<BucketCount>,
    },
    Value {
        labels: Labels,
        value: f64,
    },
}

/// Cumulative count of observations less than or equal to `le`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketCount {
    #[serde(with = "bucket_bound")]
    pub le: f64,
    pub count: u64,
}

/// `+Inf` has no JSON number representation, so the last bucket bound travels as a string.
mod bucket_bound {
    use serde::{de, Deserialize, Deserializer, Serializer};

    const INFINITY: &str = "+Inf";

    pub fn serialize<S: Serializer>(le: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if le.is_infinite() {
            serializer.serialize_str(INFINITY)
        } else {
            serializer.serialize_f64(*le)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Bound {
        Finite(f64),
        Named(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Bound::deserialize(deserializer)? {
            Bound::Finite(le) => Ok(le),
            Bound::Named(name) if name == INFINITY => Ok(f64::INFINITY),
            Bound::Named(name) => Err(de::Error::custom(format!("invalid bucket bound {name}"))),
        }
    }
}

#[derive(Debug)]
enum Definition {
    Counter { help: String },
    Gauge { help: String },
    Histogram { help: String, bounds: Vec<f64> },
}

impl Definition {
    fn help(&self) -> &str {
        match self {
            Definition::Counter { help }
            | Definition::Gauge { help }
            | Definition::Histogram { help, .. } => help,
        }
    }

    fn metric_type(&self) -> MetricType {
        match self {
            Definition::Counter { .. } => MetricType::Counter,
            Definition::Gauge { .. } => MetricType::Gauge,
            Definition::Histogram { .. } => MetricType::Histogram,
        }
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    /// Cumulative counts, one per finite bound.
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: usize) -> Histogram {
        Histogram {
            counts: vec![0; bounds],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, bounds: &[f64], value: f64) {
        for (count, bound) in self.counts.iter_mut().zip(bounds) {
            if value <= *bound {
                *count += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug)]
struct Gauge {
    value: f64,
    /// Set since the last collection.
    fresh: bool,
}

#[derive(Debug, Default)]
struct Series {
    counters: BTreeMap<Labels, f64>,
    gauges: BTreeMap<Labels, Gauge>,
    histograms: BTreeMap<Labels, Histogram>,
}

#[derive(Debug, Default)]
struct RegistryState {
    definitions: BTreeMap<String, Definition>,
    series: BTreeMap<String, Series>,
}

/// Accumulates impact metric samples between flushes.
///
/// Definitions are expected to happen during setup. Increments may come from any number of
/// threads and interleave safely with [`MetricsRegistry::collect`].
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    state: Mutex<RegistryState>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> MetricsRegistry {
        MetricsRegistry::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Define a counter. Redefinition is a no-op.
    pub fn define_counter(&self, name: &str, help: &str) {
        self.define(name, Definition::Counter { help: help.to_owned() });
    }

    /// Define a gauge. Redefinition is a no-op.
    pub fn define_gauge(&self, name: &str, help: &str) {
        self.define(name, Definition::Gauge { help: help.to_owned() });
    }

    /// Define a histogram with the given bucket upper bounds, or [`DEFAULT_BUCKETS`].
    /// Redefinition is a no-op.
    pub fn define_histogram(&self, name: &str, help: &str, buckets: Option<Vec<f64>>) {
        let mut bounds = buckets.unwrap_or_else(|| DEFAULT_BUCKETS.to_vec());
        bounds.retain(|bound| bound.is_finite());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();

        self.define(
            name,
            Definition::Histogram {
                help: help.to_owned(),
                bounds,
            },
        );
    }

    fn define(&self, name: &str, definition: Definition) {
        self.lock()
            .definitions
            .entry(name.to_owned())
            .or_insert(definition);
    }

    /// Add `value` to a counter.
    pub fn inc_counter(&self, name: &str, value: f64, labels: Labels) {
        let mut state = self.lock();
        if !matches!(state.definitions.get(name), Some(Definition::Counter { .. })) {
            log::warn!(target: "flagsync", metric = name; "ignoring increment of undefined counter");
            return;
        }
        *state
            .series
            .entry(name.to_owned())
            .or_default()
            .counters
            .entry(labels)
            .or_insert(0.0) += value;
    }

    /// Set a gauge.
    pub fn set_gauge(&self, name: &str, value: f64, labels: Labels) {
        let mut state = self.lock();
        if !matches!(state.definitions.get(name), Some(Definition::Gauge { .. })) {
            log::warn!(target: "flagsync", metric = name; "ignoring update of undefined gauge");
            return;
        }
        state
            .series
            .entry(name.to_owned())
            .or_default()
            .gauges
            .insert(labels, Gauge { value, fresh: true });
    }

    /// Record an observation in a histogram.
    pub fn observe_histogram(&self, name: &str, value: f64, labels: Labels) {
        let mut state = self.lock();
        let RegistryState {
            definitions,
            series,
        } = &mut *state;
        let Some(Definition::Histogram { bounds, .. }) = definitions.get(name) else {
            log::warn!(target: "flagsync", metric = name; "ignoring observation of undefined histogram");
            return;
        };
        series
            .entry(name.to_owned())
            .or_default()
            .histograms
            .entry(labels)
            .or_insert_with(|| Histogram::new(bounds.len()))
            .observe(bounds, value);
    }

    /// Drain everything accumulated since the last collection.
    ///
    /// Counters and histograms restart from zero; gauges keep their value but are only reported
    /// again once they are set again.
    pub fn collect(&self) -> Vec<CollectedMetric> {
        let mut state = self.lock();
        let RegistryState {
            definitions,
            series,
        } = &mut *state;

        let mut collected = Vec::new();
        for (name, definition) in definitions.iter() {
            let Some(entry) = series.get_mut(name) else {
                continue;
            };

            let samples: Vec<MetricSample> = match definition {
                Definition::Counter { .. } => std::mem::take(&mut entry.counters)
                    .into_iter()
                    .map(|(labels, value)| MetricSample::Value { labels, value })
                    .collect(),
                Definition::Gauge { .. } => entry
                    .gauges
                    .iter_mut()
                    .filter(|(_, gauge)| gauge.fresh)
                    .map(|(labels, gauge)| {
                        gauge.fresh = false;
                        MetricSample::Value {
                            labels: labels.clone(),
                            value: gauge.value,
                        }
                    })
                    .collect(),
                Definition::Histogram { bounds, .. } => std::mem::take(&mut entry.histograms)
                    .into_iter()
                    .map(|(labels, histogram)| histogram_sample(bounds, labels, histogram))
                    .collect(),
            };

            if !samples.is_empty() {
                collected.push(CollectedMetric {
                    name: name.clone(),
                    help: definition.help().to_owned(),
                    metric_type: definition.metric_type(),
                    samples,
                });
            }
        }
        collected
    }

    /// Merge previously collected metrics back, e.g. after a failed send.
    ///
    /// Counters and histograms are added to whatever accumulated meanwhile. A gauge is only
    /// restored when it was not set again since it was collected.
    pub fn restore(&self, metrics: Vec<CollectedMetric>) {
        let mut state = self.lock();
        let RegistryState {
            definitions,
            series,
        } = &mut *state;

        for metric in metrics {
            let Some(definition) = definitions.get(&metric.name) else {
                log::warn!(target: "flagsync", metric = metric.name.as_str();
                           "dropping restored metric that is not defined");
                continue;
            };
            if definition.metric_type() != metric.metric_type {
                log::warn!(target: "flagsync", metric = metric.name.as_str();
                           "dropping restored metric with mismatching type");
                continue;
            }
            let entry = series.entry(metric.name.clone()).or_default();

            for sample in metric.samples {
                match (definition, sample) {
                    (Definition::Counter { .. }, MetricSample::Value { labels, value }) => {
                        *entry.counters.entry(labels).or_insert(0.0) += value;
                    }
                    (Definition::Gauge { .. }, MetricSample::Value { labels, value }) => {
                        let gauge = entry.gauges.entry(labels).or_insert(Gauge {
                            value,
                            fresh: false,
                        });
                        if !gauge.fresh {
                            *gauge = Gauge { value, fresh: true };
                        }
                    }
                    (
                        Definition::Histogram { bounds, .. },
                        MetricSample::Histogram {
                            labels,
                            count,
                            sum,
                            buckets,
                        },
                    ) => {
                        let finite: Vec<&BucketCount> =
                            buckets.iter().filter(|b| b.le.is_finite()).collect();
                        if finite.len() != bounds.len()
                            || finite.iter().zip(bounds.iter()).any(|(b, bound)| b.le != *bound)
                        {
                            log::warn!(target: "flagsync", metric = metric.name.as_str();
                                       "dropping restored histogram with mismatching buckets");
                            continue;
                        }
                        let histogram = entry
                            .histograms
                            .entry(labels)
                            .or_insert_with(|| Histogram::new(bounds.len()));
                        for (slot, bucket) in histogram.counts.iter_mut().zip(finite) {
                            *slot += bucket.count;
                        }
                        histogram.sum += sum;
                        histogram.count += count;
                    }
                    _ => {
                        log::warn!(target: "flagsync", metric = metric.name.as_str();
                                   "dropping restored sample of the wrong shape");
                    }
                }
            }
        }
    }
}

fn histogram_sample(bounds: &[f64], labels: Labels, histogram: Histogram) -> MetricSample {
    let mut buckets: Vec<BucketCount> = bounds
        .iter()
        .zip(histogram.counts)
        .map(|(le, count)| BucketCount { le: *le, count })
        .collect();
    buckets.push(BucketCount {
        le: f64::INFINITY,
        count: histogram.count,
    });

    MetricSample::Histogram {
        labels,
        count: histogram.count,
        sum: histogram.sum,
        buckets,
    }
}

/// Flags whose exposure should be attached to a sample as labels.
#[derive(Debug, Clone, Default)]
pub struct MetricFlagContext {
    /// Each name becomes a label, valued by the variant the user got or `enabled`/`disabled`.
    pub flag_names: Vec<String>,
    /// Context the flags are evaluated with.
    pub context: Context,
}

impl MetricFlagContext {
    /// Label samples with the state of `flag_names` for `context`.
    pub fn new<I, S>(flag_names: I, context: Context) -> MetricFlagContext
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MetricFlagContext {
            flag_names: flag_names.into_iter().map(Into::into).collect(),
            context,
        }
    }
}

/// Application facing handle to define and record impact metrics.
///
/// Every sample carries `appName` and `environment` labels, plus one label per flag of an
/// optional [`MetricFlagContext`].
#[derive(Clone)]
pub struct ImpactMetrics {
    engine: Arc<dyn Engine>,
    context: Arc<SdkContext>,
}

impl ImpactMetrics {
    pub(crate) fn new(engine: Arc<dyn Engine>, context: Arc<SdkContext>) -> ImpactMetrics {
        ImpactMetrics { engine, context }
    }

    /// Define a counter.
    pub fn define_counter(&self, name: &str, help: &str) {
        self.engine.define_counter(name, help);
    }

    /// Increment a counter by `value`.
    pub fn increment_counter(&self, name: &str, value: u64, flags: Option<&MetricFlagContext>) {
        self.engine
            .inc_counter(name, value as f64, self.resolve_labels(flags));
    }

    /// Define a gauge.
    pub fn define_gauge(&self, name: &str, help: &str) {
        self.engine.define_gauge(name, help);
    }

    /// Set a gauge to `value`.
    pub fn update_gauge(&self, name: &str, value: f64, flags: Option<&MetricFlagContext>) {
        self.engine.set_gauge(name, value, self.resolve_labels(flags));
    }

    /// Define a histogram. `None` buckets means [`DEFAULT_BUCKETS`].
    pub fn define_histogram(&self, name: &str, help: &str, buckets: Option<Vec<f64>>) {
        self.engine.define_histogram(name, help, buckets);
    }

    /// Record `value` in a histogram.
    pub fn observe_histogram(&self, name: &str, value: f64, flags: Option<&MetricFlagContext>) {
        self.engine
            .observe_histogram(name, value, self.resolve_labels(flags));
    }

    fn resolve_labels(&self, flags: Option<&MetricFlagContext>) -> Labels {
        let mut labels = Labels::from([
            ("appName".to_owned(), self.context.app_name().to_owned()),
            ("environment".to_owned(), self.context.environment().to_owned()),
        ]);

        if let Some(flags) = flags {
            for flag in &flags.flag_names {
                let variant = self.engine.get_variant(flag, &flags.context);
                let value = if variant.enabled {
                    variant.name
                } else if variant.feature_enabled {
                    "enabled".to_owned()
                } else {
                    "disabled".to_owned()
                };
                labels.insert(flag.clone(), value);
            }
        }

        labels
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{
        BucketCount, CollectedMetric, ImpactMetrics, Labels, MetricFlagContext, MetricSample,
        MetricType, MetricsRegistry,
    };
    use crate::{engine::ToggleEngine, ClientConfig, Context, Engine, SdkContext};

    fn labels(entries: &[(&str, &str)]) -> Labels {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn serializes_counter_gauge_and_histogram() {
        let registry = MetricsRegistry::new();
        let base = labels(&[("appName", "my-test-app"), ("environment", "production")]);

        registry.define_counter("purchases", "Number of purchases");
        registry.inc_counter("purchases", 1.0, base.clone());
        registry.define_gauge("temperature", "Current temperature");
        registry.set_gauge("temperature", 23.5, base.clone());
        registry.define_histogram("latency", "Request latency", Some(vec![0.1, 0.5, 1.0]));
        registry.observe_histogram("latency", 0.3, base.clone());

        let collected = serde_json::to_value(registry.collect()).unwrap();
        let expected_labels = json!({"appName": "my-test-app", "environment": "production"});

        assert_eq!(
            collected,
            json!([
                {
                    "name": "latency",
                    "help": "Request latency",
                    "type": "histogram",
                    "samples": [{
                        "labels": expected_labels,
                        "count": 1,
                        "sum": 0.3,
                        "buckets": [
                            {"le": 0.1, "count": 0},
                            {"le": 0.5, "count": 1},
                            {"le": 1.0, "count": 1},
                            {"le": "+Inf", "count": 1}
                        ]
                    }]
                },
                {
                    "name": "purchases",
                    "help": "Number of purchases",
                    "type": "counter",
                    "samples": [{"labels": expected_labels, "value": 1.0}]
                },
                {
                    "name": "temperature",
                    "help": "Current temperature",
                    "type": "gauge",
                    "samples": [{"labels": expected_labels, "value": 23.5}]
                }
            ])
        );
    }

    #[test]
    fn collect_drains_counters_and_stale_gauges() {
        let registry = MetricsRegistry::new();
        registry.define_counter("c", "counter");
        registry.define_gauge("g", "gauge");
        registry.inc_counter("c", 2.0, Labels::new());
        registry.set_gauge("g", 4.0, Labels::new());

        assert_eq!(registry.collect().len(), 2);
        assert!(registry.collect().is_empty());

        registry.set_gauge("g", 5.0, Labels::new());
        let collected = registry.collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(
            collected[0].samples,
            vec![MetricSample::Value {
                labels: Labels::new(),
                value: 5.0
            }]
        );
    }

    #[test]
    fn restore_merges_with_new_samples() {
        let registry = MetricsRegistry::new();
        registry.define_counter("c", "counter");
        registry.define_gauge("g", "gauge");
        registry.define_histogram("h", "histogram", Some(vec![1.0]));

        registry.inc_counter("c", 5.0, Labels::new());
        registry.set_gauge("g", 1.0, Labels::new());
        registry.observe_histogram("h", 0.5, Labels::new());
        let failed = registry.collect();

        registry.inc_counter("c", 2.0, Labels::new());
        registry.set_gauge("g", 9.0, Labels::new());
        registry.observe_histogram("h", 3.0, Labels::new());
        registry.restore(failed);

        let collected = registry.collect();
        let by_name = |name: &str| {
            collected
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.samples.clone())
                .unwrap()
        };

        assert_eq!(
            by_name("c"),
            vec![MetricSample::Value {
                labels: Labels::new(),
                value: 7.0
            }]
        );
        // the newer gauge value wins over the restored one
        assert_eq!(
            by_name("g"),
            vec![MetricSample::Value {
                labels: Labels::new(),
                value: 9.0
            }]
        );
        assert_eq!(
            by_name("h"),
            vec![MetricSample::Histogram {
                labels: Labels::new(),
                count: 2,
                sum: 3.5,
                buckets: vec![
                    BucketCount { le: 1.0, count: 1 },
                    BucketCount {
                        le: f64::INFINITY,
                        count: 2
                    },
                ],
            }]
        );
    }

    #[test]
    fn restore_drops_undefined_metrics() {
        let registry = MetricsRegistry::new();
        registry.restore(vec![CollectedMetric {
            name: "orphan".to_owned(),
            help: "restored".to_owned(),
            metric_type: MetricType::Counter,
            samples: vec![MetricSample::Value {
                labels: Labels::new(),
                value: 3.0,
            }],
        }]);

        assert!(registry.collect().is_empty());
    }

    #[test]
    fn ignores_undefined_metrics() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("nope", 1.0, Labels::new());
        registry.set_gauge("nope", 1.0, Labels::new());
        registry.observe_histogram("nope", 1.0, Labels::new());
        assert!(registry.collect().is_empty());
    }

    #[test]
    fn wire_format_round_trips_infinite_bucket() {
        let raw = r#"{"le":"+Inf","count":4}"#;
        let bucket: BucketCount = serde_json::from_str(raw).unwrap();
        assert!(bucket.le.is_infinite());
        assert_eq!(serde_json::to_string(&bucket).unwrap(), raw);
    }

    #[test]
    fn counters_are_safe_across_threads() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.define_counter("hits", "hits");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        registry.inc_counter("hits", 1.0, Labels::new());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            registry.collect()[0].samples,
            vec![MetricSample::Value {
                labels: Labels::new(),
                value: 8000.0
            }]
        );
    }

    fn impact_metrics(engine: Arc<ToggleEngine>, config: ClientConfig) -> ImpactMetrics {
        ImpactMetrics::new(engine, Arc::new(SdkContext::new(config)))
    }

    #[test]
    fn labels_include_app_and_environment() {
        let engine = Arc::new(ToggleEngine::new());
        let metrics = impact_metrics(
            engine.clone(),
            ClientConfig::new("http://flags.test", "my-test-app").environment("production"),
        );

        metrics.define_counter("purchases", "Number of purchases");
        metrics.increment_counter("purchases", 1, None);

        let collected = engine.collect_impact_metrics().unwrap();
        assert_eq!(
            collected[0].samples,
            vec![MetricSample::Value {
                labels: labels(&[("appName", "my-test-app"), ("environment", "production")]),
                value: 1.0
            }]
        );
    }

    #[test]
    fn labels_reflect_flag_exposure() {
        let engine = Arc::new(ToggleEngine::new());
        let raw = std::fs::read_to_string("tests/data/snapshots/features-v1.json").unwrap();
        engine.take_state(&raw).unwrap();

        let metrics = impact_metrics(
            engine.clone(),
            ClientConfig::new("http://flags.test", "app")
                .custom_http_header("Authorization", "proj:staging.hash"),
        );
        metrics.define_gauge("cart_size", "Items in cart");
        let flags = MetricFlagContext::new(
            ["Feature.A", "Feature.B", "Feature.C", "Missing"],
            Context::new().with_user_id("42"),
        );
        metrics.update_gauge("cart_size", 3.0, Some(&flags));

        let collected = engine.collect_impact_metrics().unwrap();
        assert_eq!(
            collected[0].samples,
            vec![MetricSample::Value {
                labels: labels(&[
                    ("appName", "app"),
                    ("environment", "staging"),
                    ("Feature.A", "enabled"),
                    ("Feature.B", "disabled"),
                    ("Feature.C", "blue"),
                    ("Missing", "disabled"),
                ]),
                value: 3.0
            }]
        );
    }
}
