//! Periodic delivery of usage buckets and impact metrics to the server.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc},
    time::Duration,
};

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Serialize;

use crate::{
    engine::{Engine, MetricsBucket},
    impact_metrics::CollectedMetric,
    Error, Result, SdkContext, CLIENT_SPEC_VERSION,
};

const PLATFORM_NAME: &str = "rust";
const PLATFORM_VERSION: &str = env!("CARGO_PKG_RUST_VERSION");

/// What a call to [`MetricsReporter::post`] did.
#[derive(Debug, Clone)]
pub enum ReportOutcome {
    /// Nothing to report and the grace period has not elapsed yet.
    Suppressed,
    /// The server accepted the report.
    Sent,
    /// The server answered with a non-2xx status. Impact metrics were put back.
    Rejected(StatusCode),
    /// The request failed. Impact metrics were put back.
    Failed(Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    platform_name: &'static str,
    platform_version: &'static str,
    spec_version: &'static str,
    app_name: String,
    instance_id: String,
    connection_id: String,
    bucket: MetricsBucket,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    impact_metrics: Vec<CollectedMetric>,
}

/// Builds and sends metrics reports.
pub struct MetricsReporter {
    client: reqwest::Client,
    context: Arc<SdkContext>,
    engine: Arc<dyn Engine>,
    url: Url,
    /// Time of the last accepted report.
    last_sent: DateTime<Utc>,
}

impl MetricsReporter {
    pub fn new(context: Arc<SdkContext>, engine: Arc<dyn Engine>) -> Result<MetricsReporter> {
        let url = context.config.metrics_uri()?;
        let client = reqwest::Client::builder()
            .timeout(context.config.request_timeout)
            .default_headers(context.http_headers().clone())
            .build()?;

        Ok(MetricsReporter {
            client,
            context,
            engine,
            url,
            last_sent: Utc::now(),
        })
    }

    /// Flush accumulated metrics.
    ///
    /// When there is nothing to report, a heartbeat with an empty bucket is still sent once the
    /// grace period since the last accepted report has elapsed. Impact metrics of a failed
    /// report are restored into the engine so the next flush carries them. Never fails.
    pub async fn post(&mut self) -> ReportOutcome {
        log::debug!(target: "flagsync", "posting metrics report");

        let impact_metrics = self.collect_impact_metrics();
        match self.build_report(impact_metrics, Utc::now()) {
            Some(report) => self.send_report(report).await,
            None => {
                log::debug!(target: "flagsync", "nothing to report");
                ReportOutcome::Suppressed
            }
        }
    }

    fn collect_impact_metrics(&self) -> Vec<CollectedMetric> {
        self.engine.collect_impact_metrics().unwrap_or_else(|err| {
            log::warn!(target: "flagsync", "failed to collect impact metrics: {err}");
            Vec::new()
        })
    }

    fn build_report(&self, impact_metrics: Vec<CollectedMetric>, now: DateTime<Utc>) -> Option<Report> {
        let bucket = self.engine.get_metrics();
        let has_data = bucket.is_some() || !impact_metrics.is_empty();

        let silent_for = (now - self.last_sent).to_std().unwrap_or(Duration::ZERO);
        if !has_data && silent_for < self.context.config.metrics_grace_period {
            return None;
        }

        let config = &self.context.config;
        Some(Report {
            platform_name: PLATFORM_NAME,
            platform_version: PLATFORM_VERSION,
            spec_version: CLIENT_SPEC_VERSION,
            app_name: config.app_name.clone(),
            instance_id: config.instance_id.clone(),
            connection_id: config.connection_id.clone(),
            bucket: bucket.unwrap_or_else(|| MetricsBucket::empty(self.last_sent, now)),
            impact_metrics,
        })
    }

    async fn send_report(&mut self, report: Report) -> ReportOutcome {
        let sent_at = Utc::now();
        let interval = self.context.config.metrics_interval.as_millis().to_string();

        let response = self
            .client
            .post(self.url.clone())
            .header("UNLEASH-INTERVAL", interval)
            .json(&report)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                log::debug!(target: "flagsync", status:% = response.status(); "metrics report sent");
                self.last_sent = sent_at;
                ReportOutcome::Sent
            }
            Ok(response) => {
                let status = response.status();
                log::error!(target: "flagsync", "{}", Error::ReportRejected(status));
                self.restore_impact_metrics(report.impact_metrics);
                ReportOutcome::Rejected(status)
            }
            Err(err) => {
                let err = Error::from(err);
                log::warn!(target: "flagsync", "unable to send metrics report: {err}");
                self.restore_impact_metrics(report.impact_metrics);
                ReportOutcome::Failed(err)
            }
        }
    }

    fn restore_impact_metrics(&self, impact_metrics: Vec<CollectedMetric>) {
        if !impact_metrics.is_empty() {
            self.engine.restore_impact_metrics(impact_metrics);
        }
    }
}

/// Runs [`MetricsReporter::post`] every metrics interval on a dedicated thread.
pub struct ReporterThread {
    join_handle: std::thread::JoinHandle<()>,
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl ReporterThread {
    /// Start the thread. The first report is posted one interval from now.
    pub fn start(reporter: MetricsReporter, interval: Duration) -> std::io::Result<ReporterThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("flagsync-metrics".to_owned())
            .spawn(move || {
                let mut reporter = reporter;
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        log::error!(target: "flagsync", "unable to start metrics reporter: {err}");
                        return;
                    }
                };

                loop {
                    match stop_receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            runtime.block_on(reporter.post());
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "flagsync", "metrics reporter stopping, flushing");
                            runtime.block_on(reporter.post());
                            return;
                        }
                    }
                }
            })?;

        Ok(ReporterThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the thread without waiting for the final flush.
    pub fn stop(&self) {
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the thread and wait for the final flush to complete.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle.join().map_err(|_| Error::ThreadPanicked)
    }
}
