//! An HTTP client that fetches flag snapshots from the server.
use std::sync::Arc;

use reqwest::{
    header::{HeaderValue, ETAG, IF_NONE_MATCH},
    StatusCode, Url,
};

use crate::{sync::SyncCore, Error, Result};

/// Result of a successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A new snapshot was applied and persisted.
    Updated,
    /// The server confirmed the current snapshot is still fresh.
    NotModified,
}

/// Fetches snapshots from the features endpoint and hands them to the [`SyncCore`].
pub struct ToggleFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    core: Arc<SyncCore>,
    url: Url,
    /// `ETag` of the last applied snapshot, sent back as `If-None-Match`.
    etag: Option<HeaderValue>,
}

impl ToggleFetcher {
    pub fn new(core: Arc<SyncCore>) -> Result<ToggleFetcher> {
        let config = &core.context().config;
        let url = config.features_uri()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(core.context().http_headers().clone())
            .build()?;

        Ok(ToggleFetcher {
            client,
            core,
            url,
            etag: None,
        })
    }

    /// Fetch the current snapshot, apply it and persist it.
    ///
    /// On error, neither the engine nor the backup file is touched.
    pub async fn fetch_toggles(&mut self) -> Result<FetchOutcome> {
        log::debug!(target: "flagsync", url:% = self.url; "fetching toggles");

        let mut request = self.client.get(self.url.clone());
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag.clone());
        }
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            log::debug!(target: "flagsync", "toggles not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            log::warn!(target: "flagsync", status:% = status; "unexpected response while fetching toggles");
            return Err(Error::HttpStatus(status));
        }

        let etag = response.headers().get(ETAG).cloned();
        let body = response.text().await?;

        self.core.apply_fetched(&body).map_err(|err| {
            log::warn!(target: "flagsync", "failed to apply fetched toggles: {err}");
            err
        })?;
        self.etag = etag;

        log::debug!(target: "flagsync", "successfully fetched toggles");
        Ok(FetchOutcome::Updated)
    }
}
