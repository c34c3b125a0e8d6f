//! One-shot initial snapshot supplied by the application.
use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use crate::{Error, Result};

type Provider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Where to find the bootstrap snapshot. When several sources are set, the first in the order
/// data, file, url, provider wins.
#[derive(Clone, Default)]
pub struct BootstrapConfig {
    data: Option<String>,
    file: Option<PathBuf>,
    url: Option<String>,
    url_headers: Vec<(String, String)>,
    provider: Option<Provider>,
}

impl BootstrapConfig {
    /// Bootstrap from an in-memory snapshot.
    pub fn data(data: impl Into<String>) -> BootstrapConfig {
        BootstrapConfig {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    /// Bootstrap from a snapshot file.
    pub fn file(path: impl Into<PathBuf>) -> BootstrapConfig {
        BootstrapConfig {
            file: Some(path.into()),
            ..Default::default()
        }
    }

    /// Bootstrap from a snapshot served at `url`.
    pub fn url(url: impl Into<String>) -> BootstrapConfig {
        BootstrapConfig {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Bootstrap from a closure. Returning `None` counts as a failure.
    pub fn provider(provider: impl Fn() -> Option<String> + Send + Sync + 'static) -> BootstrapConfig {
        BootstrapConfig {
            provider: Some(Arc::new(provider)),
            ..Default::default()
        }
    }

    /// Add a header sent with the bootstrap url request.
    pub fn url_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.url_headers.push((name.into(), value.into()));
        self
    }

    /// Load the raw snapshot from the configured source. `timeout` bounds the url request.
    pub(crate) fn retrieve_toggles(&self, timeout: Duration) -> Result<String> {
        if let Some(data) = &self.data {
            return Ok(data.clone());
        }

        if let Some(path) = &self.file {
            log::debug!(target: "flagsync", path:? = path; "reading bootstrap file");
            return Ok(std::fs::read_to_string(path)?);
        }

        if let Some(url) = &self.url {
            // The blocking client owns a runtime and panics when created or dropped inside
            // another one, so it gets a thread of its own.
            return std::thread::scope(|scope| {
                std::thread::Builder::new()
                    .name("flagsync-bootstrap".to_owned())
                    .spawn_scoped(scope, || self.fetch_url(url, timeout))?
                    .join()
                    .unwrap_or(Err(Error::ThreadPanicked))
            });
        }

        if let Some(provider) = &self.provider {
            return provider().ok_or(Error::BootstrapUnavailable);
        }

        Err(Error::BootstrapUnavailable)
    }

    fn fetch_url(&self, url: &str, timeout: Duration) -> Result<String> {
        log::debug!(target: "flagsync", url = url; "fetching bootstrap snapshot");
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        let mut request = client.get(url);
        for (name, value) in &self.url_headers {
            request = request.header(name, value);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus(response.status()));
        }
        Ok(response.text()?)
    }
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("data", &self.data.as_ref().map(|data| data.len()))
            .field("file", &self.file)
            .field("url", &self.url)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}
