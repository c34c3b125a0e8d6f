use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::{bootstrap::BootstrapConfig, environment::environment_from_headers, ClientConfig};

/// Evaluation context passed along with flag queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    /// Identifier of the current user.
    pub user_id: Option<String>,
    /// Identifier of the current session.
    pub session_id: Option<String>,
    /// Address of the remote client.
    pub remote_address: Option<String>,
    /// Any other attributes.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Context {
        Context::default()
    }

    /// Set the user id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Context {
        self.user_id = Some(user_id.into());
        self
    }

    /// Add a custom property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Context {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Process-independent state shared by every component of one client.
///
/// Built once from [`ClientConfig`] and handed to components as `Arc<SdkContext>`.
pub struct SdkContext {
    pub(crate) config: ClientConfig,
    /// Single-use: the first initialization takes it.
    bootstrap: Mutex<Option<BootstrapConfig>>,
    headers: HeaderMap,
    environment: String,
}

impl SdkContext {
    /// Identifies this SDK in the `UNLEASH-SDK` header.
    pub const SDK_NAME: &'static str = concat!("flagsync:", env!("CARGO_PKG_VERSION"));

    /// Build the shared context, resolving headers and the environment label.
    pub fn new(mut config: ClientConfig) -> SdkContext {
        let bootstrap = Mutex::new(config.bootstrap.take());
        let headers = build_headers(&config);
        let environment = environment_from_headers(&config.custom_http_headers)
            .unwrap_or_else(|| config.environment.clone());

        SdkContext {
            config,
            bootstrap,
            headers,
            environment,
        }
    }

    /// Headers sent with every request: identity headers plus the custom ones.
    pub fn http_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Environment label attached to impact metrics.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Application name.
    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    /// Take the bootstrap configuration, leaving `None` behind.
    pub(crate) fn take_bootstrap(&self) -> Option<BootstrapConfig> {
        self.bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether a bootstrap configuration is still waiting to be consumed.
    pub fn has_pending_bootstrap(&self) -> bool {
        self.bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn build_headers(config: &ClientConfig) -> HeaderMap {
    let identity = [
        ("UNLEASH-APPNAME", config.app_name.as_str()),
        ("UNLEASH-INSTANCEID", config.instance_id.as_str()),
        ("UNLEASH-CONNECTION-ID", config.connection_id.as_str()),
        ("UNLEASH-SDK", SdkContext::SDK_NAME),
    ];

    let custom = config
        .custom_http_headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()));

    let mut headers = HeaderMap::new();
    for (name, value) in identity.into_iter().chain(custom) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => {
                log::warn!(target: "flagsync", header = name; "ignoring invalid http header");
            }
        }
    }
    headers
}
