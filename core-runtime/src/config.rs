//! # Federation Configuration Module
//!
//! Provides configuration management for the federation engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `FederationConfig` holding every collaborator and setting the engine needs.
//! It enforces fail-fast validation so a misconfigured instance never starts
//! talking to peers.
//!
//! ## Required Settings
//!
//! - `base_url` - This instance's absolute base URL
//! - `listing_register` / `listing_schema` - Where listings are stored
//! - `ObjectStore` - Host object storage
//!
//! ## Optional Settings (with defaults)
//!
//! - `directory_url` - Own directory endpoint (`base_url` + [`DIRECTORY_PATH`])
//! - `default_directory_url` - Well-known seed directory ([`DEFAULT_DIRECTORY_URL`])
//! - `HttpClient` - HTTP operations (desktop default: reqwest)
//! - `Clock` - Time source (default: system clock)
//! - `EventBus` - Progress events (default: none)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::FederationConfig;
//! use std::sync::Arc;
//!
//! let config = FederationConfig::builder()
//!     .base_url("https://catalogus.gemeente.nl")
//!     .listing_register("7")
//!     .listing_schema("12")
//!     .object_store(Arc::new(store))
//!     .build()?;
//!
//! assert_eq!(
//!     config.directory_url,
//!     "https://catalogus.gemeente.nl/apps/opencatalogi/api/directory"
//! );
//! ```

use crate::error::{Error, Result};
use crate::events::EventBus;
use bridge_traits::{Clock, HttpClient, ObjectStore, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Path of the directory endpoint below an instance's base URL
pub const DIRECTORY_PATH: &str = "/apps/opencatalogi/api/directory";

/// Well-known seed directory every instance syncs with
pub const DEFAULT_DIRECTORY_URL: &str =
    "https://directory.opencatalogi.nl/apps/opencatalogi/api/directory";

/// Value sent as `source` in outbound broadcasts
pub const DEFAULT_BROADCAST_SOURCE: &str = "OpenCatalogi";

/// Timeouts, limits and retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationTuning {
    /// Whole-request timeout for every peer call
    pub request_timeout: Duration,

    /// Connect timeout for every peer call
    pub connect_timeout: Duration,

    /// `_limit` appended when fetching a peer's directory
    pub listing_fetch_limit: u64,

    /// POST attempts per broadcast target
    pub broadcast_max_attempts: u32,

    /// Sleep between broadcast attempts is `attempt * broadcast_backoff_unit`
    pub broadcast_backoff_unit: Duration,

    pub broadcast_source: String,

    /// Only aggregate publications from listings flagged `default`
    pub aggregate_default_only: bool,
}

impl Default for FederationTuning {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            listing_fetch_limit: 10_000,
            broadcast_max_attempts: 3,
            broadcast_backoff_unit: Duration::from_secs(2),
            broadcast_source: DEFAULT_BROADCAST_SOURCE.to_string(),
            aggregate_default_only: false,
        }
    }
}

/// Configuration for the federation engine.
///
/// Use [`FederationConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct FederationConfig {
    /// This instance's base URL, without trailing slash
    pub base_url: String,

    /// This instance's own directory endpoint; never synced with
    pub directory_url: String,

    /// Seed directory always included in a full sync
    pub default_directory_url: String,

    pub listing_register: String,
    pub listing_schema: String,

    /// Scope of local publication searches; `None` searches every register
    pub publication_register: Option<String>,
    pub publication_schema: Option<String>,

    pub object_store: Arc<dyn ObjectStore>,
    pub http_client: Arc<dyn HttpClient>,
    pub clock: Arc<dyn Clock>,
    pub event_bus: Option<EventBus>,

    pub tuning: FederationTuning,
}

impl std::fmt::Debug for FederationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationConfig")
            .field("base_url", &self.base_url)
            .field("directory_url", &self.directory_url)
            .field("default_directory_url", &self.default_directory_url)
            .field("listing_register", &self.listing_register)
            .field("listing_schema", &self.listing_schema)
            .field("publication_register", &self.publication_register)
            .field("publication_schema", &self.publication_schema)
            .field("object_store", &"ObjectStore { ... }")
            .field("http_client", &"HttpClient { ... }")
            .field("clock", &"Clock { ... }")
            .field("event_bus", &self.event_bus)
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl FederationConfig {
    pub fn builder() -> FederationConfigBuilder {
        FederationConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Every URL is an absolute http(s) URL with a host
    /// - Register/schema identifiers are not empty
    /// - Timeouts are non-zero and at least one broadcast attempt is made
    pub fn validate(&self) -> Result<()> {
        validate_url("base_url", &self.base_url)?;
        validate_url("directory_url", &self.directory_url)?;
        validate_url("default_directory_url", &self.default_directory_url)?;

        if self.listing_register.trim().is_empty() {
            return Err(Error::Config("Listing register cannot be empty".to_string()));
        }
        if self.listing_schema.trim().is_empty() {
            return Err(Error::Config("Listing schema cannot be empty".to_string()));
        }

        if self.tuning.request_timeout.is_zero() || self.tuning.connect_timeout.is_zero() {
            return Err(Error::Config(
                "Request and connect timeouts must be greater than zero".to_string(),
            ));
        }

        if self.tuning.broadcast_max_attempts == 0 {
            return Err(Error::Config(
                "Broadcast must make at least one attempt".to_string(),
            ));
        }

        if self.tuning.listing_fetch_limit == 0 {
            return Err(Error::Config(
                "Listing fetch limit must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_url(name: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| Error::Config(format!("{} is not a valid absolute URL ({}): {}", name, raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "{} must use http or https, got '{}'",
            name,
            url.scheme()
        )));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::Config(format!("{} has no host: {}", name, raw)));
    }

    Ok(())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(tuning: &FederationTuning) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client =
        ReqwestHttpClient::with_timeouts(tuning.request_timeout, tuning.connect_timeout)?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_tuning: &FederationTuning) -> Result<Arc<dyn HttpClient>> {
    Err(Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required to reach peer directories. \
                 Enable the 'desktop-shims' feature to use the default ReqwestHttpClient \
                 or inject a host implementation with .http_client()."
            .to_string(),
    })
}

/// Builder for constructing [`FederationConfig`] instances.
#[derive(Default)]
pub struct FederationConfigBuilder {
    base_url: Option<String>,
    directory_url: Option<String>,
    default_directory_url: Option<String>,
    listing_register: Option<String>,
    listing_schema: Option<String>,
    publication_register: Option<String>,
    publication_schema: Option<String>,
    object_store: Option<Arc<dyn ObjectStore>>,
    http_client: Option<Arc<dyn HttpClient>>,
    clock: Option<Arc<dyn Clock>>,
    event_bus: Option<EventBus>,
    tuning: FederationTuning,
}

impl FederationConfigBuilder {
    /// Sets this instance's base URL (e.g. `https://catalogus.gemeente.nl`).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Overrides the own directory URL derived from the base URL.
    pub fn directory_url(mut self, url: impl Into<String>) -> Self {
        self.directory_url = Some(url.into());
        self
    }

    pub fn default_directory_url(mut self, url: impl Into<String>) -> Self {
        self.default_directory_url = Some(url.into());
        self
    }

    pub fn listing_register(mut self, register: impl Into<String>) -> Self {
        self.listing_register = Some(register.into());
        self
    }

    pub fn listing_schema(mut self, schema: impl Into<String>) -> Self {
        self.listing_schema = Some(schema.into());
        self
    }

    pub fn publication_register(mut self, register: impl Into<String>) -> Self {
        self.publication_register = Some(register.into());
        self
    }

    pub fn publication_schema(mut self, schema: impl Into<String>) -> Self {
        self.publication_schema = Some(schema.into());
        self
    }

    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Replaces every tuning value at once.
    pub fn tuning(mut self, tuning: FederationTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.tuning.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.tuning.connect_timeout = timeout;
        self
    }

    pub fn listing_fetch_limit(mut self, limit: u64) -> Self {
        self.tuning.listing_fetch_limit = limit;
        self
    }

    pub fn broadcast_max_attempts(mut self, attempts: u32) -> Self {
        self.tuning.broadcast_max_attempts = attempts;
        self
    }

    pub fn broadcast_backoff_unit(mut self, unit: Duration) -> Self {
        self.tuning.broadcast_backoff_unit = unit;
        self
    }

    pub fn broadcast_source(mut self, source: impl Into<String>) -> Self {
        self.tuning.broadcast_source = source.into();
        self
    }

    pub fn aggregate_default_only(mut self, enabled: bool) -> Self {
        self.tuning.aggregate_default_only = enabled;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// - `Error::Config` when a required setting is missing or invalid
    /// - `Error::CapabilityMissing` when no object store is injected, or no
    ///   HTTP client is injected and `desktop-shims` is disabled
    pub fn build(self) -> Result<FederationConfig> {
        let base_url = self
            .base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                Error::Config("Base URL is required. Use .base_url() to set it.".to_string())
            })?;

        let listing_register = self.listing_register.ok_or_else(|| {
            Error::Config(
                "Listing register is required. Use .listing_register() to set it.".to_string(),
            )
        })?;

        let listing_schema = self.listing_schema.ok_or_else(|| {
            Error::Config(
                "Listing schema is required. Use .listing_schema() to set it.".to_string(),
            )
        })?;

        let object_store = self.object_store.ok_or_else(|| Error::CapabilityMissing {
            capability: "ObjectStore".to_string(),
            message: "ObjectStore implementation is required to persist listings. \
                     Inject the host object store (or SqliteObjectStore) with .object_store()."
                .to_string(),
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(&self.tuning)?,
        };

        let directory_url = self
            .directory_url
            .unwrap_or_else(|| format!("{}{}", base_url, DIRECTORY_PATH));

        let config = FederationConfig {
            base_url,
            directory_url,
            default_directory_url: self
                .default_directory_url
                .unwrap_or_else(|| DEFAULT_DIRECTORY_URL.to_string()),
            listing_register,
            listing_schema,
            publication_register: self.publication_register,
            publication_schema: self.publication_schema,
            object_store,
            http_client,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_bus: self.event_bus,
            tuning: self.tuning,
        };

        config.validate()?;

        Ok(config)
    }
}
