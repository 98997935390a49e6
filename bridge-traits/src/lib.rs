//! # Host Bridge Traits
//!
//! Collaborator contracts between the federation engine and its host.
//!
//! ## Overview
//!
//! The engine never talks to the network, the clock or the storage layer
//! directly. Each capability is a trait defined here, implemented once per
//! host (the `bridge-desktop` crate ships the default adapters) and injected
//! through `core_runtime::config::FederationConfig`.
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Single-attempt async HTTP; statuses are data, transport failures are errors
//!
//! ### Storage
//! - [`ObjectStore`](object_store::ObjectStore) - Schemaless register/schema-partitioned object storage
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The runtime fails fast with descriptive errors when a required capability is missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let store = builder.object_store
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "ObjectStore".to_string(),
//!         message: "No object store provided.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. HTTP
//! adapters must report connection failures as `Transport`/`Timeout` so the
//! engine can tell them apart from HTTP error statuses.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`: the engine fans out one task per
//! peer directory and shares the collaborators across them.

pub mod error;
pub mod http;
pub mod object_store;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use object_store::{
    ObjectFilter, ObjectStore, PaginatedObjects, SearchQuery, SortDirection, SortKey,
    StoredObject, SELF_KEY,
};
pub use time::{Clock, ConsoleLogger, FixedClock, LogEntry, LogLevel, LoggerSink, SystemClock};
