//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for server and desktop hosts
//! (Linux, macOS, Windows).
//!
//! ## Overview
//!
//! This crate provides production-ready implementations of the bridge traits
//! the federation engine depends on:
//! - `HttpClient` using `reqwest` (single attempt, 30s request / 10s connect timeout)
//! - `ObjectStore` using a SQLite-backed JSON object table
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SqliteObjectStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = Arc::new(ReqwestHttpClient::new()?);
//!     let store = Arc::new(SqliteObjectStore::new("data/catalog.db".into()).await?);
//!
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod http;
mod object_store;

pub use http::{ReqwestHttpClient, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
pub use object_store::SqliteObjectStore;
