//! # Directory Federation & Aggregation
//!
//! Keeps a catalog instance in touch with its peers.
//!
//! ## Overview
//!
//! This crate manages everything that crosses instance boundaries:
//! - Fetching listing sets from peer directories
//! - Reconciling remote listings with local copies (hash and timestamp based)
//! - Announcing this instance to peers with retried POSTs
//! - Querying peer publication endpoints concurrently
//! - Merging local and remote results into one consistent page
//!
//! ## Components
//!
//! - **Fetcher** (`fetcher`): Single GET of a directory's listing set
//! - **Reconciler** (`reconciler`): Per-listing create/update/skip decisions
//! - **Directory Sync** (`directory_sync`): Concurrent sync runs over known directories
//! - **Broadcast** (`broadcast`): Presence announcements with linear backoff
//! - **Aggregator** (`aggregator`): Concurrent calls to publication endpoints
//! - **Merger** (`merger`): Dedup, stable multi-key sort and pagination
//! - **Coordinator** (`coordinator`): Entry points honouring the aggregate flag

pub mod aggregator;
pub mod broadcast;
pub mod coordinator;
pub mod directory_sync;
pub mod error;
pub mod fetcher;
pub mod listing;
pub mod merger;
pub mod query;
pub mod reconciler;
pub mod record;
pub mod url_policy;

pub use aggregator::{
    AggregationResult, AggregationStatistics, EndpointError, PublicationEndpointAggregator,
};
pub use broadcast::{BroadcastNotifier, BroadcastPayload};
pub use coordinator::{FederationCoordinator, LOCAL_SOURCE};
pub use directory_sync::DirectorySyncEngine;
pub use error::{FederationError, Result};
pub use fetcher::{FetchedListings, RemoteListingFetcher};
pub use listing::{
    DirectoryRecord, DirectoryStatus, KnownDirectories, RunStatistics, SyncAction, SyncAllReport,
    SyncOutcome,
};
pub use merger::{AggregatedResultSet, ResultMerger, SourceResults};
pub use query::PublicationQuery;
pub use reconciler::ListingReconciler;
pub use url_policy::{is_local_url, validate_directory_url, OwnInstance};
