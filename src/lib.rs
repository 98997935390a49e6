//! Workspace facade crate.
//!
//! Re-exports the federation engine together with the runtime and bridge
//! crates it is wired from, so a host can depend on `catalog-federation`
//! alone. The `desktop-shims` feature (default) pulls in the reqwest HTTP
//! client and the SQLite object store.

pub use bridge_traits;
pub use core_federation;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

pub use core_federation::{
    AggregatedResultSet, FederationCoordinator, FederationError, PublicationQuery, RunStatistics,
    SyncAllReport,
};
pub use core_runtime::config::FederationConfig;
