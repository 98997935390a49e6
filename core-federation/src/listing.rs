//! Listing data model and sync run bookkeeping
//!
//! A listing is a locally stored record describing one known peer directory.
//! Listings stay schemaless in the object store; [`DirectoryRecord`] is the
//! typed view the engine reads them through.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bridge_traits::StoredObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{parse_timestamp, scalar_string};
use crate::url_policy::canonical_url;

/// Field names of a stored listing
pub mod fields {
    pub const DIRECTORY: &str = "directory";
    pub const CATALOG_ID: &str = "catalogusId";
    pub const CATALOG: &str = "catalog";
    pub const TITLE: &str = "title";
    pub const SUMMARY: &str = "summary";
    pub const ORGANISATION: &str = "organisation";
    pub const AVAILABLE: &str = "available";
    pub const DEFAULT: &str = "default";
    pub const STATUS_CODE: &str = "statusCode";
    pub const LAST_SYNC: &str = "lastSync";
    pub const SCHEMAS: &str = "schemas";
    pub const SCHEMA_COUNT: &str = "schemaCount";
    pub const SEARCH: &str = "search";
    pub const PUBLICATIONS: &str = "publications";
    pub const PUBLICATIONS_ENDPOINT: &str = "publicationsEndpoint";
}

/// Typed view over a stored listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRecord {
    /// Object store uuid of the listing
    pub id: String,
    pub directory_url: Option<String>,
    pub catalog_id: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub organisation: Option<String>,
    pub available: bool,
    pub default: bool,
    pub status_code: Option<u16>,
    pub last_sync: Option<DateTime<Utc>>,
    pub schema_count: u64,
    pub publications_endpoint: Option<String>,
}

impl DirectoryRecord {
    pub fn from_stored(stored: &StoredObject) -> Self {
        let text = |key: &str| stored.field(key).and_then(scalar_string);
        let flag = |key: &str| stored.field(key).and_then(Value::as_bool).unwrap_or(false);

        let organisation = match stored.field(fields::ORGANISATION) {
            Some(Value::Object(org)) => org.get("name").and_then(scalar_string),
            Some(other) => scalar_string(other),
            None => None,
        };

        Self {
            id: stored.uuid.clone(),
            directory_url: text(fields::DIRECTORY),
            catalog_id: text(fields::CATALOG_ID),
            title: text(fields::TITLE),
            summary: text(fields::SUMMARY),
            organisation,
            available: flag(fields::AVAILABLE),
            default: flag(fields::DEFAULT),
            status_code: stored
                .field(fields::STATUS_CODE)
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok()),
            last_sync: stored.field(fields::LAST_SYNC).and_then(parse_timestamp),
            schema_count: stored
                .field(fields::SCHEMA_COUNT)
                .and_then(Value::as_u64)
                .unwrap_or(0),
            publications_endpoint: text(fields::PUBLICATIONS_ENDPOINT),
        }
    }

    /// Label used in `sources` and facet metadata
    pub fn label(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.catalog_id.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// What reconciling one remote listing did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Unchanged,
    SkippedOutdated,
    SkippedOtherDirectory,
    Failed,
}

/// Result of one reconciliation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Catalog id of the listing when it could be determined
    pub listing_id: Option<String>,
    pub action: SyncAction,
    pub success: bool,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn new(listing_id: Option<String>, action: SyncAction) -> Self {
        Self {
            listing_id,
            action,
            success: true,
            error: None,
        }
    }

    pub fn failed(listing_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            listing_id,
            action: SyncAction::Failed,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Tally of one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub listings_created: u64,
    pub listings_updated: u64,
    pub listings_unchanged: u64,
    pub listings_skipped: u64,
    pub listings_failed: u64,
    pub total_processed: u64,
    pub errors: Vec<String>,
}

impl RunStatistics {
    pub fn record(&mut self, outcome: &SyncOutcome) {
        self.total_processed += 1;
        match outcome.action {
            SyncAction::Created => self.listings_created += 1,
            SyncAction::Updated => self.listings_updated += 1,
            SyncAction::Unchanged => self.listings_unchanged += 1,
            SyncAction::SkippedOutdated | SyncAction::SkippedOtherDirectory => {
                self.listings_skipped += 1
            }
            SyncAction::Failed => self.listings_failed += 1,
        }
        if let Some(error) = &outcome.error {
            let listing = outcome.listing_id.as_deref().unwrap_or("<unknown>");
            self.errors.push(format!("{}: {}", listing, error));
        }
    }

    /// Add another run's counts; order of merging does not matter for the counters
    pub fn merge(&mut self, other: &RunStatistics) {
        self.listings_created += other.listings_created;
        self.listings_updated += other.listings_updated;
        self.listings_unchanged += other.listings_unchanged;
        self.listings_skipped += other.listings_skipped;
        self.listings_failed += other.listings_failed;
        self.total_processed += other.total_processed;
        self.errors.extend(other.errors.iter().cloned());
    }

    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a SyncOutcome>) -> Self {
        let mut stats = Self::default();
        for outcome in outcomes {
            stats.record(outcome);
        }
        stats
    }
}

/// Per-directory result of a full sync
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DirectoryStatus {
    Synced(RunStatistics),
    Failed { http_status: Option<u16>, message: String },
}

/// Result of `sync_all`: merged counters plus every directory's own result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncAllReport {
    pub totals: RunStatistics,
    pub directories: BTreeMap<String, DirectoryStatus>,
}

impl SyncAllReport {
    pub fn insert(&mut self, directory: String, status: DirectoryStatus) {
        match &status {
            DirectoryStatus::Synced(stats) => self.totals.merge(stats),
            DirectoryStatus::Failed { message, .. } => {
                self.totals.errors.push(format!("{}: {}", directory, message))
            }
        }
        self.directories.insert(directory, status);
    }

    pub fn failed_directories(&self) -> impl Iterator<Item = &str> {
        self.directories.iter().filter_map(|(url, status)| match status {
            DirectoryStatus::Failed { .. } => Some(url.as_str()),
            DirectoryStatus::Synced(_) => None,
        })
    }
}

/// Directories known at the start of a run, in canonical form
///
/// Computed once per run and shared read-only by every reconciliation.
#[derive(Debug, Clone, Default)]
pub struct KnownDirectories {
    urls: Arc<BTreeSet<String>>,
}

impl KnownDirectories {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls = urls
            .into_iter()
            .filter_map(|url| canonical_url(url.as_ref()))
            .collect();
        Self {
            urls: Arc::new(urls),
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        canonical_url(url).map_or(false, |canonical| self.urls.contains(&canonical))
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.urls.iter().map(String::as_str)
    }
}
