//! Listing Reconciler
//!
//! Decides what to do with one incoming remote listing: create it, update the
//! local copy, leave it alone, or skip it.
//!
//! ## Decision order
//!
//! 1. A listing that declares another directory which is itself part of this
//!    run is skipped (`skipped_other_directory`); that directory's own sync
//!    owns it.
//! 2. The record is normalized (stable id, envelope stripped, sync fields
//!    stamped, derived fields filled in).
//! 3. No local listing with the same `catalogusId` → `created`.
//! 4. The incoming record's newest known timestamp is older than the local
//!    `lastSync` → `skipped_outdated`, nothing written.
//! 5. Content hashes equal → `unchanged`, nothing written; otherwise the local
//!    listing is overwritten in place (`updated`).
//!
//! Any error in 2–5 produces a `failed` outcome and a best-effort write marking
//! the local listing unavailable. Reconciliation itself never returns an error.

use std::sync::Arc;

use bridge_traits::{Clock, ObjectFilter, ObjectStore, StoredObject, SELF_KEY};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::{FederationError, Result};
use crate::listing::{fields, KnownDirectories, SyncAction, SyncOutcome};
use crate::record::{content_hash, parse_timestamp, resolve_path, scalar_string, ENVELOPE_FIELDS};
use crate::url_policy::same_url;

/// Fields that change on every sync and never count as a content change
const VOLATILE_FIELDS: &[&str] = &[fields::LAST_SYNC];

/// Timestamp paths consulted for staleness, most specific first
const TIMESTAMP_PATHS: &[&str] = &[
    "updated",
    "@self.updated",
    "created",
    "@self.created",
    fields::LAST_SYNC,
];

pub struct ListingReconciler {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    register: String,
    schema: String,
    default_directory_url: String,
}

impl ListingReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        register: impl Into<String>,
        schema: impl Into<String>,
        default_directory_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            register: register.into(),
            schema: schema.into(),
            default_directory_url: default_directory_url.into(),
        }
    }

    /// Reconcile one remote listing fetched from `source_directory`
    #[instrument(skip(self, remote, known), fields(directory = %source_directory))]
    pub async fn reconcile(
        &self,
        remote: Map<String, Value>,
        source_directory: &str,
        known: &KnownDirectories,
    ) -> SyncOutcome {
        let catalog_id = catalog_id(&remote);

        if let Some(declared) = remote.get(fields::DIRECTORY).and_then(Value::as_str) {
            if !same_url(declared, source_directory) && known.contains(declared) {
                debug!(declared, "Listing belongs to another directory in this run");
                return SyncOutcome::new(catalog_id, SyncAction::SkippedOtherDirectory);
            }
        }

        match self.apply(remote, source_directory).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(catalog = ?catalog_id, error = %err, "Failed to reconcile listing");
                if let Some(id) = catalog_id.as_deref() {
                    self.mark_failed(id).await;
                }
                SyncOutcome::failed(catalog_id, err.to_string())
            }
        }
    }

    async fn apply(
        &self,
        remote: Map<String, Value>,
        source_directory: &str,
    ) -> Result<SyncOutcome> {
        let incoming_timestamp = newest_timestamp(&remote);
        let (catalog_id, stable_id, normalized) = self.normalize(remote, source_directory)?;

        let existing = self.find_by_catalog(&catalog_id).await?;

        let Some(existing) = existing else {
            let uuid = match self.store.find(&stable_id).await? {
                None => Some(stable_id.as_str()),
                // Id taken by an unrelated object; let the store assign one
                Some(_) => None,
            };
            self.store
                .save_object(normalized, &self.register, &self.schema, uuid)
                .await?;
            debug!(catalog = %catalog_id, "Created listing");
            return Ok(SyncOutcome::new(Some(catalog_id), SyncAction::Created));
        };

        let last_sync = existing.field(fields::LAST_SYNC).and_then(parse_timestamp);
        if let (Some(incoming), Some(last_sync)) = (incoming_timestamp, last_sync) {
            if incoming < last_sync {
                debug!(
                    catalog = %catalog_id,
                    incoming = %incoming,
                    last_sync = %last_sync,
                    "Incoming listing is older than the last sync"
                );
                return Ok(SyncOutcome::new(Some(catalog_id), SyncAction::SkippedOutdated));
            }
        }

        if content_hash(&normalized, VOLATILE_FIELDS) == content_hash(&existing.object, VOLATILE_FIELDS) {
            return Ok(SyncOutcome::new(Some(catalog_id), SyncAction::Unchanged));
        }

        self.store
            .save_object(normalized, &self.register, &self.schema, Some(&existing.uuid))
            .await?;
        debug!(catalog = %catalog_id, uuid = %existing.uuid, "Updated listing");

        Ok(SyncOutcome::new(Some(catalog_id), SyncAction::Updated))
    }

    /// Normalize a remote listing into the stored shape
    ///
    /// Returns the catalog id, the stable id and the normalized object.
    fn normalize(
        &self,
        mut remote: Map<String, Value>,
        source_directory: &str,
    ) -> Result<(String, String, Map<String, Value>)> {
        let catalog_id = catalog_id(&remote).ok_or_else(|| FederationError::Parse {
            url: source_directory.to_string(),
            message: "listing has no catalog identifier".to_string(),
        })?;

        let remote_value = Value::Object(remote.clone());
        let stable_id = ["id", "@self.id"]
            .iter()
            .find_map(|path| resolve_path(&remote_value, path).and_then(scalar_string))
            .unwrap_or_else(|| catalog_id.clone());

        for key in ENVELOPE_FIELDS.iter().chain(["id"].iter()) {
            remote.remove(*key);
        }

        remote.insert(fields::CATALOG_ID.to_string(), Value::String(catalog_id.clone()));

        let directory = match remote.get(fields::DIRECTORY).and_then(Value::as_str) {
            Some(declared) if !declared.trim().is_empty() => declared.trim().to_string(),
            _ => source_directory.to_string(),
        };
        remote.insert(
            fields::DEFAULT.to_string(),
            Value::Bool(same_url(&directory, &self.default_directory_url)),
        );
        remote.insert(fields::DIRECTORY.to_string(), Value::String(directory));

        let schema_count = remote
            .get(fields::SCHEMAS)
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        remote.insert(fields::SCHEMA_COUNT.to_string(), Value::from(schema_count));

        let has_endpoint = remote
            .get(fields::PUBLICATIONS_ENDPOINT)
            .and_then(Value::as_str)
            .is_some_and(|endpoint| !endpoint.trim().is_empty());
        if !has_endpoint {
            let derived = remote
                .get(fields::SEARCH)
                .and_then(Value::as_str)
                .and_then(derive_publications_endpoint);
            remote.insert(
                fields::PUBLICATIONS_ENDPOINT.to_string(),
                derived.map_or(Value::Null, Value::String),
            );
        }

        remote.insert(fields::AVAILABLE.to_string(), Value::Bool(true));
        remote.insert(fields::STATUS_CODE.to_string(), Value::from(200));
        remote.insert(
            fields::LAST_SYNC.to_string(),
            Value::String(timestamp(self.clock.now())),
        );

        Ok((catalog_id, stable_id, remote))
    }

    async fn find_by_catalog(&self, catalog_id: &str) -> Result<Option<StoredObject>> {
        let filter = ObjectFilter::new(&self.register, &self.schema)
            .field(fields::CATALOG_ID, catalog_id);
        let mut matches = self.store.find_all(&filter).await?;
        if matches.len() > 1 {
            warn!(catalog = %catalog_id, count = matches.len(), "Duplicate listings for catalog");
        }
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.remove(0))
        })
    }

    /// Best effort: mark the local copy unavailable after a failed reconciliation
    async fn mark_failed(&self, catalog_id: &str) {
        let existing = match self.find_by_catalog(catalog_id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => return,
            Err(err) => {
                warn!(catalog = %catalog_id, error = %err, "Could not load listing to mark it failed");
                return;
            }
        };

        let mut object = existing.object;
        object.insert(fields::AVAILABLE.to_string(), Value::Bool(false));
        object.insert(fields::STATUS_CODE.to_string(), Value::from(500));

        if let Err(err) = self
            .store
            .save_object(object, &self.register, &self.schema, Some(&existing.uuid))
            .await
        {
            warn!(catalog = %catalog_id, error = %err, "Could not mark listing as failed");
        }
    }
}

/// `catalogusId`, else `catalog` as a string or as an object carrying an `id`
pub fn catalog_id(record: &Map<String, Value>) -> Option<String> {
    if let Some(id) = record.get(fields::CATALOG_ID).and_then(scalar_string) {
        return Some(id);
    }
    match record.get(fields::CATALOG)? {
        Value::Object(catalog) => catalog
            .get("id")
            .or_else(|| catalog.get(SELF_KEY).and_then(|envelope| envelope.get("id")))
            .and_then(scalar_string),
        other => scalar_string(other),
    }
}

/// Newest-precedence timestamp of a remote record, checked in [`TIMESTAMP_PATHS`] order
pub fn newest_timestamp(record: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let value = Value::Object(record.clone());
    TIMESTAMP_PATHS
        .iter()
        .find_map(|path| resolve_path(&value, path).and_then(parse_timestamp))
}

/// Derive a publications endpoint from a declared search endpoint
///
/// `/api/search` becomes `/api/publications`; otherwise the last path segment
/// named `search` is replaced. Returns `None` when neither applies.
pub fn derive_publications_endpoint(search: &str) -> Option<String> {
    let search = search.trim();
    if search.is_empty() {
        return None;
    }

    if search.contains("/api/search") {
        return Some(search.replacen("/api/search", "/api/publications", 1));
    }

    let mut url = url::Url::parse(search).ok()?;
    let segments: Vec<String> = url.path_segments()?.map(str::to_string).collect();
    let position = segments.iter().rposition(|segment| segment == fields::SEARCH)?;

    let rewritten: Vec<&str> = segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            if index == position {
                fields::PUBLICATIONS
            } else {
                segment.as_str()
            }
        })
        .collect();
    url.set_path(&rewritten.join("/"));
    Some(url.to_string())
}

pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_catalog_id_sources() {
        assert_eq!(catalog_id(&object(json!({"catalogusId": "c1"}))), Some("c1".to_string()));
        assert_eq!(catalog_id(&object(json!({"catalog": "c2"}))), Some("c2".to_string()));
        assert_eq!(
            catalog_id(&object(json!({"catalog": {"id": "c3", "title": "Cat"}}))),
            Some("c3".to_string())
        );
        assert_eq!(catalog_id(&object(json!({"catalog": 17}))), Some("17".to_string()));
        assert_eq!(catalog_id(&object(json!({"title": "orphan"}))), None);
    }

    #[test]
    fn test_newest_timestamp_priority() {
        let record = object(json!({
            "created": "2024-01-01T00:00:00Z",
            "@self": {"updated": "2024-03-01T00:00:00Z"},
            "lastSync": "2024-06-01T00:00:00Z"
        }));
        assert_eq!(
            newest_timestamp(&record),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );

        let record = object(json!({"updated": "garbage", "created": "2024-01-01T00:00:00Z"}));
        assert_eq!(
            newest_timestamp(&record),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );

        assert_eq!(newest_timestamp(&object(json!({"title": "x"}))), None);
    }

    const SOURCE: &str = "https://peer.example.org/apps/opencatalogi/api/directory";
    const DEFAULT_DIRECTORY: &str =
        "https://directory.opencatalogi.nl/apps/opencatalogi/api/directory";

    async fn reconciler() -> (ListingReconciler, Arc<dyn ObjectStore>, Arc<FixedClock>) {
        let store: Arc<dyn ObjectStore> =
            Arc::new(bridge_desktop::SqliteObjectStore::in_memory().await.unwrap());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let reconciler = ListingReconciler::new(
            store.clone(),
            clock.clone(),
            "7",
            "12",
            DEFAULT_DIRECTORY,
        );
        (reconciler, store, clock)
    }

    async fn stored_listings(store: &Arc<dyn ObjectStore>) -> Vec<StoredObject> {
        store.find_all(&ObjectFilter::new("7", "12")).await.unwrap()
    }

    fn remote_listing() -> Map<String, Value> {
        object(json!({
            "id": "listing-c1",
            "catalog": {"id": "c1", "title": "Catalogus"},
            "title": "Gemeente Voorbeeld",
            "search": "https://peer.example.org/apps/opencatalogi/api/search",
            "schemas": [{"id": 1}, {"id": 2}],
            "@self": {"register": "3", "schema": "4"}
        }))
    }

    #[tokio::test]
    async fn test_new_listing_is_created_and_normalized() {
        let (reconciler, store, _clock) = reconciler().await;

        let outcome = reconciler
            .reconcile(remote_listing(), SOURCE, &KnownDirectories::new([SOURCE]))
            .await;
        assert_eq!(outcome.action, SyncAction::Created);
        assert_eq!(outcome.listing_id.as_deref(), Some("c1"));

        let listings = stored_listings(&store).await;
        assert_eq!(listings.len(), 1);
        let listing = &listings[0];
        assert_eq!(listing.uuid, "listing-c1");
        assert_eq!(listing.str_field("catalogusId"), Some("c1"));
        assert_eq!(listing.str_field("directory"), Some(SOURCE));
        assert_eq!(listing.field("available"), Some(&json!(true)));
        assert_eq!(listing.field("default"), Some(&json!(false)));
        assert_eq!(listing.field("statusCode"), Some(&json!(200)));
        assert_eq!(listing.field("schemaCount"), Some(&json!(2)));
        assert_eq!(listing.str_field("lastSync"), Some("2024-06-01T12:00:00Z"));
        assert_eq!(
            listing.str_field("publicationsEndpoint"),
            Some("https://peer.example.org/apps/opencatalogi/api/publications")
        );
        assert!(listing.field("@self").is_none());
        assert!(listing.field("id").is_none());
    }

    #[tokio::test]
    async fn test_second_identical_reconcile_is_unchanged_without_write() {
        let (reconciler, store, clock) = reconciler().await;
        let known = KnownDirectories::new([SOURCE]);

        reconciler.reconcile(remote_listing(), SOURCE, &known).await;
        let before = stored_listings(&store).await;

        clock.advance(chrono::Duration::hours(1));
        let outcome = reconciler.reconcile(remote_listing(), SOURCE, &known).await;

        assert_eq!(outcome.action, SyncAction::Unchanged);
        assert!(outcome.success);
        assert_eq!(stored_listings(&store).await, before);
    }

    #[tokio::test]
    async fn test_changed_listing_is_updated_in_place() {
        let (reconciler, store, clock) = reconciler().await;
        let known = KnownDirectories::new([SOURCE]);

        reconciler.reconcile(remote_listing(), SOURCE, &known).await;

        clock.advance(chrono::Duration::hours(1));
        let mut changed = remote_listing();
        changed.insert("title".to_string(), json!("Gemeente Hernoemd"));
        let outcome = reconciler.reconcile(changed, SOURCE, &known).await;
        assert_eq!(outcome.action, SyncAction::Updated);

        let listings = stored_listings(&store).await;
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].uuid, "listing-c1");
        assert_eq!(listings[0].str_field("title"), Some("Gemeente Hernoemd"));
        assert_eq!(listings[0].str_field("lastSync"), Some("2024-06-01T13:00:00Z"));
    }

    #[tokio::test]
    async fn test_outdated_listing_is_skipped_and_store_untouched() {
        let (reconciler, store, _clock) = reconciler().await;
        let known = KnownDirectories::new([SOURCE]);

        reconciler.reconcile(remote_listing(), SOURCE, &known).await;
        let before = stored_listings(&store).await;

        let mut stale = remote_listing();
        stale.insert("title".to_string(), json!("Old title"));
        stale.insert("updated".to_string(), json!("2024-05-01T00:00:00Z"));
        let outcome = reconciler.reconcile(stale, SOURCE, &known).await;

        assert_eq!(outcome.action, SyncAction::SkippedOutdated);
        assert!(outcome.success);
        assert_eq!(stored_listings(&store).await, before);
    }

    #[tokio::test]
    async fn test_listing_of_other_known_directory_is_skipped() {
        let (reconciler, store, _clock) = reconciler().await;
        let other = "https://other.example.org/apps/opencatalogi/api/directory";
        let known = KnownDirectories::new([SOURCE, other]);

        let mut remote = remote_listing();
        remote.insert("directory".to_string(), json!(other));
        let outcome = reconciler.reconcile(remote, SOURCE, &known).await;

        assert_eq!(outcome.action, SyncAction::SkippedOtherDirectory);
        assert!(stored_listings(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_listing_of_unknown_directory_keeps_its_directory() {
        let (reconciler, store, _clock) = reconciler().await;
        let declared = "https://third.example.org/apps/opencatalogi/api/directory";

        let mut remote = remote_listing();
        remote.insert("directory".to_string(), json!(declared));
        let outcome = reconciler
            .reconcile(remote, SOURCE, &KnownDirectories::new([SOURCE]))
            .await;

        assert_eq!(outcome.action, SyncAction::Created);
        assert_eq!(stored_listings(&store).await[0].str_field("directory"), Some(declared));
    }

    #[tokio::test]
    async fn test_default_directory_listing_is_flagged() {
        let (reconciler, store, _clock) = reconciler().await;

        reconciler
            .reconcile(remote_listing(), DEFAULT_DIRECTORY, &KnownDirectories::default())
            .await;

        assert_eq!(stored_listings(&store).await[0].field("default"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_listing_without_catalog_fails_without_panicking() {
        let (reconciler, store, _clock) = reconciler().await;

        let outcome = reconciler
            .reconcile(object(json!({"title": "orphan"})), SOURCE, &KnownDirectories::default())
            .await;

        assert_eq!(outcome.action, SyncAction::Failed);
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert!(stored_listings(&store).await.is_empty());
    }

    #[test]
    fn test_derive_publications_endpoint() {
        assert_eq!(
            derive_publications_endpoint("https://peer.example.org/apps/opencatalogi/api/search"),
            Some("https://peer.example.org/apps/opencatalogi/api/publications".to_string())
        );
        assert_eq!(
            derive_publications_endpoint("https://peer.example.org/catalog/search?x=1"),
            Some("https://peer.example.org/catalog/publications?x=1".to_string())
        );
        assert_eq!(
            derive_publications_endpoint("https://peer.example.org/research/api"),
            None
        );
        assert_eq!(derive_publications_endpoint(""), None);
    }
}
