//! Directory Sync Engine
//!
//! Pulls listing sets from peer directories and reconciles them into the local
//! store. Directories are synced concurrently in [`DirectorySyncEngine::sync_all`],
//! and every listing of one directory is reconciled concurrently as well. The
//! set of known directories is computed once per run and shared read-only.

use std::sync::Arc;
use std::time::Instant;

use bridge_traits::{ObjectFilter, ObjectStore};
use core_runtime::config::FederationConfig;
use core_runtime::events::{EventBus, FederationEvent, SyncEvent};
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::broadcast::BroadcastNotifier;
use crate::error::Result;
use crate::fetcher::RemoteListingFetcher;
use crate::listing::{fields, DirectoryStatus, KnownDirectories, RunStatistics, SyncAllReport};
use crate::reconciler::ListingReconciler;
use crate::url_policy::{canonical_url, is_local_url, same_url, validate_directory_url, OwnInstance};

pub struct DirectorySyncEngine {
    store: Arc<dyn ObjectStore>,
    fetcher: RemoteListingFetcher,
    reconciler: ListingReconciler,
    notifier: Arc<BroadcastNotifier>,
    event_bus: Option<EventBus>,
    own: OwnInstance,
    own_directory_url: String,
    default_directory_url: String,
    register: String,
    schema: String,
    fetch_limit: u64,
}

impl DirectorySyncEngine {
    pub fn new(config: &FederationConfig, own: OwnInstance, notifier: Arc<BroadcastNotifier>) -> Self {
        Self {
            store: config.object_store.clone(),
            fetcher: RemoteListingFetcher::new(
                config.http_client.clone(),
                config.tuning.request_timeout,
            ),
            reconciler: ListingReconciler::new(
                config.object_store.clone(),
                config.clock.clone(),
                config.listing_register.clone(),
                config.listing_schema.clone(),
                config.default_directory_url.clone(),
            ),
            notifier,
            event_bus: config.event_bus.clone(),
            own,
            own_directory_url: config.directory_url.clone(),
            default_directory_url: config.default_directory_url.clone(),
            register: config.listing_register.clone(),
            schema: config.listing_schema.clone(),
            fetch_limit: config.tuning.listing_fetch_limit,
        }
    }

    /// Distinct directories referenced by local listings plus the default seed,
    /// never including this instance
    pub async fn directory_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut seen = std::collections::BTreeSet::new();

        let listings = match self
            .store
            .find_all(&ObjectFilter::new(&self.register, &self.schema))
            .await
        {
            Ok(listings) => listings,
            Err(err) => {
                warn!(error = %err, "Could not load listings; syncing the default directory only");
                Vec::new()
            }
        };

        let candidates = listings
            .iter()
            .filter_map(|listing| listing.str_field(fields::DIRECTORY))
            .chain(std::iter::once(self.default_directory_url.as_str()));

        for candidate in candidates {
            let Some(canonical) = canonical_url(candidate) else {
                continue;
            };
            if self.own.is_self_str(candidate) || !seen.insert(canonical) {
                continue;
            }
            urls.push(candidate.trim().to_string());
        }

        urls
    }

    pub async fn known_directories(&self) -> KnownDirectories {
        KnownDirectories::new(self.directory_urls().await)
    }

    /// Sync every known directory concurrently; one directory's failure never
    /// affects another's
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> SyncAllReport {
        let started = Instant::now();
        let urls = self.directory_urls().await;
        let known = KnownDirectories::new(&urls);

        info!(directories = urls.len(), "Starting sync of all directories");
        self.emit(SyncEvent::Started {
            directories: urls.clone(),
        });

        let runs = urls.iter().map(|url| {
            let known = &known;
            async move {
                let result = match validate_directory_url(url, &self.own) {
                    Ok(_) => self.sync_directory(url, known).await,
                    Err(err) => Err(err),
                };
                (url.clone(), result)
            }
        });

        let mut report = SyncAllReport::default();
        for (url, result) in join_all(runs).await {
            let status = match result {
                Ok(stats) => DirectoryStatus::Synced(stats),
                Err(err) => DirectoryStatus::Failed {
                    http_status: err.remote_status(),
                    message: err.to_string(),
                },
            };
            report.insert(url, status);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            directories = report.directories.len(),
            processed = report.totals.total_processed,
            created = report.totals.listings_created,
            updated = report.totals.listings_updated,
            failed = report.totals.listings_failed,
            duration_ms,
            "Finished sync of all directories"
        );
        self.emit(SyncEvent::Completed {
            directories: report.directories.len() as u64,
            total_processed: report.totals.total_processed,
            duration_ms,
        });

        report
    }

    /// Validate and sync a single directory
    ///
    /// # Errors
    ///
    /// - `InvalidDirectoryUrl` / `SelfReference` before any network call
    /// - the fetch error when the directory itself cannot be read
    #[instrument(skip(self))]
    pub async fn sync_one(&self, directory_url: &str) -> Result<RunStatistics> {
        validate_directory_url(directory_url, &self.own)?;
        let directory_url = directory_url.trim();

        let mut urls = self.directory_urls().await;
        urls.push(directory_url.to_string());
        let known = KnownDirectories::new(&urls);

        self.emit(SyncEvent::Started {
            directories: vec![directory_url.to_string()],
        });
        let started = Instant::now();
        let result = self.sync_directory(directory_url, &known).await;
        self.emit(SyncEvent::Completed {
            directories: 1,
            total_processed: result.as_ref().map_or(0, |stats| stats.total_processed),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        result
    }

    /// Fetch one already-validated directory and reconcile everything it returns
    async fn sync_directory(
        &self,
        directory_url: &str,
        known: &KnownDirectories,
    ) -> Result<RunStatistics> {
        let fetched = match self.fetcher.fetch(directory_url, self.fetch_limit).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(directory = %directory_url, error = %err, "Directory unavailable");
                self.mark_directory_unavailable(directory_url, err.listing_status())
                    .await;
                self.emit(SyncEvent::DirectoryFailed {
                    directory: directory_url.to_string(),
                    status: err.remote_status(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let (listings, has_our_listings) = self.partition_listings(fetched.results);
        debug!(
            directory = %directory_url,
            listings = listings.len(),
            has_our_listings,
            "Reconciling directory listings"
        );

        let outcomes = join_all(
            listings
                .into_iter()
                .map(|listing| self.reconciler.reconcile(listing, directory_url, known)),
        )
        .await;
        let stats = RunStatistics::from_outcomes(&outcomes);

        if !has_our_listings && !is_local_url(&self.own_directory_url) {
            let delivered = self.notifier.broadcast(Some(directory_url)).await;
            if delivered.values().any(|ok| !ok) {
                warn!(directory = %directory_url, "Peer does not list us and could not be notified");
            }
        }

        info!(
            directory = %directory_url,
            created = stats.listings_created,
            updated = stats.listings_updated,
            unchanged = stats.listings_unchanged,
            skipped = stats.listings_skipped,
            failed = stats.listings_failed,
            "Directory synced"
        );
        self.emit(SyncEvent::DirectorySynced {
            directory: directory_url.to_string(),
            created: stats.listings_created,
            updated: stats.listings_updated,
            unchanged: stats.listings_unchanged,
            skipped: stats.listings_skipped,
            failed: stats.listings_failed,
        });

        Ok(stats)
    }

    /// Drop listings that describe this instance or a local address
    ///
    /// The flag reports whether the peer already lists this instance.
    fn partition_listings(
        &self,
        results: Vec<Map<String, Value>>,
    ) -> (Vec<Map<String, Value>>, bool) {
        let mut has_our_listings = false;
        let listings = results
            .into_iter()
            .filter(|listing| {
                let Some(declared) = listing
                    .get(fields::DIRECTORY)
                    .and_then(Value::as_str)
                    .filter(|declared| !declared.trim().is_empty())
                else {
                    return true;
                };
                if self.own.is_self_str(declared) || same_url(declared, &self.own_directory_url) {
                    has_our_listings = true;
                    return false;
                }
                if is_local_url(declared) {
                    debug!(declared, "Ignoring listing with a local directory");
                    return false;
                }
                true
            })
            .collect();
        (listings, has_our_listings)
    }

    /// Best effort: flag every listing sourced from `directory_url` as unavailable
    async fn mark_directory_unavailable(&self, directory_url: &str, status: u16) {
        let listings = match self
            .store
            .find_all(&ObjectFilter::new(&self.register, &self.schema))
            .await
        {
            Ok(listings) => listings,
            Err(err) => {
                warn!(directory = %directory_url, error = %err, "Could not load listings to mark unavailable");
                return;
            }
        };

        for listing in listings {
            let from_directory = listing
                .str_field(fields::DIRECTORY)
                .is_some_and(|declared| same_url(declared, directory_url));
            if !from_directory {
                continue;
            }

            let mut object = listing.object;
            object.insert(fields::AVAILABLE.to_string(), Value::Bool(false));
            object.insert(fields::STATUS_CODE.to_string(), Value::from(status));
            if let Err(err) = self
                .store
                .save_object(object, &self.register, &self.schema, Some(&listing.uuid))
                .await
            {
                warn!(uuid = %listing.uuid, error = %err, "Could not mark listing unavailable");
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(FederationEvent::Sync(event));
        }
    }
}
