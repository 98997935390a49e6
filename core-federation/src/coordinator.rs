//! Federation Coordinator
//!
//! The public face of the engine. Every entry point honours the aggregate
//! flag before anything else: when it is off, no remote call is made and only
//! local data is returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use bridge_traits::{ObjectStore, PaginatedObjects};
use core_runtime::config::FederationConfig;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::PublicationEndpointAggregator;
use crate::broadcast::{BroadcastNotifier, BroadcastPayload};
use crate::directory_sync::DirectorySyncEngine;
use crate::error::{FederationError, Result};
use crate::listing::{RunStatistics, SyncAllReport};
use crate::merger::{AggregatedResultSet, ResultMerger, SourceResults};
use crate::query::PublicationQuery;
use crate::url_policy::OwnInstance;

/// Source key of this instance's own records in `sources`
pub const LOCAL_SOURCE: &str = "local";

pub struct FederationCoordinator {
    config: FederationConfig,
    store: Arc<dyn ObjectStore>,
    sync: DirectorySyncEngine,
    aggregator: PublicationEndpointAggregator,
    notifier: Arc<BroadcastNotifier>,
}

impl FederationCoordinator {
    /// Wire the engine components from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns `Config` when the base or directory URL is unusable.
    pub fn new(config: FederationConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| FederationError::Config(err.to_string()))?;

        let own = OwnInstance::new(&config.base_url, &config.directory_url)?;
        let notifier = Arc::new(BroadcastNotifier::new(&config, own.clone()));
        let sync = DirectorySyncEngine::new(&config, own, notifier.clone());
        let aggregator = PublicationEndpointAggregator::new(&config);

        info!(
            base_url = %config.base_url,
            directory = %config.directory_url,
            "Federation coordinator ready"
        );

        Ok(Self {
            store: config.object_store.clone(),
            config,
            sync,
            aggregator,
            notifier,
        })
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    /// Sync every known directory; a no-op when `aggregate` is false
    pub async fn sync_all(&self, aggregate: bool) -> SyncAllReport {
        if !aggregate {
            debug!("Aggregation disabled; skipping directory sync");
            return SyncAllReport::default();
        }
        self.sync.sync_all().await
    }

    /// Sync one directory; a no-op when `aggregate` is false
    ///
    /// # Errors
    ///
    /// Validation errors for empty, malformed or self-referencing URLs, and the
    /// fetch error when the directory cannot be read.
    pub async fn sync_one(&self, directory_url: &str, aggregate: bool) -> Result<RunStatistics> {
        if !aggregate {
            debug!("Aggregation disabled; skipping directory sync");
            return Ok(RunStatistics::default());
        }
        self.sync.sync_one(directory_url).await
    }

    /// Paginated publications from this instance and, unless disabled, its peers
    ///
    /// Remote failures never surface here; the result degrades to local data.
    ///
    /// # Errors
    ///
    /// Only a failing local store is an error.
    #[instrument(skip(self, query), fields(page = query.page, limit = query.limit, aggregate = query.aggregate))]
    pub async fn aggregate_publications(
        &self,
        query: &PublicationQuery,
    ) -> Result<AggregatedResultSet> {
        if !query.aggregate {
            let local = self.local_publications(query, query.page, query.limit).await?;
            return Ok(AggregatedResultSet::from_page(local, query).with_sources(self.local_sources()));
        }

        let local = self
            .local_publications(query, 1, query.items_needed())
            .await?;
        let remote = self.aggregator.aggregate(query).await;

        if remote.statistics.successful_calls == 0 || remote.results.is_empty() {
            if !remote.errors.is_empty() {
                warn!(failed = remote.errors.len(), "No peer answered; serving local publications");
            }
            let page = self.local_publications(query, query.page, query.limit).await?;
            return Ok(AggregatedResultSet::from_page(page, query).with_sources(self.local_sources()));
        }

        let mut sources = self.local_sources();
        sources.extend(remote.sources);

        let remote_results = SourceResults {
            results: remote.results,
            facets: remote.facets,
            facetable: None,
        };
        Ok(ResultMerger::merge(local.into(), remote_results, sources, query))
    }

    /// One publication by id: the local store first, then every peer
    ///
    /// # Errors
    ///
    /// `NotFound` when no source has the publication.
    #[instrument(skip(self, query))]
    pub async fn aggregate_publication_detail(
        &self,
        id: &str,
        query: &PublicationQuery,
    ) -> Result<Value> {
        if let Some(stored) = self.store.find(id).await? {
            let in_scope = self
                .config
                .publication_register
                .as_ref()
                .map_or(true, |register| register == &stored.register)
                && self
                    .config
                    .publication_schema
                    .as_ref()
                    .map_or(true, |schema| schema == &stored.schema);
            if in_scope {
                return Ok(stored.to_record());
            }
        }

        if !query.aggregate {
            return Err(FederationError::not_found("Publication", id));
        }

        self.aggregator
            .find_publication(id)
            .await
            .ok_or_else(|| FederationError::not_found("Publication", id))
    }

    /// This instance's listings in the paginated shape peers consume
    ///
    /// # Errors
    ///
    /// Fails only when the local store does.
    pub async fn directory_index(&self, query: &PublicationQuery) -> Result<AggregatedResultSet> {
        let search = query.to_search_query(
            Some(self.config.listing_register.as_str()),
            Some(self.config.listing_schema.as_str()),
            query.page,
            query.limit,
        );
        let page = self.store.search_objects_paginated(&search).await?;
        Ok(AggregatedResultSet::from_page(page, query))
    }

    /// Handle a presence announcement POSTed by a peer: sync the directory it names
    ///
    /// # Errors
    ///
    /// `Parse` for a malformed payload; otherwise whatever [`Self::sync_one`] returns.
    #[instrument(skip(self, payload))]
    pub async fn handle_broadcast(&self, payload: Value) -> Result<RunStatistics> {
        let payload: BroadcastPayload =
            serde_json::from_value(payload).map_err(|err| FederationError::Parse {
                url: "broadcast".to_string(),
                message: err.to_string(),
            })?;

        info!(
            directory = %payload.directory,
            source = payload.source.as_deref().unwrap_or("unknown"),
            "Received broadcast"
        );
        self.sync_one(&payload.directory, true).await
    }

    /// Announce this instance to one directory, or to every known directory
    pub async fn broadcast(&self, target: Option<&str>) -> BTreeMap<String, bool> {
        self.notifier.broadcast(target).await
    }

    async fn local_publications(
        &self,
        query: &PublicationQuery,
        page: u64,
        limit: u64,
    ) -> Result<PaginatedObjects> {
        let search = query.to_search_query(
            self.config.publication_register.as_deref(),
            self.config.publication_schema.as_deref(),
            page,
            limit,
        );
        Ok(self.store.search_objects_paginated(&search).await?)
    }

    fn local_sources(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LOCAL_SOURCE.to_string(), self.config.base_url.clone())])
    }
}
