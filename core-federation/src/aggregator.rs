//! Publication Endpoint Aggregator
//!
//! Queries the publications endpoint of every available listing concurrently
//! and collects what comes back. Listings sharing an endpoint are fetched once.
//! Failures are recorded per endpoint and never abort the batch; each call also
//! refreshes the listing's availability in the background.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_traits::{Clock, HttpClient, HttpRequest, ObjectFilter, ObjectStore};
use core_runtime::config::FederationConfig;
use core_runtime::events::{AggregationEvent, EventBus, FederationEvent};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::fetcher::with_query_params;
use crate::listing::{fields, DirectoryRecord};
use crate::merger::SOURCE_KEY;
use crate::query::{PublicationQuery, AGGREGATE_PARAM};
use crate::reconciler::timestamp;
use crate::url_policy::canonical_url;

/// Counters of one aggregation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationStatistics {
    pub endpoints: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_publications: u64,
    pub execution_time_ms: u64,
}

/// One endpoint that could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointError {
    pub endpoint: String,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationResult {
    /// Publications of every successful endpoint, each tagged with `_source`
    pub results: Vec<Value>,
    /// Endpoint URL to the label of the listing it belongs to
    pub sources: BTreeMap<String, String>,
    pub statistics: AggregationStatistics,
    pub errors: Vec<EndpointError>,
    /// Facets reported by the first endpoint that returned any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<Value>,
}

/// A publications endpoint and every listing that points at it
#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    listings: Vec<DirectoryRecord>,
}

impl Endpoint {
    fn primary(&self) -> Option<&DirectoryRecord> {
        self.listings.first()
    }

    fn label(&self) -> String {
        self.primary()
            .map_or_else(|| self.url.clone(), DirectoryRecord::label)
    }

    fn source_tag(&self) -> Value {
        let primary = self.primary();
        json!({
            "endpoint": self.url,
            "listing": primary.map(|listing| listing.id.clone()),
            "catalog": primary.map(DirectoryRecord::label),
            "title": primary.and_then(|listing| listing.title.clone()),
            "directory": primary.and_then(|listing| listing.directory_url.clone()),
            "organisation": primary.and_then(|listing| listing.organisation.clone()),
        })
    }
}

enum EndpointOutcome {
    Success {
        status: u16,
        publications: Vec<Value>,
        facets: Option<Value>,
    },
    Failure(EndpointError),
}

pub struct PublicationEndpointAggregator {
    http_client: Arc<dyn HttpClient>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    event_bus: Option<EventBus>,
    register: String,
    schema: String,
    timeout: Duration,
    default_only: bool,
}

impl PublicationEndpointAggregator {
    pub fn new(config: &FederationConfig) -> Self {
        Self {
            http_client: config.http_client.clone(),
            store: config.object_store.clone(),
            clock: config.clock.clone(),
            event_bus: config.event_bus.clone(),
            register: config.listing_register.clone(),
            schema: config.listing_schema.clone(),
            timeout: config.tuning.request_timeout,
            default_only: config.tuning.aggregate_default_only,
        }
    }

    /// Query every known publications endpoint with the remote form of `query`
    #[instrument(skip(self, query))]
    pub async fn aggregate(&self, query: &PublicationQuery) -> AggregationResult {
        let started = Instant::now();
        let default_only = query.default_only.unwrap_or(self.default_only);
        let endpoints = self.endpoints(default_only).await;

        if endpoints.is_empty() {
            debug!("No publication endpoints known; skipping remote aggregation");
            return AggregationResult::default();
        }

        let params = query.remote_params();
        let outcomes = join_all(
            endpoints
                .iter()
                .map(|endpoint| self.fetch_endpoint(&endpoint.url, &params)),
        )
        .await;

        let mut result = AggregationResult {
            statistics: AggregationStatistics {
                endpoints: endpoints.len() as u64,
                ..Default::default()
            },
            ..Default::default()
        };

        for (endpoint, outcome) in endpoints.iter().zip(outcomes) {
            result.sources.insert(endpoint.url.clone(), endpoint.label());

            match outcome {
                EndpointOutcome::Success {
                    status,
                    publications,
                    facets,
                } => {
                    result.statistics.successful_calls += 1;
                    result.statistics.total_publications += publications.len() as u64;
                    if result.facets.is_none() {
                        result.facets = facets;
                    }

                    let tag = endpoint.source_tag();
                    result
                        .results
                        .extend(publications.into_iter().map(|publication| tagged(publication, &tag)));
                    self.refresh_listings(endpoint, true, status);
                }
                EndpointOutcome::Failure(error) => {
                    result.statistics.failed_calls += 1;
                    self.emit(AggregationEvent::EndpointFailed {
                        endpoint: error.endpoint.clone(),
                        status: error.status,
                        message: error.message.clone(),
                    });
                    self.refresh_listings(endpoint, false, error.status.unwrap_or(500));
                    result.errors.push(error);
                }
            }
        }

        result.statistics.execution_time_ms = started.elapsed().as_millis() as u64;
        info!(
            endpoints = result.statistics.endpoints,
            successful = result.statistics.successful_calls,
            failed = result.statistics.failed_calls,
            publications = result.statistics.total_publications,
            duration_ms = result.statistics.execution_time_ms,
            "Publication aggregation finished"
        );
        self.emit(AggregationEvent::Completed {
            endpoints: result.statistics.endpoints,
            successful_calls: result.statistics.successful_calls,
            failed_calls: result.statistics.failed_calls,
            total_publications: result.statistics.total_publications,
            duration_ms: result.statistics.execution_time_ms,
        });

        result
    }

    /// Look a single publication up on every endpoint; the first endpoint (in
    /// listing order) that has it wins
    #[instrument(skip(self))]
    pub async fn find_publication(&self, id: &str) -> Option<Value> {
        let endpoints = self.endpoints(self.default_only).await;
        if endpoints.is_empty() {
            return None;
        }

        let lookups = endpoints.iter().map(|endpoint| async move {
            let url = publication_url(&endpoint.url, id)?;
            let request = HttpRequest::get(url.as_str())
                .accept_json()
                .timeout(self.timeout);

            match self.http_client.execute(request).await {
                Ok(response) if response.is_success() => match response.json::<Value>() {
                    Ok(Value::Object(publication)) => {
                        Some(tagged(Value::Object(publication), &endpoint.source_tag()))
                    }
                    _ => {
                        debug!(endpoint = %endpoint.url, "Publication response is not an object");
                        None
                    }
                },
                Ok(response) => {
                    debug!(endpoint = %endpoint.url, status = response.status, "Publication not found on endpoint");
                    None
                }
                Err(err) => {
                    warn!(endpoint = %endpoint.url, error = %err, "Publication lookup failed");
                    None
                }
            }
        });

        join_all(lookups).await.into_iter().flatten().next()
    }

    /// Available listings grouped by publications endpoint, in listing order
    async fn endpoints(&self, default_only: bool) -> Vec<Endpoint> {
        let mut filter = ObjectFilter::new(&self.register, &self.schema).field(fields::AVAILABLE, true);
        if default_only {
            filter = filter.field(fields::DEFAULT, true);
        }

        let listings = match self.store.find_all(&filter).await {
            Ok(listings) => listings,
            Err(err) => {
                warn!(error = %err, "Could not load listings for aggregation");
                return Vec::new();
            }
        };

        let mut endpoints: Vec<Endpoint> = Vec::new();
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();
        for stored in &listings {
            let listing = DirectoryRecord::from_stored(stored);
            let Some(url) = listing.publications_endpoint.clone() else {
                continue;
            };
            let Some(canonical) = canonical_url(&url) else {
                debug!(endpoint = %url, "Ignoring listing with an invalid publications endpoint");
                continue;
            };

            match positions.get(&canonical) {
                Some(&index) => endpoints[index].listings.push(listing),
                None => {
                    positions.insert(canonical, endpoints.len());
                    endpoints.push(Endpoint {
                        url: url.trim().to_string(),
                        listings: vec![listing],
                    });
                }
            }
        }

        endpoints
    }

    async fn fetch_endpoint(&self, endpoint: &str, params: &[(String, String)]) -> EndpointOutcome {
        let failure = |status: Option<u16>, message: String| {
            EndpointOutcome::Failure(EndpointError {
                endpoint: endpoint.to_string(),
                status,
                message,
            })
        };

        let url = match with_query_params(endpoint, params) {
            Ok(url) => url,
            Err(err) => return failure(None, err.to_string()),
        };
        let request = HttpRequest::get(url.as_str())
            .accept_json()
            .timeout(self.timeout);

        let response = match self.http_client.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "Publication endpoint unreachable");
                return failure(None, err.to_string());
            }
        };

        if !response.is_success() {
            warn!(endpoint = %endpoint, status = response.status, "Publication endpoint returned an error");
            return failure(Some(response.status), format!("HTTP {}", response.status));
        }

        let mut body = match response.json::<Value>() {
            Ok(Value::Object(body)) => body,
            Ok(_) => {
                return failure(Some(response.status), "response is not a JSON object".to_string())
            }
            Err(err) => return failure(Some(response.status), err.to_string()),
        };

        let publications = match body.remove("results") {
            Some(Value::Array(results)) => results,
            _ => {
                return failure(Some(response.status), "response has no results array".to_string())
            }
        };

        EndpointOutcome::Success {
            status: response.status,
            publications,
            facets: body.remove("facets").filter(|facets| !facets.is_null()),
        }
    }

    /// Record the outcome of a call on every listing of the endpoint without
    /// holding up the response
    fn refresh_listings(&self, endpoint: &Endpoint, available: bool, status: u16) {
        let store = self.store.clone();
        let register = self.register.clone();
        let schema = self.schema.clone();
        let now = timestamp(self.clock.now());
        let ids: Vec<String> = endpoint.listings.iter().map(|listing| listing.id.clone()).collect();

        let update = async move {
            for id in ids {
                let existing = match store.find(&id).await {
                    Ok(Some(existing)) => existing,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(listing = %id, error = %err, "Could not load listing for status update");
                        continue;
                    }
                };

                let mut object = existing.object;
                object.insert(fields::AVAILABLE.to_string(), Value::Bool(available));
                object.insert(fields::STATUS_CODE.to_string(), Value::from(status));
                object.insert(fields::LAST_SYNC.to_string(), Value::String(now.clone()));

                if let Err(err) = store.save_object(object, &register, &schema, Some(&id)).await {
                    warn!(listing = %id, error = %err, "Could not update listing status");
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(update);
            }
            Err(_) => futures::executor::block_on(update),
        }
    }

    fn emit(&self, event: AggregationEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(FederationEvent::Aggregation(event));
        }
    }
}

fn tagged(publication: Value, tag: &Value) -> Value {
    match publication {
        Value::Object(mut map) => {
            map.insert(SOURCE_KEY.to_string(), tag.clone());
            Value::Object(map)
        }
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map.insert(SOURCE_KEY.to_string(), tag.clone());
            Value::Object(map)
        }
    }
}

/// `{endpoint}/{id}?_aggregate=false`
fn publication_url(endpoint: &str, id: &str) -> Option<Url> {
    let mut url = Url::parse(endpoint.trim()).ok()?;
    url.path_segments_mut().ok()?.pop_if_empty().push(id);
    url.query_pairs_mut().append_pair(AGGREGATE_PARAM, "false");
    Some(url)
}
