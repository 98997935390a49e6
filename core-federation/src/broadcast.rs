//! Broadcast Notifier
//!
//! Announces this instance's directory to peers with a JSON POST of
//! `{directory, timestamp, source}`. Each target gets a bounded number of
//! attempts with a linear backoff (`attempt * unit`) between them. A target
//! that never answers with a 2xx is recorded as failed and the batch moves on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{Clock, HttpClient, HttpRequest, ObjectFilter, ObjectStore};
use core_runtime::config::FederationConfig;
use core_runtime::events::{BroadcastEvent, EventBus, FederationEvent};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::listing::fields;
use crate::reconciler::timestamp;
use crate::url_policy::{canonical_url, is_local_url, OwnInstance};

/// Body of a presence announcement, sent and received by peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub directory: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

pub struct BroadcastNotifier {
    http_client: Arc<dyn HttpClient>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    event_bus: Option<EventBus>,
    own: OwnInstance,
    own_directory_url: String,
    register: String,
    schema: String,
    source: String,
    max_attempts: u32,
    backoff_unit: Duration,
    timeout: Duration,
}

impl BroadcastNotifier {
    pub fn new(config: &FederationConfig, own: OwnInstance) -> Self {
        Self {
            http_client: config.http_client.clone(),
            store: config.object_store.clone(),
            clock: config.clock.clone(),
            event_bus: config.event_bus.clone(),
            own,
            own_directory_url: config.directory_url.clone(),
            register: config.listing_register.clone(),
            schema: config.listing_schema.clone(),
            source: config.tuning.broadcast_source.clone(),
            max_attempts: config.tuning.broadcast_max_attempts.max(1),
            backoff_unit: config.tuning.broadcast_backoff_unit,
            timeout: config.tuning.request_timeout,
        }
    }

    /// Announce this instance to `target`, or to every directory referenced by
    /// local listings when no target is given
    ///
    /// Returns the delivery result per target. Self and local targets are
    /// skipped and do not appear in the map.
    #[instrument(skip(self))]
    pub async fn broadcast(&self, target: Option<&str>) -> BTreeMap<String, bool> {
        let targets = match target {
            Some(target) => vec![target.trim().to_string()],
            None => self.listed_directories().await,
        };

        let mut results = BTreeMap::new();
        for target in targets {
            if self.own.is_self_str(&target) {
                debug!(target = %target, "Not broadcasting to ourselves");
                continue;
            }
            if is_local_url(&target) {
                debug!(target = %target, "Not broadcasting to a local address");
                continue;
            }

            let delivered = self.notify(&target).await;
            results.insert(target, delivered);
        }

        info!(
            targets = results.len(),
            delivered = results.values().filter(|ok| **ok).count(),
            "Broadcast finished"
        );
        results
    }

    /// POST our presence to one directory, retrying up to the configured attempts
    #[instrument(skip(self), fields(target = %target))]
    pub async fn notify(&self, target: &str) -> bool {
        let payload = BroadcastPayload {
            directory: self.own_directory_url.clone(),
            timestamp: Some(timestamp(self.clock.now())),
            source: Some(self.source.clone()),
        };

        let request = match HttpRequest::post(target).accept_json().json(&payload) {
            Ok(request) => request.timeout(self.timeout),
            Err(err) => {
                warn!(error = %err, "Could not encode broadcast payload");
                return false;
            }
        };

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            debug!(attempt, max_attempts = self.max_attempts, "Sending broadcast");

            match self.http_client.execute(request.clone()).await {
                Ok(response) if response.is_success() => {
                    info!(attempt, status = response.status, "Broadcast delivered");
                    self.emit(BroadcastEvent::Delivered {
                        target: target.to_string(),
                        attempts: attempt,
                    });
                    return true;
                }
                Ok(response) => {
                    warn!(attempt, status = response.status, "Broadcast rejected");
                    last_error = format!("HTTP {}", response.status);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Broadcast request failed");
                    last_error = err.to_string();
                }
            }

            if attempt < self.max_attempts {
                sleep(self.backoff_unit * attempt).await;
            }
        }

        warn!(attempts = self.max_attempts, error = %last_error, "Giving up on broadcast target");
        self.emit(BroadcastEvent::Failed {
            target: target.to_string(),
            attempts: self.max_attempts,
            message: last_error,
        });
        false
    }

    /// Distinct directory URLs referenced by local listings, in first-seen order
    async fn listed_directories(&self) -> Vec<String> {
        let filter = ObjectFilter::new(&self.register, &self.schema);
        let listings = match self.store.find_all(&filter).await {
            Ok(listings) => listings,
            Err(err) => {
                warn!(error = %err, "Could not load listings for broadcast");
                return Vec::new();
            }
        };

        let mut seen = BTreeSet::new();
        listings
            .iter()
            .filter_map(|listing| listing.str_field(fields::DIRECTORY))
            .filter(|directory| {
                canonical_url(directory).map_or(false, |canonical| seen.insert(canonical))
            })
            .map(|directory| directory.trim().to_string())
            .collect()
    }

    fn emit(&self, event: BroadcastEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(FederationEvent::Broadcast(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::SqliteObjectStore;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::{HttpMethod, HttpResponse};
    use mockall::mock;
    use serde_json::{json, Value};

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
        }
    }

    const BASE: &str = "https://catalogus.example.nl";
    const PEER: &str = "https://peer.example.org/apps/opencatalogi/api/directory";

    async fn notifier(mock: MockHttpClient) -> BroadcastNotifier {
        let store = Arc::new(SqliteObjectStore::in_memory().await.unwrap());
        notifier_with_store(mock, store).await
    }

    async fn notifier_with_store(
        mock: MockHttpClient,
        store: Arc<SqliteObjectStore>,
    ) -> BroadcastNotifier {
        let config = FederationConfig::builder()
            .base_url(BASE)
            .listing_register("7")
            .listing_schema("12")
            .object_store(store)
            .http_client(Arc::new(mock))
            .broadcast_backoff_unit(Duration::from_millis(1))
            .build()
            .unwrap();
        let own = OwnInstance::new(&config.base_url, &config.directory_url).unwrap();
        BroadcastNotifier::new(&config, own)
    }

    #[tokio::test]
    async fn test_notify_posts_presence_payload() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(1)
            .withf(|req| {
                let body: Value = req
                    .body
                    .as_ref()
                    .and_then(|body| serde_json::from_slice(body).ok())
                    .unwrap_or(Value::Null);
                req.method == HttpMethod::Post
                    && req.url == PEER
                    && body["directory"]
                        == "https://catalogus.example.nl/apps/opencatalogi/api/directory"
                    && body["source"] == "OpenCatalogi"
                    && body["timestamp"].is_string()
            })
            .returning(|_| Ok(HttpResponse::new(200, "{}")));

        assert!(notifier(mock_http).await.notify(PEER).await);
    }

    #[tokio::test]
    async fn test_notify_gives_up_after_three_attempts() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(3)
            .returning(|_| Ok(HttpResponse::new(500, "boom")));

        assert!(!notifier(mock_http).await.notify(PEER).await);
    }

    #[tokio::test]
    async fn test_notify_retries_transport_errors_then_succeeds() {
        let mut mock_http = MockHttpClient::new();
        let mut seq = mockall::Sequence::new();
        mock_http
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(BridgeError::Timeout("30s".to_string())));
        mock_http
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(202, "")));

        assert!(notifier(mock_http).await.notify(PEER).await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_self_and_local_targets() {
        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().times(0);
        let notifier = notifier(mock_http).await;

        assert!(notifier
            .broadcast(Some("https://catalogus.example.nl/apps/opencatalogi/api/directory/"))
            .await
            .is_empty());
        assert!(notifier
            .broadcast(Some("http://localhost:8080/apps/opencatalogi/api/directory"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_without_target_uses_listed_directories() {
        let store = Arc::new(SqliteObjectStore::in_memory().await.unwrap());
        let other = "https://other.example.org/apps/opencatalogi/api/directory";
        for (catalog, directory) in [("c1", PEER), ("c2", PEER), ("c3", other)] {
            let listing = json!({"catalogusId": catalog, "directory": directory});
            store
                .save_object(listing.as_object().cloned().unwrap(), "7", "12", None)
                .await
                .unwrap();
        }

        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(2)
            .returning(|_| Ok(HttpResponse::new(200, "{}")));

        let results = notifier_with_store(mock_http, store).await.broadcast(None).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.get(PEER), Some(&true));
        assert_eq!(results.get(other), Some(&true));
    }

    #[tokio::test]
    async fn test_one_failing_target_does_not_abort_batch() {
        let store = Arc::new(SqliteObjectStore::in_memory().await.unwrap());
        let other = "https://other.example.org/apps/opencatalogi/api/directory";
        for (catalog, directory) in [("c1", PEER), ("c2", other)] {
            let listing = json!({"catalogusId": catalog, "directory": directory});
            store
                .save_object(listing.as_object().cloned().unwrap(), "7", "12", None)
                .await
                .unwrap();
        }

        let mut mock_http = MockHttpClient::new();
        mock_http.expect_execute().times(4).returning(|req| {
            if req.url == PEER {
                Err(BridgeError::Transport("connection refused".to_string()))
            } else {
                Ok(HttpResponse::new(200, "{}"))
            }
        });

        let results = notifier_with_store(mock_http, store).await.broadcast(None).await;
        assert_eq!(results.get(PEER), Some(&false));
        assert_eq!(results.get(other), Some(&true));
    }
}
