#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_desktop::SqliteObjectStore;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::{
    FixedClock, HttpClient, HttpMethod, HttpRequest, HttpResponse, ObjectFilter, ObjectStore,
    StoredObject,
};
use chrono::{TimeZone, Utc};
use core_federation::FederationCoordinator;
use core_runtime::config::{FederationConfig, DEFAULT_DIRECTORY_URL};
use core_runtime::events::EventBus;
use serde_json::{json, Map, Value};

pub const BASE_URL: &str = "https://catalogus.example.nl";
pub const OWN_DIRECTORY: &str = "https://catalogus.example.nl/apps/opencatalogi/api/directory";
pub const PEER_DIRECTORY: &str = "https://peer.example.org/apps/opencatalogi/api/directory";
pub const PEER_PUBLICATIONS: &str = "https://peer.example.org/apps/opencatalogi/api/publications";
pub const OTHER_DIRECTORY: &str = "https://other.example.org/apps/opencatalogi/api/directory";
pub const OTHER_PUBLICATIONS: &str = "https://other.example.org/apps/opencatalogi/api/publications";
pub const DEFAULT_DIRECTORY: &str = DEFAULT_DIRECTORY_URL;

pub const LISTING_REGISTER: &str = "7";
pub const LISTING_SCHEMA: &str = "12";
pub const PUBLICATION_REGISTER: &str = "7";
pub const PUBLICATION_SCHEMA: &str = "20";

#[derive(Debug, Clone)]
enum Scripted {
    Respond(u16, String),
    Fail(String),
}

/// HTTP fake answering from per-route scripts and recording every request
///
/// Routes match on method plus URL without its query string. Each route plays
/// its responses in order and keeps repeating the last one. Unscripted routes
/// answer 404.
#[derive(Default)]
pub struct ScriptedHttpClient {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

fn route_key(method: HttpMethod, url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    format!("{:?} {}", method, path.trim_end_matches('/'))
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: HttpMethod, url: &str, scripted: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry(route_key(method, url))
            .or_default()
            .push_back(scripted);
    }

    pub fn on_get(&self, url: &str, status: u16, body: Value) {
        self.push(HttpMethod::Get, url, Scripted::Respond(status, body.to_string()));
    }

    pub fn on_get_raw(&self, url: &str, status: u16, body: &str) {
        self.push(HttpMethod::Get, url, Scripted::Respond(status, body.to_string()));
    }

    pub fn on_get_error(&self, url: &str) {
        self.push(HttpMethod::Get, url, Scripted::Fail("connection refused".to_string()));
    }

    pub fn on_post(&self, url: &str, status: u16) {
        self.push(HttpMethod::Post, url, Scripted::Respond(status, "{}".to_string()));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests sent to `url` (query ignored) with `method`
    pub fn requests_to(&self, method: HttpMethod, url: &str) -> Vec<HttpRequest> {
        let key = route_key(method, url);
        self.requests()
            .into_iter()
            .filter(|request| route_key(request.method, &request.url) == key)
            .collect()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let key = route_key(request.method, &request.url);
        self.requests.lock().unwrap().push(request);

        let scripted = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match scripted {
            Some(Scripted::Respond(status, body)) => Ok(HttpResponse::new(status, body)),
            Some(Scripted::Fail(message)) => Err(BridgeError::Transport(message)),
            None => Ok(HttpResponse::new(404, r#"{"message":"not found"}"#)),
        }
    }
}

pub struct Harness {
    pub coordinator: FederationCoordinator,
    pub store: Arc<SqliteObjectStore>,
    pub http: Arc<ScriptedHttpClient>,
    pub clock: Arc<FixedClock>,
    pub events: EventBus,
}

pub async fn harness() -> Harness {
    harness_with(|builder| builder).await
}

pub async fn harness_with(
    customize: impl FnOnce(core_runtime::config::FederationConfigBuilder) -> core_runtime::config::FederationConfigBuilder,
) -> Harness {
    let store = Arc::new(SqliteObjectStore::in_memory().await.unwrap());
    let http = Arc::new(ScriptedHttpClient::new());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let events = EventBus::new(256);

    let builder = FederationConfig::builder()
        .base_url(BASE_URL)
        .listing_register(LISTING_REGISTER)
        .listing_schema(LISTING_SCHEMA)
        .publication_register(PUBLICATION_REGISTER)
        .publication_schema(PUBLICATION_SCHEMA)
        .object_store(store.clone())
        .http_client(http.clone())
        .clock(clock.clone())
        .event_bus(events.clone())
        .broadcast_backoff_unit(Duration::from_millis(1));

    let config = customize(builder).build().unwrap();
    let coordinator = FederationCoordinator::new(config).unwrap();

    Harness {
        coordinator,
        store,
        http,
        clock,
        events,
    }
}

pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// A listing as a peer directory serves it
pub fn remote_listing(catalog: &str, directory: &str) -> Value {
    json!({
        "id": format!("listing-{catalog}"),
        "catalog": catalog,
        "title": format!("Catalogus {catalog}"),
        "directory": directory,
        "search": directory.replace("/directory", "/search"),
        "schemas": [{"id": 20}],
    })
}

pub fn listing_page(listings: Vec<Value>) -> Value {
    json!({ "results": listings, "total": 0 })
}

/// Store a listing locally as if it had been synced
pub async fn seed_listing(
    store: &SqliteObjectStore,
    catalog: &str,
    directory: &str,
    endpoint: &str,
    available: bool,
    default: bool,
) -> StoredObject {
    let listing = object(json!({
        "catalogusId": catalog,
        "title": format!("Catalogus {catalog}"),
        "directory": directory,
        "publicationsEndpoint": endpoint,
        "organisation": {"name": format!("Organisatie {catalog}")},
        "available": available,
        "default": default,
        "statusCode": 200,
        "lastSync": "2024-06-01T00:00:00Z",
    }));
    store
        .save_object(listing, LISTING_REGISTER, LISTING_SCHEMA, None)
        .await
        .unwrap()
}

pub async fn seed_publication(store: &SqliteObjectStore, id: &str, title: &str) -> StoredObject {
    store
        .save_object(
            object(json!({ "title": title })),
            PUBLICATION_REGISTER,
            PUBLICATION_SCHEMA,
            Some(id),
        )
        .await
        .unwrap()
}

pub async fn listings(store: &SqliteObjectStore) -> Vec<StoredObject> {
    store
        .find_all(&ObjectFilter::new(LISTING_REGISTER, LISTING_SCHEMA))
        .await
        .unwrap()
}

pub fn publication_page(ids: &[&str]) -> Value {
    let results: Vec<Value> = ids
        .iter()
        .map(|id| json!({"id": id, "title": format!("Publicatie {id}")}))
        .collect();
    json!({ "results": results, "total": ids.len() })
}

/// Query pairs of a recorded request URL
pub fn query_pairs(request: &HttpRequest) -> Vec<(String, String)> {
    url::Url::parse(&request.url)
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}
