//! Remote Listing Fetcher
//!
//! Reads a peer directory's listing set in a single GET. The fetcher never
//! retries; callers decide what a failure means.

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{HttpClient, HttpRequest};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{FederationError, Result};

/// Query parameter carrying the page size on peer endpoints
pub const LIMIT_PARAM: &str = "_limit";

/// Listings returned by one peer directory
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedListings {
    pub status: u16,
    pub results: Vec<Map<String, Value>>,
}

pub struct RemoteListingFetcher {
    http_client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl RemoteListingFetcher {
    pub fn new(http_client: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            http_client,
            timeout,
        }
    }

    /// Fetch every listing a directory exposes, asking for up to `limit` records
    ///
    /// # Errors
    ///
    /// - `Fetch` for transport failures and non-2xx statuses
    /// - `Parse` when the body is not JSON or has no `results` array
    #[instrument(skip(self), fields(directory = %directory_url))]
    pub async fn fetch(&self, directory_url: &str, limit: u64) -> Result<FetchedListings> {
        let url = with_query_param(directory_url, LIMIT_PARAM, &limit.to_string())?;
        let request = HttpRequest::get(url.as_str())
            .accept_json()
            .timeout(self.timeout);

        let response = self.http_client.execute(request).await.map_err(|e| {
            warn!(error = %e, "Directory request failed before a response");
            FederationError::Fetch {
                url: directory_url.to_string(),
                status: None,
                message: e.to_string(),
            }
        })?;

        if !response.is_success() {
            warn!(status = response.status, "Directory answered with an error status");
            return Err(FederationError::Fetch {
                url: directory_url.to_string(),
                status: Some(response.status),
                message: format!("HTTP {}", response.status),
            });
        }

        let body: Value = response.json().map_err(|e| FederationError::Parse {
            url: directory_url.to_string(),
            message: e.to_string(),
        })?;

        let results = extract_results(body).ok_or_else(|| FederationError::Parse {
            url: directory_url.to_string(),
            message: "response has no results array".to_string(),
        })?;

        debug!(count = results.len(), "Fetched directory listings");

        Ok(FetchedListings {
            status: response.status,
            results,
        })
    }
}

/// `results` of a paginated payload, or a bare array; non-object entries are dropped
pub(crate) fn extract_results(body: Value) -> Option<Vec<Map<String, Value>>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    Some(
        items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
    )
}

/// Set (replacing any existing value) one query parameter on a URL
pub(crate) fn with_query_param(raw: &str, key: &str, value: &str) -> Result<Url> {
    with_query_params(raw, &[(key.to_string(), value.to_string())])
}

/// Set several query parameters, replacing existing ones with the same keys
pub(crate) fn with_query_params(raw: &str, params: &[(String, String)]) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|e| FederationError::InvalidDirectoryUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(existing, _)| !params.iter().any(|(key, _)| key == existing))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in kept.iter().chain(params.iter()) {
            pairs.append_pair(key, value);
        }
    }

    Ok(url)
}
