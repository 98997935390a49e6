//! Publication query parsing
//!
//! Turns request query pairs into a typed [`PublicationQuery`]. Reserved keys
//! start with an underscore:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `_aggregate` | `false` disables every remote call (default `true`) |
//! | `_page`, `_limit` | 1-based page and page size (defaults 1 and 20) |
//! | `_search` | free-text search |
//! | `_order[<path>]` | `ASC`/`DESC` per dot path, in request order |
//! | `_facets[]`, `_facets` | fields to facet on (repeated or comma separated) |
//! | `_default` | restrict remote endpoints to the default directory |
//!
//! Unknown underscore keys are ignored; every other key is a field-equality
//! filter.

use std::collections::BTreeMap;

use bridge_traits::{SearchQuery, SortDirection, SortKey};
use serde_json::Value;

use crate::error::Result;
use crate::fetcher::{with_query_param, LIMIT_PARAM};

pub const AGGREGATE_PARAM: &str = "_aggregate";
pub const PAGE_PARAM: &str = "_page";
pub const SEARCH_PARAM: &str = "_search";
pub const ORDER_PARAM: &str = "_order";
pub const FACETS_PARAM: &str = "_facets";
pub const DEFAULT_PARAM: &str = "_default";

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 1_000;
pub const MAX_PAGE: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct PublicationQuery {
    pub aggregate: bool,
    pub page: u64,
    pub limit: u64,
    pub search: Option<String>,
    pub order: Vec<SortKey>,
    pub facets: Vec<String>,
    /// `Some` when the request overrides the configured default-only setting
    pub default_only: Option<bool>,
    pub filters: BTreeMap<String, Value>,
    /// Original request URL, used to build `next`/`prev` links
    pub request_url: Option<String>,
}

impl Default for PublicationQuery {
    fn default() -> Self {
        Self {
            aggregate: true,
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            search: None,
            order: Vec::new(),
            facets: Vec::new(),
            default_only: None,
            filters: BTreeMap::new(),
            request_url: None,
        }
    }
}

impl PublicationQuery {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = Self::default();

        for (key, value) in pairs {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();

            match key {
                AGGREGATE_PARAM => query.aggregate = parse_flag(value).unwrap_or(true),
                PAGE_PARAM => query.page = value.parse::<u64>().unwrap_or(1).clamp(1, MAX_PAGE),
                LIMIT_PARAM => {
                    query.limit = value
                        .parse::<u64>()
                        .unwrap_or(DEFAULT_PAGE_SIZE)
                        .clamp(1, MAX_PAGE_SIZE)
                }
                SEARCH_PARAM => {
                    query.search = (!value.is_empty()).then(|| value.to_string());
                }
                DEFAULT_PARAM => query.default_only = parse_flag(value),
                FACETS_PARAM | "_facets[]" => query.facets.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|field| !field.is_empty())
                        .map(str::to_string),
                ),
                _ => {
                    if let Some(path) = order_path(key) {
                        query.order.push(SortKey::new(path, SortDirection::parse(value)));
                    } else if !key.starts_with('_') && !key.is_empty() {
                        query.filters.insert(key.to_string(), filter_value(value));
                    }
                }
            }
        }

        query
    }

    pub fn with_request_url(mut self, url: impl Into<String>) -> Self {
        self.request_url = Some(url.into());
        self
    }

    /// Records each source must return for the requested page to be exact
    pub fn items_needed(&self) -> u64 {
        self.page.max(1).saturating_mul(self.limit.max(1))
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) - 1).saturating_mul(self.limit.max(1))
    }

    /// Query for the local store, asking for `page`/`limit` explicitly
    pub fn to_search_query(
        &self,
        register: Option<&str>,
        schema: Option<&str>,
        page: u64,
        limit: u64,
    ) -> SearchQuery {
        SearchQuery {
            register: register.map(str::to_string),
            schema: schema.map(str::to_string),
            filters: self.filters.clone(),
            search: self.search.clone(),
            order: self.order.clone(),
            facets: self.facets.clone(),
            page,
            limit,
        }
    }

    /// Parameters for a peer's publications endpoint: page 1, over-fetched,
    /// with aggregation switched off on the peer side
    pub fn remote_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(key, value)| (key.clone(), param_value(value)))
            .collect();

        if let Some(search) = &self.search {
            params.push((SEARCH_PARAM.to_string(), search.clone()));
        }
        for key in &self.order {
            let direction = match key.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            params.push((format!("{}[{}]", ORDER_PARAM, key.path), direction.to_string()));
        }
        if !self.facets.is_empty() {
            params.push((FACETS_PARAM.to_string(), self.facets.join(",")));
        }

        params.push((PAGE_PARAM.to_string(), "1".to_string()));
        params.push((LIMIT_PARAM.to_string(), self.items_needed().to_string()));
        params.push((AGGREGATE_PARAM.to_string(), "false".to_string()));
        params
    }

    /// The request URL with `_page` rewritten, if a request URL is attached
    pub fn page_link(&self, page: u64) -> Result<Option<String>> {
        match &self.request_url {
            Some(url) => Ok(Some(with_query_param(url, PAGE_PARAM, &page.to_string())?.into())),
            None => Ok(None),
        }
    }
}

fn order_path(key: &str) -> Option<&str> {
    key.strip_prefix(ORDER_PARAM)?
        .strip_prefix('[')?
        .strip_suffix(']')
        .map(str::trim)
        .filter(|path| !path.is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn filter_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let query = PublicationQuery::from_pairs(Vec::<(String, String)>::new());
        assert!(query.aggregate);
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, 20);
        assert!(query.filters.is_empty());
    }

    #[test]
    fn test_reserved_keys_and_filters() {
        let query = PublicationQuery::from_pairs([
            ("_aggregate", "false"),
            ("_page", "3"),
            ("_limit", "15"),
            ("_search", " water "),
            ("_order[@self.published]", "desc"),
            ("_order[title]", "ASC"),
            ("_facets[]", "theme"),
            ("_facets", "organisation, catalog"),
            ("_extend", "files"),
            ("theme", "milieu"),
            ("archived", "false"),
        ]);

        assert!(!query.aggregate);
        assert_eq!(query.page, 3);
        assert_eq!(query.limit, 15);
        assert_eq!(query.search.as_deref(), Some("water"));
        assert_eq!(
            query.order,
            vec![
                SortKey::new("@self.published", SortDirection::Desc),
                SortKey::new("title", SortDirection::Asc),
            ]
        );
        assert_eq!(query.facets, vec!["theme", "organisation", "catalog"]);
        assert_eq!(query.filters.get("theme"), Some(&json!("milieu")));
        assert_eq!(query.filters.get("archived"), Some(&json!(false)));
        assert!(!query.filters.contains_key("_extend"));
        assert_eq!(query.items_needed(), 45);
        assert_eq!(query.offset(), 30);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let query = PublicationQuery::from_pairs([("_page", "0"), ("_limit", "lots")]);
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, 20);
    }

    #[test]
    fn test_huge_page_and_limit_are_clamped() {
        let query = PublicationQuery::from_pairs([
            ("_page", "18446744073709551615"),
            ("_limit", "18446744073709551615"),
        ]);
        assert_eq!(query.page, MAX_PAGE);
        assert_eq!(query.limit, MAX_PAGE_SIZE);
        assert_eq!(query.items_needed(), MAX_PAGE * MAX_PAGE_SIZE);
    }

    #[test]
    fn test_remote_params_overfetch_and_disable_aggregation() {
        let query = PublicationQuery::from_pairs([
            ("_page", "2"),
            ("_limit", "10"),
            ("theme", "milieu"),
            ("_order[title]", "desc"),
        ]);

        let params = query.remote_params();
        assert!(params.contains(&("theme".to_string(), "milieu".to_string())));
        assert!(params.contains(&("_order[title]".to_string(), "DESC".to_string())));
        assert!(params.contains(&("_page".to_string(), "1".to_string())));
        assert!(params.contains(&("_limit".to_string(), "20".to_string())));
        assert!(params.contains(&("_aggregate".to_string(), "false".to_string())));
    }

    #[test]
    fn test_page_link_rewrites_page() {
        let query = PublicationQuery::from_pairs([("_page", "2")])
            .with_request_url("https://catalogus.example.nl/api/publications?theme=a&_page=2");

        assert_eq!(
            query.page_link(3).unwrap().as_deref(),
            Some("https://catalogus.example.nl/api/publications?theme=a&_page=3")
        );
        assert_eq!(PublicationQuery::default().page_link(2).unwrap(), None);
    }
}
