//! Result Merger
//!
//! Builds one consistent page out of the local result set and the records
//! gathered from peers. Every source is read from page 1 with
//! `page * limit` records, so the merged page boundaries and totals do not
//! depend on how each source paginates.
//!
//! Steps: concatenate (local first), drop later copies of an id, stable sort
//! on the requested keys, slice out the page.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use bridge_traits::{PaginatedObjects, SortDirection, SortKey};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::query::PublicationQuery;
use crate::record::{parse_timestamp_str, record_id, resolve_path};

/// Key under which aggregated records carry their origin
pub const SOURCE_KEY: &str = "_source";

/// The paginated response shape of every federation-aware endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedResultSet {
    pub results: Vec<Value>,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub page: u64,
    pub pages: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facetable: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<BTreeMap<String, String>>,
}

impl AggregatedResultSet {
    /// Wrap a single-source page as-is, adding links for the request
    pub fn from_page(page: PaginatedObjects, query: &PublicationQuery) -> Self {
        let mut set = Self {
            results: page.results,
            total: page.total,
            limit: page.limit,
            offset: page.offset,
            page: page.page,
            pages: page.pages,
            facets: page.facets,
            facetable: page.facetable,
            ..Default::default()
        };
        set.links(query);
        set
    }

    pub fn with_sources(mut self, sources: BTreeMap<String, String>) -> Self {
        self.sources = Some(sources);
        self
    }

    fn links(&mut self, query: &PublicationQuery) {
        let link = |page: u64| match query.page_link(page) {
            Ok(link) => link,
            Err(err) => {
                warn!(error = %err, "Could not build page link");
                None
            }
        };

        self.next = if self.page < self.pages {
            link(self.page + 1)
        } else {
            None
        };
        self.prev = if self.page > 1 {
            link((self.page - 1).min(self.pages.max(1)))
        } else {
            None
        };
    }
}

/// Records and facet data of one side of a merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceResults {
    pub results: Vec<Value>,
    pub facets: Option<Value>,
    pub facetable: Option<Value>,
}

impl From<PaginatedObjects> for SourceResults {
    fn from(page: PaginatedObjects) -> Self {
        Self {
            results: page.results,
            facets: page.facets,
            facetable: page.facetable,
        }
    }
}

pub struct ResultMerger;

impl ResultMerger {
    /// Merge local and remote records into the page `query` asks for
    ///
    /// `sources` maps every contributing source key to its label or URL.
    pub fn merge(
        local: SourceResults,
        remote: SourceResults,
        sources: BTreeMap<String, String>,
        query: &PublicationQuery,
    ) -> AggregatedResultSet {
        let limit = query.limit.max(1);
        let page = query.page.max(1);

        let mut seen = BTreeSet::new();
        let mut merged: Vec<Value> = local
            .results
            .into_iter()
            .chain(remote.results)
            .filter(|record| match record_id(record) {
                Some(id) => seen.insert(id),
                None => true,
            })
            .collect();

        if !query.order.is_empty() {
            sort_records(&mut merged, &query.order);
        }

        let total = merged.len() as u64;
        let offset = (page - 1).saturating_mul(limit);
        let facetable = synthesize_facetable(local.facetable.or(remote.facetable), &merged);

        let results: Vec<Value> = merged
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();

        let mut set = AggregatedResultSet {
            results,
            total,
            limit,
            offset,
            page,
            pages: PaginatedObjects::page_count(total, limit),
            facets: non_empty(local.facets).or_else(|| non_empty(remote.facets)),
            facetable: Some(facetable),
            sources: Some(sources),
            ..Default::default()
        };
        set.links(query);
        set
    }
}

/// Stable multi-key sort; the first key that differs decides
pub fn sort_records(records: &mut [Value], order: &[SortKey]) {
    records.sort_by(|a, b| {
        for key in order {
            let ordering = compare_values(resolve_path(a, &key.path), resolve_path(b, &key.path));
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Compare two optional JSON values
///
/// Missing sorts first. Numbers and numeric strings compare numerically, then
/// values that both parse as timestamps compare chronologically, and anything
/// else compares as text.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(a), Some(b)) => (a, b),
    };

    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }

    if let (Value::String(x), Value::String(y)) = (a, b) {
        if let (Some(x), Some(y)) = (parse_timestamp_str(x), parse_timestamp_str(y)) {
            return x.cmp(&y);
        }
    }

    as_text(a).cmp(&as_text(b))
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn non_empty(facets: Option<Value>) -> Option<Value> {
    facets.filter(|value| match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Null => false,
        _ => true,
    })
}

/// Facetable metadata plus `catalog` and `organisation` term facets describing
/// where the merged records came from
fn synthesize_facetable(base: Option<Value>, records: &[Value]) -> Value {
    let mut facetable = match base {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let mut catalogs = BTreeSet::new();
    let mut organisations = BTreeSet::new();
    for record in records {
        match record.get(SOURCE_KEY) {
            Some(source) => {
                if let Some(catalog) = source.get("catalog").and_then(Value::as_str) {
                    catalogs.insert(catalog.to_string());
                }
                if let Some(organisation) = source.get("organisation").and_then(Value::as_str) {
                    organisations.insert(organisation.to_string());
                }
            }
            None => {
                catalogs.insert("local".to_string());
            }
        }
    }

    facetable.insert(
        "catalog".to_string(),
        json!({
            "type": "terms",
            "description": "Catalog the record was found in",
            "values": catalogs,
        }),
    );
    facetable.insert(
        "organisation".to_string(),
        json!({
            "type": "terms",
            "description": "Organisation publishing the source catalog",
            "values": organisations,
        }),
    );

    Value::Object(facetable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: u64, limit: u64) -> PublicationQuery {
        PublicationQuery {
            page,
            limit,
            ..Default::default()
        }
    }

    fn records(ids: &[&str]) -> Vec<Value> {
        ids.iter().map(|id| json!({"id": id})).collect()
    }

    fn ids(set: &AggregatedResultSet) -> Vec<String> {
        set.results
            .iter()
            .filter_map(|record| record["id"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_first_copy_of_an_id_wins() {
        let local = SourceResults {
            results: vec![json!({"id": "p1", "title": "local copy"})],
            ..Default::default()
        };
        let remote = SourceResults {
            results: vec![
                json!({"id": "p1", "title": "remote copy", "_source": {"catalog": "Peer"}}),
                json!({"id": "p2", "_source": {"catalog": "Peer"}}),
            ],
            ..Default::default()
        };

        let set = ResultMerger::merge(local, remote, BTreeMap::new(), &query(1, 10));
        assert_eq!(set.total, 2);
        assert_eq!(ids(&set), vec!["p1", "p2"]);
        assert_eq!(set.results[0]["title"], "local copy");
    }

    #[test]
    fn test_page_sizes_follow_total() {
        let all: Vec<&str> = vec!["a", "b", "c", "d", "e", "f", "g"];
        for page in 1..=4 {
            let set = ResultMerger::merge(
                SourceResults {
                    results: records(&all[..4]),
                    ..Default::default()
                },
                SourceResults {
                    results: records(&all[4..]),
                    ..Default::default()
                },
                BTreeMap::new(),
                &query(page, 3),
            );
            let expected = 3u64.min(7u64.saturating_sub((page - 1) * 3));
            assert_eq!(set.results.len() as u64, expected, "page {page}");
            assert_eq!(set.pages, 3);
            assert_eq!(set.total, 7);
            assert_eq!(set.offset, (page - 1) * 3);
        }
    }

    #[test]
    fn test_stable_multi_key_sort() {
        let mut input = vec![
            json!({"id": "1", "a": 2, "b": "x"}),
            json!({"id": "2", "a": 1, "b": "y"}),
            json!({"id": "3", "a": 1, "b": "z"}),
            json!({"id": "4", "a": 1, "b": "y"}),
            json!({"id": "5", "a": 2, "b": "x"}),
        ];
        sort_records(
            &mut input,
            &[
                SortKey::new("a", SortDirection::Asc),
                SortKey::new("b", SortDirection::Desc),
            ],
        );

        let order: Vec<&str> = input.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(order, vec!["3", "2", "4", "1", "5"]);
    }

    #[test]
    fn test_compare_values_rules() {
        let cmp = |a: Value, b: Value| compare_values(Some(&a), Some(&b));

        assert_eq!(compare_values(None, Some(&json!("a"))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(0)), None), Ordering::Greater);
        assert_eq!(cmp(json!("10"), json!(9)), Ordering::Greater);
        assert_eq!(cmp(json!("9"), json!("10")), Ordering::Less);
        assert_eq!(
            cmp(json!("2024-02-01T00:00:00+01:00"), json!("2024-01-31T23:30:00Z")),
            Ordering::Less
        );
        assert_eq!(cmp(json!("apple"), json!("banana")), Ordering::Less);
        assert_eq!(cmp(json!("NaN"), json!("NaN")), Ordering::Equal);
    }

    #[test]
    fn test_sort_by_self_namespace_with_missing_values_first() {
        let mut input = vec![
            json!({"id": "late", "@self": {"published": "2024-05-01T00:00:00Z"}}),
            json!({"id": "never"}),
            json!({"id": "early", "@self": {"published": "2023-01-01T00:00:00Z"}}),
        ];
        sort_records(&mut input, &[SortKey::new("@self.published", SortDirection::Asc)]);

        let order: Vec<&str> = input.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(order, vec!["never", "early", "late"]);
    }

    #[test]
    fn test_facets_prefer_local_and_facetable_lists_sources() {
        let local = SourceResults {
            results: records(&["a"]),
            facets: Some(json!({"theme": [{"_id": "milieu", "count": 1}]})),
            facetable: Some(json!({"theme": {"type": "terms"}})),
        };
        let remote = SourceResults {
            results: vec![json!({
                "id": "b",
                "_source": {"catalog": "Peer catalog", "organisation": "Gemeente Peer"}
            })],
            facets: Some(json!({"theme": [{"_id": "verkeer", "count": 4}]})),
            facetable: None,
        };

        let set = ResultMerger::merge(local, remote, BTreeMap::new(), &query(1, 10));
        assert_eq!(set.facets.unwrap()["theme"][0]["_id"], "milieu");

        let facetable = set.facetable.unwrap();
        assert_eq!(facetable["theme"]["type"], "terms");
        assert_eq!(facetable["catalog"]["values"], json!(["Peer catalog", "local"]));
        assert_eq!(facetable["organisation"]["values"], json!(["Gemeente Peer"]));
    }

    #[test]
    fn test_remote_facets_used_when_local_has_none() {
        let remote = SourceResults {
            facets: Some(json!({"theme": []})),
            ..Default::default()
        };
        let local = SourceResults {
            facets: Some(json!({})),
            ..Default::default()
        };

        let set = ResultMerger::merge(local, remote, BTreeMap::new(), &query(1, 10));
        assert_eq!(set.facets, Some(json!({"theme": []})));
    }

    #[test]
    fn test_links_rewrite_page() {
        let query = PublicationQuery {
            page: 2,
            limit: 2,
            ..Default::default()
        }
        .with_request_url("https://catalogus.example.nl/api/publications?_page=2&_limit=2");

        let set = ResultMerger::merge(
            SourceResults {
                results: records(&["a", "b", "c", "d", "e"]),
                ..Default::default()
            },
            SourceResults::default(),
            BTreeMap::new(),
            &query,
        );

        assert_eq!(
            set.next.as_deref(),
            Some("https://catalogus.example.nl/api/publications?_limit=2&_page=3")
        );
        assert_eq!(
            set.prev.as_deref(),
            Some("https://catalogus.example.nl/api/publications?_limit=2&_page=1")
        );
    }
}
