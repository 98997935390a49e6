//! Object Store Abstraction
//!
//! The host keeps catalog data (listings, publications) in a schemaless object
//! store partitioned by `register` and `schema` identifiers. The federation
//! engine only needs four operations from it, expressed by [`ObjectStore`].
//!
//! Objects are free-form JSON maps. When rendered as API records they carry an
//! `id` and an `@self` envelope with the storage metadata:
//!
//! ```text
//! {
//!   "id": "0b5c…",
//!   "title": "Gemeente Voorbeeld",
//!   "@self": { "id": "0b5c…", "register": "7", "schema": "12",
//!              "created": "2024-05-01T12:00:00+00:00", "updated": "…" }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::Result;

/// Key of the metadata envelope attached to rendered records
pub const SELF_KEY: &str = "@self";

/// An object as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub uuid: String,
    pub register: String,
    pub schema: String,
    pub object: Map<String, Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl StoredObject {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.object.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.object.get(key).and_then(Value::as_str)
    }

    /// Render as an API record: the object fields plus `id` and `@self`
    pub fn to_record(&self) -> Value {
        let mut record = self.object.clone();
        record.insert("id".to_string(), Value::String(self.uuid.clone()));

        let mut envelope = Map::new();
        envelope.insert("id".to_string(), Value::String(self.uuid.clone()));
        envelope.insert("register".to_string(), Value::String(self.register.clone()));
        envelope.insert("schema".to_string(), Value::String(self.schema.clone()));
        envelope.insert("created".to_string(), Value::String(self.created.to_rfc3339()));
        envelope.insert("updated".to_string(), Value::String(self.updated.to_rfc3339()));
        record.insert(SELF_KEY.to_string(), Value::Object(envelope));

        Value::Object(record)
    }
}

/// Equality filter for [`ObjectStore::find_all`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectFilter {
    pub register: Option<String>,
    pub schema: Option<String>,
    /// Top-level field equality constraints
    pub fields: BTreeMap<String, Value>,
}

impl ObjectFilter {
    pub fn new(register: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            register: Some(register.into()),
            schema: Some(schema.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Whether an object satisfies every constraint of this filter
    pub fn matches(&self, object: &StoredObject) -> bool {
        if let Some(register) = &self.register {
            if &object.register != register {
                return false;
            }
        }
        if let Some(schema) = &self.schema {
            if &object.schema != schema {
                return false;
            }
        }
        self.fields
            .iter()
            .all(|(key, expected)| object.object.get(key) == Some(expected))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Parse `asc`/`desc` case-insensitively; anything else is ascending
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

/// One key of a multi-key ordering, addressed by dot path (`@self.created`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub path: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn new(path: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            path: path.into(),
            direction,
        }
    }
}

/// Query for [`ObjectStore::search_objects_paginated`]
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub register: Option<String>,
    pub schema: Option<String>,
    pub filters: BTreeMap<String, Value>,
    /// Case-insensitive substring search over the serialized object
    pub search: Option<String>,
    pub order: Vec<SortKey>,
    /// Fields to compute term facets for
    pub facets: Vec<String>,
    /// 1-based page number
    pub page: u64,
    pub limit: u64,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            register: None,
            schema: None,
            filters: BTreeMap::new(),
            search: None,
            order: Vec::new(),
            facets: Vec::new(),
            page: 1,
            limit: 20,
        }
    }
}

impl SearchQuery {
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1) * self.limit
    }
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginatedObjects {
    pub results: Vec<Value>,
    pub total: u64,
    pub page: u64,
    pub pages: u64,
    pub limit: u64,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facets: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facetable: Option<Value>,
}

impl PaginatedObjects {
    /// `ceil(total / limit)`, never below 1
    pub fn page_count(total: u64, limit: u64) -> u64 {
        if limit == 0 {
            return 1;
        }
        total.div_ceil(limit).max(1)
    }
}

/// Host object store
///
/// Implementations must support per-record upsert without external locking;
/// concurrent saves of different uuids must be safe.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects matching the filter, in storage order
    async fn find_all(&self, filter: &ObjectFilter) -> Result<Vec<StoredObject>>;

    /// Look up one object by uuid
    async fn find(&self, id: &str) -> Result<Option<StoredObject>>;

    /// Insert, or replace the object stored under `uuid` when given and present.
    /// A missing `uuid` makes the store assign one.
    async fn save_object(
        &self,
        object: Map<String, Value>,
        register: &str,
        schema: &str,
        uuid: Option<&str>,
    ) -> Result<StoredObject>;

    async fn search_objects_paginated(&self, query: &SearchQuery) -> Result<PaginatedObjects>;
}
