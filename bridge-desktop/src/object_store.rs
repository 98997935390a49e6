//! Object Storage using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    object_store::{
        ObjectFilter, ObjectStore, PaginatedObjects, SearchQuery, SortDirection, StoredObject,
    },
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS objects (
        uuid TEXT PRIMARY KEY,
        register TEXT NOT NULL,
        schema TEXT NOT NULL,
        object TEXT NOT NULL,
        created TEXT NOT NULL,
        updated TEXT NOT NULL
    )
"#;

const INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_objects_register_schema ON objects (register, schema)";

/// SQLite-backed object store implementation
///
/// Every object lives in one row of the `objects` table with its JSON body in
/// the `object` column:
/// - Field filters and ordering use `json_extract`
/// - `@self.created` / `@self.updated` / `@self.id` map to the row columns
/// - Storage order is insertion order (`rowid`), stable across upserts
pub struct SqliteObjectStore {
    pool: SqlitePool,
}

impl SqliteObjectStore {
    /// Create a new object store with the given database path
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        // Convert path to string, replacing backslashes with forward slashes for SQLite URL
        let path_str = db_path.to_string_lossy().replace('\\', "/");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(db_error("Invalid database path"))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(db_error("Failed to connect to DB"))?;

        Self::init_schema(&pool).await?;
        debug!(path = ?db_path, "Initialized object store");

        Ok(Self { pool })
    }

    /// Create an in-memory object store (for testing)
    ///
    /// Every pooled connection to `sqlite::memory:` opens its own database, so
    /// the pool is pinned to a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_error("Failed to connect to DB"))?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(SCHEMA_SQL)
            .execute(pool)
            .await
            .map_err(db_error("Failed to create table"))?;
        sqlx::query(INDEX_SQL)
            .execute(pool)
            .await
            .map_err(db_error("Failed to create index"))?;
        Ok(())
    }

    fn timestamp(value: DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| BridgeError::DatabaseError(format!("Corrupt timestamp {}: {}", raw, e)))
    }

    fn row_to_object(row: &SqliteRow) -> Result<StoredObject> {
        let body: String = row.try_get("object").map_err(db_error("Failed to read row"))?;
        let object = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                return Err(BridgeError::DatabaseError(format!(
                    "Corrupt object body: {}",
                    e
                )))
            }
        };
        let created: String = row.try_get("created").map_err(db_error("Failed to read row"))?;
        let updated: String = row.try_get("updated").map_err(db_error("Failed to read row"))?;

        Ok(StoredObject {
            uuid: row.try_get("uuid").map_err(db_error("Failed to read row"))?,
            register: row.try_get("register").map_err(db_error("Failed to read row"))?,
            schema: row.try_get("schema").map_err(db_error("Failed to read row"))?,
            object,
            created: Self::parse_timestamp(&created)?,
            updated: Self::parse_timestamp(&updated)?,
        })
    }

    /// Expression addressing a dot path inside a row
    fn path_expression(builder: &mut QueryBuilder<'_, Sqlite>, path: &str) {
        match path {
            "@self.created" => {
                builder.push("created");
            }
            "@self.updated" => {
                builder.push("updated");
            }
            "@self.id" | "id" => {
                builder.push("uuid");
            }
            _ => {
                builder.push("json_extract(object, ");
                builder.push_bind(json_path(path));
                builder.push(")");
            }
        }
    }

    fn push_conditions(
        builder: &mut QueryBuilder<'_, Sqlite>,
        register: Option<&str>,
        schema: Option<&str>,
        filters: &BTreeMap<String, Value>,
        search: Option<&str>,
    ) {
        builder.push(" WHERE 1 = 1");
        if let Some(register) = register {
            builder.push(" AND register = ");
            builder.push_bind(register.to_string());
        }
        if let Some(schema) = schema {
            builder.push(" AND schema = ");
            builder.push_bind(schema.to_string());
        }

        for (key, value) in filters {
            builder.push(" AND ");
            Self::path_expression(builder, key);
            match value {
                Value::Null => {
                    builder.push(" IS NULL");
                }
                Value::Bool(flag) => {
                    builder.push(" = ");
                    builder.push_bind(i64::from(*flag));
                }
                Value::Number(number) => {
                    builder.push(" = ");
                    match number.as_i64() {
                        Some(int) => builder.push_bind(int),
                        None => builder.push_bind(number.as_f64().unwrap_or_default()),
                    };
                }
                Value::String(text) => {
                    builder.push(" = ");
                    builder.push_bind(text.clone());
                }
                nested => {
                    builder.push(" = json(");
                    builder.push_bind(nested.to_string());
                    builder.push(")");
                }
            }
        }

        if let Some(term) = search.map(str::trim).filter(|term| !term.is_empty()) {
            builder.push(" AND lower(object) LIKE ");
            builder.push_bind(format!("%{}%", term.to_lowercase()));
        }
    }

    async fn facet_counts(&self, query: &SearchQuery, field: &str) -> Result<Value> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT CAST(");
        Self::path_expression(&mut builder, field);
        builder.push(" AS TEXT) AS value, COUNT(*) AS hits FROM objects");
        Self::push_conditions(
            &mut builder,
            query.register.as_deref(),
            query.schema.as_deref(),
            &query.filters,
            query.search.as_deref(),
        );
        builder.push(" GROUP BY value ORDER BY hits DESC, value ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to compute facet"))?;

        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Option<String> = row.try_get("value").map_err(db_error("Failed to read facet"))?;
            let count: i64 = row.try_get("hits").map_err(db_error("Failed to read facet"))?;
            if let Some(value) = value {
                buckets.push(json!({ "_id": value, "count": count }));
            }
        }

        Ok(Value::Array(buckets))
    }
}

/// JSON path for a dot path (`organisation.name` -> `$."organisation"."name"`)
fn json_path(path: &str) -> String {
    let mut out = String::from("$");
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        out.push_str(".\"");
        out.push_str(&segment.replace('"', ""));
        out.push('"');
    }
    out
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> BridgeError {
    move |e| BridgeError::DatabaseError(format!("{}: {}", context, e))
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn find_all(&self, filter: &ObjectFilter) -> Result<Vec<StoredObject>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM objects");
        Self::push_conditions(
            &mut builder,
            filter.register.as_deref(),
            filter.schema.as_deref(),
            &filter.fields,
            None,
        );
        builder.push(" ORDER BY rowid ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to query objects"))?;

        let objects = rows
            .iter()
            .map(Self::row_to_object)
            .collect::<Result<Vec<_>>>()?;

        debug!(count = objects.len(), "Loaded objects");
        Ok(objects)
    }

    async fn find(&self, id: &str) -> Result<Option<StoredObject>> {
        let row = sqlx::query("SELECT * FROM objects WHERE uuid = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get object"))?;

        row.as_ref().map(Self::row_to_object).transpose()
    }

    async fn save_object(
        &self,
        object: Map<String, Value>,
        register: &str,
        schema: &str,
        uuid: Option<&str>,
    ) -> Result<StoredObject> {
        let uuid = uuid
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Self::timestamp(Utc::now());
        let body = serde_json::to_string(&object)
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to encode object: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO objects (uuid, register, schema, object, created, updated)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(uuid) DO UPDATE SET
                register = excluded.register,
                schema = excluded.schema,
                object = excluded.object,
                updated = excluded.updated
            "#,
        )
        .bind(&uuid)
        .bind(register)
        .bind(schema)
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to save object"))?;

        debug!(uuid = %uuid, register, schema, "Stored object");

        self.find(&uuid).await?.ok_or_else(|| {
            BridgeError::DatabaseError(format!("Object {} vanished after save", uuid))
        })
    }

    async fn search_objects_paginated(&self, query: &SearchQuery) -> Result<PaginatedObjects> {
        let limit = query.limit.max(1);
        let page = query.page.max(1);
        let offset = (page - 1).saturating_mul(limit);

        let mut count_builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM objects");
        Self::push_conditions(
            &mut count_builder,
            query.register.as_deref(),
            query.schema.as_deref(),
            &query.filters,
            query.search.as_deref(),
        );
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to count objects"))?
            .try_get("total")
            .map_err(db_error("Failed to count objects"))?;
        let total = u64::try_from(total).unwrap_or_default();

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM objects");
        Self::push_conditions(
            &mut builder,
            query.register.as_deref(),
            query.schema.as_deref(),
            &query.filters,
            query.search.as_deref(),
        );
        builder.push(" ORDER BY ");
        for key in &query.order {
            Self::path_expression(&mut builder, &key.path);
            builder.push(match key.direction {
                SortDirection::Asc => " ASC, ",
                SortDirection::Desc => " DESC, ",
            });
        }
        builder.push("rowid ASC LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        builder.push(" OFFSET ");
        builder.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to search objects"))?;

        let results = rows
            .iter()
            .map(|row| Self::row_to_object(row).map(|object| object.to_record()))
            .collect::<Result<Vec<_>>>()?;

        let (facets, facetable) = if query.facets.is_empty() {
            (None, None)
        } else {
            let mut facets = Map::new();
            let mut facetable = Map::new();
            for field in &query.facets {
                facets.insert(field.clone(), self.facet_counts(query, field).await?);
                facetable.insert(field.clone(), json!({ "type": "terms" }));
            }
            (Some(Value::Object(facets)), Some(Value::Object(facetable)))
        };

        Ok(PaginatedObjects {
            results,
            total,
            page,
            pages: PaginatedObjects::page_count(total, limit),
            limit,
            offset,
            facets,
            facetable,
        })
    }
}
