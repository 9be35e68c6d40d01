//! Schema-per-namespace Postgres backend.
//!
//! All namespaces share one connection pool; isolation comes from giving
//! each namespace its own schema (`ns_<id>`). Writes are serialized by an
//! exclusive transaction-level advisory lock keyed by a hash of the
//! schema-qualified category, so writes to streams of one category are
//! queued and processed in sequence while other categories and other
//! tenants proceed. The consumer-group and correlation predicates of
//! category reads are pushed into the query using SQL equivalents of the
//! native `hash_64`/`cardinal_id` functions, installed by the registry
//! migration.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    effective_batch_size, effective_list_limit, escape_like, is_unique_violation, migrate,
    validate_namespace_id, GetCategoryMessagesOpts, GetStreamMessagesOpts, ListStreamsOpts,
    NamespaceRecord, NamespaceStats, Storage, WriteMessageOpts, WrittenPosition,
};
use crate::message::{CategoryInfo, Message, StreamInfo};
use crate::{hash, stream_name, Error, Result};

/// Schema holding the registry table and the shared SQL helper functions.
const REGISTRY_SCHEMA: &str = "eventodb";

const MESSAGE_COLUMNS: &str =
    r#"id, stream_name, "type", position, global_position, data, metadata, time"#;

/// Postgres storage engine backed by a single shared database.
pub struct PgStore {
    pool: PgPool,
    schemas: RwLock<HashMap<String, Arc<str>>>,
}

impl PgStore {
    /// Connects to the database and bootstraps the registry schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        migrate::run_postgres(&pool, REGISTRY_SCHEMA, migrate::POSTGRES_REGISTRY).await?;
        debug!("connected postgres registry");

        Ok(PgStore {
            pool,
            schemas: RwLock::new(HashMap::new()),
        })
    }

    fn schema_name(id: &str) -> String {
        format!("ns_{id}")
    }

    /// Resolves the schema for a namespace, caching the lookup.
    async fn schema(&self, namespace: &str) -> Result<Arc<str>> {
        {
            let schemas = self.schemas.read().await;
            if let Some(schema) = schemas.get(namespace) {
                return Ok(schema.clone());
            }
        }

        let record = self.get_namespace(namespace).await?;

        let mut schemas = self.schemas.write().await;
        if let Some(schema) = schemas.get(namespace) {
            return Ok(schema.clone());
        }
        let schema: Arc<str> = record.locator.into();
        schemas.insert(namespace.to_string(), schema.clone());
        Ok(schema)
    }

    /// Lock key for the per-category write lock. Namespaced by schema so
    /// tenants never contend with each other.
    fn lock_key(schema: &str, category: &str) -> i64 {
        hash::hash_64(&format!("{schema}.{category}"))
    }
}

fn row_to_message(row: &PgRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        stream_name: row.try_get("stream_name")?,
        msg_type: row.try_get("type")?,
        position: row.try_get("position")?,
        global_position: row.try_get("global_position")?,
        data: row.try_get("data")?,
        metadata: row.try_get("metadata")?,
        time: row.try_get("time")?,
    })
}

fn row_to_namespace(row: &PgRow) -> Result<NamespaceRecord> {
    Ok(NamespaceRecord {
        id: row.try_get("id")?,
        token_hash: row.try_get("token_hash")?,
        locator: row.try_get("locator")?,
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait::async_trait]
impl Storage for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn open_handles(&self) -> usize {
        self.schemas.read().await.len()
    }

    async fn create_namespace(
        &self,
        id: &str,
        token_hash: &str,
        description: &str,
        metadata: Option<Value>,
    ) -> Result<NamespaceRecord> {
        validate_namespace_id(id)?;

        let schema = Self::schema_name(id);
        let created_at = Utc::now();

        let inserted = sqlx::query(&format!(
            "INSERT INTO {REGISTRY_SCHEMA}.namespaces
                 (id, token_hash, locator, description, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(id)
        .bind(token_hash)
        .bind(&schema)
        .bind(description)
        .bind(metadata.clone())
        .bind(created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(Error::NamespaceExists(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        // The row reserves the id; now create the backing schema. If that
        // fails, release the reservation so creation can be retried.
        if let Err(err) =
            migrate::run_postgres(&self.pool, &schema, migrate::POSTGRES_NAMESPACE).await
        {
            let _ = sqlx::query(&format!(
                "DELETE FROM {REGISTRY_SCHEMA}.namespaces WHERE id = $1"
            ))
            .bind(id)
            .execute(&self.pool)
            .await;
            return Err(err);
        }

        self.schemas
            .write()
            .await
            .insert(id.to_string(), schema.clone().into());
        debug!(namespace = id, %schema, "created namespace");

        Ok(NamespaceRecord {
            id: id.to_string(),
            token_hash: token_hash.to_string(),
            locator: schema,
            description: description.to_string(),
            metadata,
            created_at,
        })
    }

    async fn delete_namespace(&self, id: &str) -> Result<u64> {
        let record = self.get_namespace(id).await?;
        let deleted = self.message_count(id).await.unwrap_or(0);

        self.schemas.write().await.remove(id);

        sqlx::query(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            record.locator
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM {REGISTRY_SCHEMA}.namespaces WHERE id = $1"
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        debug!(namespace = id, deleted, "deleted namespace");

        Ok(deleted as u64)
    }

    async fn get_namespace(&self, id: &str) -> Result<NamespaceRecord> {
        let row = sqlx::query(&format!(
            "SELECT id, token_hash, locator, description, metadata, created_at
             FROM {REGISTRY_SCHEMA}.namespaces WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_namespace(&row),
            None => Err(Error::NamespaceNotFound(id.to_string())),
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT id, token_hash, locator, description, metadata, created_at
             FROM {REGISTRY_SCHEMA}.namespaces ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_namespace).collect()
    }

    async fn message_count(&self, namespace: &str) -> Result<i64> {
        let schema = self.schema(namespace).await?;
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT count(*) FROM {schema}.messages"))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn namespace_stats(&self, namespace: &str) -> Result<NamespaceStats> {
        let schema = self.schema(namespace).await?;
        let row = sqlx::query(&format!(
            "SELECT count(*) AS messages,
                    count(DISTINCT stream_name) AS streams,
                    max(time) AS last_activity
             FROM {schema}.messages"
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(NamespaceStats {
            message_count: row.try_get("messages")?,
            stream_count: row.try_get("streams")?,
            last_activity: row.try_get("last_activity")?,
        })
    }

    async fn write_message(
        &self,
        namespace: &str,
        stream_name: &str,
        msg_type: &str,
        data: Option<&Value>,
        opts: &WriteMessageOpts,
    ) -> Result<WrittenPosition> {
        stream_name::validate(stream_name)?;
        if msg_type.is_empty() {
            return Err(Error::invalid_request("message type is empty"));
        }

        let schema = self.schema(namespace).await?;
        let category = stream_name::category(stream_name);

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(Self::lock_key(&schema, category))
            .execute(&mut tx)
            .await?;

        let current: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT max(position) FROM {schema}.messages WHERE stream_name = $1"
        ))
        .bind(stream_name)
        .fetch_one(&mut tx)
        .await?;
        let current_version = current.unwrap_or(-1);

        if let Some(expected) = opts.expected_version {
            if expected != current_version {
                return Err(Error::VersionConflict {
                    stream: stream_name.to_string(),
                    expected,
                    actual: current_version,
                });
            }
        }

        let position = current_version + 1;
        let id = opts.id.unwrap_or_else(Uuid::now_v7);
        let time = Utc::now();

        let global_position: i64 = sqlx::query_scalar(&format!(
            r#"INSERT INTO {schema}.messages (id, stream_name, category, "type", position, data, metadata, time)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING global_position"#
        ))
        .bind(id)
        .bind(stream_name)
        .bind(category)
        .bind(msg_type)
        .bind(position)
        .bind(data.cloned())
        .bind(opts.metadata.clone())
        .bind(time)
        .fetch_one(&mut tx)
        .await?;

        tx.commit().await?;
        trace!(%id, stream_name, msg_type, position, global_position, "wrote message");

        Ok(WrittenPosition {
            position,
            global_position,
        })
    }

    async fn import_batch(&self, namespace: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let schema = self.schema(namespace).await?;
        let positions: Vec<i64> = messages.iter().map(|m| m.global_position).collect();

        let mut tx = self.pool.begin().await?;

        let taken: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT global_position FROM {schema}.messages
             WHERE global_position = ANY($1) LIMIT 1"
        ))
        .bind(&positions)
        .fetch_optional(&mut tx)
        .await?;
        if let Some(global_position) = taken {
            return Err(Error::PositionExists(global_position));
        }

        for message in messages {
            sqlx::query(&format!(
                r#"INSERT INTO {schema}.messages
                       (global_position, id, stream_name, category, "type", position, data, metadata, time)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#
            ))
            .bind(message.global_position)
            .bind(message.id)
            .bind(&message.stream_name)
            .bind(stream_name::category(&message.stream_name))
            .bind(&message.msg_type)
            .bind(message.position)
            .bind(message.data.clone())
            .bind(message.metadata.clone())
            .bind(message.time)
            .execute(&mut tx)
            .await?;
        }

        // Keep the sequence ahead of the imported positions.
        sqlx::query(&format!(
            "SELECT setval(pg_get_serial_sequence('{schema}.messages', 'global_position'),
                           (SELECT max(global_position) FROM {schema}.messages))"
        ))
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        debug!(namespace, count = messages.len(), "imported batch");

        Ok(())
    }

    async fn get_stream_messages(
        &self,
        namespace: &str,
        stream_name: &str,
        opts: &GetStreamMessagesOpts,
    ) -> Result<Vec<Message>> {
        let schema = self.schema(namespace).await?;
        let limit = effective_batch_size(opts.batch_size);

        let rows = match opts.global_position {
            Some(global_position) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM {schema}.messages
                     WHERE stream_name = $1 AND global_position >= $2
                     ORDER BY position LIMIT $3"
                ))
                .bind(stream_name)
                .bind(global_position)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM {schema}.messages
                     WHERE stream_name = $1 AND position >= $2
                     ORDER BY position LIMIT $3"
                ))
                .bind(stream_name)
                .bind(opts.position.unwrap_or(0))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_message).collect()
    }

    async fn get_category_messages(
        &self,
        namespace: &str,
        category: &str,
        opts: &GetCategoryMessagesOpts,
    ) -> Result<Vec<Message>> {
        let schema = self.schema(namespace).await?;
        let limit = effective_batch_size(opts.batch_size);

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {schema}.messages WHERE global_position >= $1"
        );
        let mut n = 1;
        if !category.is_empty() {
            n += 1;
            sql.push_str(&format!(" AND category = ${n}"));
        }
        if opts.correlation.is_some() {
            n += 1;
            sql.push_str(&format!(
                " AND metadata->>'correlationStreamName' LIKE ${n} ESCAPE '\\'"
            ));
        }
        if opts.consumer_group_size.is_some() {
            let size_param = n + 1;
            let member_param = n + 2;
            n += 2;
            sql.push_str(&format!(
                " AND {REGISTRY_SCHEMA}.cardinal_id(stream_name) <> '' \
                 AND mod(abs({REGISTRY_SCHEMA}.hash_64({REGISTRY_SCHEMA}.cardinal_id(stream_name))), ${size_param}) = ${member_param}"
            ));
        }
        n += 1;
        sql.push_str(&format!(" ORDER BY global_position LIMIT ${n}"));

        let mut query = sqlx::query(&sql).bind(opts.position.unwrap_or(0));
        if !category.is_empty() {
            query = query.bind(category);
        }
        if let Some(correlation) = &opts.correlation {
            query = query.bind(format!("{}-%", escape_like(correlation)));
        }
        if let Some(size) = opts.consumer_group_size {
            query = query
                .bind(size)
                .bind(opts.consumer_group_member.unwrap_or(0));
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream_name: &str,
        msg_type: Option<&str>,
    ) -> Result<Message> {
        let schema = self.schema(namespace).await?;

        let row = match msg_type {
            Some(msg_type) => {
                sqlx::query(&format!(
                    r#"SELECT {MESSAGE_COLUMNS} FROM {schema}.messages
                       WHERE stream_name = $1 AND "type" = $2
                       ORDER BY position DESC LIMIT 1"#
                ))
                .bind(stream_name)
                .bind(msg_type)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM {schema}.messages
                     WHERE stream_name = $1
                     ORDER BY position DESC LIMIT 1"
                ))
                .bind(stream_name)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => row_to_message(&row),
            None => Err(Error::StreamNotFound(stream_name.to_string())),
        }
    }

    async fn get_stream_version(&self, namespace: &str, stream_name: &str) -> Result<i64> {
        let schema = self.schema(namespace).await?;
        let version: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT max(position) FROM {schema}.messages WHERE stream_name = $1"
        ))
        .bind(stream_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(version.unwrap_or(-1))
    }

    async fn list_streams(
        &self,
        namespace: &str,
        opts: &ListStreamsOpts,
    ) -> Result<Vec<StreamInfo>> {
        let schema = self.schema(namespace).await?;
        let limit = effective_list_limit(opts.limit);

        let mut sql = format!(
            "SELECT stream_name, max(position) AS version, max(time) AS last_activity
             FROM {schema}.messages"
        );
        let mut clauses = Vec::new();
        let mut n = 0;
        if opts.prefix.is_some() {
            n += 1;
            clauses.push(format!("stream_name LIKE ${n} ESCAPE '\\'"));
        }
        if opts.cursor.is_some() {
            n += 1;
            clauses.push(format!("stream_name > ${n}"));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        n += 1;
        sql.push_str(&format!(
            " GROUP BY stream_name ORDER BY stream_name LIMIT ${n}"
        ));

        let mut query = sqlx::query(&sql);
        if let Some(prefix) = &opts.prefix {
            query = query.bind(format!("{}%", escape_like(prefix)));
        }
        if let Some(cursor) = &opts.cursor {
            query = query.bind(cursor);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                Ok(StreamInfo {
                    stream_name: row.try_get("stream_name")?,
                    version: row.try_get("version")?,
                    last_activity: row.try_get("last_activity")?,
                })
            })
            .collect()
    }

    async fn list_categories(&self, namespace: &str) -> Result<Vec<CategoryInfo>> {
        let schema = self.schema(namespace).await?;
        let rows = sqlx::query(&format!(
            "SELECT category,
                    count(DISTINCT stream_name) AS stream_count,
                    count(*) AS message_count
             FROM {schema}.messages GROUP BY category ORDER BY category"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CategoryInfo {
                    category: row.try_get("category")?,
                    stream_count: row.try_get("stream_count")?,
                    message_count: row.try_get("message_count")?,
                })
            })
            .collect()
    }

    async fn close(&self) {
        self.schemas.write().await.clear();
        self.pool.close().await;
    }
}
