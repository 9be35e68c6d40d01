//! File-per-namespace SQLite backend.
//!
//! Each namespace owns one database file under `<data_dir>/namespaces/`,
//! opened lazily into a handle that pairs a single-connection pool with a
//! write mutex. SQLite is a single-writer store, so the mutex held across
//! read-version + insert is the whole write-serialization discipline; the
//! pool of size one keeps reads from racing a half-committed write through
//! a second connection. Namespace metadata lives in `<data_dir>/registry.db`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    effective_batch_size, effective_list_limit, is_unique_violation, migrate,
    validate_namespace_id, GetCategoryMessagesOpts, GetStreamMessagesOpts, ListStreamsOpts,
    NamespaceRecord, NamespaceStats, Storage, WriteMessageOpts, WrittenPosition,
};
use crate::message::{format_time, CategoryInfo, Message, StreamInfo};
use crate::{hash, stream_name, Error, Result};

const MESSAGE_COLUMNS: &str =
    r#"id, stream_name, "type", position, global_position, data, metadata, time"#;

/// SQLite storage engine rooted at a data directory.
pub struct SqliteStore {
    data_dir: PathBuf,
    registry: SqlitePool,
    handles: RwLock<HashMap<String, Arc<NamespaceHandle>>>,
}

/// An open namespace: a single-connection pool plus the write mutex.
struct NamespaceHandle {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Opens the store, creating the data directory and registry database
    /// as needed.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(data_dir.join("namespaces")).await?;

        let registry = Self::open_db(&data_dir.join("registry.db")).await?;
        migrate::run_sqlite(&registry, migrate::SQLITE_REGISTRY).await?;
        debug!(data_dir = %data_dir.display(), "opened sqlite registry");

        Ok(SqliteStore {
            data_dir,
            registry,
            handles: RwLock::new(HashMap::new()),
        })
    }

    async fn open_db(path: &Path) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(pool)
    }

    /// Resolves the cached handle for a namespace, opening it on first
    /// access. Read-lock fast path, write-lock + double-check on miss.
    async fn handle(&self, namespace: &str) -> Result<Arc<NamespaceHandle>> {
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(namespace) {
                return Ok(handle.clone());
            }
        }

        let record = self.get_namespace(namespace).await?;

        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(namespace) {
            return Ok(handle.clone());
        }

        let pool = Self::open_db(Path::new(&record.locator)).await?;
        migrate::run_sqlite(&pool, migrate::SQLITE_NAMESPACE).await?;
        let handle = Arc::new(NamespaceHandle {
            pool,
            write_lock: Mutex::new(()),
        });
        handles.insert(namespace.to_string(), handle.clone());
        debug!(namespace, "opened namespace database");

        Ok(handle)
    }

    fn namespace_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("namespaces").join(format!("{id}.db"))
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id).map_err(|_| Error::Decode {
        expected: "message id",
    })?;

    let data: Option<String> = row.try_get("data")?;
    let data = data
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|_| Error::Decode {
            expected: "message data",
        })?;

    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|_| Error::Decode {
            expected: "message metadata",
        })?;

    Ok(Message {
        id,
        stream_name: row.try_get("stream_name")?,
        msg_type: row.try_get("type")?,
        position: row.try_get("position")?,
        global_position: row.try_get("global_position")?,
        data,
        metadata,
        time: parse_time(&row.try_get::<String, _>("time")?)?,
    })
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::Decode {
            expected: "message time",
        })
}

fn row_to_namespace(row: &SqliteRow) -> Result<NamespaceRecord> {
    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|_| Error::Decode {
            expected: "namespace metadata",
        })?;

    Ok(NamespaceRecord {
        id: row.try_get("id")?,
        token_hash: row.try_get("token_hash")?,
        locator: row.try_get("locator")?,
        description: row.try_get("description")?,
        metadata,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[async_trait::async_trait]
impl Storage for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn open_handles(&self) -> usize {
        self.handles.read().await.len()
    }

    async fn create_namespace(
        &self,
        id: &str,
        token_hash: &str,
        description: &str,
        metadata: Option<Value>,
    ) -> Result<NamespaceRecord> {
        validate_namespace_id(id)?;

        let locator = self.namespace_path(id);
        let locator_str = locator.display().to_string();
        let created_at = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO namespaces (id, token_hash, locator, description, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(token_hash)
        .bind(&locator_str)
        .bind(description)
        .bind(metadata.as_ref().map(Value::to_string))
        .bind(format_time(&created_at))
        .execute(&self.registry)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(Error::NamespaceExists(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        // The row reserves the id; now create the backing database. If that
        // fails, release the reservation so creation can be retried.
        let bootstrap = async {
            let pool = Self::open_db(&locator).await?;
            migrate::run_sqlite(&pool, migrate::SQLITE_NAMESPACE).await?;
            Ok::<SqlitePool, Error>(pool)
        }
        .await;

        let pool = match bootstrap {
            Ok(pool) => pool,
            Err(err) => {
                let _ = sqlx::query("DELETE FROM namespaces WHERE id = ?")
                    .bind(id)
                    .execute(&self.registry)
                    .await;
                return Err(err);
            }
        };

        self.handles.write().await.insert(
            id.to_string(),
            Arc::new(NamespaceHandle {
                pool,
                write_lock: Mutex::new(()),
            }),
        );
        debug!(namespace = id, "created namespace");

        Ok(NamespaceRecord {
            id: id.to_string(),
            token_hash: token_hash.to_string(),
            locator: locator_str,
            description: description.to_string(),
            metadata,
            created_at,
        })
    }

    async fn delete_namespace(&self, id: &str) -> Result<u64> {
        let record = self.get_namespace(id).await?;
        let deleted = self.message_count(id).await.unwrap_or(0);

        if let Some(handle) = self.handles.write().await.remove(id) {
            handle.pool.close().await;
        }

        for suffix in ["", "-wal", "-shm"] {
            let path = format!("{}{}", record.locator, suffix);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        sqlx::query("DELETE FROM namespaces WHERE id = ?")
            .bind(id)
            .execute(&self.registry)
            .await?;
        debug!(namespace = id, deleted, "deleted namespace");

        Ok(deleted as u64)
    }

    async fn get_namespace(&self, id: &str) -> Result<NamespaceRecord> {
        let row = sqlx::query(
            "SELECT id, token_hash, locator, description, metadata, created_at
             FROM namespaces WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.registry)
        .await?;

        match row {
            Some(row) => row_to_namespace(&row),
            None => Err(Error::NamespaceNotFound(id.to_string())),
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>> {
        let rows = sqlx::query(
            "SELECT id, token_hash, locator, description, metadata, created_at
             FROM namespaces ORDER BY id",
        )
        .fetch_all(&self.registry)
        .await?;

        rows.iter().map(row_to_namespace).collect()
    }

    async fn message_count(&self, namespace: &str) -> Result<i64> {
        let handle = self.handle(namespace).await?;
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM messages")
            .fetch_one(&handle.pool)
            .await?;
        Ok(count)
    }

    async fn namespace_stats(&self, namespace: &str) -> Result<NamespaceStats> {
        let handle = self.handle(namespace).await?;
        let row = sqlx::query(
            "SELECT count(*) AS messages,
                    count(DISTINCT stream_name) AS streams,
                    max(time) AS last_activity
             FROM messages",
        )
        .fetch_one(&handle.pool)
        .await?;

        let last_activity: Option<String> = row.try_get("last_activity")?;
        Ok(NamespaceStats {
            message_count: row.try_get("messages")?,
            stream_count: row.try_get("streams")?,
            last_activity: last_activity.as_deref().map(parse_time).transpose()?,
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

        let handle = self.handle(namespace).await?;
        let _write = handle.write_lock.lock().await;
        let mut tx = handle.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT max(position) FROM messages WHERE stream_name = ?")
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

        let result = sqlx::query(
            r#"INSERT INTO messages (id, stream_name, category, "type", position, data, metadata, time)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(stream_name)
        .bind(stream_name::category(stream_name))
        .bind(msg_type)
        .bind(position)
        .bind(data.map(Value::to_string))
        .bind(opts.metadata.as_ref().map(Value::to_string))
        .bind(format_time(&time))
        .execute(&mut tx)
        .await?;
        let global_position = result.last_insert_rowid();

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

        let handle = self.handle(namespace).await?;
        let _write = handle.write_lock.lock().await;
        let mut tx = handle.pool.begin().await?;

        // The whole batch is rejected if any supplied global position is
        // already taken.
        let placeholders = vec!["?"; messages.len()].join(", ");
        let probe_sql = format!(
            "SELECT global_position FROM messages WHERE global_position IN ({placeholders}) LIMIT 1"
        );
        let mut probe = sqlx::query_scalar(&probe_sql);
        for message in messages {
            probe = probe.bind(message.global_position);
        }
        let taken: Option<i64> = probe.fetch_optional(&mut tx).await?;
        if let Some(global_position) = taken {
            return Err(Error::PositionExists(global_position));
        }

        for message in messages {
            sqlx::query(
                r#"INSERT INTO messages (global_position, id, stream_name, category, "type", position, data, metadata, time)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(message.global_position)
            .bind(message.id.to_string())
            .bind(&message.stream_name)
            .bind(stream_name::category(&message.stream_name))
            .bind(&message.msg_type)
            .bind(message.position)
            .bind(message.data.as_ref().map(Value::to_string))
            .bind(message.metadata.as_ref().map(Value::to_string))
            .bind(format_time(&message.time))
            .execute(&mut tx)
            .await?;
        }

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
        let handle = self.handle(namespace).await?;
        let limit = effective_batch_size(opts.batch_size);

        let rows = match opts.global_position {
            Some(global_position) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE stream_name = ? AND global_position >= ?
                     ORDER BY position LIMIT ?"
                ))
                .bind(stream_name)
                .bind(global_position)
                .bind(limit)
                .fetch_all(&handle.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE stream_name = ? AND position >= ?
                     ORDER BY position LIMIT ?"
                ))
                .bind(stream_name)
                .bind(opts.position.unwrap_or(0))
                .bind(limit)
                .fetch_all(&handle.pool)
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
        let handle = self.handle(namespace).await?;
        let limit = effective_batch_size(opts.batch_size);
        let member = opts.consumer_group_member.unwrap_or(0);

        // SQLite has no MD5, so the correlation and consumer-group
        // predicates run in Rust. Paging continues past rejected rows until
        // a full batch is collected, so the result set matches the Postgres
        // push-down.
        let mut messages = Vec::new();
        let mut from = opts.position.unwrap_or(0);
        loop {
            let rows = if category.is_empty() {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE global_position >= ?
                     ORDER BY global_position LIMIT ?"
                ))
                .bind(from)
                .bind(limit)
                .fetch_all(&handle.pool)
                .await?
            } else {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE category = ? AND global_position >= ?
                     ORDER BY global_position LIMIT ?"
                ))
                .bind(category)
                .bind(from)
                .bind(limit)
                .fetch_all(&handle.pool)
                .await?
            };
            let fetched = rows.len() as i64;

            for row in &rows {
                let message = row_to_message(row)?;
                from = message.global_position + 1;

                if let Some(correlation) = &opts.correlation {
                    if !message.is_correlated(correlation) {
                        continue;
                    }
                }
                if let Some(size) = opts.consumer_group_size {
                    if !hash::is_assigned(&message.stream_name, member, size) {
                        continue;
                    }
                }

                messages.push(message);
                if messages.len() as i64 == limit {
                    return Ok(messages);
                }
            }

            if fetched < limit {
                return Ok(messages);
            }
        }
    }

    async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream_name: &str,
        msg_type: Option<&str>,
    ) -> Result<Message> {
        let handle = self.handle(namespace).await?;

        let row = match msg_type {
            Some(msg_type) => {
                sqlx::query(&format!(
                    r#"SELECT {MESSAGE_COLUMNS} FROM messages
                       WHERE stream_name = ? AND "type" = ?
                       ORDER BY position DESC LIMIT 1"#
                ))
                .bind(stream_name)
                .bind(msg_type)
                .fetch_optional(&handle.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE stream_name = ?
                     ORDER BY position DESC LIMIT 1"
                ))
                .bind(stream_name)
                .fetch_optional(&handle.pool)
                .await?
            }
        };

        match row {
            Some(row) => row_to_message(&row),
            None => Err(Error::StreamNotFound(stream_name.to_string())),
        }
    }

    async fn get_stream_version(&self, namespace: &str, stream_name: &str) -> Result<i64> {
        let handle = self.handle(namespace).await?;
        let version: Option<i64> =
            sqlx::query_scalar("SELECT max(position) FROM messages WHERE stream_name = ?")
                .bind(stream_name)
                .fetch_one(&handle.pool)
                .await?;
        Ok(version.unwrap_or(-1))
    }

    async fn list_streams(
        &self,
        namespace: &str,
        opts: &ListStreamsOpts,
    ) -> Result<Vec<StreamInfo>> {
        let handle = self.handle(namespace).await?;
        let limit = effective_list_limit(opts.limit);

        let mut sql = String::from(
            "SELECT stream_name, max(position) AS version, max(time) AS last_activity
             FROM messages",
        );
        let mut clauses = Vec::new();
        if opts.prefix.is_some() {
            clauses.push("stream_name LIKE ? ESCAPE '\\'");
        }
        if opts.cursor.is_some() {
            clauses.push("stream_name > ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" GROUP BY stream_name ORDER BY stream_name LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(prefix) = &opts.prefix {
            query = query.bind(format!("{}%", super::escape_like(prefix)));
        }
        if let Some(cursor) = &opts.cursor {
            query = query.bind(cursor);
        }
        let rows = query.bind(limit).fetch_all(&handle.pool).await?;

        rows.iter()
            .map(|row| {
                Ok(StreamInfo {
                    stream_name: row.try_get("stream_name")?,
                    version: row.try_get("version")?,
                    last_activity: parse_time(&row.try_get::<String, _>("last_activity")?)?,
                })
            })
            .collect()
    }

    async fn list_categories(&self, namespace: &str) -> Result<Vec<CategoryInfo>> {
        let handle = self.handle(namespace).await?;
        let rows = sqlx::query(
            "SELECT category,
                    count(DISTINCT stream_name) AS stream_count,
                    count(*) AS message_count
             FROM messages GROUP BY category ORDER BY category",
        )
        .fetch_all(&handle.pool)
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
        let mut handles = self.handles.write().await;
        for (_, handle) in handles.drain() {
            handle.pool.close().await;
        }
        self.registry.close().await;
    }
}
