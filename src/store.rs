//! The storage engine contract.
//!
//! Backends are variants behind the [`Storage`] capability set: the SQLite
//! backend keeps one database file per namespace under the data directory,
//! the Postgres backend keeps one schema per namespace in a shared server.
//! Their semantics are identical; the tests in `tests/` run against SQLite
//! because it needs no external service.

pub mod migrate;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::message::{CategoryInfo, Message, StreamInfo};
use crate::{Error, Result};

/// Largest batch size a caller may request explicitly.
pub const MAX_BATCH_SIZE: i64 = 10_000;

/// Server-side ceiling applied when a caller asks for `-1` (unlimited).
pub const UNLIMITED_BATCH_CEILING: i64 = 100_000;

/// Batch size used when the caller does not specify one.
pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Positions assigned to a newly written message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenPosition {
    /// Position within the stream.
    pub position: i64,
    /// Position within the namespace.
    pub global_position: i64,
}

/// Options for [`Storage::write_message`].
#[derive(Clone, Debug, Default, PartialEq, Eq, TypedBuilder)]
pub struct WriteMessageOpts {
    /// Explicit message id; a time-ordered UUID is generated when absent.
    #[builder(default, setter(strip_option))]
    pub id: Option<Uuid>,
    /// Message metadata.
    #[builder(default, setter(strip_option))]
    pub metadata: Option<Value>,
    /// Optimistic-concurrency claim: the write succeeds only if the stream
    /// is currently at exactly this version.
    #[builder(default, setter(strip_option))]
    pub expected_version: Option<i64>,
}

/// Options for [`Storage::get_stream_messages`].
#[derive(Clone, Debug, Default, PartialEq, Eq, TypedBuilder)]
pub struct GetStreamMessagesOpts {
    /// Lowest stream position to return. Defaults to 0.
    #[builder(default, setter(strip_option))]
    pub position: Option<i64>,
    /// When set, filter by global position instead of stream position.
    #[builder(default, setter(strip_option))]
    pub global_position: Option<i64>,
    /// Number of messages to return; `-1` for unlimited (capped).
    #[builder(default, setter(strip_option))]
    pub batch_size: Option<i64>,
}

/// Options for [`Storage::get_category_messages`].
#[derive(Clone, Debug, Default, PartialEq, Eq, TypedBuilder)]
pub struct GetCategoryMessagesOpts {
    /// Lowest global position to return. Defaults to 0.
    #[builder(default, setter(strip_option))]
    pub position: Option<i64>,
    /// Number of messages to return; `-1` for unlimited (capped).
    #[builder(default, setter(strip_option))]
    pub batch_size: Option<i64>,
    /// Retain only messages whose `metadata.correlationStreamName` belongs
    /// to this category.
    #[builder(default, setter(strip_option, into))]
    pub correlation: Option<String>,
    /// Consumer-group member to filter for.
    #[builder(default, setter(strip_option))]
    pub consumer_group_member: Option<i64>,
    /// Consumer-group size to partition by.
    #[builder(default, setter(strip_option))]
    pub consumer_group_size: Option<i64>,
}

/// Options for [`Storage::list_streams`].
#[derive(Clone, Debug, Default, PartialEq, Eq, TypedBuilder)]
pub struct ListStreamsOpts {
    /// Restrict to stream names starting with this prefix.
    #[builder(default, setter(strip_option, into))]
    pub prefix: Option<String>,
    /// Opaque pagination cursor: the last stream name of the previous page.
    #[builder(default, setter(strip_option, into))]
    pub cursor: Option<String>,
    /// Page size, 1 to 1000. Defaults to 100.
    #[builder(default, setter(strip_option))]
    pub limit: Option<i64>,
}

/// A namespace's registry entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Namespace id.
    pub id: String,
    /// Hex-encoded SHA-256 of the namespace's bearer token.
    pub token_hash: String,
    /// Backend-specific locator: a database file path or a schema name.
    pub locator: String,
    /// Free-form description.
    pub description: String,
    /// Opaque metadata supplied at creation.
    pub metadata: Option<Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Aggregates reported by `ns.info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    /// Total number of messages in the namespace.
    pub message_count: i64,
    /// Number of distinct streams.
    pub stream_count: i64,
    /// Write time of the most recent message, if any.
    pub last_activity: Option<DateTime<Utc>>,
}

/// The storage engine capability set. Both backends implement the same
/// semantics; see the crate-level docs for the invariants.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for health reporting.
    fn backend(&self) -> &'static str;

    /// Number of namespace handles currently open.
    async fn open_handles(&self) -> usize;

    /// Creates a namespace: reserves the id and locator in the registry,
    /// creates the backing file or schema, and applies migrations.
    async fn create_namespace(
        &self,
        id: &str,
        token_hash: &str,
        description: &str,
        metadata: Option<Value>,
    ) -> Result<NamespaceRecord>;

    /// Deletes a namespace and exactly its messages, returning how many
    /// messages were destroyed.
    async fn delete_namespace(&self, id: &str) -> Result<u64>;

    /// Looks up a namespace's registry entry.
    async fn get_namespace(&self, id: &str) -> Result<NamespaceRecord>;

    /// Lists all namespaces.
    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>>;

    /// Total number of messages in a namespace.
    async fn message_count(&self, namespace: &str) -> Result<i64>;

    /// Message, stream and activity aggregates for a namespace.
    async fn namespace_stats(&self, namespace: &str) -> Result<NamespaceStats>;

    /// Writes a message to a stream, assigning the next gap-free stream
    /// position and a fresh global position.
    async fn write_message(
        &self,
        namespace: &str,
        stream_name: &str,
        msg_type: &str,
        data: Option<&Value>,
        opts: &WriteMessageOpts,
    ) -> Result<WrittenPosition>;

    /// Inserts a batch of fully-specified messages as one atomic unit,
    /// preserving the supplied ids, positions and times. Fails with
    /// [`Error::PositionExists`] when any supplied global position is taken.
    async fn import_batch(&self, namespace: &str, messages: &[Message]) -> Result<()>;

    /// Retrieves messages from a single stream, ordered by position.
    async fn get_stream_messages(
        &self,
        namespace: &str,
        stream_name: &str,
        opts: &GetStreamMessagesOpts,
    ) -> Result<Vec<Message>>;

    /// Retrieves messages from a category of streams, ordered by global
    /// position. An empty category matches every message in the namespace.
    async fn get_category_messages(
        &self,
        namespace: &str,
        category: &str,
        opts: &GetCategoryMessagesOpts,
    ) -> Result<Vec<Message>>;

    /// The message with the highest position in the stream, optionally
    /// restricted to a message type.
    async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream_name: &str,
        msg_type: Option<&str>,
    ) -> Result<Message>;

    /// The highest position in the stream, or `-1` when the stream has no
    /// messages. Never fails for non-existent streams.
    async fn get_stream_version(&self, namespace: &str, stream_name: &str) -> Result<i64>;

    /// Pages through stream summaries, ordered by stream name.
    async fn list_streams(
        &self,
        namespace: &str,
        opts: &ListStreamsOpts,
    ) -> Result<Vec<StreamInfo>>;

    /// Category aggregates across all streams of the namespace.
    async fn list_categories(&self, namespace: &str) -> Result<Vec<CategoryInfo>>;

    /// Closes every open connection. Called once at shutdown.
    async fn close(&self);
}

/// Resolves a requested batch size to an effective row limit.
pub(crate) fn effective_batch_size(requested: Option<i64>) -> i64 {
    match requested {
        None => DEFAULT_BATCH_SIZE,
        Some(-1) => UNLIMITED_BATCH_CEILING,
        Some(n) => n.clamp(1, UNLIMITED_BATCH_CEILING),
    }
}

/// Resolves a stream-listing limit.
pub(crate) fn effective_list_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(100).clamp(1, 1000)
}

/// Namespace ids double as file stems (SQLite) and schema-name suffixes
/// (Postgres), so they are restricted to lowercase alphanumerics and
/// underscores, starting with an alphanumeric, at most 64 characters.
pub fn validate_namespace_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) if id.len() <= 64 => {
            first.is_ascii_lowercase() || first.is_ascii_digit()
        }
        _ => false,
    } && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest {
            message: format!("invalid namespace id: {id:?}"),
            details: Some(serde_json::json!({
                "pattern": "^[a-z0-9][a-z0-9_]{0,63}$",
            })),
        })
    }
}

/// Whether a database error is a unique-constraint violation, across both
/// backends (SQLite primary key / unique index, Postgres `unique_violation`).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code == "1555" || code == "2067" || code == "23505"),
        _ => false,
    }
}

/// Escapes `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`
/// pattern.
pub(crate) fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
