//! A message is a data structure that represents either an instruction to be
//! passed to a process (command), or a record of something that has happened
//! (event) - typically in response to the processing of a command.
//!
//! # Messages are just data objects
//!
//! Messages are plain data structures. They have attributes and that's it.
//! Messages do not validate themselves, transform or serialize themselves,
//! send themselves, or save themselves; all of those are external
//! capabilities.
//!
//! # Messages are serialized as JSON when stored
//!
//! A message's `data` and `metadata` are opaque JSON objects. The store
//! writes them verbatim and returns them verbatim; the single field the
//! server itself recognizes is `metadata.correlationStreamName`, used by the
//! correlation filter of category reads.
//!
//! # Messages are immutable
//!
//! Once written, a message is never updated or deleted individually. Streams
//! only ever grow; they disappear only when their namespace is deleted.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single record of the append-only log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier of the message. Time-ordered (UUID v7) when
    /// generated by the server.
    pub id: Uuid,
    /// Name of the stream the message belongs to.
    pub stream_name: String,
    /// Message type.
    ///
    /// For commands, this is typically the command name.
    /// For events, this is typically the event name.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// An incrementing gapless sequence in the stream, starting at 0.
    pub position: i64,
    /// Global incrementing sequence across the namespace.
    ///
    /// This may contain gaps.
    pub global_position: i64,
    /// Message data.
    pub data: Option<Value>,
    /// Message metadata.
    pub metadata: Option<Value>,
    /// Time the message was saved to the store.
    pub time: DateTime<Utc>,
}

impl Message {
    /// The `correlationStreamName` metadata field, when present.
    pub fn correlation_stream_name(&self) -> Option<&str> {
        self.metadata
            .as_ref()?
            .get("correlationStreamName")?
            .as_str()
    }

    /// Whether the message's correlation stream belongs to `category`.
    pub fn is_correlated(&self, category: &str) -> bool {
        match self.correlation_stream_name() {
            Some(correlation) => correlation
                .strip_prefix(category)
                .is_some_and(|rest| rest.starts_with(crate::stream_name::ID_SEPARATOR)),
            None => false,
        }
    }
}

/// Formats an instant the way every wire surface does: RFC 3339 with
/// nanosecond precision, UTC.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// A stream summary row returned by stream listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream name.
    pub stream_name: String,
    /// Highest position in the stream.
    pub version: i64,
    /// Write time of the most recent message.
    pub last_activity: DateTime<Utc>,
}

/// A category summary row aggregated across all of a namespace's streams.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryInfo {
    /// Category name.
    pub category: String,
    /// Number of distinct streams in the category.
    pub stream_count: i64,
    /// Total number of messages across those streams.
    pub message_count: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message_with_metadata(metadata: Option<Value>) -> Message {
        Message {
            id: Uuid::now_v7(),
            stream_name: "account-1".to_string(),
            msg_type: "Opened".to_string(),
            position: 0,
            global_position: 1,
            data: None,
            metadata,
            time: Utc::now(),
        }
    }

    #[test]
    fn correlation_requires_the_category_prefix() {
        let msg =
            message_with_metadata(Some(json!({ "correlationStreamName": "campaign-7+emails" })));
        assert_eq!(
            msg.correlation_stream_name(),
            Some("campaign-7+emails"),
        );
        assert!(msg.is_correlated("campaign"));
        // `campaignX-7` is a different category even though it shares a prefix.
        assert!(!msg.is_correlated("campaignX"));
        assert!(!msg.is_correlated("camp"));
    }

    #[test]
    fn uncorrelated_messages_match_nothing() {
        assert!(!message_with_metadata(None).is_correlated("campaign"));
        let msg = message_with_metadata(Some(json!({ "other": true })));
        assert!(!msg.is_correlated("campaign"));
    }
}
