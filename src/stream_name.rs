//! Messages are written to and read from streams, and a stream is identified
//! by its name. A stream name is a string of the form `category[-id[+compound]]`:
//! the part preceding the first dash (`-`) is the *category*, and the part
//! following it is the ID.
//!
//! # Entity stream name
//!
//! An *entity* stream name contains all of the messages for one specific
//! entity. For example, an `account` entity with an ID of `123` has the
//! stream name `account-123`.
//!
//! # Category stream name
//!
//! A *category* stream name does not have an ID. For example, the stream
//! name for the category of all accounts is `account`. A query by category
//! returns messages from every stream whose name begins with `account-`.
//!
//! # Compound IDs
//!
//! An ID may be compound, with parts joined by plus (`+`) characters. The
//! part before the first `+` is the *cardinal ID*: the grouping key used by
//! consumer-group partitioning, so that `account-123+settings` and
//! `account-123+billing` always route to the same consumer.
//!
//! Only the first `-` separates the category from the ID; any further `-`
//! characters are part of the ID itself.

use crate::{Error, Result};

/// Separator between the category and the ID.
pub const ID_SEPARATOR: char = '-';

/// Separator between the parts of a compound ID.
pub const COMPOUND_ID_SEPARATOR: char = '+';

/// Returns the category part of a `stream_name`: the prefix before the first
/// dash, or the whole name when there is no dash.
pub fn category(stream_name: &str) -> &str {
    stream_name
        .split_once(ID_SEPARATOR)
        .map(|(category, _)| category)
        .unwrap_or(stream_name)
}

/// Returns the ID part of a `stream_name`: the suffix after the first dash,
/// or the empty string when there is no dash.
pub fn id(stream_name: &str) -> &str {
    stream_name
        .split_once(ID_SEPARATOR)
        .map(|(_, id)| id)
        .unwrap_or("")
}

/// Returns the cardinal ID of a `stream_name`: the part of the ID before the
/// first plus, or the whole ID when there is no plus.
pub fn cardinal_id(stream_name: &str) -> &str {
    let id = id(stream_name);
    id.split_once(COMPOUND_ID_SEPARATOR)
        .map(|(cardinal, _)| cardinal)
        .unwrap_or(id)
}

/// Returns whether a `stream_name` is a category, i.e. contains no ID.
pub fn is_category(stream_name: &str) -> bool {
    !stream_name.contains(ID_SEPARATOR)
}

/// Validates a stream name for writing.
pub fn validate(stream_name: &str) -> Result<()> {
    if stream_name.is_empty() {
        return Err(Error::invalid_request("stream name is empty"));
    }

    Ok(())
}
