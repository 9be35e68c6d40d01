//! The 64-bit hash used for consumer-group partitioning and write locking.
//!
//! The definition is load-bearing: server backends and client SDKs must
//! agree on it bit-for-bit, so it is fixed as the first 8 bytes of the MD5
//! digest interpreted as a big-endian signed 64-bit integer. The Postgres
//! backend evaluates the same expression in SQL
//! (`left('x' || md5(value), 17)::bit(64)::bigint`).

use crate::stream_name;

/// Hashes a value to a signed 64-bit integer.
pub fn hash_64(value: &str) -> i64 {
    let digest = md5::compute(value.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    i64::from_be_bytes(prefix)
}

/// Returns whether `stream_name` is assigned to the consumer-group member
/// `member` out of `size` members.
///
/// Assignment partitions a category by the hash of the cardinal ID, so
/// compound streams sharing a cardinal always route to the same member.
/// Category-only streams (no ID) are assigned to nobody.
pub fn is_assigned(stream_name: &str, member: i64, size: i64) -> bool {
    if size <= 0 || member < 0 || member >= size {
        return false;
    }

    let cardinal_id = stream_name::cardinal_id(stream_name);
    if cardinal_id.is_empty() {
        return false;
    }

    hash_64(cardinal_id).unsigned_abs() % size as u64 == member as u64
}
