//! UUIDv7 helpers.
//!
//! Record and run identifiers are UUIDv7 so that ids sort by creation time,
//! which keeps "newest first" listings stable across backends.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// ```
/// use tally_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// assert!(b >= a);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
