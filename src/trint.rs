//! Message ids are 64 bit numbers, but some packet fields carry only their low 16 bits (a
//!  'truncated integer' or trint) to save space. The receiver of a trint restores the full id
//!  relative to a base id it knows, picking the id closest to the base.
//!
//! This is unambiguous as long as the actual id is less than half the trint range away from
//!  the base, which the publisher ensures by limiting the number of messages in flight.

pub type Trint = u16;

/// The number of distinct trint values
pub const TRINT_RANGE: u64 = 1 << 16;

/// The maximum distance between an id and the base it is restored against
pub const MAX_TRINT_DISTANCE: u64 = TRINT_RANGE / 2 - 1;

pub fn to_trint(id: u64) -> Trint {
    (id & (TRINT_RANGE - 1)) as Trint
}

/// Restores the full id closest to `base` whose low bits are `trint`, or `None` if that would
///  be below zero.
pub fn from_trint(trint: Trint, base: u64) -> Option<u64> {
    let delta = trint.wrapping_sub(to_trint(base)) as i16;
    base.checked_add_signed(delta as i64)
}

pub fn is_within_trint_distance(id: u64, base: u64) -> bool {
    id.abs_diff(base) <= MAX_TRINT_DISTANCE
}
