//! Error taxonomy.
//!
//! Absent keys are `Option`s, never errors. Out-of-range `grow_at_percent`
//! and broken internal invariants are programmer errors and assert instead.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The allocator refused a backing-array allocation. The map is left
    /// unmodified.
    #[error("allocation of {bytes} bytes failed")]
    Alloc { bytes: usize },

    /// The requested capacity overflows the size arithmetic.
    #[error("requested capacity overflows size arithmetic")]
    CapacityOverflow,
}
