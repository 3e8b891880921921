// padat v0.1.0 - Dense Robin Hood Hash Map
// Two-choice windowed probing, 100% fill, minimal perfect indexing at capacity

pub mod context;
pub mod error;
mod iter;
mod map;
pub mod meta;
mod simd;

// Re-export main types
pub use context::{BytesContext, HashContext, RandomContext, SeaContext};
pub use error::MapError;
pub use iter::Iter;
pub use map::{DenseMap, DEFAULT_GROW_AT_PERCENT};
