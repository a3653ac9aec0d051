//! Core deterministic primitives.
//!
//! Currency arithmetic, state hashing and the injectable wall clock.
//! Everything above this layer builds on these types.

pub mod amount;
pub mod hash;
pub mod clock;

// Re-export core types
pub use amount::{Amount, BASE_PER_CLICK, DEFAULT_PER_STEP_YIELD, DEFAULT_STEP_CORRECTION};
pub use hash::{StateHash, StateHasher, hash_string_map};
pub use clock::{Clock, SystemClock, ManualClock};
