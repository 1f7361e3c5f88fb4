//! Checkpoint module for resumable reductions.
//!
//! Provides:
//! - `CheckpointState`: decisions of the last completed scaling round
//! - `CheckpointManager`: persistence and loading of checkpoint state

mod state;

pub use state::*;
