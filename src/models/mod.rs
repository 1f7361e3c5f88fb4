//! Data models for sweepctl.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Sweep identity, measurements, run reports
//! - B_i (Beliefs): Error types for falsified beliefs
//! - I^R (Resolvable): Configuration parameters

mod config;
mod error;
mod report;
mod sweep;

pub use config::*;
pub use error::*;
pub use report::*;
pub use sweep::*;
