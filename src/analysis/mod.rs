//! Statistical decision engine.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Closed-form statistics over immutable inputs
//! - B_i (Beliefs): Every decision may find too little data → Result
//! - I^R (Resolvable): Thresholds and margins come from configuration

mod damage;
mod lattice;
mod resolution;
mod scale_model;
pub mod stats;
mod symmetry;

pub use damage::*;
pub use lattice::*;
pub use resolution::*;
pub use scale_model::*;
pub use symmetry::*;
