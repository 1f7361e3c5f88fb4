//! sweepctl - Staged data-reduction controller for multi-sweep diffraction experiments.
//!
//! ## Architecture
//!
//! Every processing step is a stage driven through prepare → execute →
//! finish by a `StageController`. Per-sweep stages (indexing, refinement,
//! integration) feed one scaling stage that sees all sweeps at once:
//! - **Lattice reconciliation**: sweeps agree on the lowest-symmetry lattice
//! - **Model selection**: every combination of correction terms is scored
//! - **Resolution loop**: limits are re-estimated until they stop moving
//! - **Damage analysis**: the dose where the decay indicator turns non-linear
//!
//! External programs do the crystallographic work behind the traits in
//! `backend`; chunked integration runs them in parallel (`pool`).
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Backend uncertainties (retry, reset, worst-case scoring)

pub mod analysis;
pub mod backend;
pub mod checkpoint;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use analysis::{BravaisTable, CorrectionModel, Lattice, SymmetryOracle};
pub use backend::{Backends, ExternalCommand, ReflectionStore, ReflectionTable};
pub use checkpoint::{CheckpointManager, CheckpointState};
pub use models::{Config, PipelineReport, ReductionError, Result, StageId, SweepKey};
pub use pipeline::{ReductionPipeline, Stage, StageController, Step};
pub use pool::ChunkPool;
