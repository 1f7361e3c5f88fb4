//! Backend seams for the external processors.
//!
//! Epistemic foundation:
//! - K_i: Every backend is driven by a serializable request and answers with
//!   a serializable result
//! - B_i: A backend run may fail → `BackendFailure`
//! - I^B: Backend internals are opaque; only their outputs are consulted

use crate::analysis::{CorrectionModel, Lattice, LatticeVerdict};
use crate::models::{BackendFailure, BatchStatistic, MergingStats, Reflection, Sweep, SweepKey};
use serde::{Deserialize, Serialize};

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendFailure>;

/// Unit cell constants a, b, c (Å) and α, β, γ (°).
pub type UnitCell = [f64; 6];

/// Input to the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
    pub sweep: Sweep,
    /// Lattice imposed by reconciliation, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lattice: Option<Lattice>,
}

/// Indexing solution for one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSolution {
    /// Space group of the best solution, e.g. `P 4 2 2`
    pub spacegroup: String,
    pub cell: UnitCell,
    /// Lattices the solution could be lowered to; empty lets the symmetry
    /// table decide
    #[serde(default)]
    pub candidates: Vec<Lattice>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Input to the lattice check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatticeCheckRequest {
    pub sweep: SweepKey,
    pub solution: IndexSolution,
    pub lattice: Lattice,
}

/// Input to geometry refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineRequest {
    pub sweep: Sweep,
    pub solution: IndexSolution,
}

/// Refined experimental geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedGeometry {
    pub cell: UnitCell,
    /// Positional RMSD in pixels
    #[serde(default)]
    pub rmsd: Option<f64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// One contiguous image range integrated as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrateRequest {
    pub sweep: Sweep,
    pub chunk: usize,
    pub first_image: u32,
    pub last_image: u32,
    pub geometry: RefinedGeometry,
}

/// Reflections integrated from one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratedChunk {
    pub chunk: usize,
    pub first_image: u32,
    pub reflections: Vec<Reflection>,
}

/// Integrated data of one sweep, as handed to the scaler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleInput {
    pub sweep: SweepKey,
    /// Dose (cumulative image count) at the sweep's first image
    pub dose_offset: f64,
    /// Resolution limit to apply, if one has been decided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d_min: Option<f64>,
    pub reflections: Vec<Reflection>,
}

/// Input to a scaling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub lattice: Lattice,
    pub corrections: CorrectionModel,
    pub sweeps: Vec<ScaleInput>,
}

/// Merging statistics of one sweep after scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMerging {
    pub sweep: SweepKey,
    pub stats: MergingStats,
}

/// Output of a scaling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleResult {
    /// Overall merging residual; lower is better
    pub merging_residual: f64,
    /// Refinement cycles to convergence, if reported
    #[serde(default)]
    pub convergence_cycles: Option<f64>,
    pub merging: Vec<SweepMerging>,
    #[serde(default)]
    pub batches: Vec<BatchStatistic>,
}

impl ScaleResult {
    pub fn stats_for(&self, sweep: &SweepKey) -> Option<&MergingStats> {
        self.merging
            .iter()
            .find(|m| &m.sweep == sweep)
            .map(|m| &m.stats)
    }
}

/// Finds and validates a lattice for a sweep.
pub trait Indexer: Send + Sync {
    fn index(&self, request: &IndexRequest) -> BackendResult<IndexSolution>;

    /// Judge whether the sweep's data is consistent with `lattice`.
    fn check_lattice(&self, request: &LatticeCheckRequest) -> BackendResult<LatticeVerdict>;
}

/// Refines experimental geometry from an indexing solution.
pub trait Refiner: Send + Sync {
    fn refine(&self, request: &RefineRequest) -> BackendResult<RefinedGeometry>;
}

/// Integrates one image range. Must be safe to call concurrently.
pub trait Integrater: Send + Sync {
    fn integrate(&self, request: &IntegrateRequest) -> BackendResult<IntegratedChunk>;
}

/// Scales and merges all sweeps together.
pub trait Scaler: Send + Sync {
    fn scale(&self, request: &ScaleRequest) -> BackendResult<ScaleResult>;
}
