//! Per-sweep processing: indexing → refinement → integration.
//!
//! Epistemic foundation:
//! - K_i: Each stage consumes its upstream stage's finished result
//! - K_i: Resetting a stage resets every stage downstream of it
//! - B_i: The indexer's lattice may be overruled by reconciliation → re-index
//! - I^R: Chunking and retry ceiling come from configuration

use super::stage::{Stage, StageController, Step};
use crate::analysis::{
    Lattice, LatticeParticipant, LatticeProposal, LatticeVerdict, SymmetryOracle,
};
use crate::backend::{
    Backends, IndexRequest, IndexSolution, Indexer, Integrater, LatticeCheckRequest,
    RefineRequest, RefinedGeometry, Refiner, ReflectionStore, ReflectionTable,
};
use crate::models::{
    BackendFailure, Config, ReductionError, Result, StageId, StageSnapshot, Sweep, SweepKey,
};
use crate::pool::ChunkPool;
use std::sync::Arc;
use tracing::{debug, info};

/// Finds a lattice and unit cell.
pub struct IndexingStage {
    sweep: Sweep,
    indexer: Arc<dyn Indexer>,
    symmetry: Arc<dyn SymmetryOracle>,
    /// Lattice imposed by reconciliation
    lattice: Option<Lattice>,
    request: Option<IndexRequest>,
}

impl Stage for IndexingStage {
    type Context = ();
    type Output = IndexSolution;

    fn id(&self) -> StageId {
        StageId::Indexing
    }

    fn sweep(&self) -> Option<&SweepKey> {
        Some(&self.sweep.key)
    }

    fn prepare(&mut self, _ctx: &mut ()) -> Result<Step<()>> {
        self.request = Some(IndexRequest {
            sweep: self.sweep.clone(),
            lattice: self.lattice,
        });
        Ok(Step::Advance(()))
    }

    fn execute(&mut self, _ctx: &mut ()) -> Result<Step<IndexSolution>> {
        let Some(request) = &self.request else {
            return Ok(Step::retry_prepare("no indexing request"));
        };
        let solution = self.indexer.index(request)?;
        info!(
            sweep = %self.sweep.key,
            spacegroup = %solution.spacegroup,
            lattice = ?self.lattice,
            "Indexed"
        );
        Ok(Step::Advance(solution))
    }

    fn finish(&mut self, _ctx: &mut (), solution: &mut IndexSolution) -> Result<Step<()>> {
        let found = self.symmetry.pointgroup(&solution.spacegroup)?.lattice;
        match self.lattice {
            Some(wanted) if wanted != found => Err(BackendFailure::InvalidOutput {
                backend: "indexer".to_string(),
                message: format!("asked for lattice {wanted}, got {found}"),
            }
            .into()),
            _ => Ok(Step::Advance(())),
        }
    }
}

/// Refines experimental geometry from the indexing solution.
pub struct RefinementStage {
    sweep: Sweep,
    refiner: Arc<dyn Refiner>,
    request: Option<RefineRequest>,
}

impl Stage for RefinementStage {
    type Context = StageController<IndexingStage>;
    type Output = RefinedGeometry;

    fn id(&self) -> StageId {
        StageId::Refinement
    }

    fn sweep(&self) -> Option<&SweepKey> {
        Some(&self.sweep.key)
    }

    fn prepare(&mut self, indexing: &mut Self::Context) -> Result<Step<()>> {
        let solution = indexing.get_result(&mut ())?;
        self.request = Some(RefineRequest {
            sweep: self.sweep.clone(),
            solution,
        });
        Ok(Step::Advance(()))
    }

    fn execute(&mut self, _indexing: &mut Self::Context) -> Result<Step<RefinedGeometry>> {
        let Some(request) = &self.request else {
            return Ok(Step::retry_prepare("no refinement request"));
        };
        let geometry = self.refiner.refine(request)?;
        debug!(sweep = %self.sweep.key, rmsd = ?geometry.rmsd, "Geometry refined");
        Ok(Step::Advance(geometry))
    }

    fn finish(&mut self, indexing: &mut Self::Context, _output: &mut RefinedGeometry) -> Result<Step<()>> {
        if !indexing.record().finished() {
            return Ok(Step::retry_prepare("indexing was reset"));
        }
        Ok(Step::Advance(()))
    }
}

/// Indexing and refinement, the upstream of integration.
pub struct GeometryChain {
    indexing: StageController<IndexingStage>,
    refinement: StageController<RefinementStage>,
}

impl GeometryChain {
    pub fn solution(&mut self) -> Result<IndexSolution> {
        self.indexing.get_result(&mut ())
    }

    pub fn geometry(&mut self) -> Result<RefinedGeometry> {
        self.refinement.get_result(&mut self.indexing)
    }
}

/// Integrates the sweep, optionally split into parallel chunks.
pub struct IntegrationStage {
    sweep: Sweep,
    integrater: Arc<dyn Integrater>,
    pool: ChunkPool,
    chunks: usize,
    geometry: Option<RefinedGeometry>,
}

impl Stage for IntegrationStage {
    type Context = GeometryChain;
    type Output = Arc<ReflectionTable>;

    fn id(&self) -> StageId {
        StageId::Integration
    }

    fn sweep(&self) -> Option<&SweepKey> {
        Some(&self.sweep.key)
    }

    fn prepare(&mut self, chain: &mut GeometryChain) -> Result<Step<()>> {
        self.geometry = Some(chain.geometry()?);
        Ok(Step::Advance(()))
    }

    fn execute(&mut self, _chain: &mut GeometryChain) -> Result<Step<Arc<ReflectionTable>>> {
        let Some(geometry) = &self.geometry else {
            return Ok(Step::retry_prepare("no refined geometry"));
        };
        let reflections =
            self.pool
                .integrate(Arc::clone(&self.integrater), &self.sweep, geometry, self.chunks)?;
        if reflections.is_empty() {
            return Err(ReductionError::InsufficientData(format!(
                "no reflections integrated for sweep {}",
                self.sweep.key
            )));
        }
        Ok(Step::Advance(Arc::new(ReflectionTable::new(reflections))))
    }

    fn finish(&mut self, _chain: &mut GeometryChain, table: &mut Arc<ReflectionTable>) -> Result<Step<()>> {
        info!(sweep = %self.sweep.key, reflections = table.len(), "Integrated");
        Ok(Step::Advance(()))
    }
}

/// All per-sweep stages of one sweep, and its side of lattice reconciliation.
pub struct SweepProcessor {
    sweep: Sweep,
    chain: GeometryChain,
    integration: StageController<IntegrationStage>,
    indexer: Arc<dyn Indexer>,
    symmetry: Arc<dyn SymmetryOracle>,
    /// Lattice accepted through reconciliation
    asserted: Option<Lattice>,
}

impl SweepProcessor {
    pub fn new(
        sweep: Sweep,
        backends: &Backends,
        symmetry: Arc<dyn SymmetryOracle>,
        config: &Config,
    ) -> Self {
        let max_retries = config.controller.max_retries;
        let indexing = IndexingStage {
            sweep: sweep.clone(),
            indexer: Arc::clone(&backends.indexer),
            symmetry: Arc::clone(&symmetry),
            lattice: None,
            request: None,
        };
        let refinement = RefinementStage {
            sweep: sweep.clone(),
            refiner: Arc::clone(&backends.refiner),
            request: None,
        };
        let integration = IntegrationStage {
            sweep: sweep.clone(),
            integrater: Arc::clone(&backends.integrater),
            pool: ChunkPool::new(config.integration.max_parallel),
            chunks: config.integration.chunks,
            geometry: None,
        };

        Self {
            sweep,
            chain: GeometryChain {
                indexing: StageController::new(indexing, max_retries),
                refinement: StageController::new(refinement, max_retries),
            },
            integration: StageController::new(integration, max_retries),
            indexer: Arc::clone(&backends.indexer),
            symmetry,
            asserted: None,
        }
    }

    /// Show a progress bar during chunked integration.
    pub fn with_progress(mut self, progress: bool) -> Self {
        let stage = self.integration.stage_mut();
        stage.pool = std::mem::replace(&mut stage.pool, ChunkPool::new(1)).with_progress(progress);
        self
    }

    pub fn key(&self) -> &SweepKey {
        &self.sweep.key
    }

    pub fn sweep(&self) -> &Sweep {
        &self.sweep
    }

    pub fn asserted_lattice(&self) -> Option<Lattice> {
        self.asserted
    }

    /// Impose a lattice up front, e.g. one remembered from an earlier run.
    pub fn seed_lattice(&mut self, lattice: Lattice) {
        if self.asserted != Some(lattice) {
            self.accept_lattice(lattice);
            self.reset_from(StageId::Indexing);
        }
    }

    fn accept_lattice(&mut self, lattice: Lattice) {
        self.asserted = Some(lattice);
        self.chain.indexing.stage_mut().lattice = Some(lattice);
    }

    /// Integrated reflections, driving every upstream stage as needed.
    pub fn integrated(&mut self) -> Result<Arc<ReflectionTable>> {
        self.integration.get_result(&mut self.chain)
    }

    /// Drive this sweep up to and including `stage`.
    pub fn run_stage(&mut self, stage: StageId) -> Result<()> {
        match stage {
            StageId::Indexing => self.chain.solution().map(|_| ()),
            StageId::Refinement => self.chain.geometry().map(|_| ()),
            StageId::Integration => self.integrated().map(|_| ()),
            StageId::Scaling => Err(ReductionError::InvalidInput(
                "scaling is not a per-sweep stage".to_string(),
            )),
        }
    }

    /// Reset `stage` and everything downstream of it.
    pub fn reset_from(&mut self, stage: StageId) {
        debug!(sweep = %self.sweep.key, stage = %stage, "Resetting sweep stages");
        if stage <= StageId::Indexing {
            self.chain.indexing.reset();
        }
        if stage <= StageId::Refinement {
            self.chain.refinement.reset();
        }
        if stage <= StageId::Integration {
            self.integration.reset();
        }
    }

    /// Snapshots of the three stages, upstream first.
    pub fn snapshots(&self) -> Vec<StageSnapshot> {
        vec![
            self.chain.indexing.snapshot(),
            self.chain.refinement.snapshot(),
            self.integration.snapshot(),
        ]
    }
}

impl LatticeParticipant for SweepProcessor {
    fn propose(&mut self) -> Result<LatticeProposal> {
        let solution = self.chain.solution()?;

        if let Some(lattice) = self.asserted {
            return Ok(LatticeProposal {
                sweep: self.sweep.key.clone(),
                lattice,
                candidates: vec![lattice],
            });
        }

        let mut proposal = LatticeProposal::from_spacegroup(
            self.sweep.key.clone(),
            &solution.spacegroup,
            self.symmetry.as_ref(),
        )?;
        if !solution.candidates.is_empty() {
            let mut candidates = solution.candidates;
            candidates.sort_by_key(|l| std::cmp::Reverse(self.symmetry.symmetry_rank(*l)));
            proposal.candidates = candidates;
        }
        Ok(proposal)
    }

    fn assert_lattice(&mut self, lattice: Lattice) -> Result<LatticeVerdict> {
        let solution = self.chain.solution()?;
        let verdict = self.indexer.check_lattice(&LatticeCheckRequest {
            sweep: self.sweep.key.clone(),
            solution,
            lattice,
        })?;
        if verdict != LatticeVerdict::Impossible {
            self.accept_lattice(lattice);
        }
        Ok(verdict)
    }
}
