//! Scaling: the one stage that sees every sweep at once.
//!
//! Epistemic foundation:
//! - K_i: All sweeps must agree on one lattice before any scaling run
//! - B_i: A resolution limit may move after scaling → scale again
//! - B_i: Damage onset may be undeterminable → use all data
//! - I^R: Thresholds, margins and manual overrides come from configuration
//!
//! Prepare reconciles lattices and collects integrated data, execute selects
//! a correction model and scales, finish settles resolution limits and
//! locates radiation damage.

use super::stage::{Stage, Step};
use super::sweep::SweepProcessor;
use crate::checkpoint::CheckpointManager;
use crate::analysis::{
    changed_limits, detect_onset, estimate, reconcile_round, select_model, wilson_cutoff,
    CorrectionModel, Criterion, DamageAnalysis, DoseAxis, Lattice, ModelSelection,
    Reconciliation, ResolutionLimit, SymmetryOracle, TrialScore,
};
use crate::backend::{ReflectionStore, ReflectionTable, ScaleInput, ScaleRequest, ScaleResult, Scaler};
use crate::models::{
    BackendFailure, Config, DamageConfig, ReductionError, ResolutionConfig, Result, ScalingConfig,
    StageId, StageSnapshot, Sweep, SweepCutoff, SweepKey,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolution shells used for the Wilson-regime check on unmerged data.
const WILSON_SHELLS: usize = 20;

/// Decisions shared across rounds, owned by the pipeline driver.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    /// Latest lattice reconciliation round
    pub lattice: Option<Reconciliation>,
    pub limits: BTreeMap<SweepKey, ResolutionLimit>,
    pub selection: Option<ModelSelection>,
    pub damage: Option<DamageAnalysis>,
    pub cutoffs: BTreeMap<SweepKey, SweepCutoff>,
    /// Scaling runs completed so far
    pub rounds: u32,
}

/// Everything the scaling stage works on.
pub struct ScalingContext {
    pub sweeps: Vec<SweepProcessor>,
    pub shared: SharedState,
    /// Written after every scaling round when present
    pub checkpoint: Option<CheckpointManager>,
}

impl ScalingContext {
    pub fn new(sweeps: Vec<SweepProcessor>) -> Self {
        Self {
            sweeps,
            shared: SharedState::default(),
            checkpoint: None,
        }
    }

    /// Per-sweep stage snapshots, sweep by sweep.
    pub fn sweep_snapshots(&self) -> Vec<StageSnapshot> {
        self.sweeps.iter().flat_map(|s| s.snapshots()).collect()
    }

    fn save_round(&mut self) -> Result<()> {
        let stages = self.sweep_snapshots();
        let Some(checkpoint) = self.checkpoint.as_mut() else {
            return Ok(());
        };
        checkpoint.record_round(
            self.shared.lattice.as_ref().map(|r| r.lattice),
            &self.shared.limits,
            self.shared.selection.as_ref().map(|s| s.selected),
            stages,
        )
    }

    pub fn sweep_mut(&mut self, key: &SweepKey) -> Option<&mut SweepProcessor> {
        self.sweeps.iter_mut().find(|s| s.key() == key)
    }
}

/// Result of a finished scaling stage.
#[derive(Debug, Clone)]
pub struct ScalingOutput {
    pub lattice: Lattice,
    pub corrections: CorrectionModel,
    pub result: ScaleResult,
}

pub struct ScalingStage {
    scaler: Arc<dyn Scaler>,
    symmetry: Arc<dyn SymmetryOracle>,
    scaling: ScalingConfig,
    resolution: ResolutionConfig,
    damage: DamageConfig,
    tables: Vec<(SweepKey, Arc<ReflectionTable>)>,
    dose: DoseAxis,
}

impl ScalingStage {
    pub fn new(scaler: Arc<dyn Scaler>, symmetry: Arc<dyn SymmetryOracle>, config: &Config) -> Self {
        Self {
            scaler,
            symmetry,
            scaling: config.scaling.clone(),
            resolution: config.resolution.clone(),
            damage: config.damage.clone(),
            tables: Vec::new(),
            dose: DoseAxis::default(),
        }
    }

    fn request(
        &self,
        lattice: Lattice,
        corrections: CorrectionModel,
        limits: &BTreeMap<SweepKey, ResolutionLimit>,
    ) -> ScaleRequest {
        let sweeps = self
            .tables
            .iter()
            .map(|(key, table)| {
                let d_min = limits.get(key).map(|l| l.d_min);
                let reflections = match d_min {
                    Some(d) => table.truncated(d).into_rows(),
                    None => table.reflections().to_vec(),
                };
                ScaleInput {
                    sweep: key.clone(),
                    dose_offset: self.dose.offset(key).unwrap_or(0.0),
                    d_min,
                    reflections,
                }
            })
            .collect();
        ScaleRequest {
            lattice,
            corrections,
            sweeps,
        }
    }

    /// Fresh limit for one sweep, falling back to the Wilson extrapolation
    /// when no ordinary criterion cut the data.
    fn estimate_limit(&self, key: &SweepKey, result: &ScaleResult) -> Result<ResolutionLimit> {
        let stats = result.stats_for(key).ok_or_else(|| {
            ReductionError::InsufficientData(format!("scaler reported no statistics for sweep {key}"))
        })?;
        let limit = estimate(key, stats, &self.resolution)?;
        if limit.criterion != Criterion::FullResolution {
            return Ok(limit);
        }

        let Some((_, table)) = self.tables.iter().find(|(k, _)| k == key) else {
            return Ok(limit);
        };
        let wilson = table
            .resolution_shells(WILSON_SHELLS)
            .and_then(|shells| wilson_cutoff(&shells, self.damage.wilson_trigger_isigma));
        match wilson {
            Ok(Some(d)) if d > limit.d_min => {
                info!(sweep = %key, d_min = d, "Data outside Wilson regime, extrapolating cutoff");
                Ok(ResolutionLimit {
                    d_min: d,
                    criterion: Criterion::Wilson,
                    ..limit
                })
            }
            Ok(_) => Ok(limit),
            Err(e) if e.is_recoverable() => {
                debug!(sweep = %key, error = %e, "Wilson check skipped");
                Ok(limit)
            }
            Err(e) => Err(e),
        }
    }

    fn locate_damage(&self, result: &ScaleResult, shared: &mut SharedState) -> Result<()> {
        shared.cutoffs.clear();
        let samples = self.dose.samples(&result.batches);
        let analysis = match detect_onset(&samples, &self.damage) {
            Ok(analysis) => analysis,
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Damage onset undeterminable, using all data");
                shared.damage = None;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(onset) = analysis.onset_dose {
            for (key, _) in &self.tables {
                let Some((_, end)) = self.dose.range(key) else {
                    continue;
                };
                if onset <= end {
                    shared.cutoffs.insert(
                        key.clone(),
                        SweepCutoff {
                            sweep: key.clone(),
                            dose: onset,
                            first_damaged_batch: self.dose.batch_at(key, onset),
                        },
                    );
                }
            }
        }
        shared.damage = Some(analysis);
        Ok(())
    }
}

impl Stage for ScalingStage {
    type Context = ScalingContext;
    type Output = ScalingOutput;

    fn id(&self) -> StageId {
        StageId::Scaling
    }

    fn prepare(&mut self, ctx: &mut ScalingContext) -> Result<Step<()>> {
        let round = reconcile_round(&mut ctx.sweeps[..], self.symmetry.as_ref())?;
        let to_reset = round.sweeps_to_reset();
        let needs_retry = round.needs_retry();
        ctx.shared.lattice = Some(round);

        if needs_retry {
            for key in &to_reset {
                if let Some(sweep) = ctx.sweep_mut(key) {
                    sweep.reset_from(StageId::Indexing);
                }
            }
            info!(reset = to_reset.len(), "Lattice reassigned, repeating reconciliation");
            return Ok(Step::retry_prepare("lattice reassigned"));
        }

        self.tables = ctx
            .sweeps
            .iter_mut()
            .map(|s| -> Result<_> { Ok((s.key().clone(), s.integrated()?)) })
            .collect::<Result<_>>()?;
        let sweeps: Vec<Sweep> = ctx.sweeps.iter().map(|s| s.sweep().clone()).collect();
        self.dose = DoseAxis::from_sweeps(&sweeps);
        Ok(Step::Advance(()))
    }

    fn execute(&mut self, ctx: &mut ScalingContext) -> Result<Step<ScalingOutput>> {
        let lattice = ctx
            .shared
            .lattice
            .as_ref()
            .map(|r| r.lattice)
            .ok_or_else(|| ReductionError::Internal("scaling before lattice reconciliation".to_string()))?;

        let mut trial_results: HashMap<u8, ScaleResult> = HashMap::new();
        let selection = match ctx.shared.selection.clone() {
            Some(selection) => selection,
            None => {
                let limits = &ctx.shared.limits;
                let mut scorer = |model: CorrectionModel| -> std::result::Result<TrialScore, BackendFailure> {
                    let result = self.scaler.scale(&self.request(lattice, model, limits))?;
                    let score = TrialScore {
                        merging_residual: result.merging_residual,
                        convergence_cycles: result.convergence_cycles,
                    };
                    trial_results.insert(model.bits(), result);
                    Ok(score)
                };
                let selection = select_model(
                    &mut scorer,
                    self.scaling.convergence_margin,
                    self.scaling.corrections,
                )?;
                ctx.shared.selection = Some(selection.clone());
                selection
            }
        };

        let corrections = selection.selected;
        let result = match trial_results.remove(&corrections.bits()) {
            Some(result) => result,
            None => self
                .scaler
                .scale(&self.request(lattice, corrections, &ctx.shared.limits))?,
        };
        ctx.shared.rounds += 1;
        info!(
            round = ctx.shared.rounds,
            corrections = %corrections,
            residual = result.merging_residual,
            "Scaled"
        );

        Ok(Step::Advance(ScalingOutput {
            lattice,
            corrections,
            result,
        }))
    }

    fn finish(&mut self, ctx: &mut ScalingContext, output: &mut ScalingOutput) -> Result<Step<()>> {
        let fresh = self
            .tables
            .iter()
            .map(|(key, _)| -> Result<_> {
                Ok((key.clone(), self.estimate_limit(key, &output.result)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let changed = changed_limits(&ctx.shared.limits, &fresh, self.resolution.tolerance);
        for key in &changed {
            if let Some(limit) = fresh.get(key) {
                info!(sweep = %key, d_min = limit.d_min, criterion = ?limit.criterion, "Resolution limit updated");
                ctx.shared.limits.insert(key.clone(), *limit);
            }
        }
        ctx.save_round()?;
        if !changed.is_empty() {
            return Ok(Step::retry_execute("resolution limits changed"));
        }

        self.locate_damage(&output.result, &mut ctx.shared)?;
        Ok(Step::Advance(()))
    }
}
