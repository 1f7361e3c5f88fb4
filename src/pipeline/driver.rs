//! Reduction pipeline driver.
//!
//! Pipeline flow:
//! Sweeps → Index → Refine → Integrate (chunked) → Reconcile lattice →
//! Scale (model search, resolution loop) → Damage analysis → Report
//!
//! The driver owns every stage controller and the shared state, and passes
//! them explicitly to whichever stage needs them.

use super::scaling::{ScalingContext, ScalingOutput, ScalingStage};
use super::sweep::SweepProcessor;
use super::stage::StageController;
use crate::analysis::{CorrectionModel, ModelSelection, SymmetryOracle};
use crate::backend::Backends;
use crate::checkpoint::{CheckpointManager, CheckpointState};
use crate::models::{
    Config, PipelineReport, ReductionError, Result, StageId, StageSnapshot, Sweep, SweepKey,
    SweepLimit,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Full data reduction over a set of sweeps.
pub struct ReductionPipeline {
    run_id: String,
    started_at: DateTime<Utc>,
    context: ScalingContext,
    scaling: StageController<ScalingStage>,
}

impl ReductionPipeline {
    /// Create a pipeline for the sweeps listed in the configuration.
    pub fn new(config: &Config, backends: &Backends, symmetry: Arc<dyn SymmetryOracle>) -> Result<Self> {
        let sweeps = config.sweeps()?;
        Self::with_sweeps(sweeps, config, backends, symmetry)
    }

    pub fn with_sweeps(
        sweeps: Vec<Sweep>,
        config: &Config,
        backends: &Backends,
        symmetry: Arc<dyn SymmetryOracle>,
    ) -> Result<Self> {
        if sweeps.is_empty() {
            return Err(ReductionError::InvalidInput("no sweeps to process".to_string()));
        }

        let processors = sweeps
            .into_iter()
            .map(|sweep| SweepProcessor::new(sweep, backends, Arc::clone(&symmetry), config))
            .collect();
        let scaling = ScalingStage::new(Arc::clone(&backends.scaler), symmetry, config);

        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            context: ScalingContext::new(processors),
            scaling: StageController::new(scaling, config.controller.max_retries),
        })
    }

    /// Show progress bars during chunked integration.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.context.sweeps = std::mem::take(&mut self.context.sweeps)
            .into_iter()
            .map(|s| s.with_progress(progress))
            .collect();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn sweep_keys(&self) -> Vec<SweepKey> {
        self.context.sweeps.iter().map(|s| s.key().clone()).collect()
    }

    /// Persist state under `dir` after every scaling round.
    ///
    /// With `resume`, decisions from an existing checkpoint seed the run.
    pub fn enable_checkpoint(&mut self, dir: &Path, resume: bool) -> Result<()> {
        let mut manager = CheckpointManager::new(dir)?;
        let keys = self.sweep_keys();

        if resume && manager.exists() {
            let state = manager.resume(&keys)?.clone();
            self.seed(&state);
        } else {
            if resume {
                warn!(dir = %dir.display(), "No checkpoint to resume from, starting fresh");
            }
            manager.start(&self.run_id, &keys)?;
        }

        self.context.checkpoint = Some(manager);
        Ok(())
    }

    fn seed(&mut self, state: &CheckpointState) {
        self.run_id = state.run_id.clone();
        if let Some(lattice) = state.lattice {
            for sweep in &mut self.context.sweeps {
                sweep.seed_lattice(lattice);
            }
        }
        let shared = &mut self.context.shared;
        shared.limits = state.limit_map();
        shared.selection = state.corrections.map(|selected| ModelSelection {
            selected,
            trials: Vec::new(),
            manual: false,
        });
        shared.rounds = state.rounds;
    }

    /// Drive every stage to completion.
    pub fn run(&mut self) -> Result<ScalingOutput> {
        let start = Instant::now();
        info!(
            run_id = %self.run_id,
            sweeps = self.context.sweeps.len(),
            "Starting reduction"
        );

        let output = self.scaling.get_result(&mut self.context)?;

        let stages = self.snapshots();
        if let Some(checkpoint) = self.context.checkpoint.as_mut() {
            checkpoint.mark_complete(stages)?;
        }

        info!(
            lattice = %output.lattice,
            corrections = %output.corrections,
            rounds = self.context.shared.rounds,
            damaged_sweeps = self.context.shared.cutoffs.len(),
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Reduction complete"
        );
        Ok(output)
    }

    /// Drive every sweep up to `stage` and return that stage's snapshots.
    pub fn run_stage(&mut self, stage: StageId) -> Result<Vec<StageSnapshot>> {
        if stage == StageId::Scaling {
            self.run()?;
            return Ok(vec![self.scaling.snapshot()]);
        }

        for sweep in &mut self.context.sweeps {
            sweep.run_stage(stage)?;
        }
        Ok(self
            .context
            .sweep_snapshots()
            .into_iter()
            .filter(|s| s.stage == stage)
            .collect())
    }

    /// Decided high-resolution cutoff (Å) per sweep.
    pub fn get_resolution_limits(&self) -> BTreeMap<SweepKey, f64> {
        self.context
            .shared
            .limits
            .iter()
            .map(|(key, limit)| (key.clone(), limit.d_min))
            .collect()
    }

    /// Correction model chosen for scaling; an error until scaling has selected one.
    pub fn get_selected_corrections(&self) -> Result<CorrectionModel> {
        self.context
            .shared
            .selection
            .as_ref()
            .map(|s| s.selected)
            .ok_or_else(|| {
                ReductionError::InvalidInput(
                    "no correction model selected, scaling has not run".to_string(),
                )
            })
    }

    /// Dose at which damage starts within `sweep`, if it does.
    pub fn get_damage_cutoff(&self, sweep: &SweepKey) -> Option<f64> {
        self.context.shared.cutoffs.get(sweep).map(|c| c.dose)
    }

    /// Snapshots of every stage: per-sweep stages first, scaling last.
    pub fn snapshots(&self) -> Vec<StageSnapshot> {
        let mut stages = self.context.sweep_snapshots();
        stages.push(self.scaling.snapshot());
        stages
    }

    /// Summarize the run so far, successful or not.
    pub fn report(&self, error: Option<&ReductionError>) -> PipelineReport {
        let shared = &self.context.shared;
        let mut report = PipelineReport::new(self.run_id.clone());
        report.started_at = self.started_at;
        report.finished_at = Some(Utc::now());
        report.stages = self.snapshots();
        report.lattice = shared.lattice.clone();
        report.resolution_limits = shared
            .limits
            .iter()
            .map(|(sweep, limit)| SweepLimit {
                sweep: sweep.clone(),
                limit: *limit,
            })
            .collect();
        report.corrections = shared.selection.clone();
        report.damage = shared.damage.clone();
        report.damage_cutoffs = shared.cutoffs.values().cloned().collect();

        match error {
            Some(e) => report.record_failure(e),
            None => report.success = self.scaling.record().finished(),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{BravaisTable, Lattice};
    use crate::models::{BackendFailure, StageStatus};
    use crate::pipeline::mock::{self, standard_result, MockBackends, MockIndexer, MockScaler};
    use tempfile::TempDir;

    fn build(backends: &MockBackends, names: &[&str], config: &Config) -> ReductionPipeline {
        let sweeps = names
            .iter()
            .enumerate()
            .map(|(i, name)| mock::sweep(name, 10, i as f64))
            .collect();
        ReductionPipeline::with_sweeps(sweeps, config, &backends.backends(), Arc::new(BravaisTable))
            .unwrap()
    }

    #[test]
    fn test_full_run_exposes_decisions() {
        let config = Config::default();
        let backends = MockBackends::new(MockIndexer::default(), MockScaler::standard());
        let mut pipeline = build(&backends, &["SWEEP1", "SWEEP2"], &config);

        let output = pipeline.run().unwrap();
        assert_eq!(output.lattice, Lattice::TriclinicP);

        let corrections = pipeline.get_selected_corrections().unwrap();
        assert!(corrections.decay && !corrections.absorption && !corrections.partiality);

        let limits = pipeline.get_resolution_limits();
        assert_eq!(limits.len(), 2);
        for d_min in limits.values() {
            assert!((d_min - 1.0 / 0.285f64.sqrt()).abs() < 1e-6);
        }
        assert_eq!(pipeline.get_damage_cutoff(&mock::key("SWEEP1")), None);

        let stages = pipeline.snapshots();
        assert_eq!(stages.len(), 7);
        assert!(stages.iter().all(|s| s.status == StageStatus::Finished));
    }

    #[test]
    fn test_run_stage_stops_before_scaling() {
        let config = Config::default();
        let backends = MockBackends::new(MockIndexer::default(), MockScaler::standard());
        let mut pipeline = build(&backends, &["SWEEP1", "SWEEP2"], &config);

        let snapshots = pipeline.run_stage(StageId::Integration).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.stage == StageId::Integration && s.finished));
        assert_eq!(backends.scaler.call_count(), 0);
        assert!(matches!(
            pipeline.get_selected_corrections(),
            Err(ReductionError::InvalidInput(_))
        ));

        let scaling = pipeline.run_stage(StageId::Scaling).unwrap();
        assert_eq!(scaling.len(), 1);
        assert!(scaling[0].finished);
        // Integration results were reused.
        assert!(pipeline
            .snapshots()
            .iter()
            .filter(|s| s.stage == StageId::Integration)
            .all(|s| s.executions == 1));
    }

    #[test]
    fn test_damage_cutoff_reported_per_sweep() {
        let scaler = MockScaler::new(|request| {
            Ok(standard_result(request, |dose| {
                if dose <= 20.0 {
                    1.0 + 0.01 * dose
                } else {
                    0.2
                }
            }))
        });
        let mut config = Config::default();
        config.damage.bin_width = 2.0;
        let backends = MockBackends::new(MockIndexer::default(), scaler);
        let mut pipeline = build(&backends, &["SWEEP1", "SWEEP2", "SWEEP3"], &config);

        pipeline.run().unwrap();
        assert_eq!(pipeline.get_damage_cutoff(&mock::key("SWEEP1")), None);
        assert_eq!(pipeline.get_damage_cutoff(&mock::key("SWEEP2")), None);
        let cutoff = pipeline.get_damage_cutoff(&mock::key("SWEEP3")).unwrap();
        assert!((cutoff - 21.0).abs() < 1e-9);

        let report = pipeline.report(None);
        assert!(report.success);
        assert_eq!(report.damage_cutoffs.len(), 1);
    }

    #[test]
    fn test_failed_run_still_reports() {
        let scaler = MockScaler::new(|_request| {
            Err(BackendFailure::Rejected {
                backend: "scaler".to_string(),
                message: "no common reflections".to_string(),
            })
        });
        let config = Config::default();
        let backends = MockBackends::new(MockIndexer::default(), scaler);
        let mut pipeline = build(&backends, &["SWEEP1"], &config);

        let err = pipeline.run().unwrap_err();
        let report = pipeline.report(Some(&err));
        assert!(!report.success);
        assert!(report.errors.iter().any(|e| e.contains("no common reflections")));
        assert!(report.lattice.is_some());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/report.json");
        report.save(&path).unwrap();
        let saved: PipelineReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.stages.len(), 4);
        assert_eq!(saved.stages[2].status, StageStatus::Finished);
        assert_eq!(saved.stages[3].status, StageStatus::Prepared);
    }

    #[test]
    fn test_resume_skips_model_search() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();

        let first = MockBackends::new(MockIndexer::default(), MockScaler::standard());
        let mut pipeline = build(&first, &["SWEEP1", "SWEEP2"], &config);
        pipeline.enable_checkpoint(dir.path(), false).unwrap();
        pipeline.run().unwrap();
        let run_id = pipeline.run_id().to_string();

        let mut manager = CheckpointManager::new(dir.path()).unwrap();
        let state = manager.load().unwrap();
        assert!(state.complete);
        assert_eq!(state.rounds, 2);
        assert_eq!(state.lattice, Some(Lattice::TriclinicP));

        let second = MockBackends::new(MockIndexer::default(), MockScaler::standard());
        let mut resumed = build(&second, &["SWEEP1", "SWEEP2"], &config);
        resumed.enable_checkpoint(dir.path(), true).unwrap();
        assert_eq!(resumed.run_id(), run_id);
        resumed.run().unwrap();

        // Seeded model and limits: one scaling run, no trials.
        assert_eq!(second.scaler.call_count(), 1);
        assert_eq!(
            resumed.get_selected_corrections().unwrap(),
            pipeline.get_selected_corrections().unwrap()
        );
        assert_eq!(
            second.indexer.index_calls.lock().unwrap()[0].1,
            Some(Lattice::TriclinicP)
        );
    }

    #[test]
    fn test_no_sweeps_rejected() {
        let config = Config::default();
        let backends = MockBackends::new(MockIndexer::default(), MockScaler::standard());
        let result = ReductionPipeline::with_sweeps(
            Vec::new(),
            &config,
            &backends.backends(),
            Arc::new(BravaisTable),
        );
        assert!(matches!(result, Err(ReductionError::InvalidInput(_))));
    }
}
