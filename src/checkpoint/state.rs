//! Checkpoint state for resumable reductions.
//!
//! Epistemic foundation:
//! - K_i: A checkpoint holds the decisions of the last completed scaling round
//! - K_i: State is persisted to disk atomically (write-then-rename)
//! - B_i: Checkpoint file may not exist → Option
//! - B_i: Checkpoint may describe different sweeps → refuse to resume
//! - I^B: Crash during write → backup file provides recovery

use crate::analysis::{CorrectionModel, Lattice, ResolutionLimit};
use crate::models::{ReductionError, Result, StageSnapshot, SweepKey, SweepLimit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Persisted pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run_id: String,
    /// Sweeps the run was started with
    pub sweeps: Vec<SweepKey>,
    /// Scaling rounds completed
    pub rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lattice: Option<Lattice>,
    #[serde(default)]
    pub limits: Vec<SweepLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrections: Option<CorrectionModel>,
    #[serde(default)]
    pub stages: Vec<StageSnapshot>,
    /// Every stage finished
    #[serde(default)]
    pub complete: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(run_id: &str, sweeps: &[SweepKey]) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            sweeps: sweeps.to_vec(),
            rounds: 0,
            lattice: None,
            limits: Vec::new(),
            corrections: None,
            stages: Vec::new(),
            complete: false,
            started_at: now,
            updated_at: now,
        }
    }

    /// Record the outcome of one scaling round.
    pub fn record_round(
        &mut self,
        lattice: Option<Lattice>,
        limits: &BTreeMap<SweepKey, ResolutionLimit>,
        corrections: Option<CorrectionModel>,
        stages: Vec<StageSnapshot>,
    ) {
        self.rounds += 1;
        self.lattice = lattice;
        self.limits = limits
            .iter()
            .map(|(sweep, limit)| SweepLimit {
                sweep: sweep.clone(),
                limit: *limit,
            })
            .collect();
        self.corrections = corrections;
        self.stages = stages;
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self, stages: Vec<StageSnapshot>) {
        self.complete = true;
        self.stages = stages;
        self.updated_at = Utc::now();
    }

    /// Stored limits keyed by sweep.
    pub fn limit_map(&self) -> BTreeMap<SweepKey, ResolutionLimit> {
        self.limits
            .iter()
            .map(|l| (l.sweep.clone(), l.limit))
            .collect()
    }

    /// Check the checkpoint was written for exactly these sweeps.
    pub fn matches(&self, sweeps: &[SweepKey]) -> bool {
        let mut ours = self.sweeps.clone();
        let mut theirs = sweeps.to_vec();
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

/// Checkpoint manager for persisting and loading checkpoint state.
pub struct CheckpointManager {
    dir: PathBuf,
    checkpoint_path: PathBuf,
    backup_path: PathBuf,
    state: Option<CheckpointState>,
}

impl CheckpointManager {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ReductionError::io("creating checkpoint dir", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            checkpoint_path: dir.join("checkpoint.json"),
            backup_path: dir.join("checkpoint.backup.json"),
            state: None,
        })
    }

    /// Check if a checkpoint exists.
    pub fn exists(&self) -> bool {
        self.checkpoint_path.exists()
    }

    /// Begin a fresh checkpoint, replacing any previous one.
    pub fn start(&mut self, run_id: &str, sweeps: &[SweepKey]) -> Result<()> {
        self.state = Some(CheckpointState::new(run_id, sweeps));
        self.save()?;
        info!(path = %self.checkpoint_path.display(), "Created new checkpoint");
        Ok(())
    }

    /// Load the checkpoint and check it belongs to these sweeps.
    pub fn resume(&mut self, sweeps: &[SweepKey]) -> Result<&CheckpointState> {
        let path = self.checkpoint_path.clone();
        let state = self.load()?;
        if !state.matches(sweeps) {
            return Err(ReductionError::InvalidInput(format!(
                "checkpoint {} was written for different sweeps",
                path.display()
            )));
        }
        info!(
            run_id = %state.run_id,
            rounds = state.rounds,
            lattice = ?state.lattice,
            "Resuming from checkpoint"
        );
        Ok(state)
    }

    /// Load checkpoint from disk, falling back to the backup copy.
    pub fn load(&mut self) -> Result<&CheckpointState> {
        let state = match read_state(&self.checkpoint_path) {
            Ok(state) => state,
            Err(e) if self.backup_path.exists() => {
                warn!(error = %e, "Checkpoint unreadable, using backup");
                read_state(&self.backup_path)?
            }
            Err(e) => return Err(e),
        };
        Ok(self.state.insert(state))
    }

    /// Save checkpoint to disk (atomic write).
    pub fn save(&self) -> Result<()> {
        let state = self.state.as_ref().ok_or_else(|| {
            ReductionError::Internal("No checkpoint state to save".to_string())
        })?;

        if self.checkpoint_path.exists() {
            fs::copy(&self.checkpoint_path, &self.backup_path)
                .map_err(|e| ReductionError::io("backing up checkpoint", e))?;
        }

        let temp_path = self.dir.join("checkpoint.tmp.json");
        let file = File::create(&temp_path)
            .map_err(|e| ReductionError::io("creating temp checkpoint", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)
            .map_err(|e| ReductionError::Internal(format!("Serializing checkpoint: {}", e)))?;
        writer
            .flush()
            .map_err(|e| ReductionError::io("flushing temp checkpoint", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| ReductionError::io("syncing temp checkpoint", e))?;

        fs::rename(&temp_path, &self.checkpoint_path)
            .map_err(|e| ReductionError::io("renaming checkpoint", e))?;

        debug!(rounds = state.rounds, "Checkpoint saved");
        Ok(())
    }

    pub fn state(&self) -> Option<&CheckpointState> {
        self.state.as_ref()
    }

    /// Record a scaling round and save.
    pub fn record_round(
        &mut self,
        lattice: Option<Lattice>,
        limits: &BTreeMap<SweepKey, ResolutionLimit>,
        corrections: Option<CorrectionModel>,
        stages: Vec<StageSnapshot>,
    ) -> Result<()> {
        if let Some(state) = &mut self.state {
            state.record_round(lattice, limits, corrections, stages);
        }
        self.save()
    }

    /// Mark the run complete and save.
    pub fn mark_complete(&mut self, stages: Vec<StageSnapshot>) -> Result<()> {
        if let Some(state) = &mut self.state {
            state.mark_complete(stages);
        }
        self.save()
    }
}

fn read_state(path: &Path) -> Result<CheckpointState> {
    let file = File::open(path).map_err(|e| ReductionError::io("opening checkpoint", e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ReductionError::ParseError(format!("Invalid checkpoint {}: {}", path.display(), e)))
}
