//! Run report and stage snapshots.
//!
//! K_i: A report is written for every run, including failed ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{ReductionError, Result, StageId, SweepKey};
use crate::analysis::{DamageAnalysis, ModelSelection, Reconciliation, ResolutionLimit};

/// Payload-free view of a stage's lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Unprepared,
    Prepared,
    Done,
    Finished,
}

/// Serializable snapshot of a stage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepKey>,
    pub status: StageStatus,
    pub prepared: bool,
    pub done: bool,
    pub finished: bool,
    /// External resets received
    pub resets: u32,
    /// Times the execute phase has completed
    pub executions: u32,
}

/// Resolution limit of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepLimit {
    pub sweep: SweepKey,
    #[serde(flatten)]
    pub limit: ResolutionLimit,
}

/// Where radiation damage starts within one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepCutoff {
    pub sweep: SweepKey,
    /// Dose at the damage onset
    pub dose: f64,
    /// First batch at or beyond the onset
    pub first_damaged_batch: Option<u32>,
}

/// Everything known about a run, complete or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,

    pub stages: Vec<StageSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lattice: Option<Reconciliation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolution_limits: Vec<SweepLimit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrections: Option<ModelSelection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<DamageAnalysis>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub damage_cutoffs: Vec<SweepCutoff>,

    /// Error chain of the failure that stopped the run, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl PipelineReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            stages: Vec::new(),
            lattice: None,
            resolution_limits: Vec::new(),
            corrections: None,
            damage: None,
            damage_cutoffs: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Record the error that stopped the run.
    pub fn record_failure(&mut self, error: &ReductionError) {
        self.success = false;
        self.errors.clear();
        let mut current: Option<&dyn std::error::Error> = Some(error);
        while let Some(e) = current {
            self.errors.push(e.to_string());
            current = e.source();
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ReductionError::io(format!("creating {}", parent.display()), e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ReductionError::Internal(format!("serializing report: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| ReductionError::io(format!("writing report {}", path.display()), e))
    }
}
