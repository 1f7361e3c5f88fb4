//! Correction model selection for final scaling.
//!
//! Epistemic foundation:
//! - K_i: The correction terms form a small fixed set, so the full power set
//!   is enumerable (2^3 = 8 scaling runs)
//! - B_i: A scaling run may fail → scored as worst case, not fatal
//! - I^R: Convergence margin and manual override are configurable

use crate::models::{BackendFailure, ReductionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Which correction terms the scaling backend should refine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrectionModel {
    #[serde(default)]
    pub decay: bool,
    #[serde(default)]
    pub absorption: bool,
    #[serde(default)]
    pub partiality: bool,
}

impl CorrectionModel {
    /// Number of correction terms.
    pub const TERMS: u32 = 3;

    /// Model with every correction switched off.
    pub const BASELINE: CorrectionModel = CorrectionModel {
        decay: false,
        absorption: false,
        partiality: false,
    };

    /// Decode from a bit mask: bit 0 decay, bit 1 absorption, bit 2 partiality.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            decay: bits & 0b001 != 0,
            absorption: bits & 0b010 != 0,
            partiality: bits & 0b100 != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        u8::from(self.decay) | u8::from(self.absorption) << 1 | u8::from(self.partiality) << 2
    }

    /// Every combination in enumeration order, baseline first.
    pub fn power_set() -> Vec<Self> {
        (0..1u8 << Self::TERMS).map(Self::from_bits).collect()
    }

    pub fn is_baseline(&self) -> bool {
        self.bits() == 0
    }
}

impl fmt::Display for CorrectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<&str> = [
            (self.decay, "decay"),
            (self.absorption, "absorption"),
            (self.partiality, "partiality"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();

        if terms.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&terms.join("+"))
        }
    }
}

/// What one scaling run reports back about a correction model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialScore {
    /// Merging residual; lower is better
    pub merging_residual: f64,
    /// Refinement cycles to convergence, if the backend reports them
    pub convergence_cycles: Option<f64>,
}

/// Scored attempt at one correction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrial {
    pub model: CorrectionModel,
    /// Merging residual, `None` when the run failed
    pub score: Option<f64>,
    pub convergence_cycles: Option<f64>,
    /// Dropped for converging too slowly relative to the baseline
    pub discarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ModelTrial {
    /// Residual used for ranking; a failed run ranks as the worst possible.
    pub fn residual(&self) -> f64 {
        self.score.unwrap_or(f64::INFINITY)
    }
}

/// Result of the model search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub selected: CorrectionModel,
    /// Empty when the selection was a manual override
    pub trials: Vec<ModelTrial>,
    pub manual: bool,
}

/// Anything that can run a scaling job for a correction model.
pub trait ModelScorer {
    fn score(&mut self, model: CorrectionModel) -> std::result::Result<TrialScore, BackendFailure>;
}

impl<F> ModelScorer for F
where
    F: FnMut(CorrectionModel) -> std::result::Result<TrialScore, BackendFailure>,
{
    fn score(&mut self, model: CorrectionModel) -> std::result::Result<TrialScore, BackendFailure> {
        self(model)
    }
}

/// Pick the correction model with the lowest merging residual.
///
/// Every combination is scored once. Combinations converging more than
/// `convergence_margin` cycles slower than the baseline are discarded.
/// Ties keep the earlier combination in enumeration order.
pub fn select_model<S: ModelScorer>(
    scorer: &mut S,
    convergence_margin: f64,
    manual: Option<CorrectionModel>,
) -> Result<ModelSelection> {
    if let Some(selected) = manual {
        info!(corrections = %selected, "Using manual correction model");
        return Ok(ModelSelection {
            selected,
            trials: Vec::new(),
            manual: true,
        });
    }

    let mut trials: Vec<ModelTrial> = Vec::with_capacity(1 << CorrectionModel::TERMS);
    let mut last_failure: Option<BackendFailure> = None;

    for model in CorrectionModel::power_set() {
        let trial = match scorer.score(model) {
            Ok(score) => {
                debug!(
                    corrections = %model,
                    residual = score.merging_residual,
                    cycles = ?score.convergence_cycles,
                    "Scored correction model"
                );
                ModelTrial {
                    model,
                    score: Some(score.merging_residual),
                    convergence_cycles: score.convergence_cycles,
                    discarded: false,
                    failure: None,
                }
            }
            Err(e) => {
                warn!(corrections = %model, error = %e, "Scaling failed, scoring as worst case");
                let trial = ModelTrial {
                    model,
                    score: None,
                    convergence_cycles: None,
                    discarded: false,
                    failure: Some(e.to_string()),
                };
                last_failure = Some(e);
                trial
            }
        };
        trials.push(trial);
    }

    if trials.iter().all(|t| t.failure.is_some()) {
        let failure = last_failure.ok_or_else(|| {
            ReductionError::Internal("all trials failed without a failure".to_string())
        })?;
        return Err(ReductionError::Backend(failure));
    }

    let baseline_cycles = trials
        .first()
        .filter(|t| t.model.is_baseline())
        .and_then(|t| t.convergence_cycles);

    if let Some(base) = baseline_cycles {
        for trial in trials.iter_mut() {
            if let Some(cycles) = trial.convergence_cycles {
                if cycles > base + convergence_margin {
                    debug!(corrections = %trial.model, cycles, base, "Discarding slow-converging model");
                    trial.discarded = true;
                }
            }
        }
    }

    let best = trials
        .iter()
        .filter(|t| !t.discarded && t.failure.is_none())
        .fold(None::<&ModelTrial>, |best, t| match best {
            Some(b) if b.residual() <= t.residual() => Some(b),
            _ => Some(t),
        })
        .ok_or_else(|| ReductionError::Internal("no surviving correction model".to_string()))?;

    let selected = best.model;
    info!(corrections = %selected, residual = best.residual(), "Selected correction model");

    Ok(ModelSelection {
        selected,
        trials,
        manual: false,
    })
}
