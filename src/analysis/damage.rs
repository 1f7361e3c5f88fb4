//! Radiation damage detection along the dose axis.
//!
//! Epistemic foundation:
//! - K_i: An undamaged crystal gives a damage indicator that drifts linearly with dose
//! - B_i: The first bin that departs from the linear trend marks the onset
//! - I^B: Too few bins to fit → `InsufficientData`, callers fall back to "use all data"

use super::resolution::exclude_ice_rings;
use super::stats::{bin_fixed_width, linear_fit, reduced_chi_squared, weighted_linear_fit, LinearFit};
use crate::models::{
    s_to_d, BatchStatistic, DamageConfig, DoseSample, ReductionError, ResolutionBin, Result, Sweep,
    SweepKey,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One dose bin with its χ² against the fit of all earlier bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageBin {
    pub index: usize,
    /// Dose at the bin centre
    pub dose: f64,
    pub count: usize,
    pub mean: f64,
    /// Standard deviation after flooring
    pub sigma: f64,
    /// Reduced χ² of this bin against the prefix fit; `None` inside the seed prefix
    pub chi_squared: Option<f64>,
}

/// Outcome of the dose-axis analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageAnalysis {
    pub bins: Vec<DamageBin>,
    /// Position in `bins` of the first damaged bin
    pub onset: Option<usize>,
    /// Lower dose edge of the first damaged bin
    pub onset_dose: Option<f64>,
}

impl DamageAnalysis {
    pub fn is_damaged(&self) -> bool {
        self.onset.is_some()
    }
}

/// Index of the first χ² strictly above `threshold`; `None` entries never exceed.
pub fn first_exceedance<I>(chi_squared: I, threshold: f64) -> Option<usize>
where
    I: IntoIterator<Item = Option<f64>>,
{
    chi_squared
        .into_iter()
        .position(|chi| chi.is_some_and(|c| c > threshold))
}

/// Locate the point along the dose axis where the indicator stops being linear.
pub fn detect_onset(samples: &[DoseSample], config: &DamageConfig) -> Result<DamageAnalysis> {
    let origin = samples
        .iter()
        .map(|s| s.dose)
        .filter(|d| d.is_finite())
        .fold(f64::INFINITY, f64::min);
    if !origin.is_finite() {
        return Err(ReductionError::InsufficientData(
            "no dose samples".to_string(),
        ));
    }

    let points: Vec<(f64, f64)> = samples.iter().map(|s| (s.dose, s.value)).collect();
    let grouped = bin_fixed_width(&points, origin, config.bin_width)?;

    let seed = config.leading_offset + 2;
    if grouped.len() <= seed {
        return Err(ReductionError::InsufficientData(format!(
            "damage analysis needs more than {seed} dose bins, got {}",
            grouped.len()
        )));
    }

    let mut bins: Vec<DamageBin> = grouped
        .into_iter()
        .map(|b| DamageBin {
            index: b.index,
            dose: b.center,
            count: b.count,
            mean: b.mean,
            sigma: b.sd.max(config.sigma_floor),
            chi_squared: None,
        })
        .collect();

    for k in seed..bins.len() {
        let prefix = &bins[config.leading_offset..k];
        let x: Vec<f64> = prefix.iter().map(|b| b.dose).collect();
        let y: Vec<f64> = prefix.iter().map(|b| b.mean).collect();
        let sigma: Vec<f64> = prefix.iter().map(|b| b.sigma).collect();
        let fit: LinearFit = weighted_linear_fit(&x, &y, &sigma)?;

        let next = &bins[k];
        bins[k].chi_squared =
            reduced_chi_squared(&[next.mean], &[fit.predict(next.dose)], &[next.sigma], 1);
    }

    let onset = first_exceedance(
        bins.iter().map(|b| b.chi_squared),
        config.chi_squared_threshold,
    );
    let onset_dose = onset.map(|i| bins[i].dose - 0.5 * config.bin_width);

    match onset {
        Some(i) => info!(
            bin = bins[i].index,
            dose = onset_dose,
            chi_squared = bins[i].chi_squared,
            "Radiation damage onset detected"
        ),
        None => debug!(bins = bins.len(), "No radiation damage detected"),
    }

    Ok(DamageAnalysis {
        bins,
        onset,
        onset_dose,
    })
}

/// Dose assigned to every batch: images counted cumulatively in epoch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DoseAxis {
    /// Per sweep: (dose before its first image, first image, last image)
    offsets: BTreeMap<SweepKey, (f64, u32, u32)>,
}

impl DoseAxis {
    pub fn from_sweeps(sweeps: &[Sweep]) -> Self {
        let mut ordered: Vec<&Sweep> = sweeps.iter().collect();
        ordered.sort_by(|a, b| a.epoch.total_cmp(&b.epoch));

        let mut offsets = BTreeMap::new();
        let mut dose = 0.0;
        for sweep in ordered {
            offsets.insert(sweep.key.clone(), (dose, sweep.first_image, sweep.last_image));
            dose += f64::from(sweep.image_count());
        }
        Self { offsets }
    }

    /// Dose before the sweep's first image.
    pub fn offset(&self, sweep: &SweepKey) -> Option<f64> {
        self.offsets.get(sweep).map(|(offset, _, _)| *offset)
    }

    /// Dose range (exclusive start, inclusive end) covered by a sweep.
    pub fn range(&self, sweep: &SweepKey) -> Option<(f64, f64)> {
        let (offset, first, last) = *self.offsets.get(sweep)?;
        Some((offset, offset + f64::from(last - first) + 1.0))
    }

    /// Dose at a batch of a sweep, `None` outside the sweep.
    pub fn dose(&self, sweep: &SweepKey, batch: u32) -> Option<f64> {
        let (offset, first, last) = *self.offsets.get(sweep)?;
        if batch < first || batch > last {
            return None;
        }
        Some(offset + f64::from(batch - first) + 1.0)
    }

    /// First batch of a sweep at or beyond `dose`, `None` if the sweep ends earlier.
    pub fn batch_at(&self, sweep: &SweepKey, dose: f64) -> Option<u32> {
        let (offset, first, last) = *self.offsets.get(sweep)?;
        let end = offset + f64::from(last - first) + 1.0;
        if dose > end {
            return None;
        }
        let steps = (dose - offset - 1.0).ceil().max(0.0) as u32;
        Some(first + steps.min(last - first))
    }

    /// Convert per-batch statistics into (dose, indicator) samples.
    ///
    /// The indicator is the product of the batch scale and B-factor.
    pub fn samples(&self, stats: &[BatchStatistic]) -> Vec<DoseSample> {
        stats
            .iter()
            .filter_map(|s| {
                self.dose(&s.sweep, s.batch).map(|dose| DoseSample {
                    dose,
                    value: s.scale * s.bfactor,
                })
            })
            .collect()
    }
}

/// Resolution cutoff from a Wilson-like fit, for data not yet in the Wilson regime.
///
/// Fits ln⟨I/σ⟩ against 1/d² over ice-free shells and returns the d where the
/// line reaches I/σ = 1. Returns `None` when some shell is already at or below
/// `trigger` (ordinary criteria apply) or the trend does not fall.
pub fn wilson_cutoff(bins: &[ResolutionBin], trigger: f64) -> Result<Option<f64>> {
    let usable: Vec<&ResolutionBin> = exclude_ice_rings(bins)
        .into_iter()
        .filter(|b| b.mean_isigma.is_finite() && b.count > 0)
        .collect();
    if usable.len() < 2 {
        return Err(ReductionError::InsufficientData(format!(
            "Wilson fit needs 2 shells outside ice rings, got {}",
            usable.len()
        )));
    }

    if usable.iter().any(|b| b.mean_isigma <= trigger) {
        return Ok(None);
    }

    let x: Vec<f64> = usable.iter().map(|b| b.s_mid()).collect();
    let y: Vec<f64> = usable.iter().map(|b| b.mean_isigma.ln()).collect();
    let fit = linear_fit(&x, &y)?;
    if fit.slope >= 0.0 {
        return Ok(None);
    }

    Ok(fit.solve_for(0.0).filter(|s| *s > 0.0).map(s_to_d))
}
