//! Sweep and measurement types for sweepctl.
//!
//! K_i: These types represent the core data flow through the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a sweep: (project, crystal, dataset, sweep name).
///
/// K_i: Equality, hashing and ordering are structural over the four names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SweepKey {
    pub project: String,
    pub crystal: String,
    pub dataset: String,
    pub sweep: String,
}

impl SweepKey {
    pub fn new(
        project: impl Into<String>,
        crystal: impl Into<String>,
        dataset: impl Into<String>,
        sweep: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            crystal: crystal.into(),
            dataset: dataset.into(),
            sweep: sweep.into(),
        }
    }
}

impl fmt::Display for SweepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project, self.crystal, self.dataset, self.sweep
        )
    }
}

impl FromStr for SweepKey {
    type Err = String;

    /// Parse `project/crystal/dataset/sweep`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').map(str::trim).collect();
        match parts.as_slice() {
            [p, x, d, w] if parts.iter().all(|s| !s.is_empty()) => Ok(Self::new(*p, *x, *d, *w)),
            _ => Err(format!(
                "expected project/crystal/dataset/sweep, got '{s}'"
            )),
        }
    }
}

/// One contiguous block of measurements.
///
/// K_i: Identity is immutable; the backend payload is free-form and mutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    /// Identifying tuple
    pub key: SweepKey,

    /// Collection order key (earlier epoch → measured first)
    #[serde(default)]
    pub epoch: f64,

    /// First image (batch) number, inclusive
    pub first_image: u32,

    /// Last image (batch) number, inclusive
    pub last_image: u32,

    /// Oscillation width per image in degrees
    #[serde(default = "default_oscillation")]
    pub oscillation: f64,

    /// Optional spacegroup hint passed to the indexer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacegroup: Option<String>,

    /// Backend-specific payload, passed through to every job
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

fn default_oscillation() -> f64 {
    1.0
}

impl Sweep {
    pub fn new(key: SweepKey, first_image: u32, last_image: u32) -> Self {
        Self {
            key,
            epoch: 0.0,
            first_image,
            last_image,
            oscillation: default_oscillation(),
            spacegroup: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Number of images in the sweep.
    pub fn image_count(&self) -> u32 {
        self.last_image.saturating_sub(self.first_image) + 1
    }

    /// Total rotation covered by the sweep in degrees.
    pub fn total_rotation(&self) -> f64 {
        f64::from(self.image_count()) * self.oscillation
    }
}

/// A single measured reflection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    /// Resolution d-spacing in Å
    pub d: f64,
    /// Measured intensity
    pub intensity: f64,
    /// Standard uncertainty of the intensity
    pub sigma: f64,
    /// Batch (image) number
    pub batch: u32,
}

impl Reflection {
    /// Reciprocal resolution squared, 1/d².
    pub fn s(&self) -> f64 {
        1.0 / (self.d * self.d)
    }

    /// I/σ(I), zero for non-positive sigma.
    pub fn i_over_sigma(&self) -> f64 {
        if self.sigma > 0.0 {
            self.intensity / self.sigma
        } else {
            0.0
        }
    }
}

/// Merging statistics for one resolution shell.
///
/// K_i: Bins are keyed by s = 1/d²; a bin is never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionBin {
    /// Lower edge in 1/d²
    pub s_low: f64,
    /// Upper edge in 1/d²
    pub s_high: f64,
    /// Number of observations in the shell
    #[serde(default)]
    pub count: usize,
    /// Mean unmerged I/σ(I)
    pub mean_isigma: f64,
    /// Standard deviation of unmerged I/σ(I)
    #[serde(default)]
    pub sd_isigma: f64,
    /// Mean merged I/σ(I)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_isigma: Option<f64>,
    /// Completeness as a fraction in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness: Option<f64>,
    /// Merging residual (Rmerge)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmerge: Option<f64>,
}

impl ResolutionBin {
    /// Midpoint of the shell in 1/d².
    pub fn s_mid(&self) -> f64 {
        0.5 * (self.s_low + self.s_high)
    }

    /// Width of the shell in 1/d².
    pub fn width(&self) -> f64 {
        self.s_high - self.s_low
    }

    /// d-spacing at the shell midpoint.
    pub fn d_mid(&self) -> f64 {
        s_to_d(self.s_mid())
    }
}

/// Convert 1/d² to d in Å.
pub fn s_to_d(s: f64) -> f64 {
    if s > 0.0 {
        1.0 / s.sqrt()
    } else {
        f64::INFINITY
    }
}

/// Convert d in Å to 1/d².
pub fn d_to_s(d: f64) -> f64 {
    1.0 / (d * d)
}

/// Merging statistics table for one dataset, shells ordered low → high resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergingStats {
    pub bins: Vec<ResolutionBin>,
}

impl MergingStats {
    pub fn new(mut bins: Vec<ResolutionBin>) -> Self {
        bins.sort_by(|a, b| a.s_low.total_cmp(&b.s_low));
        Self { bins }
    }

    /// Highest resolution (smallest d) present in the table.
    pub fn d_max_resolution(&self) -> Option<f64> {
        self.bins.last().map(|b| s_to_d(b.s_high))
    }
}

/// Per-batch statistics reported by the scaling backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistic {
    pub sweep: SweepKey,
    pub batch: u32,
    /// Refined scale factor for the batch
    pub scale: f64,
    /// Refined relative B-factor for the batch
    pub bfactor: f64,
    /// Merging residual of the batch
    #[serde(default)]
    pub rmerge: f64,
}

/// (dose, damage metric) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoseSample {
    pub dose: f64,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_key_round_trips_through_display() {
        let key = SweepKey::new("AUTOMATIC", "DEFAULT", "NATIVE", "SWEEP1");
        let parsed: SweepKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_sweep_key_rejects_partial_tuple() {
        assert!("a/b/c".parse::<SweepKey>().is_err());
        assert!("a//c/d".parse::<SweepKey>().is_err());
    }

    #[test]
    fn test_merging_stats_sorted_by_resolution() {
        let bin = |lo: f64, hi: f64| ResolutionBin {
            s_low: lo,
            s_high: hi,
            count: 1,
            mean_isigma: 1.0,
            sd_isigma: 0.0,
            merged_isigma: None,
            completeness: None,
            rmerge: None,
        };
        let stats = MergingStats::new(vec![bin(0.2, 0.3), bin(0.0, 0.1), bin(0.1, 0.2)]);
        let lows: Vec<f64> = stats.bins.iter().map(|b| b.s_low).collect();
        assert_eq!(lows, vec![0.0, 0.1, 0.2]);
        assert!((stats.d_max_resolution().unwrap() - s_to_d(0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_image_count_inclusive() {
        let sweep = Sweep::new(SweepKey::new("p", "x", "d", "s"), 1, 90);
        assert_eq!(sweep.image_count(), 90);
        assert!((sweep.total_rotation() - 90.0).abs() < 1e-12);
    }
}
