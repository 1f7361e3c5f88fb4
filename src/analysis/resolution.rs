//! Resolution limit estimation from merging statistics.
//!
//! Epistemic foundation:
//! - K_i: Each criterion is a threshold on a per-shell statistic
//! - B_i: The statistic may never cross the threshold → candidate undefined
//! - I^R: Thresholds and per-sweep overrides come from configuration

use super::stats::inverse_lerp;
use crate::models::{
    s_to_d, MergingStats, ReductionError, ResolutionBin, ResolutionConfig, Result, SweepKey,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Ice-ring bands in 1/d² (Å⁻²), excluded from smooth falloff fits.
pub const ICE_RINGS: [(f64, f64); 10] = [
    (0.0638, 0.0678), // 3.897 Å
    (0.0723, 0.0763), // 3.669 Å
    (0.0825, 0.0865), // 3.441 Å
    (0.1382, 0.1422), // 2.671 Å
    (0.1957, 0.1997), // 2.249 Å
    (0.2309, 0.2349), // 2.072 Å
    (0.2615, 0.2655), // 1.948 Å
    (0.2698, 0.2738), // 1.918 Å
    (0.2800, 0.2840), // 1.883 Å
    (0.3356, 0.3396), // 1.721 Å
];

/// Whether 1/d² falls inside an ice-ring band.
pub fn in_ice_ring(s: f64) -> bool {
    ICE_RINGS.iter().any(|(lo, hi)| s >= *lo && s <= *hi)
}

/// Drop shells whose midpoint lies in an ice ring.
pub fn exclude_ice_rings(bins: &[ResolutionBin]) -> Vec<&ResolutionBin> {
    bins.iter().filter(|b| !in_ice_ring(b.s_mid())).collect()
}

/// Which rule decided a resolution limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Completeness,
    Rmerge,
    UnmergedIsigma,
    MergedIsigma,
    /// User-specified override
    User,
    /// No criterion cut the data
    FullResolution,
    /// Extrapolated from the I/σ falloff of data outside the Wilson regime
    Wilson,
}

impl Criterion {
    pub const COMPUTED: [Criterion; 4] = [
        Self::Completeness,
        Self::Rmerge,
        Self::UnmergedIsigma,
        Self::MergedIsigma,
    ];

    /// Statistic this criterion thresholds, for one shell.
    fn value(self, bin: &ResolutionBin) -> Option<f64> {
        match self {
            Self::Completeness => bin.completeness,
            Self::Rmerge => bin.rmerge,
            Self::UnmergedIsigma => Some(bin.mean_isigma),
            Self::MergedIsigma => bin.merged_isigma,
            Self::User | Self::FullResolution | Self::Wilson => None,
        }
    }

    /// Whether a value is on the wrong side of the threshold.
    fn fails(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Rmerge => value > threshold,
            _ => value < threshold,
        }
    }
}

/// Candidate cutoffs (d, Å) from each criterion; `None` = never crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionCandidates {
    pub completeness: Option<f64>,
    pub rmerge: Option<f64>,
    pub unmerged_isigma: Option<f64>,
    pub merged_isigma: Option<f64>,
}

impl ResolutionCandidates {
    fn set(&mut self, criterion: Criterion, d: Option<f64>) {
        match criterion {
            Criterion::Completeness => self.completeness = d,
            Criterion::Rmerge => self.rmerge = d,
            Criterion::UnmergedIsigma => self.unmerged_isigma = d,
            Criterion::MergedIsigma => self.merged_isigma = d,
            Criterion::User | Criterion::FullResolution | Criterion::Wilson => {}
        }
    }

    fn iter(&self) -> impl Iterator<Item = (Criterion, Option<f64>)> {
        [
            (Criterion::Completeness, self.completeness),
            (Criterion::Rmerge, self.rmerge),
            (Criterion::UnmergedIsigma, self.unmerged_isigma),
            (Criterion::MergedIsigma, self.merged_isigma),
        ]
        .into_iter()
    }

    /// Most conservative defined candidate: the largest d.
    pub fn most_conservative(&self) -> Option<(f64, Criterion)> {
        self.iter()
            .filter_map(|(c, d)| d.map(|d| (d, c)))
            .fold(None, |best: Option<(f64, Criterion)>, (d, c)| match best {
                Some((bd, _)) if bd >= d => best,
                _ => Some((d, c)),
            })
    }
}

/// Selected high-resolution cutoff for one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLimit {
    /// Cutoff d-spacing in Å
    pub d_min: f64,
    /// Rule that decided it
    pub criterion: Criterion,
    /// Every computed candidate
    pub candidates: ResolutionCandidates,
}

/// d at which a criterion crosses its threshold, by linear interpolation in 1/d².
///
/// Shells are walked from low to high resolution. If the very first shell
/// already fails, the data never reached the threshold and the candidate is
/// undefined, as it is when no shell fails.
pub fn criterion_cutoff(bins: &[ResolutionBin], criterion: Criterion, threshold: f64) -> Option<f64> {
    let points: Vec<(f64, f64)> = bins
        .iter()
        .filter_map(|b| criterion.value(b).map(|v| (b.s_mid(), v)))
        .filter(|(_, v)| v.is_finite())
        .collect();

    let (first_s, first_v) = *points.first()?;
    if criterion.fails(first_v, threshold) {
        warn!(
            criterion = ?criterion,
            threshold,
            value = first_v,
            d = s_to_d(first_s),
            "Lowest shell already past threshold, accepting full resolution"
        );
        return None;
    }

    points.windows(2).find_map(|pair| {
        let (s0, v0) = pair[0];
        let (s1, v1) = pair[1];
        if !criterion.fails(v0, threshold) && criterion.fails(v1, threshold) {
            let s = inverse_lerp(s0, v0, s1, v1, threshold);
            Some(s_to_d(s))
        } else {
            None
        }
    })
}

/// Compute all four candidates for one table of merging statistics.
pub fn candidates(stats: &MergingStats, config: &ResolutionConfig) -> ResolutionCandidates {
    let mut out = ResolutionCandidates::default();
    for criterion in Criterion::COMPUTED {
        if let Some(threshold) = config.threshold(criterion) {
            out.set(criterion, criterion_cutoff(&stats.bins, criterion, threshold));
        }
    }
    out
}

/// Select the resolution limit for one sweep.
///
/// A user override wins unconditionally; otherwise the most conservative
/// candidate, falling back to the table's own highest resolution.
pub fn estimate(
    key: &SweepKey,
    stats: &MergingStats,
    config: &ResolutionConfig,
) -> Result<ResolutionLimit> {
    let computed = candidates(stats, config);

    if let Some(d_min) = config.override_for(key) {
        debug!(sweep = %key, d_min, "Using user resolution limit");
        return Ok(ResolutionLimit {
            d_min,
            criterion: Criterion::User,
            candidates: computed,
        });
    }

    if let Some((d_min, criterion)) = computed.most_conservative() {
        debug!(sweep = %key, d_min, criterion = ?criterion, "Resolution limit estimated");
        return Ok(ResolutionLimit {
            d_min,
            criterion,
            candidates: computed,
        });
    }

    let d_min = stats.d_max_resolution().ok_or_else(|| {
        ReductionError::InsufficientData(format!("no merging statistics for sweep {key}"))
    })?;
    debug!(sweep = %key, d_min, "No criterion cut the data, using full resolution");
    Ok(ResolutionLimit {
        d_min,
        criterion: Criterion::FullResolution,
        candidates: computed,
    })
}

/// Sweeps whose new limit differs from the stored one beyond `tolerance`.
pub fn changed_limits(
    stored: &BTreeMap<SweepKey, ResolutionLimit>,
    fresh: &BTreeMap<SweepKey, ResolutionLimit>,
    tolerance: f64,
) -> Vec<SweepKey> {
    fresh
        .iter()
        .filter(|(key, new)| match stored.get(*key) {
            Some(old) => (old.d_min - new.d_min).abs() > tolerance,
            None => true,
        })
        .map(|(key, _)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::d_to_s;

    /// Shells of width `w` in 1/d², with I/σ falling linearly in s.
    fn falling_isigma(n: usize, w: f64, i0: f64, slope: f64) -> Vec<ResolutionBin> {
        (0..n)
            .map(|i| {
                let s_low = i as f64 * w;
                let s_mid = s_low + 0.5 * w;
                ResolutionBin {
                    s_low,
                    s_high: s_low + w,
                    count: 100,
                    mean_isigma: i0 - slope * s_mid,
                    sd_isigma: 1.0,
                    merged_isigma: None,
                    completeness: Some(1.0),
                    rmerge: Some(0.05),
                }
            })
            .collect()
    }

    #[test]
    fn test_interpolation_recovers_crossing() {
        // I/σ = 20 − 100 s crosses 1.0 at s = 0.19 → d ≈ 2.294 Å.
        let width = 0.02;
        let bins = falling_isigma(15, width, 20.0, 100.0);
        let d = criterion_cutoff(&bins, Criterion::UnmergedIsigma, 1.0).unwrap();
        let expected_s: f64 = 0.19;
        assert!((d_to_s(d) - expected_s).abs() <= width);
        assert!((d - 1.0 / expected_s.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_never_crossing_is_undefined() {
        let bins = falling_isigma(5, 0.02, 20.0, 10.0);
        assert_eq!(criterion_cutoff(&bins, Criterion::UnmergedIsigma, 1.0), None);
    }

    #[test]
    fn test_weak_data_accepted_at_full_resolution() {
        // Best shell has I/σ 0.8 < 1: never exceeds the threshold.
        let bins = falling_isigma(5, 0.02, 0.8, 1.0);
        assert_eq!(criterion_cutoff(&bins, Criterion::UnmergedIsigma, 1.0), None);

        let key = SweepKey::new("p", "x", "d", "s");
        let stats = MergingStats::new(bins);
        let limit = estimate(&key, &stats, &ResolutionConfig::default()).unwrap();
        assert_eq!(limit.criterion, Criterion::FullResolution);
        assert!((limit.d_min - s_to_d(0.1)).abs() < 1e-9);
    }

    #[test]
    fn test_most_conservative_candidate_wins() {
        let candidates = ResolutionCandidates {
            completeness: Some(2.1),
            rmerge: Some(2.0),
            unmerged_isigma: Some(1.8),
            merged_isigma: None,
        };
        assert_eq!(
            candidates.most_conservative(),
            Some((2.1, Criterion::Completeness))
        );
        assert_eq!(ResolutionCandidates::default().most_conservative(), None);
    }

    #[test]
    fn test_rmerge_cuts_when_exceeding() {
        let mut bins = falling_isigma(10, 0.02, 50.0, 1.0);
        for (i, bin) in bins.iter_mut().enumerate() {
            bin.rmerge = Some(0.2 * i as f64);
        }
        // Rmerge crosses 1.0 between shells 5 and 6.
        let d = criterion_cutoff(&bins, Criterion::Rmerge, 1.0).unwrap();
        let s = d_to_s(d);
        assert!(s > bins[5].s_low && s <= bins[5].s_high + 1e-12);
    }

    #[test]
    fn test_user_override_takes_precedence() {
        let key = SweepKey::new("p", "x", "d", "s");
        let mut config = ResolutionConfig::default();
        config.overrides.insert(key.to_string(), 3.0);

        let stats = MergingStats::new(falling_isigma(15, 0.02, 20.0, 100.0));
        let limit = estimate(&key, &stats, &config).unwrap();
        assert_eq!(limit.criterion, Criterion::User);
        assert_eq!(limit.d_min, 3.0);
        assert!(limit.candidates.unmerged_isigma.is_some());
    }

    #[test]
    fn test_empty_table_is_insufficient() {
        let key = SweepKey::new("p", "x", "d", "s");
        let err = estimate(&key, &MergingStats::default(), &ResolutionConfig::default()).unwrap_err();
        assert!(matches!(err, ReductionError::InsufficientData(_)));
    }

    #[test]
    fn test_changed_limits_respects_tolerance() {
        let key = SweepKey::new("p", "x", "d", "s");
        let limit = |d| ResolutionLimit {
            d_min: d,
            criterion: Criterion::UnmergedIsigma,
            candidates: ResolutionCandidates::default(),
        };
        let stored = BTreeMap::from([(key.clone(), limit(2.0))]);
        let same = BTreeMap::from([(key.clone(), limit(2.001))]);
        let moved = BTreeMap::from([(key.clone(), limit(2.2))]);
        assert!(changed_limits(&stored, &same, 0.005).is_empty());
        assert_eq!(changed_limits(&stored, &moved, 0.005), vec![key]);
    }

    #[test]
    fn test_ice_rings() {
        assert!(in_ice_ring(d_to_s(3.669)));
        assert!(!in_ice_ring(d_to_s(3.0)));
    }
}
