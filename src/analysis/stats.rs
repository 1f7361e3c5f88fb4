//! Statistics primitives shared by every decision component.
//!
//! Epistemic foundation:
//! - K_i: Fits are closed-form least squares, no iteration
//! - B_i: Input may be too short or degenerate → `InsufficientData`

use crate::models::{ReductionError, Result};

/// Mean of a slice, `None` when empty.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (n − 1 denominator), `None` below two values.
pub fn variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(ss / (values.len() - 1) as f64)
}

/// Mean and standard deviation; a single value has zero spread.
pub fn mean_and_sd(values: &[f64]) -> Option<(f64, f64)> {
    let m = mean(values)?;
    let sd = variance(values).map(f64::sqrt).unwrap_or(0.0);
    Some((m, sd))
}

/// A group of samples sharing a fixed-width slot along x.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    /// Slot index counted from the binning origin
    pub index: usize,
    /// Centre of the slot along x
    pub center: f64,
    pub count: usize,
    pub mean: f64,
    pub sd: f64,
}

/// Group `(x, y)` samples into slots of `width` starting at `origin`.
///
/// Slots without samples are omitted; the result is ordered by slot index.
pub fn bin_fixed_width(samples: &[(f64, f64)], origin: f64, width: f64) -> Result<Vec<Bin>> {
    if !(width > 0.0) {
        return Err(ReductionError::InvalidInput(format!(
            "bin width must be positive, got {width}"
        )));
    }

    let mut slots: std::collections::BTreeMap<usize, Vec<f64>> = std::collections::BTreeMap::new();
    for &(x, y) in samples {
        if x < origin || !x.is_finite() || !y.is_finite() {
            continue;
        }
        let idx = ((x - origin) / width).floor() as usize;
        slots.entry(idx).or_default().push(y);
    }

    Ok(slots
        .into_iter()
        .filter_map(|(index, ys)| {
            let (mean, sd) = mean_and_sd(&ys)?;
            Some(Bin {
                index,
                center: origin + (index as f64 + 0.5) * width,
                count: ys.len(),
                mean,
                sd,
            })
        })
        .collect())
}

/// Straight line y = intercept + slope · x.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
    /// χ² of the fit (weighted) or residual sum of squares (unweighted)
    pub chi_squared: f64,
    /// Number of points the fit was made from
    pub n: usize,
}

impl LinearFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }

    /// x at which the line reaches `y`, `None` for a flat line.
    pub fn solve_for(&self, y: f64) -> Option<f64> {
        if self.slope == 0.0 {
            return None;
        }
        Some((y - self.intercept) / self.slope)
    }
}

/// Ordinary least-squares straight-line fit.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Result<LinearFit> {
    let weights = vec![1.0; x.len()];
    fit_with_weights(x, y, &weights)
}

/// Maximum-likelihood straight-line fit with weights 1/σ².
pub fn weighted_linear_fit(x: &[f64], y: &[f64], sigma: &[f64]) -> Result<LinearFit> {
    if sigma.len() != x.len() {
        return Err(ReductionError::InvalidInput(format!(
            "{} sigmas for {} points",
            sigma.len(),
            x.len()
        )));
    }
    if let Some(bad) = sigma.iter().find(|s| !(**s > 0.0)) {
        return Err(ReductionError::InvalidInput(format!(
            "non-positive sigma {bad} in weighted fit"
        )));
    }
    let weights: Vec<f64> = sigma.iter().map(|s| 1.0 / (s * s)).collect();
    fit_with_weights(x, y, &weights)
}

fn fit_with_weights(x: &[f64], y: &[f64], w: &[f64]) -> Result<LinearFit> {
    if x.len() != y.len() {
        return Err(ReductionError::InvalidInput(format!(
            "{} x values for {} y values",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 2 {
        return Err(ReductionError::InsufficientData(format!(
            "straight-line fit needs 2 points, got {}",
            x.len()
        )));
    }

    let sw: f64 = w.iter().sum();
    let swx: f64 = w.iter().zip(x).map(|(w, x)| w * x).sum();
    let swy: f64 = w.iter().zip(y).map(|(w, y)| w * y).sum();
    let swxx: f64 = w.iter().zip(x).map(|(w, x)| w * x * x).sum();
    let swxy: f64 = w.iter().zip(x.iter().zip(y)).map(|(w, (x, y))| w * x * y).sum();

    let det = sw * swxx - swx * swx;
    if det.abs() <= f64::EPSILON * sw * swxx.max(1.0) {
        return Err(ReductionError::InsufficientData(
            "straight-line fit is degenerate (all x equal)".to_string(),
        ));
    }

    let slope = (sw * swxy - swx * swy) / det;
    let intercept = (swxx * swy - swx * swxy) / det;
    let chi_squared = w
        .iter()
        .zip(x.iter().zip(y))
        .map(|(w, (x, y))| w * (y - intercept - slope * x).powi(2))
        .sum();

    Ok(LinearFit {
        intercept,
        slope,
        chi_squared,
        n: x.len(),
    })
}

/// Linear interpolation of y at `x` between two points.
pub fn lerp(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if x1 == x0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Inverse linear interpolation: x at which the segment reaches `y`.
pub fn inverse_lerp(x0: f64, y0: f64, x1: f64, y1: f64, y: f64) -> f64 {
    if y1 == y0 {
        return x0;
    }
    x0 + (x1 - x0) * (y - y0) / (y1 - y0)
}

/// Reduced χ² of observations against predictions, `dof` degrees of freedom.
pub fn reduced_chi_squared(observed: &[f64], predicted: &[f64], sigma: &[f64], dof: usize) -> Option<f64> {
    if dof == 0 || observed.len() != predicted.len() || observed.len() != sigma.len() {
        return None;
    }
    let chi2: f64 = observed
        .iter()
        .zip(predicted)
        .zip(sigma)
        .map(|((o, p), s)| ((o - p) / s).powi(2))
        .sum();
    Some(chi2 / dof as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_variance() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&v), Some(5.0));
        assert!((variance(&v).unwrap() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(mean(&[]), None);
        assert_eq!(mean_and_sd(&[3.0]), Some((3.0, 0.0)));
    }

    #[test]
    fn test_linear_fit_exact_line() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let fit = linear_fit(&x, &y).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!(fit.chi_squared < 1e-20);
        assert!((fit.solve_for(0.0).unwrap() + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_fit_ignores_low_weight_outlier() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [0.0, 1.0, 2.0, 3.0, 40.0];
        let sigma = [0.1, 0.1, 0.1, 0.1, 1000.0];
        let fit = weighted_linear_fit(&x, &y, &sigma).unwrap();
        assert!((fit.slope - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_fit_needs_two_distinct_points() {
        assert!(matches!(
            linear_fit(&[1.0], &[1.0]),
            Err(ReductionError::InsufficientData(_))
        ));
        assert!(matches!(
            linear_fit(&[1.0, 1.0], &[1.0, 2.0]),
            Err(ReductionError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_bin_fixed_width_groups_and_skips_empty() {
        let samples = [(0.5, 1.0), (1.5, 2.0), (1.7, 4.0), (5.2, 9.0)];
        let bins = bin_fixed_width(&samples, 0.0, 1.0).unwrap();
        assert_eq!(bins.len(), 3);
        assert_eq!(bins[1].index, 1);
        assert_eq!(bins[1].count, 2);
        assert!((bins[1].mean - 3.0).abs() < 1e-12);
        assert_eq!(bins[2].index, 5);
        assert!((bins[2].center - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_reduced_chi_squared() {
        let chi = reduced_chi_squared(&[3.0, 1.0], &[1.0, 1.0], &[0.5, 1.0], 2).unwrap();
        assert!((chi - 8.0).abs() < 1e-12);
        assert_eq!(reduced_chi_squared(&[1.0], &[1.0], &[1.0], 0), None);
        assert_eq!(reduced_chi_squared(&[1.0], &[1.0, 2.0], &[1.0], 1), None);
    }

    #[test]
    fn test_inverse_lerp() {
        assert!((inverse_lerp(0.0, 10.0, 1.0, 0.0, 2.5) - 0.75).abs() < 1e-12);
        assert!((lerp(0.0, 10.0, 1.0, 0.0, 0.75) - 2.5).abs() < 1e-12);
    }
}
