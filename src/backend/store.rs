//! Reflection storage.
//!
//! Epistemic foundation:
//! - K_i: Integrated reflections are append-only; chunks are merged in image order
//! - B_i: A stored file may be truncated or malformed → `ParseError`

use crate::analysis::stats;
use crate::models::{ReductionError, Reflection, ResolutionBin, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Read access to a sweep's integrated reflections.
pub trait ReflectionStore {
    fn reflections(&self) -> &[Reflection];

    fn len(&self) -> usize {
        self.reflections().len()
    }

    fn is_empty(&self) -> bool {
        self.reflections().is_empty()
    }

    /// Unmerged I/σ statistics in `shells` equal-width shells of 1/d².
    ///
    /// Empty shells are skipped.
    fn resolution_shells(&self, shells: usize) -> Result<Vec<ResolutionBin>> {
        let reflections = self.reflections();
        if reflections.is_empty() || shells == 0 {
            return Err(ReductionError::InsufficientData(
                "no reflections to bin by resolution".to_string(),
            ));
        }

        let (s_min, s_max) = reflections
            .iter()
            .map(Reflection::s)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s), hi.max(s))
            });
        let width = ((s_max - s_min) / shells as f64).max(f64::EPSILON);

        let mut grouped: Vec<Vec<f64>> = vec![Vec::new(); shells];
        for r in reflections {
            let idx = (((r.s() - s_min) / width) as usize).min(shells - 1);
            grouped[idx].push(r.i_over_sigma());
        }

        Ok(grouped
            .into_iter()
            .enumerate()
            .filter_map(|(i, values)| {
                let (mean, sd) = stats::mean_and_sd(&values)?;
                let s_low = s_min + i as f64 * width;
                Some(ResolutionBin {
                    s_low,
                    s_high: s_low + width,
                    count: values.len(),
                    mean_isigma: mean,
                    sd_isigma: sd,
                    merged_isigma: None,
                    completeness: None,
                    rmerge: None,
                })
            })
            .collect())
    }
}

/// In-memory reflection table with JSONL persistence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReflectionTable {
    rows: Vec<Reflection>,
}

impl ReflectionTable {
    pub fn new(rows: Vec<Reflection>) -> Self {
        Self { rows }
    }

    /// Keep only reflections at or below resolution `d_min` (Å).
    pub fn truncated(&self, d_min: f64) -> Self {
        Self::new(self.rows.iter().filter(|r| r.d >= d_min).copied().collect())
    }

    /// Load one reflection per line.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| ReductionError::io(format!("opening {}", path.display()), e))?;

        let mut rows = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                ReductionError::io(format!("reading line {} of {}", line_num + 1, path.display()), e)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Reflection = serde_json::from_str(&line).map_err(|e| {
                ReductionError::ParseError(format!(
                    "{}:{}: {e}",
                    path.display(),
                    line_num + 1
                ))
            })?;
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| ReductionError::io(format!("creating {}", path.display()), e))?;
        let mut writer = BufWriter::new(file);
        for row in &self.rows {
            let line = serde_json::to_string(row)
                .map_err(|e| ReductionError::Internal(format!("serializing reflection: {e}")))?;
            writeln!(writer, "{line}")
                .map_err(|e| ReductionError::io(format!("writing {}", path.display()), e))?;
        }
        writer
            .flush()
            .map_err(|e| ReductionError::io(format!("flushing {}", path.display()), e))
    }

    pub fn into_rows(self) -> Vec<Reflection> {
        self.rows
    }
}

impl ReflectionStore for ReflectionTable {
    fn reflections(&self) -> &[Reflection] {
        &self.rows
    }
}
