//! In-process backends for pipeline tests.

use crate::analysis::{CorrectionModel, Lattice, LatticeVerdict};
use crate::backend::{
    BackendResult, Backends, IndexRequest, IndexSolution, Indexer, IntegrateRequest,
    IntegratedChunk, Integrater, LatticeCheckRequest, RefineRequest, RefinedGeometry, Refiner,
    ScaleRequest, ScaleResult, Scaler, SweepMerging,
};
use crate::models::{
    d_to_s, BackendFailure, BatchStatistic, MergingStats, Reflection, ResolutionBin, Sweep,
    SweepKey,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Simplest space group in each lattice.
pub fn spacegroup_for(lattice: Lattice) -> &'static str {
    match lattice {
        Lattice::TriclinicP => "P 1",
        Lattice::MonoclinicP => "P 2",
        Lattice::MonoclinicC => "C 2",
        Lattice::OrthorhombicP => "P 2 2 2",
        Lattice::OrthorhombicC => "C 2 2 2",
        Lattice::OrthorhombicI => "I 2 2 2",
        Lattice::OrthorhombicF => "F 2 2 2",
        Lattice::TetragonalP => "P 4",
        Lattice::TetragonalI => "I 4",
        Lattice::RhombohedralR => "R 3",
        Lattice::HexagonalP => "P 6",
        Lattice::CubicP => "P 2 3",
        Lattice::CubicI => "I 2 3",
        Lattice::CubicF => "F 2 3",
    }
}

pub fn key(name: &str) -> SweepKey {
    SweepKey::new("AUTOMATIC", "DEFAULT", "NATIVE", name)
}

/// Sweep of `images` images starting at image 1, collected at `epoch`.
pub fn sweep(name: &str, images: u32, epoch: f64) -> Sweep {
    let mut sweep = Sweep::new(key(name), 1, images);
    sweep.epoch = epoch;
    sweep
}

/// Indexer proposing a fixed lattice per sweep and answering a fixed verdict.
#[derive(Default)]
pub struct MockIndexer {
    lattices: HashMap<String, Lattice>,
    verdicts: HashMap<String, LatticeVerdict>,
    pub index_calls: Mutex<Vec<(String, Option<Lattice>)>>,
    pub checks: Mutex<Vec<(String, Lattice)>>,
}

impl MockIndexer {
    pub fn with_lattice(mut self, sweep: &str, lattice: Lattice) -> Self {
        self.lattices.insert(sweep.to_string(), lattice);
        self
    }

    pub fn with_verdict(mut self, sweep: &str, verdict: LatticeVerdict) -> Self {
        self.verdicts.insert(sweep.to_string(), verdict);
        self
    }

    pub fn index_count(&self, sweep: &str) -> usize {
        self.index_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == sweep)
            .count()
    }
}

impl Indexer for MockIndexer {
    fn index(&self, request: &IndexRequest) -> BackendResult<IndexSolution> {
        let name = request.sweep.key.sweep.clone();
        self.index_calls
            .lock()
            .unwrap()
            .push((name.clone(), request.lattice));

        let lattice = request
            .lattice
            .or_else(|| self.lattices.get(&name).copied())
            .unwrap_or(Lattice::TriclinicP);
        Ok(IndexSolution {
            spacegroup: spacegroup_for(lattice).to_string(),
            cell: [50.0, 60.0, 70.0, 90.0, 90.0, 90.0],
            candidates: Vec::new(),
            payload: serde_json::Value::Null,
        })
    }

    fn check_lattice(&self, request: &LatticeCheckRequest) -> BackendResult<LatticeVerdict> {
        let name = request.sweep.sweep.clone();
        self.checks.lock().unwrap().push((name.clone(), request.lattice));
        Ok(self
            .verdicts
            .get(&name)
            .copied()
            .unwrap_or(LatticeVerdict::Correct))
    }
}

pub struct MockRefiner;

impl Refiner for MockRefiner {
    fn refine(&self, request: &RefineRequest) -> BackendResult<RefinedGeometry> {
        Ok(RefinedGeometry {
            cell: request.solution.cell,
            rmsd: Some(0.3),
            payload: serde_json::Value::Null,
        })
    }
}

/// Integrater yielding `per_image` reflections per image, I/σ falling with resolution.
pub struct MockIntegrater {
    pub per_image: u32,
    pub fail: bool,
}

impl Default for MockIntegrater {
    fn default() -> Self {
        Self {
            per_image: 20,
            fail: false,
        }
    }
}

impl Integrater for MockIntegrater {
    fn integrate(&self, request: &IntegrateRequest) -> BackendResult<IntegratedChunk> {
        if self.fail {
            return Err(BackendFailure::ExitStatus {
                backend: "integrater".to_string(),
                status: 2,
                message: "no spots".to_string(),
            });
        }
        let mut reflections = Vec::new();
        for batch in request.first_image..=request.last_image {
            for i in 0..self.per_image {
                // d from 5 Å down to 1.5 Å, I/σ from 30 down to 0.5
                let f = f64::from(i) / f64::from(self.per_image.max(2) - 1);
                reflections.push(Reflection {
                    d: 5.0 - 3.5 * f,
                    intensity: (30.0 - 29.5 * f) * 10.0,
                    sigma: 10.0,
                    batch,
                });
            }
        }
        Ok(IntegratedChunk {
            chunk: request.chunk,
            first_image: request.first_image,
            reflections,
        })
    }
}

type ScaleFn = dyn Fn(&ScaleRequest) -> BackendResult<ScaleResult> + Send + Sync;

/// Scaler delegating to a closure and recording every request.
pub struct MockScaler {
    respond: Box<ScaleFn>,
    pub calls: Mutex<Vec<(CorrectionModel, Vec<Option<f64>>)>>,
}

impl MockScaler {
    pub fn new(respond: impl Fn(&ScaleRequest) -> BackendResult<ScaleResult> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Decay improves the residual; I/σ crosses 1.0 at 1/d² = 0.285.
    pub fn standard() -> Self {
        Self::new(|request| Ok(standard_result(request, |_| 1.0)))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Scaler for MockScaler {
    fn scale(&self, request: &ScaleRequest) -> BackendResult<ScaleResult> {
        self.calls.lock().unwrap().push((
            request.corrections,
            request.sweeps.iter().map(|s| s.d_min).collect(),
        ));
        (self.respond)(request)
    }
}

/// Merging table over (0, s_max] in 10 shells with I/σ = 20·(1 − s/0.3).
pub fn falling_stats(s_max: f64) -> MergingStats {
    let width = s_max / 10.0;
    MergingStats::new(
        (0..10)
            .map(|i| {
                let s_low = f64::from(i) * width;
                let s_mid = s_low + 0.5 * width;
                ResolutionBin {
                    s_low,
                    s_high: s_low + width,
                    count: 500,
                    mean_isigma: 20.0 * (1.0 - s_mid / 0.3),
                    sd_isigma: 2.0,
                    merged_isigma: None,
                    completeness: Some(0.99),
                    rmerge: Some(0.05),
                }
            })
            .collect(),
    )
}

/// Scale result honouring the request's resolution limits.
///
/// `indicator` maps a dose (cumulative batch count) to the batch scale; the
/// B-factor is fixed at 1.0 so the damage indicator equals the scale.
pub fn standard_result(request: &ScaleRequest, indicator: impl Fn(f64) -> f64) -> ScaleResult {
    let residual = if request.corrections.decay { 0.05 } else { 0.08 };
    let merging = request
        .sweeps
        .iter()
        .map(|input| SweepMerging {
            sweep: input.sweep.clone(),
            stats: falling_stats(input.d_min.map(d_to_s).unwrap_or(1.0 / (1.5 * 1.5))),
        })
        .collect();

    let indicator = &indicator;
    let batches = request
        .sweeps
        .iter()
        .flat_map(move |input| {
            let mut batches: Vec<u32> = input.reflections.iter().map(|r| r.batch).collect();
            batches.dedup();
            let offset = input.dose_offset;
            let sweep = input.sweep.clone();
            batches.into_iter().map(move |batch| BatchStatistic {
                sweep: sweep.clone(),
                batch,
                scale: indicator(offset + f64::from(batch)),
                bfactor: 1.0,
                rmerge: 0.05,
            })
        })
        .collect();

    ScaleResult {
        merging_residual: residual,
        convergence_cycles: Some(5.0),
        merging,
        batches,
    }
}

pub struct MockBackends {
    pub indexer: Arc<MockIndexer>,
    pub integrater: Arc<MockIntegrater>,
    pub scaler: Arc<MockScaler>,
}

impl MockBackends {
    pub fn new(indexer: MockIndexer, scaler: MockScaler) -> Self {
        Self {
            indexer: Arc::new(indexer),
            integrater: Arc::new(MockIntegrater::default()),
            scaler: Arc::new(scaler),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            indexer: self.indexer.clone(),
            refiner: Arc::new(MockRefiner),
            integrater: self.integrater.clone(),
            scaler: self.scaler.clone(),
        }
    }
}
