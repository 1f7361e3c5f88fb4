//! Fork/join integration over image chunks.
//!
//! Epistemic foundation:
//! - K_i: Chunks partition the sweep's image range without overlap
//! - K_i: Merged output is in image order regardless of completion order
//! - B_i: Any chunk may fail → the whole merge fails, after every chunk has finished
//! - I^R: Chunk count and parallelism are configurable

use crate::backend::{BackendResult, IntegrateRequest, IntegratedChunk, Integrater, RefinedGeometry};
use crate::models::{BackendFailure, ReductionError, Reflection, Result, Sweep};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Contiguous inclusive image range integrated as one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageChunk {
    pub index: usize,
    pub first_image: u32,
    pub last_image: u32,
}

/// Split `first..=last` into at most `chunks` near-equal ranges.
///
/// Never yields more chunks than images; earlier chunks take the remainder.
pub fn split_images(first_image: u32, last_image: u32, chunks: usize) -> Vec<ImageChunk> {
    let images = (last_image.saturating_sub(first_image) + 1) as usize;
    let chunks = chunks.clamp(1, images);
    let base = images / chunks;
    let extra = images % chunks;

    let mut start = first_image;
    (0..chunks)
        .map(|index| {
            let len = (base + usize::from(index < extra)) as u32;
            let chunk = ImageChunk {
                index,
                first_image: start,
                last_image: start + len - 1,
            };
            start += len;
            chunk
        })
        .collect()
}

/// Bounded pool running integration chunks in parallel.
pub struct ChunkPool {
    max_parallel: usize,
    progress: bool,
}

impl ChunkPool {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            progress: false,
        }
    }

    /// Show a progress bar while chunks run.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Integrate a sweep as `chunks` parallel jobs and merge in image order.
    ///
    /// With a single chunk the job runs inline without a runtime.
    pub fn integrate(
        &self,
        integrater: Arc<dyn Integrater>,
        sweep: &Sweep,
        geometry: &RefinedGeometry,
        chunks: usize,
    ) -> Result<Vec<Reflection>> {
        let requests: Vec<IntegrateRequest> =
            split_images(sweep.first_image, sweep.last_image, chunks)
                .into_iter()
                .map(|c| IntegrateRequest {
                    sweep: sweep.clone(),
                    chunk: c.index,
                    first_image: c.first_image,
                    last_image: c.last_image,
                    geometry: geometry.clone(),
                })
                .collect();

        if let [request] = requests.as_slice() {
            let chunk = integrater.integrate(request)?;
            return Ok(chunk.reflections);
        }

        info!(sweep = %sweep.key, chunks = requests.len(), parallel = self.max_parallel, "Integrating in chunks");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(self.max_parallel)
            .build()
            .map_err(|e| ReductionError::io("starting integration runtime", e))?;

        let outputs = runtime.block_on(self.run_all(integrater, requests))?;
        Ok(merge(outputs))
    }

    async fn run_all(
        &self,
        integrater: Arc<dyn Integrater>,
        requests: Vec<IntegrateRequest>,
    ) -> Result<Vec<IntegratedChunk>> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let pb = self.progress_bar(requests.len());

        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let chunk = request.chunk;
            let handle = tokio::spawn(run_chunk(
                Arc::clone(&semaphore),
                Arc::clone(&integrater),
                request,
            ));
            handles.push((chunk, handle));
        }

        // Join every chunk before deciding, so no job is left running.
        let mut outputs = Vec::with_capacity(handles.len());
        let mut first_failure: Option<BackendFailure> = None;
        for (chunk, handle) in handles {
            match handle.await {
                Ok(Ok(output)) => {
                    debug!(chunk, reflections = output.reflections.len(), "Chunk integrated");
                    outputs.push(output);
                }
                Ok(Err(e)) => {
                    warn!(chunk, error = %e, "Chunk failed");
                    first_failure.get_or_insert(e);
                }
                Err(e) => {
                    warn!(chunk, error = %e, "Chunk task panicked");
                    first_failure.get_or_insert(chunk_failed(chunk, e.to_string()));
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        match first_failure {
            Some(failure) => Err(ReductionError::Backend(failure)),
            None => Ok(outputs),
        }
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} chunks {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}

/// Wait for a permit, then integrate one chunk on the blocking pool.
async fn run_chunk(
    semaphore: Arc<Semaphore>,
    integrater: Arc<dyn Integrater>,
    request: IntegrateRequest,
) -> BackendResult<IntegratedChunk> {
    let chunk = request.chunk;
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| chunk_failed(chunk, "semaphore closed"))?;
    tokio::task::spawn_blocking(move || integrater.integrate(&request))
        .await
        .map_err(|e| chunk_failed(chunk, e.to_string()))?
        .map_err(|e| chunk_failed(chunk, e.to_string()))
}

fn chunk_failed(chunk: usize, message: impl Into<String>) -> BackendFailure {
    BackendFailure::ChunkFailed {
        chunk,
        message: message.into(),
    }
}

/// Concatenate chunk outputs in ascending start-image order.
pub fn merge(mut outputs: Vec<IntegratedChunk>) -> Vec<Reflection> {
    outputs.sort_by_key(|c| c.first_image);
    outputs.into_iter().flat_map(|c| c.reflections).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SweepKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// One reflection per image, batch = image number. Later chunks finish first.
    struct PerImage {
        fail_chunk: Option<usize>,
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl PerImage {
        fn new(fail_chunk: Option<usize>) -> Self {
            Self {
                fail_chunk,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Integrater for PerImage {
        fn integrate(&self, request: &IntegrateRequest) -> BackendResult<IntegratedChunk> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(40 / (request.chunk as u64 + 1)));
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail_chunk == Some(request.chunk) {
                return Err(BackendFailure::ExitStatus {
                    backend: "integrater".to_string(),
                    status: 1,
                    message: "bad chunk".to_string(),
                });
            }
            Ok(IntegratedChunk {
                chunk: request.chunk,
                first_image: request.first_image,
                reflections: (request.first_image..=request.last_image)
                    .map(|batch| Reflection {
                        d: 2.0,
                        intensity: 100.0,
                        sigma: 10.0,
                        batch,
                    })
                    .collect(),
            })
        }
    }

    fn sweep(first: u32, last: u32) -> Sweep {
        Sweep::new(SweepKey::new("p", "x", "d", "SWEEP1"), first, last)
    }

    fn geometry() -> RefinedGeometry {
        RefinedGeometry {
            cell: [50.0, 50.0, 80.0, 90.0, 90.0, 90.0],
            rmsd: None,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_split_covers_range_exactly() {
        let chunks = split_images(1, 10, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].first_image, chunks[0].last_image), (1, 4));
        assert_eq!((chunks[1].first_image, chunks[1].last_image), (5, 7));
        assert_eq!((chunks[2].first_image, chunks[2].last_image), (8, 10));
    }

    #[test]
    fn test_split_never_exceeds_images() {
        let chunks = split_images(5, 6, 8);
        assert_eq!(chunks.len(), 2);
        assert_eq!(split_images(1, 1, 0).len(), 1);
    }

    #[test]
    fn test_merge_in_image_order() {
        let pool = ChunkPool::new(4);
        let integrater = Arc::new(PerImage::new(None));
        let reflections = pool
            .integrate(integrater.clone(), &sweep(1, 20), &geometry(), 4)
            .unwrap();

        let batches: Vec<u32> = reflections.iter().map(|r| r.batch).collect();
        assert_eq!(batches, (1..=20).collect::<Vec<_>>());
        assert_eq!(integrater.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_parallelism_is_bounded() {
        let pool = ChunkPool::new(2);
        let integrater = Arc::new(PerImage::new(None));
        pool.integrate(integrater.clone(), &sweep(1, 12), &geometry(), 6)
            .unwrap();
        assert!(integrater.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_one_failed_chunk_fails_merge_after_all_ran() {
        let pool = ChunkPool::new(4);
        let integrater = Arc::new(PerImage::new(Some(1)));
        let err = pool
            .integrate(integrater.clone(), &sweep(1, 20), &geometry(), 4)
            .unwrap_err();

        assert!(matches!(
            err,
            ReductionError::Backend(BackendFailure::ChunkFailed { chunk: 1, .. })
        ));
        assert_eq!(integrater.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_single_chunk_runs_inline() {
        let pool = ChunkPool::new(4);
        let integrater = Arc::new(PerImage::new(None));
        let reflections = pool
            .integrate(integrater, &sweep(3, 5), &geometry(), 1)
            .unwrap();
        assert_eq!(reflections.len(), 3);
    }
}
