//! Error types for sweepctl.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (incompatible data, too few points to fit)
//! - I^B materialized: Backend failures (external processor crashed, bad output)
//! - K_i violated: Internal invariant violations (bugs)

use std::fmt;
use thiserror::Error;

use super::SweepKey;

/// Identifier of a processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Indexing,
    Refinement,
    Integration,
    Scaling,
}

impl StageId {
    /// Per-sweep stages in upstream → downstream order.
    pub const SWEEP_STAGES: [StageId; 3] = [Self::Indexing, Self::Refinement, Self::Integration];

    /// Whether this stage is run once per sweep (as opposed to once per pipeline).
    pub fn is_per_sweep(self) -> bool {
        !matches!(self, Self::Scaling)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Indexing => "indexing",
            Self::Refinement => "refinement",
            Self::Integration => "integration",
            Self::Scaling => "scaling",
        };
        f.write_str(name)
    }
}

/// Top-level error type for sweepctl.
#[derive(Debug, Error)]
pub enum ReductionError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Sweep {sweep} is incompatible with asserted lattice {lattice}")]
    IncompatibleLattice { sweep: SweepKey, lattice: String },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Backend failure: {0}")]
    Backend(#[from] BackendFailure),

    #[error("Stage {stage} failed to converge after {attempts} attempts")]
    FailedToConverge { stage: StageId, attempts: u32 },

    #[error("Stage {stage}{} failed: {source}", sweep_suffix(.sweep))]
    StageFailure {
        stage: StageId,
        sweep: Option<SweepKey>,
        #[source]
        source: Box<ReductionError>,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

fn sweep_suffix(sweep: &Option<SweepKey>) -> String {
    match sweep {
        Some(key) => format!(" for sweep {key}"),
        None => String::new(),
    }
}

/// Failures raised by external backend processors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendFailure {
    #[error("{backend} exited with status {status}: {message}")]
    ExitStatus {
        backend: String,
        status: i32,
        message: String,
    },

    #[error("{backend} could not be launched: {message}")]
    Launch { backend: String, message: String },

    #[error("{backend} produced invalid output: {message}")]
    InvalidOutput { backend: String, message: String },

    #[error("{backend} rejected the job: {message}")]
    Rejected { backend: String, message: String },

    #[error("Integration chunk {chunk} failed: {message}")]
    ChunkFailed { chunk: usize, message: String },
}

impl ReductionError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an error raised inside a stage phase.
    pub fn stage(stage: StageId, sweep: Option<SweepKey>, source: ReductionError) -> Self {
        Self::StageFailure {
            stage,
            sweep,
            source: Box::new(source),
        }
    }

    /// Strip `StageFailure` wrappers down to the originating error.
    pub fn root_cause(&self) -> &ReductionError {
        let mut current = self;
        while let Self::StageFailure { source, .. } = current {
            current = source;
        }
        current
    }

    /// Check if a caller may fall back to a default instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::InsufficientData(_) | Self::Backend(_)
        )
    }
}

/// Result type alias for sweepctl.
pub type Result<T> = std::result::Result<T, ReductionError>;
