//! Configuration models for sweepctl.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use crate::analysis::{CorrectionModel, Criterion};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::OnceLock;

use super::{Sweep, SweepKey};

/// Top-level configuration for sweepctl.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Stage controller settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Resolution cutoff criteria
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Correction model search
    #[serde(default)]
    pub scaling: ScalingConfig,

    /// Radiation damage detection
    #[serde(default)]
    pub damage: DamageConfig,

    /// Chunked integration
    #[serde(default)]
    pub integration: IntegrationConfig,

    /// External backend commands
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Sweeps to process
    #[serde(default)]
    pub sweeps: Vec<SweepConfig>,
}

/// Stage controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum rewinds a stage may take before `FailedToConverge`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    8
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Resolution limit criteria.
///
/// K_i: Each threshold yields one candidate cutoff; the most conservative wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Completeness below which the shell is cut (fraction)
    #[serde(default = "default_completeness")]
    pub completeness: Option<f64>,

    /// Merging residual above which the shell is cut
    #[serde(default = "default_rmerge")]
    pub rmerge: Option<f64>,

    /// Unmerged I/σ(I) below which the shell is cut
    #[serde(default = "default_isigma")]
    pub isigma: Option<f64>,

    /// Merged I/σ(I) below which the shell is cut
    #[serde(default = "default_misigma")]
    pub misigma: Option<f64>,

    /// Criteria switched off entirely
    #[serde(default)]
    pub disabled: Vec<Criterion>,

    /// Change in d (Å) below which a new estimate counts as unchanged
    #[serde(default = "default_resolution_tolerance")]
    pub tolerance: f64,

    /// User-specified limits, keyed `project/crystal/dataset/sweep`
    #[serde(default)]
    pub overrides: HashMap<String, f64>,
}

fn default_completeness() -> Option<f64> {
    Some(0.5)
}

fn default_rmerge() -> Option<f64> {
    Some(1.0)
}

fn default_isigma() -> Option<f64> {
    Some(1.0)
}

fn default_misigma() -> Option<f64> {
    Some(2.0)
}

fn default_resolution_tolerance() -> f64 {
    0.005
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            completeness: default_completeness(),
            rmerge: default_rmerge(),
            isigma: default_isigma(),
            misigma: default_misigma(),
            disabled: Vec::new(),
            tolerance: default_resolution_tolerance(),
            overrides: HashMap::new(),
        }
    }
}

impl ResolutionConfig {
    /// Threshold for a criterion, `None` when unset or disabled.
    pub fn threshold(&self, criterion: Criterion) -> Option<f64> {
        if self.disabled.contains(&criterion) {
            return None;
        }
        match criterion {
            Criterion::Completeness => self.completeness,
            Criterion::Rmerge => self.rmerge,
            Criterion::UnmergedIsigma => self.isigma,
            Criterion::MergedIsigma => self.misigma,
            Criterion::User | Criterion::FullResolution | Criterion::Wilson => None,
        }
    }

    /// User override for a sweep, if any.
    pub fn override_for(&self, key: &SweepKey) -> Option<f64> {
        self.overrides.get(&key.to_string()).copied()
    }
}

/// Correction model search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Extra convergence cycles tolerated over the baseline
    #[serde(default = "default_convergence_margin")]
    pub convergence_margin: f64,

    /// Manual correction flags; bypasses the search when set
    #[serde(default)]
    pub corrections: Option<CorrectionModel>,
}

fn default_convergence_margin() -> f64 {
    1.0
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            convergence_margin: default_convergence_margin(),
            corrections: None,
        }
    }
}

/// Radiation damage detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamageConfig {
    /// Width of a dose bin (dose units, one image = one unit by default)
    #[serde(default = "default_bin_width")]
    pub bin_width: f64,

    /// Leading bins left out of the linear prefix fit
    #[serde(default = "default_leading_offset")]
    pub leading_offset: usize,

    /// Floor on per-bin standard deviation
    #[serde(default = "default_sigma_floor")]
    pub sigma_floor: f64,

    /// Reduced χ² above which a bin marks the damage onset
    #[serde(default = "default_chi_squared_threshold")]
    pub chi_squared_threshold: f64,

    /// Mean I/σ(I) above which every shell counts as outside the Wilson regime
    #[serde(default = "default_wilson_trigger")]
    pub wilson_trigger_isigma: f64,
}

fn default_bin_width() -> f64 {
    5.0
}

fn default_leading_offset() -> usize {
    1
}

fn default_sigma_floor() -> f64 {
    0.01
}

fn default_chi_squared_threshold() -> f64 {
    2.0
}

fn default_wilson_trigger() -> f64 {
    5.0
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self {
            bin_width: default_bin_width(),
            leading_offset: default_leading_offset(),
            sigma_floor: default_sigma_floor(),
            chi_squared_threshold: default_chi_squared_threshold(),
            wilson_trigger_isigma: default_wilson_trigger(),
        }
    }
}

/// Chunked integration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Number of chunks each sweep's image range is split into
    #[serde(default = "default_chunks")]
    pub chunks: usize,

    /// Maximum chunks running at the same time
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_chunks() -> usize {
    1
}

fn default_max_parallel() -> usize {
    4
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            chunks: default_chunks(),
            max_parallel: default_max_parallel(),
        }
    }
}

/// External commands used as backend processors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub indexer: Option<CommandConfig>,
    #[serde(default)]
    pub refiner: Option<CommandConfig>,
    #[serde(default)]
    pub integrater: Option<CommandConfig>,
    #[serde(default)]
    pub scaler: Option<CommandConfig>,
}

/// A program invoked with a JSON job file and expected to write a JSON result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Executable to run
    pub program: String,

    /// Extra arguments; `${VAR}` is expanded from the environment
    #[serde(default)]
    pub args: Vec<String>,

    /// Parent directory for per-job working areas
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Pipeline report path
    #[serde(default = "default_report_path")]
    pub report: PathBuf,

    /// Checkpoint directory for resume support
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

fn default_report_path() -> PathBuf {
    PathBuf::from("sweepctl-report.json")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            report: default_report_path(),
            checkpoint_dir: None,
        }
    }
}

/// Sweep definition as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_crystal")]
    pub crystal: String,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    pub name: String,
    #[serde(default)]
    pub epoch: f64,
    pub first_image: u32,
    pub last_image: u32,
    #[serde(default = "default_oscillation")]
    pub oscillation: f64,
    #[serde(default)]
    pub spacegroup: Option<String>,
    /// Free-form backend payload (image template, beam centre, ...)
    #[serde(default)]
    pub payload: Option<toml::Value>,
}

fn default_project() -> String {
    "AUTOMATIC".to_string()
}

fn default_crystal() -> String {
    "DEFAULT".to_string()
}

fn default_dataset() -> String {
    "NATIVE".to_string()
}

fn default_oscillation() -> f64 {
    1.0
}

impl SweepConfig {
    pub fn key(&self) -> SweepKey {
        SweepKey::new(&self.project, &self.crystal, &self.dataset, &self.name)
    }

    /// Convert into the runtime sweep representation.
    pub fn to_sweep(&self) -> Result<Sweep, ConfigError> {
        let payload = match &self.payload {
            Some(value) => serde_json::to_value(value)
                .map_err(|e| ConfigError::Invalid(format!("sweep {}: payload: {e}", self.name)))?,
            None => serde_json::Value::Null,
        };
        Ok(Sweep {
            key: self.key(),
            epoch: self.epoch,
            first_image: self.first_image,
            last_image: self.last_image,
            oscillation: self.oscillation,
            spacegroup: self.spacegroup.clone(),
            payload,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Runtime sweeps in collection (epoch) order.
    pub fn sweeps(&self) -> Result<Vec<Sweep>, ConfigError> {
        let mut sweeps = self
            .sweeps
            .iter()
            .map(SweepConfig::to_sweep)
            .collect::<Result<Vec<_>, _>>()?;
        sweeps.sort_by(|a, b| a.epoch.total_cmp(&b.epoch));
        Ok(sweeps)
    }

    /// Validate ranges and cross-references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "controller.max_retries must be at least 1".to_string(),
            ));
        }

        if let Some(c) = self.resolution.completeness {
            if !(c > 0.0 && c <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "resolution.completeness must be in (0, 1], got {c}"
                )));
            }
        }
        for (name, value) in [
            ("rmerge", self.resolution.rmerge),
            ("isigma", self.resolution.isigma),
            ("misigma", self.resolution.misigma),
        ] {
            if let Some(v) = value {
                if !(v > 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "resolution.{name} must be positive, got {v}"
                    )));
                }
            }
        }
        for (key, d) in &self.resolution.overrides {
            key.parse::<SweepKey>()
                .map_err(|e| ConfigError::Invalid(format!("resolution.overrides: {e}")))?;
            if !(*d > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "resolution override for {key} must be positive, got {d}"
                )));
            }
        }

        if !(self.damage.bin_width > 0.0) {
            return Err(ConfigError::Invalid(
                "damage.bin_width must be positive".to_string(),
            ));
        }
        if !(self.damage.sigma_floor > 0.0) {
            return Err(ConfigError::Invalid(
                "damage.sigma_floor must be positive".to_string(),
            ));
        }

        if self.integration.chunks == 0 || self.integration.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "integration.chunks and integration.max_parallel must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for sweep in &self.sweeps {
            if sweep.first_image > sweep.last_image {
                return Err(ConfigError::Invalid(format!(
                    "sweep {}: first_image {} after last_image {}",
                    sweep.name, sweep.first_image, sweep.last_image
                )));
            }
            if !seen.insert(sweep.key()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate sweep {}",
                    sweep.key()
                )));
            }
        }

        Ok(())
    }

    /// Validate that every backend the pipeline needs is configured.
    pub fn require_backends(&self) -> Result<(), ConfigError> {
        let backends = [
            ("indexer", &self.backends.indexer),
            ("refiner", &self.backends.refiner),
            ("integrater", &self.backends.integrater),
            ("scaler", &self.backends.scaler),
        ];
        for (name, backend) in backends {
            if backend.is_none() {
                return Err(ConfigError::MissingBackend(name.to_string()));
            }
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing backend '{0}': add a [backends.{0}] section")]
    MissingBackend(String),
}
