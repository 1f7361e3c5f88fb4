//! External-process backend speaking JSON files.
//!
//! Epistemic foundation:
//! - K_i: Each job runs in its own directory, so concurrent jobs never share files
//! - B_i: The program may fail to launch, exit non-zero or write garbage
//!   → `BackendFailure`
//! - I^R: Program, arguments and work directory are configured per backend
//!
//! Protocol: the program is invoked as `program [args..] request.json result.json`
//! inside a fresh job directory. The request file holds
//! `{"operation": ..., "request": ...}`; the result file holds either the
//! operation's result or `{"error": "..."}`.

use super::traits::{
    BackendResult, IndexRequest, IndexSolution, Indexer, IntegrateRequest, IntegratedChunk,
    Integrater, LatticeCheckRequest, RefineRequest, RefinedGeometry, Refiner, ScaleRequest,
    ScaleResult, Scaler,
};
use crate::analysis::LatticeVerdict;
use crate::models::{expand_env_vars, BackendFailure, CommandConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

const REQUEST_FILE: &str = "request.json";
const RESULT_FILE: &str = "result.json";

#[derive(Serialize)]
struct Envelope<'a, T> {
    operation: &'a str,
    request: &'a T,
}

/// Result file written by the program: `{"ok": <result>}` or `{"error": "<why>"}`.
#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Reply<T> {
    Ok(T),
    Error(String),
}

/// Backend implemented by an external program.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    name: String,
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl ExternalCommand {
    pub fn new(name: impl Into<String>, config: &CommandConfig) -> Self {
        Self {
            name: name.into(),
            program: expand_env_vars(&config.program),
            args: config.args.iter().map(|a| expand_env_vars(a)).collect(),
            work_dir: config.work_dir.clone(),
        }
    }

    fn failure_launch(&self, message: impl Into<String>) -> BackendFailure {
        BackendFailure::Launch {
            backend: self.name.clone(),
            message: message.into(),
        }
    }

    fn failure_output(&self, message: impl Into<String>) -> BackendFailure {
        BackendFailure::InvalidOutput {
            backend: self.name.clone(),
            message: message.into(),
        }
    }

    /// Run one job to completion.
    ///
    /// The job directory is removed on success and kept on failure.
    pub fn run<Req, Resp>(&self, operation: &str, request: &Req) -> BackendResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let job_dir = self
            .work_dir
            .join(format!("{}-{operation}-{}", self.name, Uuid::new_v4()));
        std::fs::create_dir_all(&job_dir)
            .map_err(|e| self.failure_launch(format!("creating {}: {e}", job_dir.display())))?;

        let result = self.run_in(&job_dir, operation, request);
        match &result {
            Ok(_) => {
                if let Err(e) = std::fs::remove_dir_all(&job_dir) {
                    warn!(backend = %self.name, dir = %job_dir.display(), error = %e, "Failed to remove job directory");
                }
            }
            Err(e) => {
                warn!(backend = %self.name, operation, dir = %job_dir.display(), error = %e, "Backend job failed");
            }
        }
        result
    }

    fn run_in<Req, Resp>(&self, job_dir: &Path, operation: &str, request: &Req) -> BackendResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request_path = job_dir.join(REQUEST_FILE);
        let result_path = job_dir.join(RESULT_FILE);

        let body = serde_json::to_vec_pretty(&Envelope { operation, request })
            .map_err(|e| self.failure_launch(format!("serializing request: {e}")))?;
        std::fs::write(&request_path, body)
            .map_err(|e| self.failure_launch(format!("writing {}: {e}", request_path.display())))?;

        debug!(backend = %self.name, operation, dir = %job_dir.display(), "Launching backend");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(REQUEST_FILE)
            .arg(RESULT_FILE)
            .current_dir(job_dir)
            .output()
            .map_err(|e| self.failure_launch(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendFailure::ExitStatus {
                backend: self.name.clone(),
                status: output.status.code().unwrap_or(-1),
                message: tail(&stderr, 5),
            });
        }

        let raw = std::fs::read_to_string(&result_path)
            .map_err(|e| self.failure_output(format!("reading {}: {e}", result_path.display())))?;
        match serde_json::from_str::<Reply<Resp>>(&raw) {
            Ok(Reply::Ok(value)) => Ok(value),
            Ok(Reply::Error(error)) => Err(BackendFailure::Rejected {
                backend: self.name.clone(),
                message: error,
            }),
            Err(e) => Err(self.failure_output(e.to_string())),
        }
    }
}

/// Last `n` non-empty lines of a process's stderr.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

impl Indexer for ExternalCommand {
    fn index(&self, request: &IndexRequest) -> BackendResult<IndexSolution> {
        self.run("index", request)
    }

    fn check_lattice(&self, request: &LatticeCheckRequest) -> BackendResult<LatticeVerdict> {
        self.run("check_lattice", request)
    }
}

impl Refiner for ExternalCommand {
    fn refine(&self, request: &RefineRequest) -> BackendResult<RefinedGeometry> {
        self.run("refine", request)
    }
}

impl Integrater for ExternalCommand {
    fn integrate(&self, request: &IntegrateRequest) -> BackendResult<IntegratedChunk> {
        self.run("integrate", request)
    }
}

impl Scaler for ExternalCommand {
    fn scale(&self, request: &ScaleRequest) -> BackendResult<ScaleResult> {
        self.run("scale", request)
    }
}
