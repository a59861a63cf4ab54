mod local;

pub use local::{run_algorithm, LocalExecutor, SlotGate, SlotPermit};

use crate::{ledger::RunResult, shutdown::Shutdown};
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to start {exec:?}: {source}")]
    Spawn { exec: PathBuf, source: io::Error },
    #[error("Failed to wait for the algorithm: {0}")]
    Wait(io::Error),
    #[error("Failed to create log file {path:?}: {source}")]
    Logs { path: PathBuf, source: io::Error },
    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Result of a single algorithm run, exit code 0 is the only success
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "outcome", content = "exit_code")]
pub enum Outcome {
    Success,
    /// `None` if the process was killed by a signal or the timeout
    Failure(Option<i32>),
    /// terminated because the scheduler is shutting down, the item stays pending
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::Failure(code) => *code,
            Self::Cancelled => None,
        }
    }
}

impl From<Outcome> for RunResult {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => RunResult::Success,
            Outcome::Failure(_) | Outcome::Cancelled => RunResult::Failure,
        }
    }
}

/// Everything needed to invoke the external algorithm once
#[derive(Clone, Debug)]
pub struct Invocation {
    pub exec: PathBuf,
    pub params: Vec<String>,
    pub container_dir: PathBuf,
    pub container_id: String,
    pub config_path: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub timeout: Option<Duration>,
    pub shutdown: Shutdown,
}
