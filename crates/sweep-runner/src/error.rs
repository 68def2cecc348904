use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("launch_failure: candidate '{candidate}' (index {index}): {source}")]
    Launch {
        index: u64,
        candidate: String,
        #[source]
        source: io::Error,
    },

    #[error("cleanup_failure: {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint_write_failure: {} after {attempts} attempt(s): {source}", .path.display())]
    CheckpointWrite {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint_delete_failure: {}: {source}", .path.display())]
    CheckpointDelete {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("result_write_failure: {}: {source}", .path.display())]
    ResultWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("process_io: {0}")]
    Process(#[from] io::Error),
}

impl SweepError {
    /// Stable machine-readable code for JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            SweepError::Config(_) => "invalid_config",
            SweepError::Launch { .. } => "launch_failure",
            SweepError::Cleanup { .. } => "cleanup_failure",
            SweepError::CheckpointWrite { .. } => "checkpoint_write_failure",
            SweepError::CheckpointDelete { .. } => "checkpoint_delete_failure",
            SweepError::ResultWrite { .. } => "result_write_failure",
            SweepError::Process(_) => "process_io",
        }
    }
}

pub type SweepResult<T> = std::result::Result<T, SweepError>;
