use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{SweepError, SweepResult};
use crate::fsutil::{atomic_write_bytes, remove_if_present};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointState {
    Missing,
    Valid(u64),
    Corrupt(String),
}

/// The single persisted resume index: the lowest keyspace index not yet launched.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    write_attempts: u32,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_attempts: 1,
        }
    }

    pub fn with_write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inspect(&self) -> CheckpointState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return CheckpointState::Missing,
            Err(e) => return CheckpointState::Corrupt(format!("unreadable: {}", e)),
        };
        parse_index(&raw)
    }

    pub fn exists(&self) -> bool {
        !matches!(self.inspect(), CheckpointState::Missing)
    }

    /// Resume index if one is stored and valid; a corrupt file is reported and ignored.
    pub fn load(&self) -> Option<u64> {
        match self.inspect() {
            CheckpointState::Missing => None,
            CheckpointState::Valid(index) => Some(index),
            CheckpointState::Corrupt(reason) => {
                warn!(
                    path = %self.path.display(),
                    reason = %reason,
                    "checkpoint is invalid; starting from the beginning"
                );
                None
            }
        }
    }

    pub fn save(&self, index: u64) -> SweepResult<()> {
        let payload = index.to_string();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match atomic_write_bytes(&self.path, payload.as_bytes()) {
                Ok(()) => {
                    info!(path = %self.path.display(), index, "checkpoint saved");
                    return Ok(());
                }
                Err(source) if attempt >= self.write_attempts => {
                    return Err(SweepError::CheckpointWrite {
                        path: self.path.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "checkpoint write failed; retrying"
                    );
                }
            }
        }
    }

    pub fn delete(&self) -> SweepResult<()> {
        match remove_if_present(&self.path) {
            Ok(true) => {
                info!(path = %self.path.display(), "checkpoint removed");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(source) => Err(SweepError::CheckpointDelete {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn parse_index(raw: &str) -> CheckpointState {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return CheckpointState::Corrupt("empty".to_string());
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return CheckpointState::Corrupt(format!("not a non-negative integer: '{}'", trimmed));
    }
    match trimmed.parse::<u64>() {
        Ok(index) => CheckpointState::Valid(index),
        Err(e) => CheckpointState::Corrupt(format!("'{}': {}", trimmed, e)),
    }
}
