use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::CheckpointStore;
use crate::job::JobSettings;
use crate::keyspace::Keyspace;

pub const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";
pub const DEFAULT_MARKER: &str = "CRC OK";

/// Run configuration. Every field has a default except `archive`; a YAML
/// file supplies any subset and CLI flags override on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub tool: PathBuf,
    pub archive: PathBuf,
    pub min_len: u32,
    pub max_len: u32,
    pub alphabet: String,
    pub combination_length: usize,
    pub max_instances: usize,
    pub success_marker: String,
    pub checkpoint_path: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    pub monitor_join_timeout_ms: u64,
    pub checkpoint_write_attempts: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("crark"),
            archive: PathBuf::new(),
            min_len: 6,
            max_len: 6,
            alphabet: DEFAULT_ALPHABET.to_string(),
            combination_length: 2,
            max_instances: 36,
            success_marker: DEFAULT_MARKER.to_string(),
            checkpoint_path: PathBuf::from("save_progress.txt"),
            work_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            poll_interval_ms: 100,
            grace_period_ms: 1000,
            monitor_join_timeout_ms: 2000,
            checkpoint_write_attempts: 3,
        }
    }
}

impl SweepConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: SweepConfig = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Reports every problem in one error so a bad file is fixed in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.tool.as_os_str().is_empty() {
            problems.push("tool must not be empty".to_string());
        }
        if self.archive.as_os_str().is_empty() {
            problems.push("archive is required".to_string());
        }
        if self.min_len > self.max_len {
            problems.push(format!(
                "min_len ({}) must not exceed max_len ({})",
                self.min_len, self.max_len
            ));
        }
        if self.max_instances == 0 {
            problems.push("max_instances must be at least 1".to_string());
        }
        if self.success_marker.is_empty() {
            problems.push("success_marker must not be empty".to_string());
        }
        if self.poll_interval_ms == 0 {
            problems.push("poll_interval_ms must be at least 1".to_string());
        }
        if self.checkpoint_write_attempts == 0 {
            problems.push("checkpoint_write_attempts must be at least 1".to_string());
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = self.alphabet.chars().find(|c| !seen.insert(*c)) {
            problems.push(format!("alphabet contains duplicate symbol '{}'", dup));
        } else if let Err(e) = Keyspace::new(&self.alphabet, self.combination_length) {
            problems.push(e.to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid configuration:\n  - {}", problems.join("\n  - ")))
        }
    }

    pub fn keyspace(&self) -> Result<Keyspace> {
        Ok(Keyspace::new(&self.alphabet, self.combination_length)?)
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.checkpoint_path).with_write_attempts(self.checkpoint_write_attempts)
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            tool: self.tool.clone(),
            archive: self.archive.clone(),
            min_len: self.min_len,
            max_len: self.max_len,
            work_dir: self.work_dir.clone(),
            success_marker: self.success_marker.clone(),
        }
    }

    /// `pass_<archive file name>.txt` under `output_dir`.
    pub fn result_artifact_path(&self) -> PathBuf {
        let name = self
            .archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "archive".to_string());
        self.output_dir.join(format!("pass_{}.txt", name))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn monitor_join_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_join_timeout_ms)
    }
}
