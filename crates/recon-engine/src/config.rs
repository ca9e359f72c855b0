//! Configuration for a re-execution run (spec §6, §4.7): loaded from an
//! optional TOML file, overridable by CLI flags, matching the config/CLI
//! split the teacher uses for `BatcherConfig`.

use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

const GIB: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Every knob the core depends on (spec §6's enumerated configuration plus
/// the worker pool size, spec §5).
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ReconConfig {
    /// Delete and recreate the recon database and aggregator directory
    /// before starting.
    pub reset: bool,
    pub datadir: PathBuf,
    pub aggregation_step: u64,
    #[validate(custom(function = "nonzero_u64"))]
    pub commit_threshold: u64,
    #[validate(custom(function = "nonzero_u64"))]
    pub results_threshold: u64,
    #[validate(custom(function = "nonzero_usize"))]
    pub result_channel_capacity: usize,
    #[validate(custom(function = "nonzero_usize"))]
    pub heap_backpressure_bound: usize,
    pub start_block: u64,
    pub max_block_num: u64,
    /// Number of executor worker threads. Defaults to [`num_cpus::get`].
    pub num_workers: usize,
}

fn nonzero_u64(v: &u64) -> Result<(), validator::ValidationError> {
    if *v == 0 {
        return Err(validator::ValidationError::new("must be nonzero"));
    }
    Ok(())
}

fn nonzero_usize(v: &usize) -> Result<(), validator::ValidationError> {
    if *v == 0 {
        return Err(validator::ValidationError::new("must be nonzero"));
    }
    Ok(())
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            reset: false,
            datadir: PathBuf::from("./datadir"),
            aggregation_step: 1_562_500,
            commit_threshold: GIB,
            results_threshold: GIB,
            result_channel_capacity: 128,
            heap_backpressure_bound: 128,
            start_block: 0,
            max_block_num: 0,
            num_workers: num_cpus::get(),
        }
    }
}

impl ReconConfig {
    pub fn db22(&self) -> PathBuf {
        self.datadir.join("db22")
    }

    pub fn agg22(&self) -> PathBuf {
        self.datadir.join("agg22")
    }

    pub fn snapshots(&self) -> PathBuf {
        self.datadir.join("snapshots")
    }

    pub fn tmp(&self) -> PathBuf {
        self.datadir.join("tmp")
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Self = toml::from_str(&contents)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validated()
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.start_block > self.max_block_num {
            return Err(ConfigError::Invalid(format!(
                "start_block ({}) must be <= max_block_num ({})",
                self.start_block, self.max_block_num
            )));
        }
        Ok(self)
    }

    /// Applies CLI overrides on top of a loaded (or default) config.
    pub fn apply_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if overrides.reset {
            self.reset = true;
        }
        if let Some(datadir) = &overrides.datadir {
            self.datadir = datadir.clone();
        }
        if let Some(v) = overrides.start_block {
            self.start_block = v;
        }
        if let Some(v) = overrides.max_block_num {
            self.max_block_num = v;
        }
        if let Some(v) = overrides.num_workers {
            self.num_workers = v;
        }
        self
    }
}

/// CLI-surfaced overrides, mirroring the config/CLI split the teacher uses
/// in its simulation binary: a config file supplies defaults, flags win.
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigOverrides {
    #[arg(long)]
    pub reset: bool,
    #[arg(long)]
    pub datadir: Option<PathBuf>,
    #[arg(long)]
    pub start_block: Option<u64>,
    #[arg(long)]
    pub max_block_num: Option<u64>,
    #[arg(long)]
    pub num_workers: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut cfg = ReconConfig::default();
        cfg.max_block_num = 10;
        assert!(cfg.validated().is_ok());
    }

    #[test]
    fn zero_commit_threshold_is_rejected() {
        let mut cfg = ReconConfig { commit_threshold: 0, max_block_num: 10, ..ReconConfig::default() };
        assert!(cfg.validated().is_err());
        cfg.commit_threshold = GIB;
        assert!(cfg.validated().is_ok());
    }

    #[test]
    fn start_after_max_is_rejected() {
        let cfg = ReconConfig { start_block: 10, max_block_num: 5, ..ReconConfig::default() };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn overrides_win_over_file_defaults() {
        let cfg = ReconConfig { max_block_num: 10, ..ReconConfig::default() };
        let overrides = ConfigOverrides { num_workers: Some(2), ..ConfigOverrides::default() };
        let cfg = cfg.apply_overrides(&overrides);
        assert_eq!(cfg.num_workers, 2);
    }

    #[test]
    fn derived_paths_are_rooted_at_datadir() {
        let cfg = ReconConfig { datadir: PathBuf::from("/data"), ..ReconConfig::default() };
        assert_eq!(cfg.db22(), PathBuf::from("/data/db22"));
        assert_eq!(cfg.agg22(), PathBuf::from("/data/agg22"));
        assert_eq!(cfg.snapshots(), PathBuf::from("/data/snapshots"));
        assert_eq!(cfg.tmp(), PathBuf::from("/data/tmp"));
    }
}
