// src/config.rs

//! Runtime configuration for a pipeline run.
//!
//! Domain nodes only see this through [`RunContext`](crate::node::RunContext):
//! a `temp_root` to place scoped temp directories under, and the shared
//! version-check cache. The thread budget is consumed by the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::errors::{PipelineError, Result};
use crate::version::VersionCache;

/// Raw on-disk configuration, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    pub temp_root: PathBuf,
    #[serde(default)]
    pub max_threads: Option<usize>,
}

/// Validated configuration shared by the scheduler and every node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which each node gets its own fresh temp directory.
    pub temp_root: PathBuf,
    /// Global thread budget for concurrently running nodes.
    pub max_threads: usize,
    version_cache: Arc<VersionCache>,
}

impl Config {
    pub fn new(temp_root: impl Into<PathBuf>, max_threads: usize) -> Result<Self> {
        let temp_root = temp_root.into();
        if temp_root.as_os_str().is_empty() {
            return Err(PipelineError::Config(
                "temp_root must not be empty".to_string(),
            ));
        }
        if max_threads == 0 {
            return Err(PipelineError::Config(format!(
                "max_threads must be >= 1 (got {max_threads})"
            )));
        }

        Ok(Self {
            temp_root,
            max_threads,
            version_cache: Arc::new(VersionCache::new()),
        })
    }

    /// Load and validate a configuration from a TOML file:
    ///
    /// ```toml
    /// [pipeline]
    /// temp_root = "/scratch/pipedag"
    /// max_threads = 8
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let raw: RawConfig = toml::from_str(&contents)?;

        let max_threads = raw
            .pipeline
            .max_threads
            .unwrap_or_else(default_max_threads);
        Self::new(raw.pipeline.temp_root, max_threads)
    }

    /// Shared cache for external-tool version checks.
    pub fn version_cache(&self) -> &VersionCache {
        &self.version_cache
    }
}

fn default_max_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
