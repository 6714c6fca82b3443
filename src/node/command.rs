// src/node/command.rs

//! Runner executing a command pipeline with the temp-file commit protocol.

use std::collections::BTreeSet;
use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cmd::{format, CommandPipeline};
use crate::errors::{CmdNodeError, NodeError};
use crate::fsutil;
use crate::node::{default_setup, default_teardown, RunContext, Runner};

/// Executes a [`CommandPipeline`] inside the node's temp directory and, on
/// success, commits the produced files to their final paths.
///
/// Teardown enforces the declared temp-file contract before anything is
/// moved: every required file must have been produced, and nothing outside
/// the declared required and optional sets may remain. Violations abort the
/// commit and leave the temp directory untouched for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRunner {
    pipeline: CommandPipeline,
}

impl CommandRunner {
    pub fn new(pipeline: CommandPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &CommandPipeline {
        &self.pipeline
    }
}

impl Runner for CommandRunner {
    fn run(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        let running = self.pipeline.start(ctx.temp).map_err(NodeError::from)?;
        let return_codes = running.wait().map_err(|source| NodeError::Io {
            path: ctx.temp.to_path_buf(),
            source,
        })?;

        if return_codes.iter().any(|&code| code != 0) {
            return Err(NodeError::from(CmdNodeError::NonZeroExit {
                return_codes,
                temp: ctx.temp.to_path_buf(),
                description: format::pformat(&self.pipeline, Some(ctx.temp)),
            })
            .into());
        }
        Ok(())
    }

    fn teardown(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        let temp = ctx.temp;
        let required = self.pipeline.required_temp_files();
        let optional = self.pipeline.optional_temp_files();
        let fifos = self.pipeline.fifo_names();

        let mut present = BTreeSet::new();
        for entry in fs::read_dir(temp).map_err(|source| NodeError::Io {
            path: temp.to_path_buf(),
            source,
        })? {
            let entry = entry.map_err(|source| NodeError::Io {
                path: temp.to_path_buf(),
                source,
            })?;
            present.insert(entry.file_name().to_string_lossy().into_owned());
        }

        let missing: Vec<String> = required.difference(&present).cloned().collect();
        if !missing.is_empty() {
            return Err(NodeError::from(CmdNodeError::MissingTempFiles {
                temp: temp.to_path_buf(),
                files: missing,
            })
            .into());
        }

        let unexpected: Vec<String> = present
            .iter()
            .filter(|name| {
                !required.contains(*name) && !optional.contains(*name) && !fifos.contains(*name)
            })
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(NodeError::from(CmdNodeError::UnexpectedTempFiles {
                temp: temp.to_path_buf(),
                files: unexpected,
            })
            .into());
        }

        // Contract holds; commit outputs and drop the scratch files.
        for (name, destination) in self.pipeline.committable_outputs() {
            fsutil::move_file(&temp.join(&name), &destination).map_err(|source| {
                NodeError::Io {
                    path: destination.clone(),
                    source,
                }
            })?;
            info!(file = ?destination, "committed output file");
        }
        for name in optional.union(&fifos) {
            let path = temp.join(name);
            fsutil::try_remove(&path).map_err(|source| NodeError::Io {
                path: path.clone(),
                source,
            })?;
            debug!(path = ?path, "removed scratch file");
        }

        default_teardown(ctx)?;
        Ok(())
    }
}
