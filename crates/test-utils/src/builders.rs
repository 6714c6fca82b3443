#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pipedag::cmd::{AtomicCommand, CommandPipeline};
use pipedag::node::{Node, RunContext, Runner};
use pipedag::Config;

/// Runner that creates every declared output file, creating parent
/// directories as needed. Lets tests exercise scheduling and freshness
/// without spawning processes.
#[derive(Debug)]
pub struct TouchRunner;

impl Runner for TouchRunner {
    fn run(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        for path in ctx.info.output_files.iter() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, b"")?;
        }
        Ok(())
    }
}

/// Runner that always fails during its run phase.
#[derive(Debug)]
pub struct FailingRunner;

impl Runner for FailingRunner {
    fn run(&self, _ctx: &RunContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!("injected failure")
    }
}

/// Task node that produces `output` by touching it.
pub fn touch_node(label: &str, output: impl Into<PathBuf>) -> Arc<Node> {
    Node::builder()
        .description(label)
        .output_files(output.into())
        .runner(TouchRunner)
        .build()
        .expect("valid touch node")
}

/// Task node that consumes `input` and produces `output`.
pub fn transform_node(
    label: &str,
    input: impl Into<PathBuf>,
    output: impl Into<PathBuf>,
) -> Arc<Node> {
    Node::builder()
        .description(label)
        .input_files(input.into())
        .output_files(output.into())
        .runner(TouchRunner)
        .build()
        .expect("valid transform node")
}

/// Task node that always fails.
pub fn failing_node(label: &str, output: impl Into<PathBuf>) -> Arc<Node> {
    Node::builder()
        .description(label)
        .output_files(output.into())
        .runner(FailingRunner)
        .build()
        .expect("valid failing node")
}

/// Single-command pipeline running a shell snippet. Placeholders in the
/// snippet still resolve against the node's bindings.
pub fn shell_pipeline(script: &str) -> CommandPipeline {
    let command = AtomicCommand::build(["sh", "-c", script])
        .done()
        .expect("valid shell command");
    CommandPipeline::single(command).expect("valid single-command pipeline")
}

/// Config rooted in a test directory, with a small thread budget.
pub fn test_config(dir: &Path, max_threads: usize) -> Config {
    Config::new(dir.join("temp"), max_threads).expect("valid test config")
}
