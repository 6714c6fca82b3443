// src/node/mod.rs

//! Nodes: the unit of schedulable work.
//!
//! A task node owns a description of its work (a [`NodeInfo`] with declared
//! input, output, auxiliary, and executable file sets) plus a [`Runner`]
//! that performs it through the three-phase lifecycle: setup, run, teardown.
//! Each run happens inside a fresh temp directory; on success the directory
//! must be empty and is removed, on failure it is preserved together with a
//! `pipe.errors` diagnostic log.
//!
//! A meta node has no work of its own: it aggregates subnodes so a whole
//! stage can be depended upon at once. Asking a meta node to run, or for
//! done/outdated status, is an error.

pub mod command;

use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cmd::CommandPipeline;
use crate::config::Config;
use crate::errors::{MetaNodeError, NodeError};
use crate::fileset::FileSet;
use crate::fsutil;
use crate::node::command::CommandRunner;
use crate::version::Requirement;

/// Name of the diagnostic log written to a failed node's temp directory.
pub const ERROR_LOG_NAME: &str = "pipe.errors";

/// Declared properties of a task node. Plain data, so work descriptions can
/// be serialized and shipped to workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub description: Option<String>,
    /// Files that must exist before the node runs; staleness compares their
    /// timestamps against the outputs.
    pub input_files: FileSet,
    /// Files the node promises to create.
    pub output_files: FileSet,
    /// Programs that must be resolvable before the node runs.
    pub executables: FileSet,
    /// Files that must exist but do not participate in staleness (indices,
    /// reference data).
    pub auxiliary_files: FileSet,
    /// Threads reserved from the global budget while the node runs.
    pub threads: usize,
    /// External tool version requirements, checked during setup.
    pub requirements: Vec<Requirement>,
}

/// Everything a runner phase may look at.
pub struct RunContext<'a> {
    pub config: &'a Config,
    pub temp: &'a Path,
    pub info: &'a NodeInfo,
}

/// The three-phase lifecycle of a task node. All phases run on a worker
/// thread and may block.
///
/// Phases report failures as `anyhow::Error`; errors that are not already a
/// [`NodeError`] are wrapped in [`NodeError::Unhandled`] by [`Node::run`].
pub trait Runner: Debug + Send + Sync + 'static {
    /// Pre-flight checks. The default verifies executables, version
    /// requirements, input files, and auxiliary files, in that order.
    fn setup(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        default_setup(ctx)?;
        Ok(())
    }

    /// The actual work. The default does nothing, which makes a node with
    /// no runner a pure checkpoint over its declared files.
    fn run(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Post-flight checks and commit. The default verifies that every
    /// declared output file now exists.
    fn teardown(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        default_teardown(ctx)?;
        Ok(())
    }
}

/// Default setup phase: executables, versions, inputs, auxiliary files.
pub fn default_setup(ctx: &RunContext<'_>) -> Result<(), NodeError> {
    let node = ctx.info.label();

    let missing = fsutil::missing_executables(&ctx.info.executables);
    if !missing.is_empty() {
        return Err(NodeError::MissingExecutables {
            node,
            executables: missing,
        });
    }

    for requirement in &ctx.info.requirements {
        requirement.check(ctx.config.version_cache())?;
    }

    let missing = fsutil::missing_files(&ctx.info.input_files);
    if !missing.is_empty() {
        return Err(NodeError::MissingFiles {
            kind: "input",
            node,
            files: missing,
        });
    }

    let missing = fsutil::missing_files(&ctx.info.auxiliary_files);
    if !missing.is_empty() {
        return Err(NodeError::MissingFiles {
            kind: "auxiliary",
            node,
            files: missing,
        });
    }

    Ok(())
}

/// Default teardown phase: every declared output must exist.
pub fn default_teardown(ctx: &RunContext<'_>) -> Result<(), NodeError> {
    let missing = fsutil::missing_files(&ctx.info.output_files);
    if !missing.is_empty() {
        return Err(NodeError::MissingFiles {
            kind: "output",
            node: ctx.info.label(),
            files: missing,
        });
    }
    Ok(())
}

impl NodeInfo {
    pub fn label(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| "<unnamed node>".to_string())
    }
}

#[derive(Debug)]
enum NodeKind {
    Task {
        info: NodeInfo,
        runner: Arc<dyn Runner>,
    },
    Meta {
        description: Option<String>,
    },
}

/// A vertex of the dependency graph.
#[derive(Debug)]
pub struct Node {
    kind: NodeKind,
    subnodes: Vec<Arc<Node>>,
    dependencies: Vec<Arc<Node>>,
}

impl Node {
    /// Builder for a task node with a custom (or default) runner.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// Builder for a task node that runs a command pipeline; file sets and
    /// version requirements are derived from the pipeline's declarations.
    pub fn command(pipeline: CommandPipeline) -> NodeBuilder {
        let mut builder = NodeBuilder::new();
        builder.input_files = pipeline.input_files();
        builder.output_files = pipeline.output_files();
        builder.executables = pipeline.executables();
        builder.auxiliary_files = pipeline.auxiliary_files();
        builder.requirements = pipeline.requirements();
        builder.runner = Some(Arc::new(CommandRunner::new(pipeline)));
        builder
    }

    /// Builder for a meta node aggregating a set of subnodes.
    pub fn meta() -> MetaNodeBuilder {
        MetaNodeBuilder::default()
    }

    pub fn description(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Task { info, .. } => info.description.as_deref(),
            NodeKind::Meta { description } => description.as_deref(),
        }
    }

    pub fn label(&self) -> String {
        match &self.kind {
            NodeKind::Task { info, .. } => info.label(),
            NodeKind::Meta { description } => description
                .clone()
                .unwrap_or_else(|| "<meta node>".to_string()),
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self.kind, NodeKind::Meta { .. })
    }

    /// Declared work description; `None` for meta nodes.
    pub fn info(&self) -> Option<&NodeInfo> {
        match &self.kind {
            NodeKind::Task { info, .. } => Some(info),
            NodeKind::Meta { .. } => None,
        }
    }

    /// Threads reserved while running. Meta nodes never run and reserve
    /// nothing.
    pub fn threads(&self) -> usize {
        self.info().map_or(0, |info| info.threads)
    }

    pub fn subnodes(&self) -> &[Arc<Node>] {
        &self.subnodes
    }

    pub fn dependencies(&self) -> &[Arc<Node>] {
        &self.dependencies
    }

    /// True when every declared output exists and every subnode is done.
    /// Zero-byte outputs count as done.
    pub fn is_done(&self) -> Result<bool, NodeError> {
        let NodeKind::Task { info, .. } = &self.kind else {
            return Err(MetaNodeError {
                operation: "is_done",
            }
            .into());
        };

        for subnode in &self.subnodes {
            if !subnode.is_done()? {
                return Ok(false);
            }
        }

        Ok(fsutil::missing_files(&info.output_files).is_empty())
    }

    /// True when the node is done but any input is newer than the oldest
    /// output. Nodes without inputs or without outputs are never outdated.
    pub fn is_outdated(&self) -> Result<bool, NodeError> {
        let NodeKind::Task { info, .. } = &self.kind else {
            return Err(MetaNodeError {
                operation: "is_outdated",
            }
            .into());
        };

        if info.input_files.is_empty() || info.output_files.is_empty() {
            return Ok(false);
        }
        if !self.is_done()? {
            return Ok(false);
        }

        fsutil::modified_after(&info.input_files, &info.output_files)
    }

    /// Run the node through its full lifecycle inside a fresh temp
    /// directory. On failure the directory is preserved and a `pipe.errors`
    /// log is written into it.
    pub fn run(&self, config: &Config) -> Result<(), NodeError> {
        let NodeKind::Task { info, runner } = &self.kind else {
            return Err(MetaNodeError { operation: "run" }.into());
        };

        let temp = fsutil::create_temp_dir(&config.temp_root)?;
        debug!(node = %self.label(), temp = ?temp, "node started");

        let ctx = RunContext {
            config,
            temp: &temp,
            info,
        };
        let outcome = runner
            .setup(&ctx)
            .and_then(|()| runner.run(&ctx))
            .and_then(|()| runner.teardown(&ctx));

        match outcome {
            Ok(()) => {
                // The lifecycle must leave nothing behind; a non-empty
                // directory is a bug in the runner and fails the node.
                fs::remove_dir(&temp).map_err(|source| NodeError::TempDir {
                    path: temp.clone(),
                    source,
                })?;
                debug!(node = %self.label(), "node finished");
                Ok(())
            }
            Err(err) => {
                let err = classify(err, &self.label());
                write_error_log(&temp, info, &err);
                warn!(
                    node = %self.label(),
                    temp = ?temp,
                    error = %err,
                    "node failed; temp directory preserved"
                );
                Err(err)
            }
        }
    }
}

/// Fold an arbitrary phase error into the node error taxonomy.
fn classify(err: anyhow::Error, node: &str) -> NodeError {
    match err.downcast::<NodeError>() {
        Ok(node_err) => node_err,
        Err(other) => NodeError::Unhandled {
            node: node.to_string(),
            message: format!("{other:?}"),
        },
    }
}

/// Best-effort diagnostic log for a failed node.
fn write_error_log(temp: &Path, info: &NodeInfo, error: &NodeError) {
    if !temp.is_dir() {
        return;
    }

    let format_files = |files: &FileSet| -> String {
        if files.is_empty() {
            "<none>".to_string()
        } else {
            files
                .sorted()
                .iter()
                .map(|path| format!("{path:?}"))
                .collect::<Vec<_>>()
                .join("\n                   ")
        }
    };

    let argv: Vec<String> = std::env::args().collect();
    let cwd = std::env::current_dir()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let text = format!(
        "Command          = {argv:?}\n\
         CWD              = {cwd}\n\
         Node             = {label}\n\
         Threads          = {threads}\n\
         Input files      = {inputs}\n\
         Output files     = {outputs}\n\
         Auxiliary files  = {auxiliary}\n\
         Executables      = {executables}\n\
         \n\
         Errors =\n{error}\n",
        label = info.label(),
        threads = info.threads,
        inputs = format_files(&info.input_files),
        outputs = format_files(&info.output_files),
        auxiliary = format_files(&info.auxiliary_files),
        executables = format_files(&info.executables),
    );

    if let Err(err) = fs::write(temp.join(ERROR_LOG_NAME), text) {
        warn!(temp = ?temp, error = %err, "could not write error log");
    }
}

#[derive(Debug)]
struct DefaultRunner;

impl Runner for DefaultRunner {}

/// Builder for task nodes.
pub struct NodeBuilder {
    description: Option<String>,
    input_files: FileSet,
    output_files: FileSet,
    executables: FileSet,
    auxiliary_files: FileSet,
    threads: usize,
    requirements: Vec<Requirement>,
    runner: Option<Arc<dyn Runner>>,
    subnodes: Vec<Arc<Node>>,
    dependencies: Vec<Arc<Node>>,
}

impl NodeBuilder {
    fn new() -> Self {
        Self {
            description: None,
            input_files: FileSet::empty(),
            output_files: FileSet::empty(),
            executables: FileSet::empty(),
            auxiliary_files: FileSet::empty(),
            threads: 1,
            requirements: Vec::new(),
            runner: None,
            subnodes: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input_files(mut self, files: impl Into<FileSet>) -> Self {
        self.input_files.merge(&files.into());
        self
    }

    pub fn output_files(mut self, files: impl Into<FileSet>) -> Self {
        self.output_files.merge(&files.into());
        self
    }

    pub fn executables(mut self, files: impl Into<FileSet>) -> Self {
        self.executables.merge(&files.into());
        self
    }

    pub fn auxiliary_files(mut self, files: impl Into<FileSet>) -> Self {
        self.auxiliary_files.merge(&files.into());
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn runner(mut self, runner: impl Runner) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    pub fn subnode(mut self, node: Arc<Node>) -> Self {
        self.subnodes.push(node);
        self
    }

    pub fn dependency(mut self, node: Arc<Node>) -> Self {
        self.dependencies.push(node);
        self
    }

    pub fn dependencies(mut self, nodes: impl IntoIterator<Item = Arc<Node>>) -> Self {
        self.dependencies.extend(nodes);
        self
    }

    pub fn build(self) -> Result<Arc<Node>, NodeError> {
        let info = NodeInfo {
            description: self.description,
            input_files: self.input_files,
            output_files: self.output_files,
            executables: self.executables,
            auxiliary_files: self.auxiliary_files,
            threads: self.threads,
            requirements: self.requirements,
        };
        let node = info.label();

        if info.threads == 0 {
            return Err(NodeError::InvalidThreads { node });
        }
        for (kind, files) in [
            ("input", &info.input_files),
            ("output", &info.output_files),
            ("executable", &info.executables),
            ("auxiliary", &info.auxiliary_files),
        ] {
            if files.has_invalid_paths() {
                return Err(NodeError::InvalidPath { kind, node });
            }
        }

        Ok(Arc::new(Node {
            kind: NodeKind::Task {
                info,
                runner: self.runner.unwrap_or_else(|| Arc::new(DefaultRunner)),
            },
            subnodes: self.subnodes,
            dependencies: self.dependencies,
        }))
    }
}

/// Builder for meta nodes.
#[derive(Default)]
pub struct MetaNodeBuilder {
    description: Option<String>,
    subnodes: Vec<Arc<Node>>,
    dependencies: Vec<Arc<Node>>,
}

impl MetaNodeBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn subnode(mut self, node: Arc<Node>) -> Self {
        self.subnodes.push(node);
        self
    }

    pub fn subnodes(mut self, nodes: impl IntoIterator<Item = Arc<Node>>) -> Self {
        self.subnodes.extend(nodes);
        self
    }

    pub fn dependency(mut self, node: Arc<Node>) -> Self {
        self.dependencies.push(node);
        self
    }

    pub fn build(self) -> Arc<Node> {
        Arc::new(Node {
            kind: NodeKind::Meta {
                description: self.description,
            },
            subnodes: self.subnodes,
            dependencies: self.dependencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config::new(dir.join("temp"), 2).unwrap()
    }

    #[test]
    fn builder_rejects_zero_threads() {
        let err = Node::builder().threads(0).build().unwrap_err();
        assert!(matches!(err, NodeError::InvalidThreads { .. }));
    }

    #[test]
    fn builder_rejects_empty_paths() {
        let err = Node::builder()
            .input_files(FileSet::new([""]))
            .build()
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidPath { kind: "input", .. }));
    }

    #[test]
    fn meta_node_rejects_task_operations() {
        let meta = Node::meta().description("stage").build();
        assert!(matches!(
            meta.is_done(),
            Err(NodeError::Meta(MetaNodeError {
                operation: "is_done"
            }))
        ));
        assert!(matches!(
            meta.is_outdated(),
            Err(NodeError::Meta(MetaNodeError {
                operation: "is_outdated"
            }))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            meta.run(&test_config(dir.path())),
            Err(NodeError::Meta(MetaNodeError { operation: "run" }))
        ));
    }

    #[test]
    fn is_done_tracks_output_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");
        let node = Node::builder()
            .output_files(output.clone())
            .build()
            .unwrap();

        assert!(!node.is_done().unwrap());
        std::fs::write(&output, b"").unwrap();
        assert!(node.is_done().unwrap());
    }

    #[test]
    fn node_without_inputs_is_never_outdated() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");
        std::fs::write(&output, b"x").unwrap();

        let node = Node::builder().output_files(output).build().unwrap();
        assert!(!node.is_outdated().unwrap());
    }

    #[test]
    fn newer_input_makes_node_outdated() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, b"i").unwrap();
        std::fs::write(&output, b"o").unwrap();

        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&input)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let node = Node::builder()
            .input_files(input)
            .output_files(output)
            .build()
            .unwrap();
        assert!(node.is_done().unwrap());
        assert!(node.is_outdated().unwrap());
    }

    #[test]
    fn run_cleans_up_temp_dir_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let node = Node::builder().description("noop").build().unwrap();

        node.run(&config).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(&config.temp_root)
            .unwrap()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failing_setup_preserves_temp_dir_with_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let node = Node::builder()
            .description("needs input")
            .input_files(dir.path().join("never-created.txt"))
            .build()
            .unwrap();

        let err = node.run(&config).unwrap_err();
        assert!(matches!(err, NodeError::MissingFiles { kind: "input", .. }));

        let mut temp_dirs: Vec<_> = std::fs::read_dir(&config.temp_root)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(temp_dirs.len(), 1);

        let log = std::fs::read_to_string(temp_dirs.pop().unwrap().join(ERROR_LOG_NAME)).unwrap();
        assert!(log.contains("needs input"));
        assert!(log.contains("never-created.txt"));
        assert!(log.contains("Errors ="));
    }

    #[derive(Debug)]
    struct ExplodingRunner;

    impl Runner for ExplodingRunner {
        fn run(&self, _ctx: &RunContext<'_>) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("sequence data went missing"))
        }
    }

    #[test]
    fn foreign_errors_are_wrapped_as_unhandled() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let node = Node::builder()
            .description("explodes")
            .runner(ExplodingRunner)
            .build()
            .unwrap();

        let err = node.run(&config).unwrap_err();
        match err {
            NodeError::Unhandled { node, message } => {
                assert_eq!(node, "explodes");
                assert!(message.contains("sequence data went missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_outputs_fail_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let node = Node::builder()
            .description("promises too much")
            .output_files(dir.path().join("never-produced.txt"))
            .build()
            .unwrap();

        let err = node.run(&config).unwrap_err();
        assert!(matches!(err, NodeError::MissingFiles { kind: "output", .. }));
    }
}
