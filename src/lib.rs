// src/lib.rs

//! pipedag: a dependency-graph runner for multi-stage command pipelines.
//!
//! Work is described as a graph of [`Node`]s. A task node declares the
//! files it consumes and produces and carries a [`node::Runner`] (most
//! commonly a [`cmd::CommandPipeline`] of external processes); a meta node
//! groups subnodes into a stage. The [`Pipeline`] validates the graph,
//! skips nodes whose outputs are already fresh, and runs the rest on
//! blocking workers under a global thread budget. Each node executes in a
//! private temp directory and its outputs only reach their final paths
//! through an all-or-nothing commit, so an interrupted run never leaves
//! half-written result files.
//!
//! ```no_run
//! use pipedag::cmd::{AtomicCommand, Binding, CommandPipeline};
//! use pipedag::{Config, Node, Pipeline};
//!
//! # #[tokio::main]
//! # async fn main() -> pipedag::Result<()> {
//! let config = Config::new("/scratch/pipedag", 4)?;
//! let command = AtomicCommand::build(["gzip", "--stdout", "{IN}"])
//!     .bind("IN", Binding::InputFile("reads.fastq".into()))
//!     .stdout(pipedag::cmd::StdoutSpec::File("reads.fastq.gz".into()))
//!     .done()?;
//! let node = Node::command(CommandPipeline::single(command)?)
//!     .description("compress reads")
//!     .build()?;
//!
//! let mut pipeline = Pipeline::new(config);
//! pipeline.add_node(node);
//! let summary = pipeline.run().await?;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```

pub mod cmd;
pub mod config;
pub mod errors;
pub mod fileset;
pub mod fsutil;
pub mod graph;
pub mod logging;
pub mod node;
pub mod sched;
pub mod version;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

pub use crate::config::Config;
pub use crate::errors::{NodeError, PipelineError, Result};
pub use crate::fileset::FileSet;
pub use crate::graph::NodeGraph;
pub use crate::node::{Node, NodeInfo};
pub use crate::sched::{Driver, RunSummary, Scheduler, TokioWorkerPool};
pub use crate::version::Requirement;

/// Channel depth for worker completion events; completions are tiny and the
/// driver drains them eagerly.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A configured set of root nodes, ready to run.
pub struct Pipeline {
    config: Arc<Config>,
    nodes: Vec<Arc<Node>>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            nodes: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn add_node(&mut self, node: Arc<Node>) {
        self.nodes.push(node);
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = Arc<Node>>) {
        self.nodes.extend(nodes);
    }

    /// Validate the graph and run every node that is not already done.
    ///
    /// Returns the run totals on success; if any node failed the error
    /// carries every failed node's label and error text, and the failed
    /// nodes' temp directories are left in place under
    /// [`Config::temp_root`].
    pub async fn run(&self) -> Result<RunSummary> {
        let graph = NodeGraph::new(&self.nodes)?;
        info!(
            nodes = graph.len(),
            budget = self.config.max_threads,
            "starting pipeline"
        );

        let scheduler = Scheduler::new(graph, self.config.max_threads)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pool = TokioWorkerPool::new(Arc::clone(&self.config), events_tx);
        let summary = Driver::new(scheduler, pool, events_rx).run().await?;

        info!(
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "pipeline finished"
        );
        if summary.is_success() {
            Ok(summary)
        } else {
            Err(PipelineError::NodesFailed {
                failed: summary.failed,
            })
        }
    }
}
