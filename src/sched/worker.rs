// src/sched/worker.rs

//! Workers: where node lifecycles actually run.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::errors::NodeError;
use crate::graph::NodeId;
use crate::sched::scheduler::WorkItem;

/// Event sent back to the driver when a worker finishes a node.
#[derive(Debug)]
pub enum SchedEvent {
    NodeFinished {
        id: NodeId,
        result: Result<(), NodeError>,
    },
}

/// Seam between the driver and the execution substrate. The production pool
/// runs nodes on blocking threads; tests substitute a recording fake.
pub trait WorkerPool: Send {
    fn dispatch(&mut self, item: WorkItem);
}

/// Runs each node lifecycle on a dedicated blocking thread of the tokio
/// runtime and reports completions over the event channel.
pub struct TokioWorkerPool {
    config: Arc<Config>,
    events: mpsc::Sender<SchedEvent>,
}

impl TokioWorkerPool {
    pub fn new(config: Arc<Config>, events: mpsc::Sender<SchedEvent>) -> Self {
        Self { config, events }
    }
}

impl WorkerPool for TokioWorkerPool {
    fn dispatch(&mut self, item: WorkItem) {
        let config = Arc::clone(&self.config);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            debug!(node = %item.node.label(), threads = item.threads, "worker picked up node");
            let result = item.node.run(&config);
            // A closed channel means the driver is gone; nothing to do.
            let _ = events.blocking_send(SchedEvent::NodeFinished {
                id: item.id,
                result,
            });
        });
    }
}
