use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use pipedag::errors::NodeError;
use pipedag::sched::{SchedEvent, WorkItem, WorkerPool};

/// A fake worker pool that:
/// - records which nodes were "run", in dispatch order
/// - immediately reports success (or an injected failure) for each node.
pub struct FakeWorkerPool {
    events: mpsc::Sender<SchedEvent>,
    executed: Arc<Mutex<Vec<String>>>,
    failing: HashSet<String>,
}

impl FakeWorkerPool {
    pub fn new(events: mpsc::Sender<SchedEvent>, executed: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            events,
            executed,
            failing: HashSet::new(),
        }
    }

    /// Make the node with this label report a failure instead of success.
    pub fn failing(mut self, label: &str) -> Self {
        self.failing.insert(label.to_string());
        self
    }
}

impl WorkerPool for FakeWorkerPool {
    fn dispatch(&mut self, item: WorkItem) {
        let label = item.node.label();
        self.executed.lock().unwrap().push(label.clone());

        let result = if self.failing.contains(&label) {
            Err(NodeError::Unhandled {
                node: label,
                message: "injected failure".to_string(),
            })
        } else {
            Ok(())
        };
        // Tests drain eagerly; the channel is deep enough to never fill.
        let _ = self.events.try_send(SchedEvent::NodeFinished {
            id: item.id,
            result,
        });
    }
}
