// src/sched/driver.rs

//! Async event loop connecting the scheduler to a worker pool.

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::errors::{PipelineError, Result};
use crate::sched::scheduler::{RunSummary, Scheduler, SchedulerStep};
use crate::sched::worker::{SchedEvent, WorkerPool};

/// Drives the graph to completion: dispatches whatever the scheduler hands
/// out, then sleeps on the event channel until a worker reports back.
pub struct Driver<P: WorkerPool> {
    scheduler: Scheduler,
    pool: P,
    events: mpsc::Receiver<SchedEvent>,
}

impl<P: WorkerPool> Driver<P> {
    pub fn new(scheduler: Scheduler, pool: P, events: mpsc::Receiver<SchedEvent>) -> Self {
        Self {
            scheduler,
            pool,
            events,
        }
    }

    pub async fn run(mut self) -> Result<RunSummary> {
        let mut step = self.scheduler.initial_step();
        loop {
            self.apply(&mut step);
            if step.finished {
                break;
            }

            let Some(event) = self.events.recv().await else {
                return Err(PipelineError::Other(anyhow!(
                    "worker event channel closed while nodes were running"
                )));
            };
            let SchedEvent::NodeFinished { id, result } = event;
            if result.is_ok() {
                info!(node = %self.scheduler.graph().node(id).label(), "node done");
            }
            step = self.scheduler.handle_completion(id, result);
        }

        Ok(self.scheduler.summary())
    }

    fn apply(&mut self, step: &mut SchedulerStep) {
        for &id in &step.newly_failed {
            error!(node = %self.scheduler.graph().node(id).label(), "node failed");
        }
        for item in step.dispatch.drain(..) {
            info!(
                node = %item.node.label(),
                threads = item.threads,
                "dispatching node"
            );
            self.pool.dispatch(item);
        }
    }
}
