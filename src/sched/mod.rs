// src/sched/mod.rs

//! Scheduling and execution of the node graph.
//!
//! The [`Scheduler`](scheduler::Scheduler) is a pure state machine over the
//! graph: it decides what to dispatch and digests completion events without
//! touching threads or channels itself. The [`driver`] owns the async event
//! loop, and [`worker`] runs node lifecycles on blocking worker threads.

pub mod driver;
pub mod scheduler;
pub mod worker;

pub use driver::Driver;
pub use scheduler::{NodeState, RunSummary, Scheduler, SchedulerStep, WorkItem};
pub use worker::{SchedEvent, TokioWorkerPool, WorkerPool};
