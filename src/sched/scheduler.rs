// src/sched/scheduler.rs

//! Pure scheduling state machine.
//!
//! The scheduler never performs IO beyond the freshness probes of the nodes
//! themselves (`is_done` / `is_outdated`): it tracks one [`NodeState`] per
//! graph node, reserves threads from the global budget while nodes run, and
//! turns completion events into the next batch of dispatchable work. All
//! decisions are deterministic: ready nodes are dispatched most-depended-on
//! first, with the node id as tiebreaker.

use std::sync::Arc;

use tracing::warn;

use crate::errors::{NodeError, PipelineError};
use crate::graph::{NodeGraph, NodeId};
use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting on dependencies or subnodes.
    NotReady,
    /// All dependencies done; waiting for budget.
    Ready,
    /// Dispatched to a worker.
    Running,
    /// Work complete (or outputs already fresh at startup).
    Done,
    /// The node failed, or an upstream node did.
    Failed,
}

/// One node to hand to a worker.
#[derive(Debug)]
pub struct WorkItem {
    pub id: NodeId,
    pub node: Arc<Node>,
    pub threads: usize,
}

/// Outcome of digesting one event (or of startup).
#[derive(Debug, Default)]
pub struct SchedulerStep {
    /// Nodes to dispatch now, in priority order.
    pub dispatch: Vec<WorkItem>,
    /// Nodes that entered `Failed` during this step, directly or by
    /// propagation.
    pub newly_failed: Vec<NodeId>,
    /// True when nothing is running and nothing further can be dispatched.
    pub finished: bool,
}

/// Totals reported after the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Task nodes that ran to completion.
    pub done: usize,
    /// Task nodes whose outputs were already fresh at startup.
    pub skipped: usize,
    /// Labels and errors of every failed node.
    pub failed: Vec<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Scheduler {
    graph: NodeGraph,
    states: Vec<NodeState>,
    errors: Vec<Option<String>>,
    /// Whether the node was found done (and fresh) at startup.
    preexisting: Vec<bool>,
    /// Direct downstream consumer count; higher dispatches first.
    priority: Vec<usize>,
    budget: usize,
    reserved: usize,
    running: usize,
}

impl Scheduler {
    pub fn new(graph: NodeGraph, budget: usize) -> Result<Self, PipelineError> {
        for id in graph.ids() {
            let threads = graph.node(id).threads();
            if threads > budget {
                return Err(PipelineError::ThreadBudget {
                    node: graph.node(id).label(),
                    threads,
                    budget,
                });
            }
        }

        let count = graph.len();
        let priority = graph
            .ids()
            .map(|id| graph.dependents_of(id).len() + graph.parents_of(id).len())
            .collect();

        let mut scheduler = Self {
            graph,
            states: vec![NodeState::NotReady; count],
            errors: vec![None; count],
            preexisting: vec![false; count],
            priority,
            budget,
            reserved: 0,
            running: 0,
        };
        scheduler.probe_initial_states();
        Ok(scheduler)
    }

    /// First dispatch batch.
    pub fn initial_step(&mut self) -> SchedulerStep {
        self.step(Vec::new())
    }

    /// Digest a completion event from a worker.
    pub fn handle_completion(
        &mut self,
        id: NodeId,
        result: Result<(), NodeError>,
    ) -> SchedulerStep {
        let threads = self.graph.node(id).threads();
        self.reserved = self.reserved.saturating_sub(threads);
        self.running = self.running.saturating_sub(1);

        let mut newly_failed = Vec::new();
        match result {
            Ok(()) => {
                self.states[id] = NodeState::Done;
                self.preexisting[id] = false;
                self.requeue_stale_downstream(id);
            }
            Err(err) => {
                self.fail(id, err.to_string(), &mut newly_failed);
            }
        }

        self.step(newly_failed)
    }

    pub fn state_of(&self, id: NodeId) -> NodeState {
        self.states[id]
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn summary(&self) -> RunSummary {
        let mut done = 0;
        let mut skipped = 0;
        let mut failed = Vec::new();
        for id in self.graph.ids() {
            let is_task = !self.graph.node(id).is_meta();
            match self.states[id] {
                NodeState::Done if is_task && self.preexisting[id] => skipped += 1,
                NodeState::Done if is_task => done += 1,
                NodeState::Failed => {
                    let label = self.graph.node(id).label();
                    match &self.errors[id] {
                        Some(message) => failed.push(format!("{label}: {message}")),
                        None => failed.push(label),
                    }
                }
                _ => {}
            }
        }
        RunSummary {
            done,
            skipped,
            failed,
        }
    }

    /// Nodes whose outputs already exist and are fresh start out `Done`.
    fn probe_initial_states(&mut self) {
        let mut failed = Vec::new();
        for id in self.graph.ids() {
            let node = self.graph.node(id);
            if node.is_meta() {
                continue;
            }
            match node.is_done().and_then(|done| {
                Ok(done && !node.is_outdated()?)
            }) {
                Ok(true) => {
                    self.states[id] = NodeState::Done;
                    self.preexisting[id] = true;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(node = %node.label(), error = %err, "could not probe node status");
                    failed.push((id, err.to_string()));
                }
            }
        }
        let mut newly_failed = Vec::new();
        for (id, message) in failed {
            self.fail(id, message, &mut newly_failed);
        }
    }

    fn step(&mut self, newly_failed: Vec<NodeId>) -> SchedulerStep {
        self.refresh();
        let dispatch = self.take_ready();
        let finished = self.running == 0 && dispatch.is_empty();
        SchedulerStep {
            dispatch,
            newly_failed,
            finished,
        }
    }

    /// Propagate states until stable: derive meta node states from their
    /// children and promote task nodes whose dependencies are all done and
    /// still fresh.
    fn refresh(&mut self) {
        let order = self.graph.topo_order().to_vec();
        loop {
            let mut changed = false;
            for &id in &order {
                let node = self.graph.node(id).clone();
                if node.is_meta() {
                    let derived = self.derive_meta_state(id);
                    if self.states[id] != derived {
                        self.states[id] = derived;
                        changed = true;
                    }
                } else if self.states[id] == NodeState::NotReady
                    && self.deps_satisfied(id, &mut changed)
                {
                    self.states[id] = NodeState::Ready;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn derive_meta_state(&self, id: NodeId) -> NodeState {
        // A failed child poisons the meta node even while siblings run.
        if self.states[id] == NodeState::Failed {
            return NodeState::Failed;
        }
        let children = self
            .graph
            .dependencies_of(id)
            .iter()
            .chain(self.graph.subnodes_of(id));
        let mut all_done = true;
        for &child in children {
            match self.states[child] {
                NodeState::Failed => return NodeState::Failed,
                NodeState::Done => {}
                _ => all_done = false,
            }
        }
        if all_done {
            NodeState::Done
        } else {
            NodeState::NotReady
        }
    }

    /// All dependencies and subnodes done, with task dependencies re-checked
    /// for staleness: a dependency whose inputs got newer is re-queued and
    /// blocks this node. A re-queue sets `changed` so the sweep revisits the
    /// demoted node, which sits earlier in topological order.
    fn deps_satisfied(&mut self, id: NodeId, changed: &mut bool) -> bool {
        let children: Vec<NodeId> = self
            .graph
            .dependencies_of(id)
            .iter()
            .chain(self.graph.subnodes_of(id))
            .copied()
            .collect();

        let mut satisfied = true;
        for child in children {
            if self.states[child] != NodeState::Done {
                satisfied = false;
                continue;
            }
            let node = self.graph.node(child).clone();
            if !node.is_meta() && node.is_outdated().unwrap_or(false) {
                self.states[child] = NodeState::NotReady;
                self.preexisting[child] = false;
                *changed = true;
                satisfied = false;
            }
        }
        satisfied
    }

    /// Dispatch ready nodes that fit the remaining budget, most-depended-on
    /// first.
    fn take_ready(&mut self) -> Vec<WorkItem> {
        let mut ready: Vec<NodeId> = self
            .graph
            .ids()
            .filter(|&id| self.states[id] == NodeState::Ready)
            .collect();
        ready.sort_by_key(|&id| (std::cmp::Reverse(self.priority[id]), id));

        let mut dispatch = Vec::new();
        for id in ready {
            let threads = self.graph.node(id).threads();
            if threads <= self.budget - self.reserved {
                self.states[id] = NodeState::Running;
                self.reserved += threads;
                self.running += 1;
                dispatch.push(WorkItem {
                    id,
                    node: self.graph.node(id).clone(),
                    threads,
                });
            }
        }
        dispatch
    }

    /// Mark a node failed and poison everything downstream that has not
    /// already run. Running siblings and unrelated branches are untouched.
    fn fail(&mut self, id: NodeId, message: String, newly_failed: &mut Vec<NodeId>) {
        self.states[id] = NodeState::Failed;
        self.errors[id] = Some(message);
        newly_failed.push(id);

        let label = self.graph.node(id).label();
        for downstream in self.graph.downstream_of(id) {
            if matches!(
                self.states[downstream],
                NodeState::NotReady | NodeState::Ready
            ) {
                self.states[downstream] = NodeState::Failed;
                self.errors[downstream] =
                    Some(format!("not run: upstream node '{label}' failed"));
                newly_failed.push(downstream);
            }
        }
    }

    /// After a node re-runs, previously done consumers may have gone stale.
    fn requeue_stale_downstream(&mut self, id: NodeId) {
        for downstream in self.graph.downstream_of(id) {
            if self.states[downstream] != NodeState::Done {
                continue;
            }
            let node = self.graph.node(downstream).clone();
            if !node.is_meta() && node.is_outdated().unwrap_or(false) {
                self.states[downstream] = NodeState::NotReady;
                self.preexisting[downstream] = false;
            }
        }
    }
}
