//! Per-tick dependency graph.
//!
//! Built fresh on every spawn. Each node owns one task, the indices of the
//! nodes waiting on it, and a countdown of its own unfinished dependencies.
//! The node that brings a successor's countdown to zero releases it: worker
//! successors go straight to the pool, primary successors go to the primary
//! ready queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use super::latch::Latch;
use super::pool::{AffinityId, PoolHandle};
use crate::error::SchedulerError;
use crate::task::{execute_task, Task, TaskOutcome, TickContext};

struct GraphNode {
    task: Arc<dyn Task>,
    primary: bool,
    affinity: Option<AffinityId>,
    successors: Vec<usize>,
    unresolved: AtomicUsize,
}

#[derive(Default)]
struct Counters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    panicked: AtomicUsize,
}

pub(crate) struct TickGraph {
    nodes: Vec<GraphNode>,
    ctx: TickContext,
    pool: PoolHandle,
    primary_ready: Sender<usize>,
    workers_done: Latch,
    counters: Counters,
}

/// Outcome tally for one graph, see [`TickTaskReport`](super::TickTaskReport).
pub(crate) struct GraphTally {
    pub(crate) completed: usize,
    pub(crate) failed: usize,
    pub(crate) panicked: usize,
}

impl TickGraph {
    /// Resolves dependency names and rejects cycles. Nothing runs yet.
    ///
    /// `affinities` is cycled over the worker nodes.
    pub(crate) fn build(
        tasks: &[Arc<dyn Task>],
        ctx: TickContext,
        pool: PoolHandle,
        affinities: &[AffinityId],
        primary_ready: Sender<usize>,
    ) -> Result<Self, SchedulerError> {
        let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            for name in std::iter::once(task.name()).chain(task.aliases().iter().map(String::as_str)) {
                if let Some(&existing) = by_name.get(name) {
                    if existing != index {
                        tracing::warn!(name, "task name registered twice this tick, keeping the first");
                    }
                    continue;
                }
                by_name.insert(name, index);
            }
        }

        let mut next_affinity = 0usize;
        let mut nodes: Vec<GraphNode> = tasks
            .iter()
            .map(|task| {
                let primary = task.is_primary_thread_only();
                let affinity = if primary || affinities.is_empty() {
                    None
                } else {
                    let id = affinities[next_affinity % affinities.len()];
                    next_affinity += 1;
                    Some(id)
                };
                GraphNode {
                    task: Arc::clone(task),
                    primary,
                    affinity,
                    successors: Vec::new(),
                    unresolved: AtomicUsize::new(0),
                }
            })
            .collect();

        for index in 0..tasks.len() {
            for dep in tasks[index].dependencies() {
                match by_name.get(dep.as_str()) {
                    Some(&upstream) if upstream != index => {
                        nodes[upstream].successors.push(index);
                        *nodes[index].unresolved.get_mut() += 1;
                    }
                    Some(_) => {}
                    None => {
                        tracing::trace!(task = tasks[index].name(), dependency = %dep, "dependency not scheduled this tick");
                    }
                }
            }
        }

        check_acyclic(&nodes)?;

        let worker_nodes = nodes.iter().filter(|n| !n.primary).count();

        Ok(Self {
            nodes,
            ctx,
            pool,
            primary_ready,
            workers_done: Latch::new(worker_nodes),
            counters: Counters::default(),
        })
    }

    pub(crate) fn primary_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.primary).count()
    }

    /// Releases every node without dependencies.
    ///
    /// Roots are collected before any is released: once one runs, a
    /// successor's countdown can reach zero here too.
    pub(crate) fn start(self: &Arc<Self>) {
        let roots: Vec<usize> = (0..self.nodes.len())
            .filter(|&index| self.nodes[index].unresolved.load(Ordering::Acquire) == 0)
            .collect();
        for index in roots {
            self.release(index);
        }
    }

    /// Runs one node on the calling thread and releases its successors.
    pub(crate) fn run_node(self: &Arc<Self>, index: usize) {
        let node = &self.nodes[index];
        let counter = match execute_task(node.task.as_ref(), &self.ctx) {
            TaskOutcome::Completed => &self.counters.completed,
            TaskOutcome::Failed => &self.counters.failed,
            TaskOutcome::Panicked => &self.counters.panicked,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        for &successor in &node.successors {
            if self.nodes[successor].unresolved.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.release(successor);
            }
        }

        if !node.primary {
            self.workers_done.count_down();
        }
    }

    fn release(self: &Arc<Self>, index: usize) {
        let node = &self.nodes[index];
        if node.primary {
            if self.primary_ready.send(index).is_err() {
                tracing::error!(task = node.task.name(), "primary ready queue closed");
            }
            return;
        }

        let graph = Arc::clone(self);
        self.pool.spawn(Box::new(move || graph.run_node(index)), node.affinity);
    }

    pub(crate) fn workers_done(&self) -> &Latch {
        &self.workers_done
    }

    pub(crate) fn tally(&self) -> GraphTally {
        GraphTally {
            completed: self.counters.completed.load(Ordering::Acquire),
            failed: self.counters.failed.load(Ordering::Acquire),
            panicked: self.counters.panicked.load(Ordering::Acquire),
        }
    }
}

/// Kahn's algorithm over a copy of the countdowns.
fn check_acyclic(nodes: &[GraphNode]) -> Result<(), SchedulerError> {
    let mut remaining: Vec<usize> = nodes.iter().map(|n| n.unresolved.load(Ordering::Relaxed)).collect();
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| remaining[i] == 0).collect();
    let mut visited = 0usize;

    while let Some(index) = ready.pop() {
        visited += 1;
        for &successor in &nodes[index].successors {
            remaining[successor] -= 1;
            if remaining[successor] == 0 {
                ready.push(successor);
            }
        }
    }

    if visited == nodes.len() {
        return Ok(());
    }

    let stuck: Vec<String> = nodes
        .iter()
        .zip(&remaining)
        .filter(|(_, count)| **count > 0)
        .map(|(node, _)| node.task.name().to_owned())
        .collect();
    tracing::error!(tasks = ?stuck, "dependency cycle, tick not spawned");
    Err(SchedulerError::DependencyCycle(stuck))
}

/// Dependency order for running `tasks` serially on one thread.
///
/// # Errors
///
/// `DependencyCycle` if the named dependencies loop.
pub(crate) fn serial_order(tasks: &[Arc<dyn Task>]) -> Result<Vec<usize>, SchedulerError> {
    let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    for (index, task) in tasks.iter().enumerate() {
        for name in std::iter::once(task.name()).chain(task.aliases().iter().map(String::as_str)) {
            by_name.entry(name).or_insert(index);
        }
    }

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    let mut remaining = vec![0usize; tasks.len()];
    for (index, task) in tasks.iter().enumerate() {
        for dep in task.dependencies() {
            if let Some(&upstream) = by_name.get(dep.as_str()) {
                if upstream != index {
                    successors[upstream].push(index);
                    remaining[index] += 1;
                }
            }
        }
    }

    // Stable: among ready tasks, keep the incoming (hint-sorted) order
    let mut order = Vec::with_capacity(tasks.len());
    let mut ready: std::collections::VecDeque<usize> = (0..tasks.len()).filter(|&i| remaining[i] == 0).collect();
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &successor in &successors[index] {
            remaining[successor] -= 1;
            if remaining[successor] == 0 {
                ready.push_back(successor);
            }
        }
    }

    if order.len() == tasks.len() {
        Ok(order)
    } else {
        let stuck = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, _)| tasks[i].name().to_owned())
            .collect();
        Err(SchedulerError::DependencyCycle(stuck))
    }
}
