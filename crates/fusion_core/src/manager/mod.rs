//! # Task Manager
//!
//! Executes one tick's task list across a worker pool, honouring named
//! dependencies, with the primary thread as a participant.
//!
//! ## Per-tick protocol
//!
//! ```text
//! primary thread                           workers
//! ──────────────                           ───────
//! spawn_jobs_for_system_tasks(tasks) ──┬─> root worker nodes start
//!                                      └─> root primary nodes queued
//! wait_for_system_tasks()
//!   ├─ run primary nodes as they become ready
//!   ├─ meanwhile, run shared-queue jobs
//!   └─ block until every worker node finished
//! <serial phase: property sync, signal delivery>
//! ```
//!
//! Spawn and wait bracket the only parallel region. Both must be called from
//! the thread that constructed the manager.

mod graph;
mod latch;
mod pool;

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver};
use parking_lot::Mutex;

pub(crate) use graph::serial_order;
pub use pool::{current_affinity, AffinityId};

use crate::config::ManagerConfig;
use crate::error::SchedulerError;
use crate::task::{Task, TickContext};
use graph::TickGraph;
use pool::WorkerPool;

/// How long the primary thread sleeps between helping attempts while it
/// waits for workers.
const HELP_POLL: Duration = Duration::from_micros(250);

/// Outcome counts for one spawn/wait cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickTaskReport {
    /// Tasks whose `update()` returned `Ok`.
    pub completed: usize,
    /// Tasks whose `update()` returned `Err`.
    pub failed: usize,
    /// Tasks whose `update()` panicked.
    pub panicked: usize,
    /// How many of the above ran on the primary thread as primary-only tasks.
    pub primary_executed: usize,
}

impl TickTaskReport {
    /// Total tasks executed.
    #[inline]
    #[must_use]
    pub fn executed(&self) -> usize {
        self.completed + self.failed + self.panicked
    }
}

struct InFlight {
    graph: Arc<TickGraph>,
    primary_ready: Receiver<usize>,
    primary_count: usize,
}

/// Parallel task executor with a designated primary thread.
pub struct TaskManager {
    primary: ThreadId,
    pool: WorkerPool,
    affinities: Vec<AffinityId>,
    in_flight: Option<InFlight>,
    thread_cleanup: Vec<Arc<dyn Fn() + Send + Sync>>,
}

impl TaskManager {
    /// Creates a manager owned by the calling thread.
    ///
    /// Spawns the worker pool, then has every worker report its affinity id.
    ///
    /// # Errors
    ///
    /// `PoolUnavailable` if the pool cannot be started.
    pub fn new(config: &ManagerConfig) -> Result<Self, SchedulerError> {
        let threads = config.resolved_worker_threads();
        let pool = WorkerPool::new(threads, config.affinity_queue_depth)?;

        let mut manager = Self {
            primary: thread::current().id(),
            pool,
            affinities: Vec::new(),
            in_flight: None,
            thread_cleanup: Vec::new(),
        };

        let discovered = Arc::new(Mutex::new(Vec::with_capacity(threads)));
        let sink = Arc::clone(&discovered);
        manager.non_standard_per_thread_callback(move || {
            if let Some(id) = current_affinity() {
                sink.lock().push(id);
            }
        })?;
        manager.affinities = std::mem::take(&mut *discovered.lock());

        tracing::info!(
            workers = manager.affinities.len(),
            affinity_queue_depth = config.affinity_queue_depth,
            "task manager ready"
        );
        Ok(manager)
    }

    /// Creates a manager with `threads` workers and default queue depth.
    ///
    /// # Errors
    ///
    /// `PoolUnavailable` if the pool cannot be started.
    pub fn with_threads(threads: usize) -> Result<Self, SchedulerError> {
        Self::new(&ManagerConfig {
            worker_threads: threads.max(1),
            ..ManagerConfig::default()
        })
    }

    /// True when called from the thread that constructed this manager.
    #[inline]
    #[must_use]
    pub fn is_primary_thread(&self) -> bool {
        thread::current().id() == self.primary
    }

    /// Number of worker threads.
    #[inline]
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.len()
    }

    /// Affinity ids reported by the workers at startup.
    #[must_use]
    pub fn affinity_ids(&self) -> &[AffinityId] {
        &self.affinities
    }

    /// Builds this tick's dependency graph and starts every task with no
    /// unfinished dependency.
    ///
    /// Worker tasks are assigned affinity hints round-robin. Primary-only
    /// tasks are held until [`wait_for_system_tasks`](Self::wait_for_system_tasks).
    ///
    /// # Errors
    ///
    /// - `NotPrimaryThread` off the primary thread
    /// - `EmptyTaskList` for an empty `tasks`
    /// - `PreconditionViolation` if the previous spawn was never waited for
    /// - `DependencyCycle` if the named dependencies loop; nothing is started
    pub fn spawn_jobs_for_system_tasks(
        &mut self,
        tasks: &[Arc<dyn Task>],
        ctx: &TickContext,
    ) -> Result<(), SchedulerError> {
        if !self.is_primary_thread() {
            tracing::error!("spawn_jobs_for_system_tasks called off the primary thread");
            return Err(SchedulerError::NotPrimaryThread);
        }
        if tasks.is_empty() {
            return Err(SchedulerError::EmptyTaskList);
        }
        if self.in_flight.is_some() {
            return Err(SchedulerError::PreconditionViolation(
                "previous tick's tasks were never waited for",
            ));
        }

        let (primary_tx, primary_rx) = unbounded();
        let graph = Arc::new(TickGraph::build(
            tasks,
            ctx.clone(),
            self.pool.handle().clone(),
            &self.affinities,
            primary_tx,
        )?);
        let primary_count = graph.primary_count();

        tracing::debug!(
            tick = ctx.tick,
            tasks = tasks.len(),
            primary = primary_count,
            categories = %ctx.categories,
            "spawning tick graph"
        );

        graph.start();
        self.in_flight = Some(InFlight {
            graph,
            primary_ready: primary_rx,
            primary_count,
        });
        Ok(())
    }

    /// Runs the primary-only tasks as they become ready, then blocks until
    /// every worker task has finished.
    ///
    /// While nothing is ready for it, the primary thread takes jobs off the
    /// shared queue.
    ///
    /// # Errors
    ///
    /// - `NotPrimaryThread` off the primary thread
    /// - `NothingSpawned` without a preceding spawn
    pub fn wait_for_system_tasks(&mut self) -> Result<TickTaskReport, SchedulerError> {
        if !self.is_primary_thread() {
            tracing::error!("wait_for_system_tasks called off the primary thread");
            return Err(SchedulerError::NotPrimaryThread);
        }
        let Some(in_flight) = self.in_flight.take() else {
            return Err(SchedulerError::NothingSpawned);
        };

        let InFlight {
            graph,
            primary_ready,
            primary_count,
        } = in_flight;
        let shared = self.pool.shared_receiver();

        let mut primary_executed = 0usize;
        while primary_executed < primary_count {
            select! {
                recv(primary_ready) -> index => match index {
                    Ok(index) => {
                        graph.run_node(index);
                        primary_executed += 1;
                    }
                    Err(_) => break,
                },
                recv(shared) -> job => {
                    if let Ok(job) = job {
                        job();
                    }
                },
            }
        }

        let latch = graph.workers_done();
        while !latch.is_released() {
            match shared.try_recv() {
                Ok(job) => job(),
                Err(_) => {
                    latch.wait_for(HELP_POLL);
                }
            }
        }

        let tally = graph.tally();
        let report = TickTaskReport {
            completed: tally.completed,
            failed: tally.failed,
            panicked: tally.panicked,
            primary_executed,
        };

        if report.failed + report.panicked > 0 {
            tracing::warn!(
                failed = report.failed,
                panicked = report.panicked,
                "tick finished with task failures"
            );
        }
        Ok(report)
    }

    /// Runs `f` exactly once on every worker thread and blocks until all
    /// invocations return.
    ///
    /// # Errors
    ///
    /// `PreconditionViolation` when called from a worker thread.
    pub fn non_standard_per_thread_callback<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pool.broadcast(Arc::new(f))
    }

    /// Registers `f` to run once on every worker when the manager is dropped,
    /// before the workers exit. For releasing thread-local state.
    pub fn add_thread_cleanup<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.thread_cleanup.push(Arc::new(f));
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        if self.in_flight.take().is_some() {
            tracing::warn!("task manager dropped with a tick in flight, unfinished tasks are abandoned");
        }
        for cleanup in std::mem::take(&mut self.thread_cleanup) {
            if let Err(err) = self.pool.broadcast(cleanup) {
                tracing::error!(error = %err, "thread cleanup skipped");
            }
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("primary", &self.primary)
            .field("workers", &self.pool.len())
            .field("in_flight", &self.in_flight.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FnTask, TaskCategory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_affinities_discovered_at_startup() {
        let manager = TaskManager::with_threads(3).unwrap();
        assert_eq!(manager.worker_count(), 3);

        let mut ids: Vec<_> = manager.affinity_ids().iter().map(|id| id.index()).collect();
        ids.sort_unstable();
        assert_eq!(ids, [0, 1, 2]);
    }

    #[test]
    fn test_constructing_thread_is_primary() {
        let manager = TaskManager::with_threads(1).unwrap();
        assert!(manager.is_primary_thread());

        let manager = Arc::new(Mutex::new(manager));
        let remote = Arc::clone(&manager);
        let off_primary = thread::spawn(move || remote.lock().is_primary_thread())
            .join()
            .unwrap();
        assert!(!off_primary);
    }

    #[test]
    fn test_empty_task_list_rejected() {
        let mut manager = TaskManager::with_threads(1).unwrap();
        assert_eq!(
            manager.spawn_jobs_for_system_tasks(&[], &TickContext::default()),
            Err(SchedulerError::EmptyTaskList)
        );
    }

    #[test]
    fn test_wait_without_spawn_rejected() {
        let mut manager = TaskManager::with_threads(1).unwrap();
        assert_eq!(manager.wait_for_system_tasks(), Err(SchedulerError::NothingSpawned));
    }

    #[test]
    fn test_double_spawn_rejected() {
        let mut manager = TaskManager::with_threads(1).unwrap();
        let tasks = vec![FnTask::new("a", TaskCategory::SIMULATION, |_| Ok(())).shared()];
        let ctx = TickContext::default();

        manager.spawn_jobs_for_system_tasks(&tasks, &ctx).unwrap();
        assert!(matches!(
            manager.spawn_jobs_for_system_tasks(&tasks, &ctx),
            Err(SchedulerError::PreconditionViolation(_))
        ));
        manager.wait_for_system_tasks().unwrap();
    }

    #[test]
    fn test_primary_tasks_run_on_primary_thread() {
        let mut manager = TaskManager::with_threads(2).unwrap();
        let primary = thread::current().id();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let on_primary = FnTask::new("ui", TaskCategory::RENDERING, move |_| {
            sink.lock().push(thread::current().id());
            Ok(())
        })
        .primary_thread_only()
        .shared();

        manager
            .spawn_jobs_for_system_tasks(&[on_primary], &TickContext::default())
            .unwrap();
        let report = manager.wait_for_system_tasks().unwrap();

        assert_eq!(report.primary_executed, 1);
        assert_eq!(*seen.lock(), [primary]);
    }

    #[test]
    fn test_failures_counted_not_fatal() {
        let mut manager = TaskManager::with_threads(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let tasks = vec![
            FnTask::new("bad", TaskCategory::SIMULATION, |_| Err("bad input".into())).shared(),
            FnTask::new("worse", TaskCategory::SIMULATION, |_| panic!("worse")).shared(),
            FnTask::new("after", TaskCategory::SIMULATION, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .depends_on("bad")
            .depends_on("worse")
            .shared(),
        ];

        manager
            .spawn_jobs_for_system_tasks(&tasks, &TickContext::default())
            .unwrap();
        let report = manager.wait_for_system_tasks().unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.panicked, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cycle_rejected_and_manager_reusable() {
        let mut manager = TaskManager::with_threads(1).unwrap();
        let cyclic = vec![
            FnTask::new("a", TaskCategory::SIMULATION, |_| Ok(())).depends_on("b").shared(),
            FnTask::new("b", TaskCategory::SIMULATION, |_| Ok(())).depends_on("a").shared(),
        ];
        let ctx = TickContext::default();

        assert!(matches!(
            manager.spawn_jobs_for_system_tasks(&cyclic, &ctx),
            Err(SchedulerError::DependencyCycle(_))
        ));

        let fine = vec![FnTask::new("c", TaskCategory::SIMULATION, |_| Ok(())).shared()];
        manager.spawn_jobs_for_system_tasks(&fine, &ctx).unwrap();
        assert_eq!(manager.wait_for_system_tasks().unwrap().completed, 1);
    }

    #[test]
    fn test_thread_cleanup_runs_on_every_worker() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        {
            let mut manager = TaskManager::with_threads(3).unwrap();
            let counter = Arc::clone(&cleaned);
            manager.add_thread_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(cleaned.load(Ordering::SeqCst), 3);
    }
}
