//! # Task Scheduler
//!
//! Drives one tick at a time on the primary thread:
//!
//! 1. measure elapsed wall time (or wait for it, with the frame limiter)
//! 2. ask [`FixedTimestep`] which categories run
//! 3. select those tasks from the pre-grouped universe
//! 4. run them through the [`TaskManager`], or serially without one
//! 5. run every registered [`SerialPhase`] (property and event commits)
//!
//! Step 5 always follows the wait in step 4, so staged writes are never
//! committed while a task may still be producing them.

mod groups;
mod limiter;
mod timestep;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use groups::{TaskGroup, TaskGroups};
pub use limiter::FrameLimiter;
pub use timestep::{FixedTimestep, StepDecision, RENDER_CATEGORIES, SKIP_CATEGORIES};

use crate::config::{CoreConfig, SchedulerConfig, DEFAULT_STEP_HZ, MAX_FRAMESKIP_LIMIT, MIN_STEP};
use crate::error::{CoreResult, SchedulerError};
use crate::manager::{serial_order, TaskManager, TickTaskReport};
use crate::task::{execute_task, SystemWorld, Task, TaskCategory, TaskOutcome, TickContext};

/// Work run on the primary thread once per tick, after every task finished.
pub trait SerialPhase: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Runs the phase. Only ever called between ticks.
    fn run_serial(&self);
}

/// What one call to [`TaskScheduler::execute`] did.
#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    /// Context the tasks saw. `categories` is empty when nothing ran.
    pub context: TickContext,
    /// Number of tasks selected.
    pub task_count: usize,
    /// Task outcomes.
    pub tasks: TickTaskReport,
    /// Serial phases run after the tasks.
    pub serial_phases: usize,
}

impl TickReport {
    /// Categories that ran.
    #[must_use]
    pub fn categories(&self) -> TaskCategory {
        self.context.categories
    }

    /// True if the tick advanced simulation.
    #[must_use]
    pub fn simulated(&self) -> bool {
        self.context.categories.contains(TaskCategory::SIMULATION)
    }
}

/// Fixed-timestep frame driver.
pub struct TaskScheduler {
    manager: Option<TaskManager>,
    timestep: FixedTimestep,
    limiter: FrameLimiter,
    frame_limiter: bool,
    unlimited: bool,
    fuse_world_tasks: bool,
    worlds: Vec<Arc<dyn SystemWorld>>,
    groups: TaskGroups,
    serial_phases: Vec<Arc<dyn SerialPhase>>,
    last_execute: Option<Instant>,
    tick: u64,
}

impl TaskScheduler {
    /// Creates a scheduler with an empty universe.
    ///
    /// Without a manager every task runs serially on the calling thread, in
    /// dependency order.
    #[must_use]
    pub fn new(config: &SchedulerConfig, manager: Option<TaskManager>) -> Self {
        let step = match config.step() {
            Some(step) => step.max(MIN_STEP),
            None => {
                tracing::warn!(step_hz = config.step_hz, fallback_hz = DEFAULT_STEP_HZ, "unusable step rate");
                Duration::from_secs_f64(1.0 / DEFAULT_STEP_HZ)
            }
        };
        let max_frameskip = config.max_frameskip.min(MAX_FRAMESKIP_LIMIT);
        Self {
            manager,
            timestep: FixedTimestep::new(step, max_frameskip),
            limiter: FrameLimiter::new(step),
            frame_limiter: config.frame_limiter,
            unlimited: config.unlimited,
            fuse_world_tasks: config.fuse_world_tasks,
            worlds: Vec::new(),
            groups: TaskGroups::default(),
            serial_phases: Vec::new(),
            last_execute: None,
            tick: 0,
        }
    }

    /// Validates `config` and builds a scheduler with its own worker pool.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `Scheduler` if the pool cannot
    /// start.
    pub fn from_config(config: &CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let manager = TaskManager::new(&config.manager)?;
        tracing::info!(
            step_hz = config.scheduler.step_hz,
            max_frameskip = config.scheduler.max_frameskip,
            workers = manager.worker_count(),
            "task scheduler ready"
        );
        Ok(Self::new(&config.scheduler, Some(manager)))
    }

    /// The task manager, if tasks run in parallel.
    #[must_use]
    pub fn manager(&self) -> Option<&TaskManager> {
        self.manager.as_ref()
    }

    /// Mutable access to the task manager, for per-thread callbacks and
    /// cleanups.
    pub fn manager_mut(&mut self) -> Option<&mut TaskManager> {
        self.manager.as_mut()
    }

    /// Δ.
    #[must_use]
    pub fn step(&self) -> Duration {
        self.timestep.step()
    }

    /// Sets Δ. Steps of [`MIN_STEP`] or less are refused.
    pub fn set_step(&mut self, step: Duration) -> bool {
        if step <= MIN_STEP {
            tracing::warn!(?step, min = ?MIN_STEP, "refusing simulation step");
            return false;
        }
        self.timestep.set_step(step);
        self.limiter.set_interval(step);
        true
    }

    /// K.
    #[must_use]
    pub fn max_frameskip(&self) -> u32 {
        self.timestep.max_frameskip()
    }

    /// Sets K. Values above [`MAX_FRAMESKIP_LIMIT`] are refused.
    pub fn set_max_frameskip(&mut self, max_frameskip: u32) -> bool {
        if max_frameskip > MAX_FRAMESKIP_LIMIT {
            tracing::warn!(max_frameskip, limit = MAX_FRAMESKIP_LIMIT, "refusing frame-skip count");
            return false;
        }
        self.timestep.set_max_frameskip(max_frameskip);
        true
    }

    /// With the frame limiter on, each tick waits out Δ and runs every
    /// category.
    pub fn set_frame_limiter(&mut self, enabled: bool) {
        self.frame_limiter = enabled;
        self.limiter.reset();
    }

    /// With unlimited on, every tick runs every category without waiting.
    pub fn set_unlimited(&mut self, enabled: bool) {
        self.unlimited = enabled;
    }

    /// Fixed-timestep state, for inspection.
    #[must_use]
    pub fn timestep(&self) -> &FixedTimestep {
        &self.timestep
    }

    /// Simulation ticks run so far.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Replaces the universe.
    pub fn set_universe(&mut self, worlds: Vec<Arc<dyn SystemWorld>>) {
        self.worlds = worlds;
        self.rebuild();
    }

    /// Adds one world to the universe.
    pub fn add_world(&mut self, world: Arc<dyn SystemWorld>) {
        self.worlds.push(world);
        self.rebuild();
    }

    /// Removes every world named `name`. Returns whether any was removed.
    pub fn remove_world(&mut self, name: &str) -> bool {
        let before = self.worlds.len();
        self.worlds.retain(|w| w.name() != name);
        let removed = self.worlds.len() != before;
        if removed {
            self.rebuild();
        }
        removed
    }

    /// Worlds in the universe.
    #[must_use]
    pub fn worlds(&self) -> &[Arc<dyn SystemWorld>] {
        &self.worlds
    }

    /// The grouped task lists.
    #[must_use]
    pub fn groups(&self) -> &TaskGroups {
        &self.groups
    }

    /// Registers work to run after every tick's tasks, in registration order.
    pub fn add_serial_phase(&mut self, phase: Arc<dyn SerialPhase>) {
        self.serial_phases.push(phase);
    }

    fn rebuild(&mut self) {
        self.groups = TaskGroups::build(&self.worlds, self.fuse_world_tasks);
    }

    /// Runs one tick against wall time.
    ///
    /// # Errors
    ///
    /// Whatever the manager reports; see [`TaskManager`].
    pub fn execute(&mut self) -> Result<TickReport, SchedulerError> {
        self.execute_filtered(TaskCategory::ALL)
    }

    /// Runs one tick against wall time, restricted to `mask`.
    ///
    /// # Errors
    ///
    /// Whatever the manager reports; see [`TaskManager`].
    pub fn execute_filtered(&mut self, mask: TaskCategory) -> Result<TickReport, SchedulerError> {
        let elapsed = if self.frame_limiter && !self.unlimited {
            self.limiter.wait()
        } else {
            let now = Instant::now();
            let elapsed = self.last_execute.map_or(Duration::ZERO, |last| now.duration_since(last));
            self.last_execute = Some(now);
            elapsed
        };
        self.run_tick(elapsed, mask)
    }

    /// Runs one tick as if `elapsed` had passed. Never sleeps.
    ///
    /// # Errors
    ///
    /// Whatever the manager reports; see [`TaskManager`].
    pub fn execute_elapsed(&mut self, elapsed: Duration, mask: TaskCategory) -> Result<TickReport, SchedulerError> {
        self.run_tick(elapsed, mask)
    }

    fn run_tick(&mut self, elapsed: Duration, mask: TaskCategory) -> Result<TickReport, SchedulerError> {
        let decision = if self.frame_limiter || self.unlimited {
            self.timestep.full_step(elapsed)
        } else {
            self.timestep.advance(elapsed)
        };

        let categories = decision.categories & mask;
        if categories.contains(TaskCategory::SIMULATION) {
            self.tick += 1;
        }

        let context = TickContext {
            tick: self.tick,
            step: self.timestep.step(),
            actual_elapsed: decision.actual_elapsed,
            alpha: decision.alpha,
            frames_skipped: decision.frames_skipped,
            categories,
        };

        if categories.is_empty() {
            tracing::trace!(?elapsed, "nothing to run this tick");
            return Ok(TickReport {
                context,
                task_count: 0,
                tasks: TickTaskReport::default(),
                serial_phases: 0,
            });
        }

        let span = tracing::debug_span!("tick", tick = context.tick, categories = %categories);
        let _enter = span.enter();

        let tasks = self.groups.select(categories);
        let report = if tasks.is_empty() {
            TickTaskReport::default()
        } else if let Some(manager) = self.manager.as_mut() {
            manager.spawn_jobs_for_system_tasks(&tasks, &context)?;
            manager.wait_for_system_tasks()?
        } else {
            run_serially(&tasks, &context)?
        };

        for phase in &self.serial_phases {
            tracing::trace!(phase = phase.name(), "serial phase");
            phase.run_serial();
        }

        Ok(TickReport {
            context,
            task_count: tasks.len(),
            tasks: report,
            serial_phases: self.serial_phases.len(),
        })
    }
}

/// Runs `tasks` on the calling thread in dependency order.
fn run_serially(tasks: &[Arc<dyn Task>], ctx: &TickContext) -> Result<TickTaskReport, SchedulerError> {
    let order = serial_order(tasks)?;
    let mut report = TickTaskReport::default();
    for index in order {
        let task = tasks[index].as_ref();
        if task.is_primary_thread_only() {
            report.primary_executed += 1;
        }
        match execute_task(task, ctx) {
            TaskOutcome::Completed => report.completed += 1,
            TaskOutcome::Failed => report.failed += 1,
            TaskOutcome::Panicked => report.panicked += 1,
        }
    }
    if report.failed + report.panicked > 0 {
        tracing::warn!(
            failed = report.failed,
            panicked = report.panicked,
            "serial tick finished with task failures"
        );
    }
    Ok(report)
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("step", &self.timestep.step())
            .field("max_frameskip", &self.timestep.max_frameskip())
            .field("frame_limiter", &self.frame_limiter)
            .field("unlimited", &self.unlimited)
            .field("worlds", &self.worlds.len())
            .field("tasks", &self.groups.all().len())
            .field("parallel", &self.manager.is_some())
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FnTask;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct World {
        name: &'static str,
        tasks: Vec<Arc<dyn Task>>,
    }

    impl SystemWorld for World {
        fn name(&self) -> &str {
            self.name
        }

        fn tasks(&self) -> Vec<Arc<dyn Task>> {
            self.tasks.clone()
        }
    }

    struct CountingPhase(AtomicUsize);

    impl SerialPhase for CountingPhase {
        fn name(&self) -> &str {
            "counting"
        }

        fn run_serial(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_frameskip: u32) -> SchedulerConfig {
        SchedulerConfig {
            step_hz: 100.0,
            max_frameskip,
            fuse_world_tasks: false,
            ..SchedulerConfig::default()
        }
    }

    fn logging_task(name: &'static str, category: TaskCategory, log: &Arc<Mutex<Vec<&'static str>>>) -> FnTask {
        let log = Arc::clone(log);
        FnTask::new(name, category, move |_| {
            log.lock().push(name);
            Ok(())
        })
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_serial_fallback_respects_dependencies() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = TaskScheduler::new(&config(2), None);
        scheduler.add_world(Arc::new(World {
            name: "w",
            tasks: vec![
                logging_task("c", TaskCategory::SIMULATION, &log).depends_on("b").shared(),
                logging_task("b", TaskCategory::SIMULATION, &log).depends_on("a").shared(),
                logging_task("a", TaskCategory::SIMULATION, &log).shared(),
            ],
        }));

        let report = scheduler.execute_elapsed(ms(10), TaskCategory::ALL).unwrap();
        assert_eq!(report.tasks.completed, 3);
        assert_eq!(*log.lock(), ["a", "b", "c"]);
    }

    #[test]
    fn test_categories_follow_timestep() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = TaskScheduler::new(&config(2), None);
        scheduler.add_world(Arc::new(World {
            name: "w",
            tasks: vec![
                logging_task("sim", TaskCategory::SIMULATION, &log).shared(),
                logging_task("gfx", TaskCategory::RENDERING, &log).shared(),
            ],
        }));

        let render_only = scheduler.execute_elapsed(ms(3), TaskCategory::ALL).unwrap();
        assert_eq!(render_only.categories(), RENDER_CATEGORIES);
        assert_eq!(*log.lock(), ["gfx"]);
        assert_eq!(scheduler.tick(), 0);

        log.lock().clear();
        let skip = scheduler.execute_elapsed(ms(25), TaskCategory::ALL).unwrap();
        assert_eq!(skip.categories(), SKIP_CATEGORIES);
        assert_eq!(*log.lock(), ["sim"]);
        assert_eq!(scheduler.tick(), 1);
    }

    #[test]
    fn test_mask_filters_categories() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = TaskScheduler::new(&config(2), None);
        scheduler.set_unlimited(true);
        scheduler.add_world(Arc::new(World {
            name: "w",
            tasks: vec![
                logging_task("sim", TaskCategory::SIMULATION, &log).shared(),
                logging_task("gfx", TaskCategory::RENDERING, &log).shared(),
            ],
        }));

        let report = scheduler.execute_elapsed(ms(0), TaskCategory::RENDERING).unwrap();
        assert_eq!(report.categories(), TaskCategory::RENDERING);
        assert!(!report.simulated());
        assert_eq!(*log.lock(), ["gfx"]);
    }

    #[test]
    fn test_serial_phases_run_after_tasks() {
        let phase = Arc::new(CountingPhase(AtomicUsize::new(0)));
        let mut scheduler = TaskScheduler::new(&config(2), None);
        scheduler.set_unlimited(true);
        scheduler.add_serial_phase(Arc::clone(&phase) as Arc<dyn SerialPhase>);

        for _ in 0..3 {
            let report = scheduler.execute().unwrap();
            assert_eq!(report.serial_phases, 1);
        }
        assert_eq!(phase.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cycle_surfaces_as_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = TaskScheduler::new(&config(2), None);
        scheduler.set_unlimited(true);
        scheduler.add_world(Arc::new(World {
            name: "w",
            tasks: vec![
                logging_task("a", TaskCategory::SIMULATION, &log).depends_on("b").shared(),
                logging_task("b", TaskCategory::SIMULATION, &log).depends_on("a").shared(),
            ],
        }));

        assert!(matches!(
            scheduler.execute(),
            Err(SchedulerError::DependencyCycle(_))
        ));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_remove_world() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = TaskScheduler::new(&config(2), None);
        scheduler.set_universe(vec![
            Arc::new(World {
                name: "keep",
                tasks: vec![logging_task("k", TaskCategory::RENDERING, &log).shared()],
            }),
            Arc::new(World {
                name: "drop",
                tasks: vec![logging_task("d", TaskCategory::RENDERING, &log).shared()],
            }),
        ]);
        assert_eq!(scheduler.groups().all().len(), 2);

        assert!(scheduler.remove_world("drop"));
        assert!(!scheduler.remove_world("drop"));
        assert_eq!(scheduler.worlds().len(), 1);
        assert_eq!(scheduler.groups().all().len(), 1);
    }

    #[test]
    fn test_unusable_step_rate_falls_back_to_default() {
        for step_hz in [0.0, 1e-30, f64::NAN] {
            let config = SchedulerConfig {
                step_hz,
                ..SchedulerConfig::default()
            };
            let scheduler = TaskScheduler::new(&config, None);
            assert_eq!(scheduler.step(), Duration::from_secs_f64(1.0 / DEFAULT_STEP_HZ));
        }
    }

    #[test]
    fn test_setters_reject_out_of_range() {
        let mut scheduler = TaskScheduler::new(&config(2), None);
        assert!(!scheduler.set_step(MIN_STEP));
        assert!(scheduler.set_step(ms(20)));
        assert_eq!(scheduler.step(), ms(20));

        assert!(!scheduler.set_max_frameskip(MAX_FRAMESKIP_LIMIT + 1));
        assert!(scheduler.set_max_frameskip(0));
        assert_eq!(scheduler.max_frameskip(), 0);
    }

    #[test]
    fn test_parallel_manager_runs_every_task() {
        let manager = TaskManager::with_threads(2).unwrap();
        let mut scheduler = TaskScheduler::new(&config(2), Some(manager));
        scheduler.set_unlimited(true);

        let ran = Arc::new(AtomicUsize::new(0));
        let tasks = (0..8)
            .map(|i| {
                let ran = Arc::clone(&ran);
                FnTask::new(format!("t{i}"), TaskCategory::SIMULATION, move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .shared()
            })
            .collect();
        scheduler.add_world(Arc::new(World { name: "w", tasks }));

        let report = scheduler.execute().unwrap();
        assert_eq!(report.task_count, 8);
        assert_eq!(report.tasks.completed, 8);
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }
}
