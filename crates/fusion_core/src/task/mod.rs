//! # Tasks
//!
//! A task is one unit of per-tick work contributed by a system world. The core
//! never looks inside a task: it only reads the task's category, thread
//! requirement, performance hint and named dependencies, and calls `update()`.
//!
//! ```text
//! SystemWorld ──tasks()──> [Arc<dyn Task>, ...]
//!                               │
//!               TaskScheduler (select by category)
//!                               │
//!               TaskManager (graph by dependency name)
//! ```

mod composite;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

pub use composite::{CompositeFailure, CompositeTask};

/// Failure returned from a task's `update()`.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for task updates.
pub type TaskResult = Result<(), TaskError>;

/// Category bitmask. A task may belong to several categories.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct TaskCategory(u8);

impl TaskCategory {
    /// No category.
    pub const NONE: Self = Self(0);
    /// Fixed-step simulation work.
    pub const SIMULATION: Self = Self(0x01);
    /// Per-frame rendering work.
    pub const RENDERING: Self = Self(0x02);
    /// World streaming work.
    pub const STREAMING: Self = Self(0x04);
    /// Every category.
    pub const ALL: Self = Self(0x07);

    /// Builds a category set from raw bits, dropping unknown bits.
    #[inline]
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when no category is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every category in `other` is also in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when `self` and `other` share at least one category.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for TaskCategory {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TaskCategory {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TaskCategory {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (flag, label) in [
            (Self::SIMULATION, "simulation"),
            (Self::RENDERING, "rendering"),
            (Self::STREAMING, "streaming"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(label)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Soft scheduling priority. Ordered slowest-first, so sorting ascending puts
/// long tasks at the front of the spawn list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PerformanceHint {
    /// Long-running, internally serial.
    LongSerial,
    /// Long-running, spawns its own parallel work.
    LongParallel,
    /// Short.
    Short,
    /// No hint given.
    #[default]
    None,
}

/// Ambient per-tick context handed to every task.
#[derive(Clone, Debug, PartialEq)]
pub struct TickContext {
    /// Simulation tick number. Advances on every tick that includes simulation.
    pub tick: u64,
    /// Fixed step duration (Δ).
    pub step: Duration,
    /// Wall-clock time covered by this tick, including skipped steps.
    pub actual_elapsed: Duration,
    /// Blend factor between the last two simulated states, for rendering.
    pub alpha: f32,
    /// Consecutive simulation-only ticks that preceded this one.
    pub frames_skipped: u32,
    /// Categories running this tick.
    pub categories: TaskCategory,
}

impl TickContext {
    /// Context for a single full step of `step` length.
    #[must_use]
    pub fn single_step(step: Duration) -> Self {
        Self {
            tick: 0,
            step,
            actual_elapsed: step,
            alpha: 1.0,
            frames_skipped: 0,
            categories: TaskCategory::ALL,
        }
    }

    /// Step length in seconds.
    #[inline]
    #[must_use]
    pub fn step_seconds(&self) -> f32 {
        self.step.as_secs_f32()
    }
}

impl Default for TickContext {
    fn default() -> Self {
        Self::single_step(Duration::from_secs(1) / 30)
    }
}

/// A schedulable unit of per-tick work.
///
/// Tasks are shared between the scheduler and the worker pool, so every
/// mutation a task performs on shared component state must go through a
/// [`ThreadSafeProperty`](crate::property::ThreadSafeProperty) or a signaling
/// generator.
pub trait Task: Send + Sync {
    /// Unique name within a tick; dependency names resolve against it.
    fn name(&self) -> &str;

    /// Categories this task belongs to.
    fn category(&self) -> TaskCategory;

    /// Must this task run on the primary thread?
    fn is_primary_thread_only(&self) -> bool {
        false
    }

    /// Soft priority.
    fn performance_hint(&self) -> PerformanceHint {
        PerformanceHint::None
    }

    /// Names of tasks that must complete before this one starts.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    /// Extra names this task answers to when others depend on it.
    fn aliases(&self) -> &[String] {
        &[]
    }

    /// Runs one tick of work.
    ///
    /// # Errors
    ///
    /// A returned error is logged and absorbed; the tick carries on.
    fn update(&self, ctx: &TickContext) -> TaskResult;
}

/// A group of tasks contributed by one system (physics, rendering, ...).
pub trait SystemWorld: Send + Sync {
    /// World name, used in composite task names and logs.
    fn name(&self) -> &str;

    /// Tasks this world contributes. Called whenever the universe changes.
    fn tasks(&self) -> Vec<Arc<dyn Task>>;
}

/// How a single `update()` call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Returned `Ok`.
    Completed,
    /// Returned `Err`; the error was logged.
    Failed,
    /// Panicked; the panic was caught and logged.
    Panicked,
}

/// Runs `task.update()`, absorbing errors and panics.
///
/// A failing task degrades only its own effects for this tick: whatever it
/// staged before failing stands.
pub(crate) fn execute_task(task: &dyn Task, ctx: &TickContext) -> TaskOutcome {
    let span = tracing::trace_span!("task", name = task.name(), tick = ctx.tick);
    let _enter = span.enter();

    match panic::catch_unwind(AssertUnwindSafe(|| task.update(ctx))) {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(err)) => {
            tracing::error!(task = task.name(), error = %err, "task update failed");
            TaskOutcome::Failed
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task = task.name(), panic = %message, "task update panicked");
            TaskOutcome::Panicked
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

type UpdateFn = dyn Fn(&TickContext) -> TaskResult + Send + Sync;

/// Closure-backed task, for worlds that do not need a dedicated type.
pub struct FnTask {
    name: String,
    category: TaskCategory,
    primary_thread_only: bool,
    hint: PerformanceHint,
    dependencies: Vec<String>,
    update: Box<UpdateFn>,
}

impl FnTask {
    /// Creates a worker-eligible task with no dependencies.
    pub fn new<F>(name: impl Into<String>, category: TaskCategory, update: F) -> Self
    where
        F: Fn(&TickContext) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            category,
            primary_thread_only: false,
            hint: PerformanceHint::None,
            dependencies: Vec::new(),
            update: Box::new(update),
        }
    }

    /// Adds a named dependency.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Pins the task to the primary thread.
    #[must_use]
    pub fn primary_thread_only(mut self) -> Self {
        self.primary_thread_only = true;
        self
    }

    /// Sets the performance hint.
    #[must_use]
    pub fn with_hint(mut self, hint: PerformanceHint) -> Self {
        self.hint = hint;
        self
    }

    /// Wraps the task for sharing with the scheduler.
    #[must_use]
    pub fn shared(self) -> Arc<dyn Task> {
        Arc::new(self)
    }
}

impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> TaskCategory {
        self.category
    }

    fn is_primary_thread_only(&self) -> bool {
        self.primary_thread_only
    }

    fn performance_hint(&self) -> PerformanceHint {
        self.hint
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn update(&self, ctx: &TickContext) -> TaskResult {
        (self.update)(ctx)
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("primary_thread_only", &self.primary_thread_only)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_set_operations() {
        let sim_stream = TaskCategory::SIMULATION | TaskCategory::STREAMING;
        assert!(sim_stream.contains(TaskCategory::SIMULATION));
        assert!(!sim_stream.contains(TaskCategory::RENDERING));
        assert!(sim_stream.intersects(TaskCategory::ALL));
        assert!((sim_stream & TaskCategory::RENDERING).is_empty());
        assert_eq!(TaskCategory::from_bits_truncate(0xFF), TaskCategory::ALL);
        assert_eq!(sim_stream.to_string(), "simulation|streaming");
        assert_eq!(TaskCategory::NONE.to_string(), "none");
    }

    #[test]
    fn test_hint_orders_slowest_first() {
        let mut hints = vec![
            PerformanceHint::None,
            PerformanceHint::Short,
            PerformanceHint::LongSerial,
            PerformanceHint::LongParallel,
        ];
        hints.sort();
        assert_eq!(
            hints,
            vec![
                PerformanceHint::LongSerial,
                PerformanceHint::LongParallel,
                PerformanceHint::Short,
                PerformanceHint::None,
            ]
        );
    }

    #[test]
    fn test_execute_task_absorbs_errors_and_panics() {
        let ctx = TickContext::default();

        let ok = FnTask::new("ok", TaskCategory::SIMULATION, |_| Ok(()));
        assert_eq!(execute_task(&ok, &ctx), TaskOutcome::Completed);

        let failing = FnTask::new("failing", TaskCategory::SIMULATION, |_| Err("boom".into()));
        assert_eq!(execute_task(&failing, &ctx), TaskOutcome::Failed);

        let panicking = FnTask::new("panicking", TaskCategory::SIMULATION, |_| panic!("kaboom"));
        assert_eq!(execute_task(&panicking, &ctx), TaskOutcome::Panicked);
    }

    #[test]
    fn test_fn_task_builder() {
        let task = FnTask::new("render", TaskCategory::RENDERING, |_| Ok(()))
            .depends_on("physics")
            .primary_thread_only()
            .with_hint(PerformanceHint::Short);

        assert_eq!(task.name(), "render");
        assert_eq!(task.dependencies(), ["physics".to_owned()]);
        assert!(task.is_primary_thread_only());
        assert_eq!(task.performance_hint(), PerformanceHint::Short);
    }
}
