//! # Core Error Types
//!
//! Every misuse of the task core is a wiring defect, not a runtime condition:
//! these errors are returned at the call site and never cross the worker /
//! primary boundary. Failures inside a task's `update()` are a different
//! category entirely, see [`TaskError`](crate::task::TaskError).

use thiserror::Error;

/// Errors raised by the task manager and task scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A scheduler operation was invoked in a state that forbids it.
    #[error("precondition violated: {0}")]
    PreconditionViolation(&'static str),

    /// `spawn_jobs_for_system_tasks` was given nothing to run.
    #[error("precondition violated: empty task list")]
    EmptyTaskList,

    /// A primary-thread-only operation was called from another thread.
    #[error("precondition violated: not called from the primary thread")]
    NotPrimaryThread,

    /// `wait_for_system_tasks` was called without a preceding spawn.
    #[error("precondition violated: nothing was spawned this tick")]
    NothingSpawned,

    /// The named dependencies of this tick's tasks form a cycle.
    #[error("dependency cycle between tasks: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// The worker pool could not be created.
    #[error("worker pool unavailable: {0}")]
    PoolUnavailable(String),
}

/// Errors raised by the synchronised signaling system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// A generator is already registered under this key.
    #[error("a generator is already registered for key {0}")]
    DuplicateKey(String),

    /// No generator is registered under this key.
    #[error("there is no generator for key {0}")]
    NoSuchGenerator(String),

    /// The handler's payload type differs from the generator's.
    #[error("handler for key {key} expects {expected}, but the generator emits {found}")]
    TypeMismatch {
        /// Generator key.
        key: String,
        /// Payload type the handler was written for.
        expected: &'static str,
        /// Payload type the generator was registered with.
        found: &'static str,
    },

    /// `run()` was called off the owning thread.
    #[error("signals can only be delivered from the owning thread")]
    WrongThread,
}

/// Errors raised by thread-safe properties.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyError {
    /// `set()` was called on a read-only property.
    #[error("property is read-only")]
    ReadOnly,
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for [`CoreConfig`](crate::config::CoreConfig).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error for callers that drive the whole core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Scheduling failure.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Signaling failure.
    #[error(transparent)]
    Signal(#[from] SignalError),

    /// Property failure.
    #[error(transparent)]
    Property(#[from] PropertyError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = SchedulerError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle between tasks: a -> b -> a");
    }

    #[test]
    fn test_core_error_is_transparent() {
        let err: CoreError = SignalError::NoSuchGenerator("evt".into()).into();
        assert_eq!(err.to_string(), "there is no generator for key evt");
    }
}
