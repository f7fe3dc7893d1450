//! # Fusion Core
//!
//! Task scheduling and cross-thread synchronisation for a fixed-timestep
//! simulation:
//! - A task manager that runs each tick's dependency graph over a worker pool
//! - A scheduler that decides per tick which task categories run
//! - Properties that stage writes from any thread and commit them serially
//! - A signaling system that queues events and delivers them in one place
//!
//! ## Threading Rules
//!
//! 1. **One primary thread** - the thread that builds the [`TaskManager`]
//!    owns the tick; spawn, wait and every serial phase happen there
//! 2. **Workers only stage** - property writes and fired events are buffered
//!    until the primary thread commits them
//! 3. **Commits happen between ticks** - never while a task may still run
//!
//! ## Example
//!
//! ```rust,ignore
//! use fusion_core::{CoreConfig, TaskScheduler};
//!
//! let config = CoreConfig::load("config/fusion.toml")?;
//! let mut scheduler = TaskScheduler::from_config(&config)?;
//! scheduler.add_world(physics_world);
//! loop {
//!     scheduler.execute()?;
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod manager;
pub mod property;
pub mod scheduler;
pub mod signaling;
pub mod task;

pub use config::{CoreConfig, ManagerConfig, SchedulerConfig};
pub use error::{ConfigError, CoreError, CoreResult, PropertyError, SchedulerError, SignalError};
pub use manager::{current_affinity, AffinityId, TaskManager, TickTaskReport};
pub use property::{
    AtomicProperty, Connection, PropertyId, PropertyRegistry, PropertySignalingSystem, ReadOnlyProperty,
    ScopedConnection, Signal, SyncProperty, ThreadSafeProperty,
};
pub use scheduler::{FixedTimestep, SerialPhase, TaskScheduler, TickReport};
pub use signaling::{
    EventKey, EventSerializer, NewGenerator, NullSerializer, PendingSubscription, PersistentFollower,
    RecordReader, RecordSerializer, SynchronisedSignalingSystem, Trigger,
};
pub use task::{
    CompositeTask, FnTask, PerformanceHint, SystemWorld, Task, TaskCategory, TaskError, TaskResult, TickContext,
};
