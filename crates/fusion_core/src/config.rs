//! # Core Configuration
//!
//! Loaded once at startup from TOML:
//!
//! ```toml
//! [scheduler]
//! step_hz = 30.0
//! max_frameskip = 2
//! frame_limiter = false
//! unlimited = false
//! fuse_world_tasks = true
//!
//! [manager]
//! worker_threads = 0        # 0 = one per core, minus the primary thread
//! affinity_queue_depth = 4
//! ```
//!
//! Every field is optional; missing ones take the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest accepted simulation step.
pub const MIN_STEP: Duration = Duration::from_millis(1);

/// Step used when a configured rate cannot be turned into a step.
pub const DEFAULT_STEP_HZ: f64 = 30.0;

/// Largest accepted frame-skip count.
pub const MAX_FRAMESKIP_LIMIT: u32 = 16;

/// Fixed-timestep settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Simulation steps per second. Δ = 1 / `step_hz`.
    pub step_hz: f64,
    /// Maximum consecutive simulation-only ticks (K).
    pub max_frameskip: u32,
    /// Block each tick until Δ has passed, then run one full step.
    pub frame_limiter: bool,
    /// Run every category on every tick, bypassing the accumulator.
    pub unlimited: bool,
    /// Fuse each world's same-category tasks into one graph node.
    pub fuse_world_tasks: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_hz: DEFAULT_STEP_HZ,
            max_frameskip: 2,
            frame_limiter: false,
            unlimited: false,
            fuse_world_tasks: true,
        }
    }
}

impl SchedulerConfig {
    /// Δ derived from `step_hz`, or `None` when the rate is not a positive
    /// finite number or its step does not fit a [`Duration`].
    #[must_use]
    pub fn step(&self) -> Option<Duration> {
        if !self.step_hz.is_finite() || self.step_hz <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.step_hz).ok()
    }
}

/// Worker pool settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Worker threads. Zero picks one per core minus the primary thread.
    pub worker_threads: usize,
    /// How many hinted jobs a worker queue may hold before hints are ignored.
    pub affinity_queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            affinity_queue_depth: 4,
        }
    }
}

impl ManagerConfig {
    /// Worker count with zero resolved against the machine, never below one.
    #[must_use]
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }
}

/// Full configuration of the task core.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Fixed-timestep settings.
    pub scheduler: SchedulerConfig,
    /// Worker pool settings.
    pub manager: ManagerConfig,
}

impl CoreConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// `Parse` for malformed TOML or unknown keys, `Invalid` for out-of-range values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, otherwise as [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!(path = %path.display(), "loaded core config");
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// `Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hz = self.scheduler.step_hz;
        if !self.scheduler.step().is_some_and(|step| step > MIN_STEP) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.step_hz = {hz} gives no step above {MIN_STEP:?}"
            )));
        }
        if self.scheduler.max_frameskip > MAX_FRAMESKIP_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "scheduler.max_frameskip = {} exceeds {MAX_FRAMESKIP_LIMIT}",
                self.scheduler.max_frameskip
            )));
        }
        if self.manager.affinity_queue_depth == 0 {
            return Err(ConfigError::Invalid("manager.affinity_queue_depth must be at least 1".into()));
        }
        Ok(())
    }
}
