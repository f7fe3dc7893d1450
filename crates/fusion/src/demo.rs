//! # Demo Universe
//!
//! A few bodies falling onto a floor, wired through every part of the core:
//!
//! ```text
//! input (primary) ──> physics/integrate{i} ──┬─> height/velocity properties
//!                                            └─> "impact" replicated generator
//! render/draw    reads committed heights, once per rendered tick
//! stream/sample  counts simulated time
//!
//! serial phase:  property registry ──> signals ──> record bytes
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use fusion_core::{
    FnTask, PerformanceHint, PropertyRegistry, RecordSerializer, SerialPhase, SignalError,
    SynchronisedSignalingSystem, SystemWorld, Task, TaskCategory, TaskScheduler, ThreadSafeProperty, Trigger,
};

/// Downward acceleration, m/s².
pub const GRAVITY: f32 = -9.81;

/// Fraction of speed kept after a bounce.
pub const RESTITUTION: f32 = 0.6;

/// Generator key for floor impacts.
pub const IMPACT_KEY: &str = "impact";

/// Replicated floor impact.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Impact {
    /// Body index.
    pub body: u32,
    /// Speed at contact, m/s.
    pub speed: f32,
}

/// One falling body.
pub struct Body {
    /// Height above the floor, m.
    pub height: Arc<ThreadSafeProperty<f32>>,
    /// Vertical velocity, m/s.
    pub velocity: Arc<ThreadSafeProperty<f32>>,
}

/// Signaling system carrying replicated demo events.
pub type DemoSignals = SynchronisedSignalingSystem<String, RecordSerializer<String>>;

/// Running totals, readable from the driver.
#[derive(Default)]
pub struct DemoStats {
    /// Impacts delivered to the local handler.
    pub impacts: AtomicUsize,
    /// Bytes written by the replication serializer.
    pub replicated_bytes: AtomicUsize,
    /// Rendered frames.
    pub frames_drawn: AtomicUsize,
    /// Simulated time streamed, in microseconds.
    pub streamed_us: AtomicU64,
}

struct DemoWorld {
    name: &'static str,
    tasks: Vec<Arc<dyn Task>>,
}

impl SystemWorld for DemoWorld {
    fn name(&self) -> &str {
        self.name
    }

    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        self.tasks.clone()
    }
}

/// Everything the headless driver runs.
pub struct DemoUniverse {
    bodies: Arc<Vec<Body>>,
    registry: Arc<PropertyRegistry>,
    signals: Arc<DemoSignals>,
    stats: Arc<DemoStats>,
    worlds: Vec<Arc<dyn SystemWorld>>,
}

impl DemoUniverse {
    /// Builds `body_count` bodies dropped from staggered heights.
    ///
    /// Must be called on the thread that will drive the scheduler.
    ///
    /// # Errors
    ///
    /// Whatever the signaling system reports while registering the impact
    /// generator and its handler.
    pub fn new(body_count: usize) -> Result<Self, SignalError> {
        let registry = Arc::new(PropertyRegistry::new("bodies"));
        let signals = Arc::new(DemoSignals::named("replication"));
        let stats = Arc::new(DemoStats::default());

        let bodies: Vec<Body> = (0..body_count)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let start = 2.0 + i as f32 * 0.5;
                let body = Body {
                    height: Arc::new(ThreadSafeProperty::new(start)),
                    velocity: Arc::new(ThreadSafeProperty::new(0.0)),
                };
                registry.register(&body.height);
                registry.register(&body.velocity);
                body
            })
            .collect();
        let bodies = Arc::new(bodies);

        let impacts = signals.make_replicated_generator::<Impact>(IMPACT_KEY.to_owned())?;
        {
            let stats = Arc::clone(&stats);
            signals.add_handler::<Impact, _>(&IMPACT_KEY.to_owned(), move |impact| {
                stats.impacts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(body = impact.body, speed = impact.speed, "impact");
            })?;
        }
        {
            let stats = Arc::clone(&stats);
            signals.set_output_handler(move |record| {
                stats.replicated_bytes.fetch_add(record.as_bytes().len(), Ordering::Relaxed);
            });
        }

        let worlds = vec![
            input_world(),
            physics_world(&bodies, &impacts),
            render_world(&bodies, &stats),
            stream_world(&stats),
        ];

        Ok(Self {
            bodies,
            registry,
            signals,
            stats,
            worlds,
        })
    }

    /// Hands the worlds and serial phases to `scheduler`.
    pub fn install(&self, scheduler: &mut TaskScheduler) {
        scheduler.set_universe(self.worlds.clone());
        scheduler.add_serial_phase(Arc::clone(&self.registry) as Arc<dyn SerialPhase>);
        scheduler.add_serial_phase(Arc::clone(&self.signals) as Arc<dyn SerialPhase>);
    }

    /// The bodies.
    #[must_use]
    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    /// Running totals.
    #[must_use]
    pub fn stats(&self) -> &DemoStats {
        &self.stats
    }
}

fn input_world() -> Arc<dyn SystemWorld> {
    let input = FnTask::new("input", TaskCategory::SIMULATION, |ctx| {
        tracing::trace!(tick = ctx.tick, "input polled");
        Ok(())
    })
    .primary_thread_only()
    .shared();

    Arc::new(DemoWorld {
        name: "input",
        tasks: vec![input],
    })
}

fn physics_world(bodies: &Arc<Vec<Body>>, impacts: &Trigger<Impact>) -> Arc<dyn SystemWorld> {
    let tasks = (0..bodies.len())
        .map(|index| {
            let bodies = Arc::clone(bodies);
            let impacts = impacts.clone();
            FnTask::new(format!("integrate{index}"), TaskCategory::SIMULATION, move |ctx| {
                let body = &bodies[index];
                let dt = ctx.step_seconds();
                let mut velocity = body.velocity.get() + GRAVITY * dt;
                let mut height = body.height.get() + velocity * dt;

                if height <= 0.0 {
                    height = 0.0;
                    if velocity < 0.0 {
                        impacts.fire(Impact {
                            body: u32::try_from(index).unwrap_or(u32::MAX),
                            speed: -velocity,
                        });
                        velocity = -velocity * RESTITUTION;
                    }
                }

                body.height.set(height)?;
                body.velocity.set(velocity)?;
                Ok(())
            })
            .depends_on("input")
            .with_hint(PerformanceHint::Short)
            .shared()
        })
        .collect();

    Arc::new(DemoWorld { name: "physics", tasks })
}

fn render_world(bodies: &Arc<Vec<Body>>, stats: &Arc<DemoStats>) -> Arc<dyn SystemWorld> {
    let bodies = Arc::clone(bodies);
    let stats = Arc::clone(stats);
    let draw = FnTask::new("draw", TaskCategory::RENDERING, move |ctx| {
        let lowest = bodies
            .iter()
            .map(|b| b.height.get())
            .fold(f32::INFINITY, f32::min);
        stats.frames_drawn.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(alpha = ctx.alpha, lowest, "frame drawn");
        Ok(())
    })
    .with_hint(PerformanceHint::LongSerial)
    .shared();

    Arc::new(DemoWorld {
        name: "render",
        tasks: vec![draw],
    })
}

fn stream_world(stats: &Arc<DemoStats>) -> Arc<dyn SystemWorld> {
    let stats = Arc::clone(stats);
    let sample = FnTask::new("sample", TaskCategory::STREAMING, move |ctx| {
        let us = u64::try_from(ctx.step.as_micros()).unwrap_or(u64::MAX);
        stats.streamed_us.fetch_add(us, Ordering::Relaxed);
        Ok(())
    })
    .shared();

    Arc::new(DemoWorld {
        name: "stream",
        tasks: vec![sample],
    })
}
