//! # Thread-Safe Properties
//!
//! A property is one mutable field of a component. Any thread may read it or
//! stage a new value at any time; only the serial phase commits.
//!
//! ```text
//! tick N, parallel region           serial phase (primary thread)
//! ───────────────────────           ─────────────────────────────
//! worker 0: prop.set(a) ─┐          pass 1: every prop.synchronise()
//! worker 3: prop.set(b) ─┼─ slots ─>        one staged value wins
//! worker 5: prop.get()   │                  slots cleared
//!           (sees N-1)   │          pass 2: every prop.fire_signal()
//!                                           handlers see committed values
//! ```
//!
//! The two passes are separate so that a handler reading some other
//! property never sees it half-way through the phase.

mod registry;
mod signal;
mod writer;

use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

pub use registry::{PropertyRegistry, SyncProperty};
pub use signal::{Connection, ScopedConnection, Signal};
pub use writer::{AtomicValue, AtomicWriter, NullWriter, PerThreadWriter, WritePolicy};

use crate::error::{PropertyError, SignalError};
use crate::signaling::{EventKey, SynchronisedSignalingSystem, Trigger};

/// Key of a published property in a [`PropertySignalingSystem`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(u64);

static NEXT_PROPERTY_ID: AtomicU64 = AtomicU64::new(1);

impl PropertyId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_PROPERTY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prop#{}", self.0)
    }
}

impl EventKey for PropertyId {
    fn write_key(&self, out: &mut Vec<u8>) {
        self.0.write_key(out);
    }

    fn read_key(bytes: &[u8]) -> Option<(Self, usize)> {
        u64::read_key(bytes).map(|(raw, used)| (Self(raw), used))
    }
}

/// Signaling system carrying committed property values.
pub type PropertySignalingSystem = SynchronisedSignalingSystem<PropertyId>;

/// Property that rejects `set()` and only refreshes from its source.
pub type ReadOnlyProperty<T> = ThreadSafeProperty<T, NullWriter<T>>;

/// Property backed by a single atomic slot.
pub type AtomicProperty<T> = ThreadSafeProperty<T, AtomicWriter<T>>;

struct Accessors<T> {
    get: Box<dyn Fn() -> T + Send + Sync>,
    set: Box<dyn Fn(T) + Send + Sync>,
}

/// One component field with per-thread staged writes.
pub struct ThreadSafeProperty<T, W = PerThreadWriter<T>> {
    value: RwLock<T>,
    writer: W,
    changed: AtomicBool,
    signal: Signal<T>,
    binding: Mutex<Option<Connection>>,
    accessors: Option<Accessors<T>>,
    published: Mutex<Option<(PropertyId, Trigger<T>)>>,
}

impl<T, W> ThreadSafeProperty<T, W>
where
    T: Clone + Send + Sync + 'static,
    W: WritePolicy<T>,
{
    /// Creates a property holding `initial`.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            value: RwLock::new(initial),
            writer: W::default(),
            changed: AtomicBool::new(false),
            signal: Signal::new(),
            binding: Mutex::new(None),
            accessors: None,
            published: Mutex::new(None),
        }
    }

    /// Ties the property to an underlying field through a getter and setter.
    /// The initial value is read through `get`.
    ///
    /// See [`synchronise_with_accessors`](Self::synchronise_with_accessors).
    #[must_use]
    pub fn with_accessors<G, S>(get: G, set: S) -> Self
    where
        G: Fn() -> T + Send + Sync + 'static,
        S: Fn(T) + Send + Sync + 'static,
    {
        let mut property = Self::new(get());
        property.accessors = Some(Accessors {
            get: Box::new(get),
            set: Box::new(set),
        });
        property
    }

    /// Current committed value.
    #[inline]
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Stages `value` for the next synchronisation.
    ///
    /// # Errors
    ///
    /// `ReadOnly` for a [`ReadOnlyProperty`].
    #[inline]
    pub fn set(&self, value: T) -> Result<(), PropertyError> {
        self.writer.stage(value)
    }

    /// True if a write is staged.
    #[must_use]
    pub fn has_pending_write(&self) -> bool {
        self.writer.has_staged()
    }

    /// Commits one staged write, or refreshes from `fallback` when nothing
    /// was staged. Returns true if a staged write was committed as a change.
    ///
    /// Serial phase only.
    pub fn synchronise(&self, fallback: T) -> bool {
        match self.writer.collapse() {
            Some(staged) => self.commit(staged),
            None => {
                *self.value.write() = fallback;
                false
            }
        }
    }

    /// Commits one staged write and leaves the value alone otherwise.
    ///
    /// Serial phase only.
    pub fn synchronise_external_only(&self) -> bool {
        self.writer.collapse().is_some_and(|staged| self.commit(staged))
    }

    /// Commits a staged write through the setter, or refreshes from the
    /// getter when nothing was staged. Without accessors this behaves like
    /// [`synchronise_external_only`](Self::synchronise_external_only).
    ///
    /// Serial phase only.
    pub fn synchronise_with_accessors(&self) -> bool {
        let Some(accessors) = &self.accessors else {
            return self.synchronise_external_only();
        };

        match self.writer.collapse() {
            Some(staged) => {
                let changed = self.commit(staged.clone());
                if changed {
                    (accessors.set)(staged);
                }
                changed
            }
            None => {
                *self.value.write() = (accessors.get)();
                false
            }
        }
    }

    fn commit(&self, staged: T) -> bool {
        let mut value = self.value.write();
        if !W::is_change(&value, &staged) {
            return false;
        }
        *value = staged;
        self.changed.store(true, Ordering::Release);
        true
    }

    /// Forces the next [`fire_signal`](Self::fire_signal) to notify.
    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    /// True if the last sync committed a change not yet fired.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Notifies handlers with the committed value if it changed, then
    /// clears the change flag. Published properties also push the value to
    /// their generator.
    pub fn fire_signal(&self) {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return;
        }
        let value = self.get();
        if let Some((_, trigger)) = &*self.published.lock() {
            trigger.fire(value.clone());
        }
        self.signal.emit(&value);
    }

    /// Subscribes to committed changes.
    pub fn connect<F>(&self, handler: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.signal.connect(handler)
    }

    /// Mirrors `upstream`: each value it fires is staged here. Replaces any
    /// previous binding.
    pub fn bind_property<W2>(self: &Arc<Self>, upstream: &ThreadSafeProperty<T, W2>)
    where
        W2: WritePolicy<T>,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let connection = upstream.connect(move |value| {
            if let Some(this) = weak.upgrade() {
                if let Err(err) = this.set(value.clone()) {
                    tracing::warn!(error = %err, "bound property rejected upstream value");
                }
            }
        });

        if let Some(previous) = self.binding.lock().replace(connection) {
            previous.disconnect();
        }
    }

    /// Drops the upstream binding, if any. Returns true if one existed.
    pub fn unbind(&self) -> bool {
        self.binding.lock().take().is_some_and(|c| c.disconnect())
    }

    /// True while bound to an upstream property.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.lock().as_ref().is_some_and(Connection::is_connected)
    }

    /// Registers a generator for this property so that remote followers see
    /// every fired change. Publishing twice returns the existing id.
    ///
    /// # Errors
    ///
    /// Whatever `make_generator` reports.
    pub fn publish(&self, system: &PropertySignalingSystem) -> Result<PropertyId, SignalError> {
        let mut published = self.published.lock();
        if let Some((id, _)) = &*published {
            return Ok(*id);
        }
        let id = PropertyId::next();
        let trigger = system.make_generator::<T>(id)?;
        *published = Some((id, trigger));
        Ok(id)
    }

    /// Id assigned by [`publish`](Self::publish).
    #[must_use]
    pub fn published_id(&self) -> Option<PropertyId> {
        self.published.lock().as_ref().map(|(id, _)| *id)
    }
}

impl<T, W> ThreadSafeProperty<T, W>
where
    T: Clone + Add<Output = T> + Send + Sync + 'static,
    W: WritePolicy<T>,
{
    /// Stages `get() + delta`.
    ///
    /// Two threads adding in the same tick do not accumulate: one staged
    /// result wins.
    ///
    /// # Errors
    ///
    /// `ReadOnly` for a [`ReadOnlyProperty`].
    pub fn add_assign(&self, delta: T) -> Result<(), PropertyError> {
        self.set(self.get() + delta)
    }
}

impl<T, W> Default for ThreadSafeProperty<T, W>
where
    T: Clone + Default + Send + Sync + 'static,
    W: WritePolicy<T>,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, W> Drop for ThreadSafeProperty<T, W> {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.disconnect();
        }
    }
}

impl<T: fmt::Debug, W> fmt::Debug for ThreadSafeProperty<T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeProperty")
            .field("value", &*self.value.read())
            .field("changed", &self.changed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_set_is_invisible_until_synchronise() {
        let prop = ThreadSafeProperty::<f32>::new(1.0);
        prop.set(2.0).unwrap();
        assert!((prop.get() - 1.0).abs() < f32::EPSILON);

        assert!(prop.synchronise(1.0));
        assert!((prop.get() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_fallback_when_nothing_staged() {
        let prop = ThreadSafeProperty::<i32>::new(0);
        assert!(!prop.synchronise(42));
        assert_eq!(prop.get(), 42);
        assert!(!prop.is_changed());
    }

    #[test]
    fn test_external_only_keeps_value_without_writes() {
        let prop = ThreadSafeProperty::<i32>::new(5);
        assert!(!prop.synchronise_external_only());
        assert_eq!(prop.get(), 5);

        prop.set(6).unwrap();
        assert!(prop.synchronise_external_only());
        assert_eq!(prop.get(), 6);
    }

    #[test]
    fn test_fire_signal_only_after_commit() {
        let prop = ThreadSafeProperty::<u32>::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _conn = prop.connect(move |v| sink.lock().push(*v));

        prop.set(3).unwrap();
        prop.fire_signal();
        assert!(seen.lock().is_empty());

        prop.synchronise_external_only();
        prop.fire_signal();
        prop.fire_signal();
        assert_eq!(*seen.lock(), [3]);
    }

    #[test]
    fn test_mark_changed_forces_notification() {
        let prop = ThreadSafeProperty::<u32>::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _conn = prop.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        prop.mark_changed();
        prop.fire_signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_only_rejects_set() {
        let prop = ReadOnlyProperty::<u32>::new(1);
        assert_eq!(prop.set(2), Err(PropertyError::ReadOnly));
        assert!(!prop.synchronise(7));
        assert_eq!(prop.get(), 7);
    }

    #[test]
    fn test_atomic_property_reports_real_changes_only() {
        let prop = AtomicProperty::<bool>::new(false);
        prop.set(false).unwrap();
        assert!(!prop.synchronise_external_only());

        prop.set(true).unwrap();
        assert!(prop.synchronise_external_only());
        assert!(prop.get());
    }

    #[test]
    fn test_accessors_push_and_pull() {
        let backing = Arc::new(Mutex::new(10_i32));
        let (get_src, set_dst) = (Arc::clone(&backing), Arc::clone(&backing));
        let prop = ThreadSafeProperty::<i32>::with_accessors(
            move || *get_src.lock(),
            move |v| *set_dst.lock() = v,
        );
        assert_eq!(prop.get(), 10);

        prop.set(11).unwrap();
        assert!(prop.synchronise_with_accessors());
        assert_eq!(*backing.lock(), 11);

        *backing.lock() = 20;
        assert!(!prop.synchronise_with_accessors());
        assert_eq!(prop.get(), 20);
    }

    #[test]
    fn test_bind_property_follows_latest_upstream() {
        let a = ThreadSafeProperty::<i32>::new(0);
        let b = ThreadSafeProperty::<i32>::new(0);
        let follower = Arc::new(ThreadSafeProperty::<i32>::new(0));

        follower.bind_property(&a);
        follower.bind_property(&b);
        assert!(follower.is_bound());

        a.set(1).unwrap();
        a.synchronise_external_only();
        a.fire_signal();
        assert!(!follower.has_pending_write());

        b.set(2).unwrap();
        b.synchronise_external_only();
        b.fire_signal();
        follower.synchronise_external_only();
        assert_eq!(follower.get(), 2);

        assert!(follower.unbind());
        assert!(!follower.is_bound());
    }

    #[test]
    fn test_read_only_binding_drops_upstream_values() {
        let upstream = ThreadSafeProperty::<u32>::new(0);
        let derived = Arc::new(ReadOnlyProperty::<u32>::new(5));
        derived.bind_property(&upstream);

        upstream.set(9).unwrap();
        upstream.synchronise_external_only();
        upstream.fire_signal();

        assert!(derived.is_bound());
        assert!(!derived.has_pending_write());
        assert!(!derived.synchronise_external_only());
        assert_eq!(derived.get(), 5);
    }

    #[test]
    fn test_add_assign() {
        let prop = ThreadSafeProperty::<i64>::new(40);
        prop.add_assign(2).unwrap();
        prop.synchronise_external_only();
        assert_eq!(prop.get(), 42);
    }

    #[test]
    fn test_concurrent_writers_one_wins() {
        let prop = Arc::new(ThreadSafeProperty::<i32>::new(0));
        let handles: Vec<_> = [1, 2]
            .into_iter()
            .map(|v| {
                let prop = Arc::clone(&prop);
                thread::spawn(move || prop.set(v).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        prop.synchronise(0);
        let value = prop.get();
        assert!(value == 1 || value == 2);
        assert!(!prop.has_pending_write());
    }

    #[test]
    fn test_publish_forwards_fired_values() {
        let system = PropertySignalingSystem::new();
        let prop = ThreadSafeProperty::<u32>::new(0);
        let id = prop.publish(&system).unwrap();
        assert_eq!(prop.publish(&system).unwrap(), id);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _conn = system.add_handler::<u32, _>(&id, move |v| sink.lock().push(*v)).unwrap();

        prop.set(9).unwrap();
        prop.synchronise_external_only();
        prop.fire_signal();
        assert!(seen.lock().is_empty());

        system.run().unwrap();
        assert_eq!(*seen.lock(), [9]);
    }
}
