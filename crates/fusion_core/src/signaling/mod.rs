//! # Synchronised Signaling
//!
//! Keyed, typed event generators whose payloads are raised on any thread
//! and delivered later, on one owning thread, during [`run`].
//!
//! ```text
//!  any thread                          owning thread, serial phase
//!  ──────────                          ───────────────────────────
//!  trigger.fire(p) ─> payload queue    run():
//!        │                               for each triggered generator:
//!        └─ first fire since last run      serializer: begin / write* / end
//!           ─> triggered queue             handlers:   h(p) per payload, FIFO
//! ```
//!
//! A generator enters the triggered queue once per run no matter how many
//! payloads it collected. Payloads fired while `run()` is delivering wait for
//! the next call.
//!
//! [`run`]: SynchronisedSignalingSystem::run

mod follower;
mod serializer;

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use bytemuck::Pod;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

pub use follower::PersistentFollower;
pub use serializer::{decode_pod, EventKey, EventSerializer, NullSerializer, RecordReader, RecordSerializer};

use crate::error::SignalError;
use crate::property::{Connection, Signal};
use crate::scheduler::SerialPhase;

type Encoder<T> = Box<dyn Fn(&T, &mut Vec<u8>) + Send + Sync>;

/// What `run()` needs from a generator without knowing its payload type.
trait ErasedGenerator<K>: Send + Sync {
    fn key(&self) -> &K;
    fn payload_type(&self) -> &'static str;
    fn deliver(&self, sink: &mut dyn EventSerializer<K>, scratch: &mut Vec<u8>) -> usize;
    fn detach(&self);
}

struct Generator<K, T> {
    key: K,
    this: Weak<Self>,
    payloads_tx: Sender<T>,
    payloads_rx: Receiver<T>,
    scheduled: AtomicBool,
    detached: AtomicBool,
    handlers: Signal<T>,
    encoder: Option<Encoder<T>>,
    triggered: Sender<Arc<dyn ErasedGenerator<K>>>,
}

impl<K, T> Generator<K, T>
where
    K: Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    fn push(&self, payload: T) {
        if self.detached.load(Ordering::Acquire) {
            tracing::trace!(key = ?self.key, "payload for a removed generator dropped");
            return;
        }
        if self.payloads_tx.send(payload).is_err() {
            return;
        }
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            if let Some(this) = self.this.upgrade() {
                let erased: Arc<dyn ErasedGenerator<K>> = this;
                let _ = self.triggered.send(erased);
            }
        }
    }
}

impl<K, T> ErasedGenerator<K> for Generator<K, T>
where
    K: Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    fn key(&self) -> &K {
        &self.key
    }

    fn payload_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn deliver(&self, sink: &mut dyn EventSerializer<K>, scratch: &mut Vec<u8>) -> usize {
        // Cleared first: a fire racing with the drain reschedules us
        self.scheduled.store(false, Ordering::Release);
        if self.detached.load(Ordering::Acquire) {
            return 0;
        }

        let payloads: Vec<T> = self.payloads_rx.try_iter().collect();
        if payloads.is_empty() {
            return 0;
        }

        let encoder = self.encoder.as_ref().filter(|_| sink.is_enabled());
        if encoder.is_some() {
            sink.begin_generator(&self.key);
        }
        for payload in &payloads {
            if let Some(encode) = encoder {
                scratch.clear();
                encode(payload, &mut *scratch);
                sink.write_event(scratch.as_slice());
            }
            self.handlers.emit(payload);
        }
        if encoder.is_some() {
            sink.end_generator(&self.key);
        }
        payloads.len()
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        while self.payloads_rx.try_recv().is_ok() {}
    }
}

/// Fires payloads into one generator. Cheap to clone, usable from any thread.
pub struct Trigger<T> {
    sink: Arc<dyn Fn(T) + Send + Sync>,
    live: Weak<dyn Any + Send + Sync>,
}

impl<T> Trigger<T> {
    /// Queues `payload` for the next `run()`.
    ///
    /// A trigger whose generator was removed drops the payload.
    #[inline]
    pub fn fire(&self, payload: T) {
        (self.sink)(payload);
    }

    /// False once the generator has been removed and dropped.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.strong_count() > 0
    }
}

impl<T> Clone for Trigger<T> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            live: self.live.clone(),
        }
    }
}

impl<T> Debug for Trigger<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("payload", &type_name::<T>())
            .field("live", &self.is_live())
            .finish()
    }
}

struct Entry<K> {
    erased: Arc<dyn ErasedGenerator<K>>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl<K> Clone for Entry<K> {
    fn clone(&self) -> Self {
        Self {
            erased: Arc::clone(&self.erased),
            typed: Arc::clone(&self.typed),
        }
    }
}

/// A just-created generator, handed to new-generator subscribers.
pub struct NewGenerator<K> {
    entry: Entry<K>,
}

impl<K> NewGenerator<K>
where
    K: Clone + Debug + Send + Sync + 'static,
{
    /// The generator's key.
    #[must_use]
    pub fn key(&self) -> &K {
        self.entry.erased.key()
    }

    /// The generator's payload type name.
    #[must_use]
    pub fn payload_type(&self) -> &'static str {
        self.entry.erased.payload_type()
    }

    /// Subscribes to this generator.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` if `T` is not the payload type.
    pub fn add_handler<T, F>(&self, handler: F) -> Result<Connection, SignalError>
    where
        T: Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        connect_entry(&self.entry, handler)
    }
}

fn connect_entry<K, T, F>(entry: &Entry<K>, handler: F) -> Result<Connection, SignalError>
where
    K: Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    match Arc::clone(&entry.typed).downcast::<Generator<K, T>>() {
        Ok(generator) => Ok(generator.handlers.connect(handler)),
        Err(_) => Err(SignalError::TypeMismatch {
            key: format!("{:?}", entry.erased.key()),
            expected: type_name::<T>(),
            found: entry.erased.payload_type(),
        }),
    }
}

type PendingCallback<K> = Box<dyn FnOnce(&NewGenerator<K>) + Send>;

struct Pending<K> {
    id: u64,
    key: Option<K>,
    callback: PendingCallback<K>,
}

struct PendingTable<K> {
    next_id: u64,
    entries: Vec<Pending<K>>,
}

/// Cancellation handle for a one-shot new-generator subscription.
pub struct PendingSubscription {
    cancel: Weak<dyn Fn(u64) -> bool + Send + Sync>,
    id: u64,
}

impl PendingSubscription {
    /// Withdraws the subscription. Returns false if it already fired.
    pub fn cancel(&self) -> bool {
        self.cancel.upgrade().is_some_and(|cancel| cancel(self.id))
    }
}

impl Debug for PendingSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSubscription").field("id", &self.id).finish()
    }
}

type OutputHandler<S> = Box<dyn Fn(S) + Send + Sync>;

/// Registry of keyed generators with deferred, single-thread delivery.
///
/// `S` is instantiated fresh for every `run()` and returned to the caller.
pub struct SynchronisedSignalingSystem<K, S = NullSerializer> {
    owner: Mutex<ThreadId>,
    generators: Mutex<HashMap<K, Entry<K>>>,
    pending: Arc<Mutex<PendingTable<K>>>,
    cancel_pending: Arc<dyn Fn(u64) -> bool + Send + Sync>,
    triggered_tx: Sender<Arc<dyn ErasedGenerator<K>>>,
    triggered_rx: Receiver<Arc<dyn ErasedGenerator<K>>>,
    output: Mutex<Option<OutputHandler<S>>>,
    name: String,
}

impl<K, S> SynchronisedSignalingSystem<K, S>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    S: EventSerializer<K> + Default,
{
    /// Creates a system owned by the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self::named("signals")
    }

    /// Creates a system with a name for logs and the serial phase.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let (triggered_tx, triggered_rx) = unbounded();
        let pending = Arc::new(Mutex::new(PendingTable {
            next_id: 0,
            entries: Vec::new(),
        }));
        let table = Arc::downgrade(&pending);
        let cancel_pending: Arc<dyn Fn(u64) -> bool + Send + Sync> = Arc::new(move |id: u64| {
            table.upgrade().is_some_and(|table: Arc<Mutex<PendingTable<K>>>| {
                let mut table = table.lock();
                let before = table.entries.len();
                table.entries.retain(|p| p.id != id);
                table.entries.len() != before
            })
        });

        Self {
            owner: Mutex::new(thread::current().id()),
            generators: Mutex::new(HashMap::new()),
            pending,
            cancel_pending,
            triggered_tx,
            triggered_rx,
            output: Mutex::new(None),
            name: name.into(),
        }
    }

    /// Hands delivery to the calling thread.
    pub fn set_owner_thread(&self) {
        *self.owner.lock() = thread::current().id();
    }

    /// Registers a local-only generator.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if `key` already has a generator.
    pub fn make_generator<T>(&self, key: K) -> Result<Trigger<T>, SignalError>
    where
        T: Send + 'static,
    {
        self.register(key, None)
    }

    /// Registers a generator whose payloads are also written to the
    /// serializer as their raw bytes.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if `key` already has a generator.
    pub fn make_replicated_generator<T>(&self, key: K) -> Result<Trigger<T>, SignalError>
    where
        T: Pod + Send,
    {
        self.register(
            key,
            Some(Box::new(|payload: &T, out: &mut Vec<u8>| {
                out.extend_from_slice(bytemuck::bytes_of(payload));
            })),
        )
    }

    /// Registers a generator with a custom payload encoder for the serializer.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if `key` already has a generator.
    pub fn make_generator_with_encoder<T, E>(&self, key: K, encoder: E) -> Result<Trigger<T>, SignalError>
    where
        T: Send + 'static,
        E: Fn(&T, &mut Vec<u8>) + Send + Sync + 'static,
    {
        self.register(key, Some(Box::new(encoder)))
    }

    fn register<T>(&self, key: K, encoder: Option<Encoder<T>>) -> Result<Trigger<T>, SignalError>
    where
        T: Send + 'static,
    {
        let (payloads_tx, payloads_rx) = unbounded();
        let generator: Arc<Generator<K, T>> = Arc::new_cyclic(|this| Generator {
            key: key.clone(),
            this: this.clone(),
            payloads_tx,
            payloads_rx,
            scheduled: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            handlers: Signal::new(),
            encoder,
            triggered: self.triggered_tx.clone(),
        });

        let entry = Entry {
            erased: generator.clone(),
            typed: generator.clone(),
        };

        {
            let mut generators = self.generators.lock();
            if generators.contains_key(&key) {
                tracing::error!(system = %self.name, key = ?key, "generator key already registered");
                return Err(SignalError::DuplicateKey(format!("{key:?}")));
            }
            generators.insert(key.clone(), entry.clone());
        }

        tracing::debug!(system = %self.name, key = ?key, payload = type_name::<T>(), "generator created");
        self.notify_new_generator(&key, entry);

        let weak = Arc::downgrade(&generator);
        let live: Weak<dyn Any + Send + Sync> = weak.clone();
        Ok(Trigger {
            sink: Arc::new(move |payload| {
                if let Some(generator) = weak.upgrade() {
                    generator.push(payload);
                }
            }),
            live,
        })
    }

    fn notify_new_generator(&self, key: &K, entry: Entry<K>) {
        let ready: Vec<Pending<K>> = {
            let mut table = self.pending.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut table.entries)
                .into_iter()
                .partition(|p| p.key.as_ref().map_or(true, |wanted| wanted == key));
            table.entries = waiting;
            ready
        };

        if ready.is_empty() {
            return;
        }
        let handle = NewGenerator { entry };
        for pending in ready {
            (pending.callback)(&handle);
        }
    }

    /// Detaches the generator for `key` and discards its queued payloads.
    /// Returns false if there was none.
    pub fn remove_generator(&self, key: &K) -> bool {
        let Some(entry) = self.generators.lock().remove(key) else {
            return false;
        };
        entry.erased.detach();
        tracing::debug!(system = %self.name, key = ?key, "generator removed");
        true
    }

    /// True if `key` has a generator.
    #[must_use]
    pub fn has_generator(&self, key: &K) -> bool {
        self.generators.lock().contains_key(key)
    }

    /// Subscribes `handler` to every future payload from `key`.
    ///
    /// # Errors
    ///
    /// `NoSuchGenerator` if `key` has no generator, `TypeMismatch` if its
    /// payload type is not `T`.
    pub fn add_handler<T, F>(&self, key: &K, handler: F) -> Result<Connection, SignalError>
    where
        T: Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let entry = self.generators.lock().get(key).cloned();
        let Some(entry) = entry else {
            tracing::error!(system = %self.name, key = ?key, "add_handler on a missing generator");
            return Err(SignalError::NoSuchGenerator(format!("{key:?}")));
        };
        connect_entry(&entry, handler).map_err(|err| {
            tracing::error!(system = %self.name, error = %err, "add_handler type mismatch");
            err
        })
    }

    /// Calls `callback` once, the next time any generator is created.
    pub fn subscribe_new_generators<F>(&self, callback: F) -> PendingSubscription
    where
        F: FnOnce(&NewGenerator<K>) + Send + 'static,
    {
        self.subscribe_pending(None, Box::new(callback))
    }

    /// Calls `callback` once, the next time a generator for `key` is created.
    pub fn subscribe_new_generator<F>(&self, key: K, callback: F) -> PendingSubscription
    where
        F: FnOnce(&NewGenerator<K>) + Send + 'static,
    {
        self.subscribe_pending(Some(key), Box::new(callback))
    }

    fn subscribe_pending(&self, key: Option<K>, callback: PendingCallback<K>) -> PendingSubscription {
        let mut table = self.pending.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push(Pending { id, key, callback });
        PendingSubscription {
            cancel: Arc::downgrade(&self.cancel_pending),
            id,
        }
    }

    /// Number of subscriptions still waiting for a generator.
    #[must_use]
    pub fn pending_subscriptions(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Delivers every queued payload.
    ///
    /// For each triggered generator, each payload goes to the serializer (if
    /// the generator is mirrored), then to the handlers in subscription
    /// order. No lock is held while handlers run.
    ///
    /// # Errors
    ///
    /// `WrongThread` off the owning thread; nothing is delivered.
    pub fn run(&self) -> Result<S, SignalError> {
        if thread::current().id() != *self.owner.lock() {
            tracing::error!(system = %self.name, "run() called off the owning thread");
            return Err(SignalError::WrongThread);
        }

        let triggered: Vec<_> = self.triggered_rx.try_iter().collect();
        let mut serializer = S::default();
        let mut scratch = Vec::new();
        let mut delivered = 0usize;
        for generator in &triggered {
            delivered += generator.deliver(&mut serializer, &mut scratch);
        }

        if delivered > 0 {
            tracing::trace!(
                system = %self.name,
                generators = triggered.len(),
                payloads = delivered,
                "signals delivered"
            );
        }
        Ok(serializer)
    }

    /// Receives the serializer from every `run()` driven as a serial phase.
    pub fn set_output_handler<F>(&self, handler: F)
    where
        F: Fn(S) + Send + Sync + 'static,
    {
        *self.output.lock() = Some(Box::new(handler));
    }
}

impl<K, S> Default for SynchronisedSignalingSystem<K, S>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    S: EventSerializer<K> + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> SerialPhase for SynchronisedSignalingSystem<K, S>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    S: EventSerializer<K> + Default + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run_serial(&self) {
        match self.run() {
            Ok(serializer) => {
                if let Some(output) = &*self.output.lock() {
                    output(serializer);
                }
            }
            Err(err) => tracing::error!(system = %self.name, error = %err, "signal phase skipped"),
        }
    }
}

impl<K: Debug, S> Debug for SynchronisedSignalingSystem<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronisedSignalingSystem")
            .field("name", &self.name)
            .field("generators", &self.generators.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
