//! Minimal multicast signal with disconnectable connections.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// Type-erased view of a slot table, so a [`Connection`] does not carry `T`.
trait SlotTable: Send + Sync {
    fn remove(&self, id: u64) -> bool;
    fn contains(&self, id: u64) -> bool;
}

impl<T: 'static> SlotTable for Mutex<Slots<T>> {
    fn remove(&self, id: u64) -> bool {
        let mut slots = self.lock();
        let before = slots.handlers.len();
        slots.handlers.retain(|(slot, _)| *slot != id);
        slots.handlers.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        self.lock().handlers.iter().any(|(slot, _)| *slot == id)
    }
}

/// Ordered list of handlers taking `&T`.
///
/// Handlers are invoked outside the lock, so a handler may connect or
/// disconnect on the signal it is called from.
pub struct Signal<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> Signal<T> {
    /// Creates a signal with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Appends a handler.
    pub fn connect<F>(&self, handler: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut slots = self.slots.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.handlers.push((id, Arc::new(handler)));
            id
        };
        let table: Arc<dyn SlotTable> = self.slots.clone();
        Connection {
            table: Some(Arc::downgrade(&table)),
            id,
        }
    }

    /// Invokes every handler in connection order.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.slots.lock().handlers.iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            handler(value);
        }
    }

    /// Number of connected handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().handlers.len()
    }

    /// True when nothing is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one connected handler.
///
/// Dropping a `Connection` leaves the handler connected; use
/// [`ScopedConnection`] for drop-to-disconnect.
#[derive(Clone, Default)]
pub struct Connection {
    table: Option<Weak<dyn SlotTable>>,
    id: u64,
}

impl Connection {
    /// Removes the handler. Returns false if it was already gone.
    pub fn disconnect(&self) -> bool {
        self.table
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|table| table.remove(self.id))
    }

    /// True while the handler is connected and its signal alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.table
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|table| table.contains(self.id))
    }

    /// Wraps the connection so that it disconnects on drop.
    #[must_use]
    pub fn scoped(self) -> ScopedConnection {
        ScopedConnection(self)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Connection that disconnects when dropped.
#[derive(Debug, Default)]
pub struct ScopedConnection(Connection);

impl ScopedConnection {
    /// The wrapped connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.0
    }

    /// Gives up ownership without disconnecting.
    #[must_use]
    pub fn release(mut self) -> Connection {
        std::mem::take(&mut self.0)
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}
