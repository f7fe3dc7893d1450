//! Property registry: commits every live property in the serial phase.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{ThreadSafeProperty, WritePolicy};
use crate::scheduler::SerialPhase;

/// Object-safe view of a property for the serial phase.
pub trait SyncProperty: Send + Sync {
    /// Commits staged writes. Returns true if the value changed.
    fn synchronise_staged(&self) -> bool;

    /// Fires the change signal if the last commit changed the value.
    fn fire_changed(&self);
}

impl<T, W> SyncProperty for ThreadSafeProperty<T, W>
where
    T: Clone + Send + Sync + 'static,
    W: WritePolicy<T>,
{
    fn synchronise_staged(&self) -> bool {
        self.synchronise_with_accessors()
    }

    fn fire_changed(&self) {
        self.fire_signal();
    }
}

/// Weak list of properties, synchronised together once per tick.
///
/// Dropped properties are pruned on the next run.
#[derive(Default)]
pub struct PropertyRegistry {
    name: String,
    properties: Mutex<Vec<Weak<dyn SyncProperty>>>,
}

impl PropertyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Mutex::new(Vec::new()),
        }
    }

    /// Adds a property. The registry does not keep it alive.
    pub fn register<P>(&self, property: &Arc<P>)
    where
        P: SyncProperty + 'static,
    {
        let property: Arc<dyn SyncProperty> = property.clone();
        self.properties.lock().push(Arc::downgrade(&property));
    }

    /// Number of registered properties still alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.lock().iter().filter(|p| p.strong_count() > 0).count()
    }

    /// True when no live property is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronises every property, then fires every signal.
    ///
    /// Returns how many properties committed a change.
    pub fn synchronise_all(&self) -> usize {
        let live: Vec<Arc<dyn SyncProperty>> = {
            let mut properties = self.properties.lock();
            properties.retain(|p| p.strong_count() > 0);
            properties.iter().filter_map(Weak::upgrade).collect()
        };

        let changed = live.iter().filter(|p| p.synchronise_staged()).count();
        for property in &live {
            property.fire_changed();
        }

        tracing::trace!(registry = %self.name, properties = live.len(), changed, "properties synchronised");
        changed
    }
}

impl SerialPhase for PropertyRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_serial(&self) {
        self.synchronise_all();
    }
}
