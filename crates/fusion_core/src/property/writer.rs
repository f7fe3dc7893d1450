//! Write policies: where a property keeps values staged between syncs.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::error::PropertyError;

/// Staging area for writes made between two synchronisations.
pub trait WritePolicy<T>: Default + Send + Sync + 'static {
    /// Stages `value` for the calling thread.
    ///
    /// # Errors
    ///
    /// `ReadOnly` if the policy accepts no writes.
    fn stage(&self, value: T) -> Result<(), PropertyError>;

    /// Takes one staged value and empties every slot.
    fn collapse(&self) -> Option<T>;

    /// True if a write is waiting.
    fn has_staged(&self) -> bool;

    /// Whether committing `staged` over `current` counts as a change.
    fn is_change(_current: &T, _staged: &T) -> bool {
        true
    }
}

/// One slot per writing thread.
///
/// Collapsing keeps whichever slot the map yields first and drops the rest.
/// No thread's write is promised to win.
pub struct PerThreadWriter<T> {
    slots: DashMap<ThreadId, T>,
}

impl<T> Default for PerThreadWriter<T> {
    fn default() -> Self {
        Self { slots: DashMap::new() }
    }
}

impl<T: Send + Sync + 'static> WritePolicy<T> for PerThreadWriter<T> {
    fn stage(&self, value: T) -> Result<(), PropertyError> {
        self.slots.insert(thread::current().id(), value);
        Ok(())
    }

    fn collapse(&self) -> Option<T> {
        // The iterator guard must be gone before `remove` locks the shard
        let first = self.slots.iter().next().map(|entry| *entry.key())?;
        let value = self.slots.remove(&first).map(|(_, value)| value);
        self.slots.clear();
        value
    }

    fn has_staged(&self) -> bool {
        !self.slots.is_empty()
    }
}

/// Accepts no writes. For derived values refreshed from their source.
pub struct NullWriter<T>(PhantomData<fn() -> T>);

impl<T> Default for NullWriter<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: 'static> WritePolicy<T> for NullWriter<T> {
    fn stage(&self, _value: T) -> Result<(), PropertyError> {
        tracing::error!(ty = std::any::type_name::<T>(), "set() on a read-only property");
        Err(PropertyError::ReadOnly)
    }

    fn collapse(&self) -> Option<T> {
        None
    }

    fn has_staged(&self) -> bool {
        false
    }
}

/// Primitive with a matching std atomic.
pub trait AtomicValue: Copy + PartialEq + Default + Send + Sync + 'static {
    /// The atomic cell type.
    type Cell: Send + Sync;

    /// New cell holding `value`.
    fn new_cell(value: Self) -> Self::Cell;
    /// Reads the cell.
    fn load(cell: &Self::Cell) -> Self;
    /// Writes the cell.
    fn store(cell: &Self::Cell, value: Self);
}

macro_rules! atomic_value {
    ($($ty:ty => $cell:ty),* $(,)?) => {
        $(
            impl AtomicValue for $ty {
                type Cell = $cell;

                #[inline]
                fn new_cell(value: Self) -> Self::Cell {
                    <$cell>::new(value)
                }

                #[inline]
                fn load(cell: &Self::Cell) -> Self {
                    cell.load(Ordering::Acquire)
                }

                #[inline]
                fn store(cell: &Self::Cell, value: Self) {
                    cell.store(value, Ordering::Release);
                }
            }
        )*
    };
}

atomic_value! {
    bool => AtomicBool,
    i32 => AtomicI32,
    u32 => AtomicU32,
    i64 => AtomicI64,
    u64 => AtomicU64,
    isize => AtomicIsize,
    usize => AtomicUsize,
}

/// Single atomic slot shared by every thread.
///
/// Concurrent writers race; whichever store lands last is what the next
/// sync sees. A commit that leaves the value unchanged is not a change.
pub struct AtomicWriter<T: AtomicValue> {
    value: T::Cell,
    staged: AtomicBool,
}

impl<T: AtomicValue> Default for AtomicWriter<T> {
    fn default() -> Self {
        Self {
            value: T::new_cell(T::default()),
            staged: AtomicBool::new(false),
        }
    }
}

impl<T: AtomicValue> WritePolicy<T> for AtomicWriter<T> {
    #[inline]
    fn stage(&self, value: T) -> Result<(), PropertyError> {
        T::store(&self.value, value);
        self.staged.store(true, Ordering::Release);
        Ok(())
    }

    #[inline]
    fn collapse(&self) -> Option<T> {
        self.staged
            .swap(false, Ordering::AcqRel)
            .then(|| T::load(&self.value))
    }

    #[inline]
    fn has_staged(&self) -> bool {
        self.staged.load(Ordering::Acquire)
    }

    #[inline]
    fn is_change(current: &T, staged: &T) -> bool {
        current != staged
    }
}
