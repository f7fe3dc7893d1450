//! Followers: handlers that outlive the absence of their generator.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{EventSerializer, PendingSubscription, SynchronisedSignalingSystem};
use crate::error::SignalError;
use crate::property::Connection;

#[derive(Default)]
struct FollowerState {
    connection: Option<Connection>,
    pending: Option<PendingSubscription>,
}

/// Handler for a key that may not have a generator yet.
///
/// If the generator exists the handler attaches at once. Otherwise a
/// one-shot subscription waits for it and attaches on creation. Dropping the
/// follower disconnects the handler or cancels the wait.
pub struct PersistentFollower<T> {
    state: Arc<Mutex<FollowerState>>,
    _payload: std::marker::PhantomData<fn(&T)>,
}

impl<T: Send + 'static> PersistentFollower<T> {
    /// Follows `key` with `handler`.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` if a generator for `key` already exists with another
    /// payload type.
    pub fn follow<K, S, F>(
        system: &SynchronisedSignalingSystem<K, S>,
        key: K,
        handler: F,
    ) -> Result<Self, SignalError>
    where
        K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
        S: EventSerializer<K> + Default,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handler: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(handler);
        let state = Arc::new(Mutex::new(FollowerState::default()));

        match attach(system, &key, &handler) {
            Ok(connection) => {
                state.lock().connection = Some(connection);
                return Ok(Self::from_state(state));
            }
            Err(SignalError::NoSuchGenerator(_)) => {}
            Err(err) => return Err(err),
        }

        let adopt_state = Arc::clone(&state);
        let adopt_handler = Arc::clone(&handler);
        let adopt_key = key.clone();
        let pending = system.subscribe_new_generator(key.clone(), move |new| {
            let handler = Arc::clone(&adopt_handler);
            match new.add_handler::<T, _>(move |payload| handler(payload)) {
                Ok(connection) => {
                    let mut state = adopt_state.lock();
                    state.pending = None;
                    state.connection = Some(connection);
                }
                Err(err) => {
                    tracing::error!(key = ?adopt_key, error = %err, "follower could not adopt generator");
                }
            }
        });
        {
            // Adoption on another thread may already have attached the handler
            let mut state = state.lock();
            if state.connection.is_none() {
                state.pending = Some(pending);
            }
        }

        // The generator may have appeared between the first attempt and the subscription
        if system.has_generator(&key) {
            let cancelled = state.lock().pending.as_ref().is_some_and(PendingSubscription::cancel);
            if cancelled {
                let connection = attach(system, &key, &handler)?;
                let mut state = state.lock();
                state.pending = None;
                state.connection = Some(connection);
            }
        }

        Ok(Self::from_state(state))
    }

    fn from_state(state: Arc<Mutex<FollowerState>>) -> Self {
        Self {
            state,
            _payload: std::marker::PhantomData,
        }
    }

    /// True once the handler is attached to a generator.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state.lock().connection.as_ref().is_some_and(Connection::is_connected)
    }

    /// True while still waiting for the generator to appear.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

fn attach<K, S, T>(
    system: &SynchronisedSignalingSystem<K, S>,
    key: &K,
    handler: &Arc<dyn Fn(&T) + Send + Sync>,
) -> Result<Connection, SignalError>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    S: EventSerializer<K> + Default,
    T: Send + 'static,
{
    let handler = Arc::clone(handler);
    system.add_handler::<T, _>(key, move |payload| handler(payload))
}

impl<T> Drop for PersistentFollower<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        if let Some(connection) = state.connection.take() {
            connection.disconnect();
        }
    }
}

impl<T> Debug for PersistentFollower<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PersistentFollower")
            .field("attached", &state.connection.is_some())
            .field("waiting", &state.pending.is_some())
            .finish()
    }
}
