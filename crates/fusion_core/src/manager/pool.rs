//! # Worker Pool
//!
//! Fixed-size pool of OS threads fed by crossbeam channels.
//!
//! ```text
//!                 ┌──────────────┐
//!   spawn(hint) ─>│ own queue  0 │──> worker 0 ─┐
//!                 ├──────────────┤              │ idle workers
//!                 │ own queue  1 │──> worker 1 ─┤ fall through to
//!                 ├──────────────┤              │ the shared queue
//!   spawn(None) ─>│ shared queue │<─────────────┘ (primary helps too)
//!                 └──────────────┘
//! ```
//!
//! A job with an affinity hint lands on its worker's own queue unless that
//! queue is already `affinity_queue_depth` deep, in which case the hint is
//! ignored and the job goes to the shared queue for whoever is free.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, unbounded, Receiver, SendError, Sender};

use super::latch::Latch;
use crate::error::SchedulerError;

/// A unit of work for the pool.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Opaque per-worker identifier, used as a placement hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffinityId(usize);

impl AffinityId {
    /// Index of the worker this id belongs to.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

thread_local! {
    static WORKER_AFFINITY: Cell<Option<AffinityId>> = const { Cell::new(None) };
}

/// Affinity of the calling thread, if it is a pool worker.
#[must_use]
pub fn current_affinity() -> Option<AffinityId> {
    WORKER_AFFINITY.with(Cell::get)
}

enum Message {
    Run(Job),
    Shutdown,
}

struct Worker {
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
}

/// Cloneable dispatch side of the pool. Tasks that finish on a worker use it
/// to spawn their successors without going back through the primary thread.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    own: Vec<Sender<Message>>,
    shared: Sender<Job>,
    affinity_queue_depth: usize,
}

impl PoolHandle {
    pub(crate) fn spawn(&self, job: Job, hint: Option<AffinityId>) {
        let job = match hint.and_then(|id| self.own.get(id.0)) {
            Some(own) if own.len() < self.affinity_queue_depth => match own.send(Message::Run(job)) {
                Ok(()) => return,
                Err(SendError(Message::Run(job))) => job,
                Err(SendError(Message::Shutdown)) => return,
            },
            _ => job,
        };

        if self.shared.send(job).is_err() {
            tracing::error!("worker pool is shut down, job dropped");
        }
    }
}

/// Fixed-size worker pool.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    handle: PoolHandle,
    shared_rx: Receiver<Job>,
}

impl WorkerPool {
    /// Spawns `threads` workers.
    ///
    /// # Errors
    ///
    /// `PoolUnavailable` if the OS refuses a thread.
    pub(crate) fn new(threads: usize, affinity_queue_depth: usize) -> Result<Self, SchedulerError> {
        if threads == 0 {
            return Err(SchedulerError::PoolUnavailable("pool needs at least one worker".into()));
        }

        let (shared_tx, shared_rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);

        for index in 0..threads {
            let (own_tx, own_rx) = unbounded::<Message>();
            let shared = shared_rx.clone();

            let handle = thread::Builder::new()
                .name(format!("fusion-worker-{index}"))
                .spawn(move || worker_loop(AffinityId(index), &own_rx, &shared))
                .map_err(|err| SchedulerError::PoolUnavailable(err.to_string()))?;

            workers.push(Worker {
                sender: own_tx,
                handle: Some(handle),
            });
        }

        tracing::info!(threads, "worker pool started");

        let handle = PoolHandle {
            own: workers.iter().map(|w| w.sender.clone()).collect(),
            shared: shared_tx,
            affinity_queue_depth: affinity_queue_depth.max(1),
        };

        Ok(Self {
            workers,
            handle,
            shared_rx,
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub(crate) fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Receiving end of the shared queue, for the primary thread to help out.
    #[inline]
    pub(crate) fn shared_receiver(&self) -> &Receiver<Job> {
        &self.shared_rx
    }

    /// Runs `f` exactly once on every worker and blocks until all are done.
    ///
    /// # Errors
    ///
    /// `PreconditionViolation` when called from a worker: it would wait on itself.
    pub(crate) fn broadcast(&self, f: Arc<dyn Fn() + Send + Sync>) -> Result<(), SchedulerError> {
        if current_affinity().is_some() {
            return Err(SchedulerError::PreconditionViolation(
                "per-thread callback issued from a worker thread",
            ));
        }

        let latch = Arc::new(Latch::new(self.workers.len()));
        for worker in &self.workers {
            let f = Arc::clone(&f);
            let job_latch = Arc::clone(&latch);
            let job: Job = Box::new(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| f())).is_err() {
                    tracing::error!(worker = ?current_affinity(), "per-thread callback panicked");
                }
                job_latch.count_down();
            });
            if worker.sender.send(Message::Run(job)).is_err() {
                // Worker is gone; count it as done so the caller is not stranded
                latch.count_down();
            }
        }

        latch.wait();
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(Message::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    tracing::warn!("worker thread exited by panic");
                }
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

fn worker_loop(affinity: AffinityId, own: &Receiver<Message>, shared: &Receiver<Job>) {
    WORKER_AFFINITY.with(|slot| slot.set(Some(affinity)));

    loop {
        // Own queue first: that is where affinity-hinted work waits
        let message = match own.try_recv() {
            Ok(message) => message,
            Err(_) => select! {
                recv(own) -> message => match message {
                    Ok(message) => message,
                    Err(_) => break,
                },
                recv(shared) -> job => match job {
                    Ok(job) => Message::Run(job),
                    Err(_) => break,
                },
            },
        };

        match message {
            Message::Run(job) => job(),
            Message::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            WorkerPool::new(0, 4),
            Err(SchedulerError::PoolUnavailable(_))
        ));
    }

    #[test]
    fn test_broadcast_reaches_every_worker_once() {
        let pool = WorkerPool::new(4, 4).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        pool.broadcast(Arc::new(move || {
            sink.lock().push(current_affinity().unwrap());
        }))
        .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        let distinct: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_hinted_and_unhinted_jobs_all_run() {
        let pool = WorkerPool::new(2, 2).unwrap();
        let done = Arc::new(Latch::new(64));
        let count = Arc::new(AtomicUsize::new(0));

        for i in 0..64 {
            let done = Arc::clone(&done);
            let count = Arc::clone(&count);
            let hint = if i % 2 == 0 { Some(AffinityId(i % 3)) } else { None };
            pool.handle().spawn(
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                    done.count_down();
                }),
                hint,
            );
        }

        done.wait();
        assert_eq!(count.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_broadcast_from_worker_rejected() {
        let pool = Arc::new(WorkerPool::new(1, 1).unwrap());
        let result = Arc::new(parking_lot::Mutex::new(None));
        let done = Arc::new(Latch::new(1));

        {
            let pool_ref = Arc::clone(&pool);
            let result = Arc::clone(&result);
            let done = Arc::clone(&done);
            pool.handle().spawn(
                Box::new(move || {
                    *result.lock() = Some(pool_ref.broadcast(Arc::new(|| {})));
                    done.count_down();
                }),
                None,
            );
        }

        done.wait();
        assert!(matches!(
            result.lock().take(),
            Some(Err(SchedulerError::PreconditionViolation(_)))
        ));
    }

    #[test]
    fn test_non_worker_has_no_affinity() {
        assert_eq!(current_affinity(), None);
    }
}
