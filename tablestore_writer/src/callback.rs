//! Asynchronous per-row result notification.

use std::{
    fmt::Debug,
    panic::{AssertUnwindSafe, catch_unwind},
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{
    result::{RowAck, RowFailure},
    row::RowChange,
};

/// Receives the outcome of every accepted row.
///
/// Invoked on a [`CallbackExecutor`] thread, never on the thread that
/// submitted the row nor on a bucket consumer. Each accepted row produces
/// exactly one call. Calls for rows of the same batch are made in batch order,
/// with no ordering across batches.
///
/// Implementations must not block for long: a slow callback holds up every
/// flush.
pub trait ResultCallback: Send + Sync + Debug {
    fn on_completed(&self, row: &RowChange, ack: &RowAck);

    fn on_failed(&self, row: &RowChange, failure: &RowFailure);
}

type CallbackFn = dyn Fn(&RowChange, Result<&RowAck, &RowFailure>) + Send + Sync;

/// A [`ResultCallback`] backed by a single closure.
pub struct FnCallback(Box<CallbackFn>);

impl FnCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RowChange, Result<&RowAck, &RowFailure>) + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }
}

impl Debug for FnCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCallback").finish_non_exhaustive()
    }
}

impl ResultCallback for FnCallback {
    fn on_completed(&self, row: &RowChange, ack: &RowAck) {
        (self.0)(row, Ok(ack))
    }

    fn on_failed(&self, row: &RowChange, failure: &RowFailure) {
        (self.0)(row, Err(failure))
    }
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of threads running callback jobs.
///
/// Jobs are queued without bound; the number of queued jobs is bounded in
/// practice by the writer's in-flight batch limit. A panicking job is logged
/// and does not take its thread down.
///
/// An executor may be shared by several writers. Only its owner should call
/// [`CallbackExecutor::shutdown()`].
#[derive(Debug)]
pub struct CallbackExecutor {
    tx: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CallbackExecutor {
    /// Start an executor running `n_threads` threads.
    ///
    /// # Panics
    ///
    /// Panics if `n_threads` is 0, or a thread cannot be spawned.
    pub fn new(n_threads: usize) -> Self {
        assert_ne!(n_threads, 0, "callback executor needs at least one thread");

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let threads = (0..n_threads)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("tablestore-writer-callback-{i}"))
                    .spawn(move || run_jobs(rx))
                    .expect("failed to spawn callback thread")
            })
            .collect();

        debug!(n_threads, "started callback executor");

        Self {
            tx: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
        }
    }

    /// Queue `job`, returning it if the executor has been shut down.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting jobs, run every job already queued, and join the
    /// threads.
    ///
    /// Blocks the calling thread.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());

        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            if t.join().is_err() {
                warn!("callback thread exited abnormally");
            }
        }
        debug!("callback executor stopped");
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the threads exit once the queue is empty.
        drop(self.tx.lock().take());
    }
}

fn run_jobs(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("result callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_runs_jobs_and_survives_panics() {
        let exec = CallbackExecutor::new(2);
        let ran = Arc::new(AtomicUsize::new(0));

        assert!(exec.submit(Box::new(|| panic!("bang"))).is_ok());
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            let job = Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            assert!(exec.submit(job).is_ok());
        }

        exec.shutdown();
        assert!(exec.is_shutdown());
        assert_eq!(ran.load(Ordering::SeqCst), 10);

        // Jobs submitted after shutdown are handed back.
        assert!(exec.submit(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_fn_callback() {
        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let cb = FnCallback::new({
            let completed = Arc::clone(&completed);
            let failed = Arc::clone(&failed);
            move |_, outcome| {
                match outcome {
                    Ok(_) => completed.fetch_add(1, Ordering::SeqCst),
                    Err(_) => failed.fetch_add(1, Ordering::SeqCst),
                };
            }
        });

        let row = RowChange::delete("t", crate::row::PrimaryKey::new([("id", 1_i64)]));
        cb.on_completed(&row, &RowAck::default());
        cb.on_failed(&row, &RowFailure::Dropped);
        cb.on_failed(&row, &RowFailure::Dropped);

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 2);
    }
}
