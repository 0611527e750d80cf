// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A queue to handle delayed, cancellable destruction of named objects
//!
//! Guest network devices are not torn down at the moment a port is unplugged:
//! the hypervisor may still hold the device open for a short while. Instead
//! their deletion is scheduled here, keyed by device name, and a later plug
//! that reuses the name cancels the pending deletion.

use anyhow::Error;
use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::exponential::ExponentialBackoff;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
use slog::{error, info, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Deletions which are scheduled or running, keyed by name.
///
/// The map lock is only held to look entries up or change them, never
/// while a deletion runs. Each key has a run lock instead, held by its
/// deletion for as long as that runs and shared by every deletion
/// scheduled for the key. [`Destructor::cancel`] waits on that lock alone,
/// so once `cancel` returns no deletion of the key is running, and the
/// cancelled one will never start.
type PendingMap = Arc<tokio::sync::Mutex<HashMap<String, PendingDeletion>>>;

struct PendingDeletion {
    generation: u64,
    token: CancellationToken,
    running: Arc<tokio::sync::Mutex<()>>,
    started: bool,
}

/// Measures retry deadlines on the tokio clock, so they follow the
/// runtime's notion of time.
#[derive(Clone, Copy, Debug, Default)]
struct TokioClock;

impl backoff::Clock for TokioClock {
    fn now(&self) -> std::time::Instant {
        tokio::time::Instant::now().into_std()
    }
}

fn deletion_policy() -> ExponentialBackoff<TokioClock> {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(50);
    const MAX_INTERVAL: Duration = Duration::from_secs(1);
    const MAX_ELAPSED: Duration = Duration::from_secs(30);
    ExponentialBackoff {
        current_interval: INITIAL_INTERVAL,
        initial_interval: INITIAL_INTERVAL,
        multiplier: 2.0,
        max_interval: MAX_INTERVAL,
        max_elapsed_time: Some(MAX_ELAPSED),
        ..ExponentialBackoff::default()
    }
}

enum Message<T> {
    // An object for the destructor to delete once its delay has passed.
    Data { key: String, object: T, delay: Duration, generation: u64 },
    // A signal for the destructor to exit when no additional work remains.
    Exit,
}

struct DestructorWorker<T> {
    log: Logger,
    rx: mpsc::UnboundedReceiver<Message<T>>,
    futs: FuturesUnordered<BoxFuture<'static, ()>>,
    pending: PendingMap,
}

/// Takes the run lock of `key` and marks the deletion started, unless
/// `generation` was cancelled or replaced in the meantime.
async fn claim(
    pending: &PendingMap,
    key: &str,
    generation: u64,
) -> Option<OwnedMutexGuard<()>> {
    let running = pending
        .lock()
        .await
        .get(key)
        .filter(|p| p.generation == generation)?
        .running
        .clone();
    // An earlier deletion of the same key may still be running.
    let guard = running.lock_owned().await;

    let mut pending = pending.lock().await;
    let entry =
        pending.get_mut(key).filter(|p| p.generation == generation)?;
    entry.started = true;
    Some(guard)
}

impl<T: Deletable> DestructorWorker<T> {
    async fn run(&mut self) {
        let mut exit = false;
        loop {
            tokio::select! {
                Some(_) = self.futs.next() => {
                    if exit && self.futs.is_empty() {
                        return;
                    }
                }
                msg = self.rx.recv(), if !exit => {
                    let msg = msg.unwrap_or(Message::Exit);
                    match msg {
                        Message::Data { key, object, delay, generation } => {
                            self.enqueue_destroy(key, object, delay, generation)
                        }
                        Message::Exit => {
                            exit = true;
                            if self.futs.is_empty() {
                                return;
                            }
                        },
                    }
                },
            }
        }
    }

    fn enqueue_destroy(
        &self,
        key: String,
        object: T,
        delay: Duration,
        generation: u64,
    ) {
        let pending = self.pending.clone();
        let log = self.log.new(slog::o!("key" => key.clone()));
        self.futs.push(
            async move {
                let token = match pending.lock().await.get(&key) {
                    Some(p) if p.generation == generation => p.token.clone(),
                    // Cancelled or superseded before we even started.
                    _ => return,
                };
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(_running) = claim(&pending, &key, generation).await
                else {
                    return;
                };
                let do_delete = || async {
                    object.delete().await.map_err(|err| {
                        backoff::Error::transient(format!("{err:#}"))
                    })
                };
                let log_retry = |err: String, delay: Duration| {
                    warn!(
                        log,
                        "Deletion failed, will retry";
                        "error" => err,
                        "retry_in" => ?delay,
                    );
                };
                match retry_notify(deletion_policy(), do_delete, log_retry)
                    .await
                {
                    Ok(()) => info!(log, "Deleted"),
                    Err(err) => error!(
                        log,
                        "Giving up on deletion";
                        "error" => err,
                    ),
                }

                let mut pending = pending.lock().await;
                if pending.get(&key).is_some_and(|p| p.generation == generation)
                {
                    pending.remove(&key);
                }
            }
            .boxed(),
        );
    }
}

struct Inner<T> {
    tx: mpsc::UnboundedSender<Message<T>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    next_generation: u64,
}

/// A destructor which asynchronously destroys objects after a delay,
/// which can throw errors during destruction.
pub struct Destructor<T> {
    inner: Arc<Mutex<Inner<T>>>,
    pending: PendingMap,
}

// Manual, since derive(Clone) would demand `T: Clone`.
impl<T> Clone for Destructor<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), pending: self.pending.clone() }
    }
}

impl<T: Deletable> Destructor<T> {
    /// Creates a new destructor with a background task to consume destroyed
    /// objects.
    pub fn new(log: Logger) -> Self {
        let futs = FuturesUnordered::new();
        let (tx, rx) = mpsc::unbounded_channel::<Message<T>>();
        let pending: PendingMap = Arc::default();

        let worker_pending = pending.clone();
        let handle = tokio::task::spawn(async move {
            let mut worker =
                DestructorWorker { log, rx, futs, pending: worker_pending };
            worker.run().await;
        });
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tx,
                handle: Some(handle),
                next_generation: 0,
            })),
            pending,
        }
    }

    /// Destroys `object` in a background task once `delay` has elapsed,
    /// unless [`Self::cancel`] is called for `key` first.
    ///
    /// Scheduling a key which is already pending replaces the earlier
    /// deletion. A deletion of the key which is already running is left to
    /// finish.
    pub async fn enqueue_destroy(&self, key: &str, object: T, delay: Duration) {
        let mut pending = self.pending.lock().await;
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_generation += 1;
            inner.next_generation
        };
        let running = pending
            .get(key)
            .map(|p| p.running.clone())
            .unwrap_or_default();
        let entry = PendingDeletion {
            generation,
            token: CancellationToken::new(),
            running,
            started: false,
        };
        if let Some(old) = pending.insert(key.to_string(), entry) {
            old.token.cancel();
        }
        drop(pending);

        self.inner
            .lock()
            .unwrap()
            .tx
            .send(Message::Data { key: key.to_string(), object, delay, generation })
            .map_err(|err| err.to_string())
            // Unwrap safety:
            // - The DestructorWorker can only be stopped by "try_close"
            // - "try_close" can only succeed if it's called on the last strong reference to the
            // Destructor.
            // - Since "enqueue_destroy" was called on a "Destructor", one more reference must
            // exist.
            .unwrap();
    }

    /// Cancels the deletion for `key`, returning true if one was scheduled
    /// and had not started.
    ///
    /// A deletion of `key` which is already running is waited for.
    /// Deletions of other keys never delay this call.
    pub async fn cancel(&self, key: &str) -> bool {
        let Some(entry) = self.pending.lock().await.remove(key) else {
            return false;
        };
        entry.token.cancel();
        let _finished = entry.running.lock().await;
        !entry.started
    }

    /// Returns true if a deletion is scheduled or running for `key`.
    pub async fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().await.contains_key(key)
    }

    /// Closes the destructor if this is the only reference to it.
    ///
    /// Consumes "self" to prevent subsequent objects from being enqueued
    /// to the Destructor. Pending deletions still run (after their delay)
    /// before this returns.
    ///
    /// If there is more than one reference to "self", it is returned
    /// as the Result's error type.
    pub async fn try_close(self) -> Result<(), Self> {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            if inner.handle.is_none() {
                return Ok(());
            }
            if Arc::strong_count(&self.inner) != 1 {
                drop(inner);
                return Err(self);
            }
            // Unwrap safety: the handle must be "Some", so we only get here if the
            // DestructorWorker is still running.
            //
            // This relies on the assumption that "Exit" is the only way to stop the
            // worker.
            inner
                .tx
                .send(Message::Exit)
                .map_err(|err| err.to_string())
                .unwrap();

            // Unwrap safety: we validated "inner.handle.is_none()" was false
            // earlier, under a Mutex.
            inner.handle.take().unwrap()
        };
        let _ = handle.await;
        Ok(())
    }
}

/// Describes an object which can be destroyed asynchronously.
///
/// Implementations capture everything needed to perform the deletion, since
/// the deletion runs long after the caller has moved on.
#[async_trait]
pub trait Deletable: Send + Sync + 'static {
    async fn delete(&self) -> Result<(), Error>;
}
