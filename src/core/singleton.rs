// src/core/singleton.rs

//! A lazily created, singly flighted, fault-recoverable async resource slot.
//!
//! `FaultTolerantSingleton` hands out one shared instance of an expensive
//! resource (a protocol session), creating it on first demand, letting
//! concurrent callers piggyback on a single in-flight creation, and
//! transparently rebuilding it after the resource reports itself closed.

use crate::core::errors::HubMuxError;
use crate::core::timeout::Budget;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// A resource the singleton can hold: cheaply cloneable, with an observable
/// open/closed state and a completion future for its eventual close.
pub trait Recyclable: Clone + Send + Sync + 'static {
    fn is_open(&self) -> bool;
    fn closed(&self) -> BoxFuture<'static, ()>;
}

type CreateFuture<T> = BoxFuture<'static, Result<T, HubMuxError>>;
type CreateFn<T> = dyn Fn(Duration) -> CreateFuture<T> + Send + Sync;
type CloseFn<T> = dyn Fn(T) + Send + Sync;
type Outcome<T> = Option<Result<T, HubMuxError>>;

enum Slot<T> {
    Empty,
    /// A creation attempt is in flight; waiters subscribe to its outcome.
    Pending(watch::Receiver<Outcome<T>>),
    /// A fully created value. `generation` ties the fault watcher to this
    /// particular incarnation.
    Ready { value: T, generation: u64 },
}

pub struct FaultTolerantSingleton<T: Recyclable> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Recyclable> {
    create: Box<CreateFn<T>>,
    close: Box<CloseFn<T>>,
    slot: Mutex<Slot<T>>,
    disposed: AtomicBool,
    generation: AtomicU64,
}

impl<T: Recyclable> FaultTolerantSingleton<T> {
    pub fn new(
        create: impl Fn(Duration) -> CreateFuture<T> + Send + Sync + 'static,
        close: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                create: Box::new(create),
                close: Box::new(close),
                slot: Mutex::new(Slot::Empty),
                disposed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the current instance, creating it if absent.
    ///
    /// At most one creation is ever in flight: the caller that observes an
    /// empty slot installs the pending attempt, and every concurrent caller
    /// awaits that same attempt's outcome. A creation failure is delivered
    /// to all of them, after which the slot resets so a later call retries
    /// cleanly. Fails with `Timeout` once the budget is spent and with
    /// `Disposed` if `close` was called meanwhile.
    pub async fn get_or_create(&self, timeout: Duration) -> Result<T, HubMuxError> {
        let budget = Budget::new(timeout);
        loop {
            if self.inner.disposed.load(Ordering::Acquire) {
                return Err(HubMuxError::Disposed);
            }
            let remaining = budget.check()?;

            let mut rx = {
                let mut slot = self.inner.slot.lock();
                if let Slot::Ready { value, .. } = &*slot {
                    if value.is_open() {
                        return Ok(value.clone());
                    }
                    // The fault watcher usually clears this first; either
                    // way a closed value is never handed out.
                    *slot = Slot::Empty;
                }
                match &*slot {
                    Slot::Pending(rx) => rx.clone(),
                    _ => self.inner.clone().spawn_attempt(&mut slot, remaining),
                }
            };

            let outcome = tokio::time::timeout(remaining, async {
                loop {
                    if let Some(outcome) = rx.borrow_and_update().clone() {
                        return outcome;
                    }
                    if rx.changed().await.is_err() {
                        return Err(HubMuxError::Internal(
                            "creation attempt dropped without an outcome".into(),
                        ));
                    }
                }
            })
            .await;

            match outcome {
                Err(_) => return Err(HubMuxError::Timeout(timeout)),
                Ok(Ok(value)) if value.is_open() => return Ok(value),
                Ok(Ok(_)) => {
                    // Created but already closed again; retry while the
                    // budget lasts.
                    debug!("created object reported closed immediately; retrying");
                }
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    /// Non-blocking: the current value, only if present and observably open.
    /// Never triggers creation.
    pub fn try_get_opened(&self) -> Option<T> {
        match &*self.inner.slot.lock() {
            Slot::Ready { value, .. } if value.is_open() => Some(value.clone()),
            _ => None,
        }
    }

    /// Idempotent. A fully created value is closed through the owner's close
    /// callback; an in-flight creation is left to complete and self-close.
    pub fn close(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let value = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Ready { value, .. } => Some(value),
                Slot::Pending(rx) => {
                    // Leave the attempt in place; its driver observes the
                    // disposed flag on completion and closes the result.
                    *slot = Slot::Pending(rx);
                    None
                }
                Slot::Empty => None,
            }
        };
        if let Some(value) = value {
            (self.inner.close)(value);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl<T: Recyclable> Inner<T> {
    /// Installs a pending attempt into `slot` (the caller holds the lock)
    /// and spawns the driver task that runs the creation callback.
    fn spawn_attempt(
        self: Arc<Self>,
        slot: &mut Slot<T>,
        timeout: Duration,
    ) -> watch::Receiver<Outcome<T>> {
        let (tx, rx) = watch::channel(None);
        *slot = Slot::Pending(rx.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::spawn(async move {
            let outcome = match (self.create)(timeout).await {
                Ok(value) => self.install(value, generation),
                Err(err) => {
                    let mut slot = self.slot.lock();
                    if matches!(&*slot, Slot::Pending(_)) {
                        *slot = Slot::Empty;
                    }
                    Err(err)
                }
            };
            // Every waiter may have timed out and gone away; that is fine.
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    /// Publishes a freshly created value and wires its fault watcher.
    fn install(self: &Arc<Self>, value: T, generation: u64) -> Result<T, HubMuxError> {
        let disposed = {
            let mut slot = self.slot.lock();
            if self.disposed.load(Ordering::Acquire) {
                *slot = Slot::Empty;
                true
            } else {
                *slot = Slot::Ready {
                    value: value.clone(),
                    generation,
                };
                false
            }
        };
        if disposed {
            (self.close)(value);
            return Err(HubMuxError::Disposed);
        }

        let weak = Arc::downgrade(self);
        let closed = value.closed();
        tokio::spawn(async move {
            closed.await;
            if let Some(inner) = weak.upgrade() {
                inner.invalidate(generation);
            }
        });
        Ok(value)
    }

    /// Empties the slot if it still holds the given incarnation, so the next
    /// `get_or_create` rebuilds instead of returning a closed object.
    fn invalidate(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Ready { generation: g, .. } if *g == generation) {
            debug!(generation, "held object reported closed; invalidating");
            *slot = Slot::Empty;
        }
    }
}
