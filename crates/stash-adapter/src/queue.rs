//! Store lifecycle and the queue of requests made before the store opened.
//!
//! A store starts `Opening`. Requests submitted while opening are parked in
//! arrival order. The transition to `Ready` or `Failed` happens once, under
//! the same lock that guards enqueueing, and hands the parked requests back
//! to the caller so they can be replayed or failed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use stash_store::Database;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{AdapterError, AdapterResult};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Lifecycle of the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    Opening,
    Ready,
    Failed,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => f.write_str("opening"),
            Self::Ready => f.write_str("ready"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// A request parked until the store leaves `Opening`.
pub(crate) trait Deferred: Send {
    /// Run against the opened store and deliver the result.
    fn run(self: Box<Self>, db: Arc<dyn Database>) -> BoxFuture;

    /// Deliver `error` without running.
    fn fail(self: Box<Self>, error: AdapterError);
}

struct PendingRequest<F, T> {
    operation: F,
    reply: oneshot::Sender<AdapterResult<T>>,
}

impl<F, Fut, T> Deferred for PendingRequest<F, T>
where
    F: FnOnce(Arc<dyn Database>) -> Fut + Send + 'static,
    Fut: Future<Output = AdapterResult<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, db: Arc<dyn Database>) -> BoxFuture {
        let Self { operation, reply } = *self;
        Box::pin(async move {
            // The submitter may have stopped waiting; nothing to deliver to.
            let _ = reply.send(operation(db).await);
        })
    }

    fn fail(self: Box<Self>, error: AdapterError) {
        let _ = self.reply.send(Err(error));
    }
}

enum Lifecycle {
    Opening(Vec<Box<dyn Deferred>>),
    Ready(Arc<dyn Database>),
    Failed,
}

enum Admission<F, T> {
    Run(Arc<dyn Database>, F),
    Parked(oneshot::Receiver<AdapterResult<T>>),
    Refused,
}

/// Gate between callers and a store that may still be opening.
pub struct RequestQueue {
    lifecycle: Mutex<Lifecycle>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Opening(Vec::new())),
        }
    }

    pub fn state(&self) -> StoreState {
        match &*self.lifecycle.lock().expect("lifecycle lock poisoned") {
            Lifecycle::Opening(_) => StoreState::Opening,
            Lifecycle::Ready(_) => StoreState::Ready,
            Lifecycle::Failed => StoreState::Failed,
        }
    }

    /// Number of requests parked while opening.
    pub fn pending(&self) -> usize {
        match &*self.lifecycle.lock().expect("lifecycle lock poisoned") {
            Lifecycle::Opening(queue) => queue.len(),
            _ => 0,
        }
    }

    /// Run `operation` against the store.
    ///
    /// Runs immediately when the store is ready, parks until the store opens
    /// when it is opening, and fails with
    /// [`AdapterError::InitializationFailed`] when opening failed.
    pub async fn submit<F, Fut, T>(&self, operation: F) -> AdapterResult<T>
    where
        F: FnOnce(Arc<dyn Database>) -> Fut + Send + 'static,
        Fut: Future<Output = AdapterResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let admission = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            match &mut *lifecycle {
                Lifecycle::Ready(db) => Admission::Run(Arc::clone(db), operation),
                Lifecycle::Failed => Admission::Refused,
                Lifecycle::Opening(queue) => {
                    let (reply, rx) = oneshot::channel();
                    queue.push(Box::new(PendingRequest { operation, reply }));
                    Admission::Parked(rx)
                }
            }
        };

        match admission {
            Admission::Run(db, operation) => operation(db).await,
            Admission::Refused => Err(AdapterError::InitializationFailed),
            // A dropped sender means the request was discarded with the queue.
            Admission::Parked(rx) => rx.await.unwrap_or(Err(AdapterError::InitializationFailed)),
        }
    }

    /// Move to `Ready` and replay parked requests one after another, in
    /// arrival order.
    pub async fn open(&self, db: Arc<dyn Database>) {
        let parked = self.transition(Lifecycle::Ready(Arc::clone(&db)));
        for request in parked {
            request.run(Arc::clone(&db)).await;
        }
    }

    /// Move to `Failed` and fail every parked request.
    pub fn fail(&self) {
        for request in self.transition(Lifecycle::Failed) {
            request.fail(AdapterError::InitializationFailed);
        }
    }

    fn transition(&self, next: Lifecycle) -> Vec<Box<dyn Deferred>> {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        if !matches!(*lifecycle, Lifecycle::Opening(_)) {
            warn!("store lifecycle already settled; ignoring transition");
            return Vec::new();
        }
        match std::mem::replace(&mut *lifecycle, next) {
            Lifecycle::Opening(parked) => parked,
            _ => Vec::new(),
        }
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
