//! One-shot asynchronous value shared between a [`Promise`] and an
//! [`RpcFuture`].
//!
//! The pair wraps a mutex-guarded slot plus a [`Notify`] for waiters. A
//! promise produces at most one future; the future is consumed at most once,
//! by [`RpcFuture::get`] or [`RpcFuture::then`]. Continuations run on the
//! resolver's task unless an [`Executor`] is bound, in which case they are
//! posted to it.

use std::sync::{Arc, Mutex};

use tokio::{
    sync::Notify,
    time::{Duration, Instant},
};

use crate::error::{Error, Result, StateError};

/// A unit of deferred work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// External scheduler for continuations.
///
/// Absence of an executor (the `None` case wherever one is accepted) means
/// "run inline on the resolver's task".
pub type Executor = Arc<dyn Fn(Task) + Send + Sync + 'static>;

/// An executor that runs each task on the current tokio runtime.
pub fn spawn_executor() -> Executor {
    Arc::new(|task: Task| {
        tokio::spawn(async move { task() });
    })
}

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

struct Inner<T> {
    /// Present between resolution and consumption. `None` both before the
    /// promise fires and after `get` or a continuation took the outcome.
    outcome: Option<Result<T>>,
    /// Set once the promise has fired, regardless of who consumed the value.
    satisfied: bool,
    retrieved: bool,
    continuation: Option<Continuation<T>>,
}

pub(crate) struct Shared<T> {
    inner: Mutex<Inner<T>>,
    ready: Notify,
}

impl<T: Send + 'static> Shared<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                outcome: None,
                satisfied: false,
                retrieved: false,
                continuation: None,
            }),
            ready: Notify::new(),
        })
    }

    /// Resolves the state, waking waiters or firing the continuation with
    /// the lock released.
    fn resolve(&self, result: Result<T>) -> std::result::Result<(), StateError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.satisfied {
            return Err(StateError::PromiseAlreadySatisfied);
        }
        guard.satisfied = true;
        if let Some(continuation) = guard.continuation.take() {
            drop(guard);
            continuation(result);
        } else {
            guard.outcome = Some(result);
            drop(guard);
            self.ready.notify_waiters();
        }
        Ok(())
    }

    /// Attaches the single continuation, firing it immediately when the
    /// state is already resolved.
    fn attach(&self, continuation: Continuation<T>) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(outcome) = guard.outcome.take() {
            drop(guard);
            continuation(outcome);
        } else {
            guard.continuation = Some(continuation);
        }
    }
}

/// Creates a linked promise/future pair.
pub(crate) fn promise_pair<T: Send + 'static>() -> (Promise<T>, RpcFuture<T>) {
    let shared = Shared::new();
    shared.inner.lock().unwrap().retrieved = true;
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        RpcFuture {
            shared,
            executor: None,
        },
    )
}

/// The producing half of a one-shot asynchronous value.
///
/// Dropping a promise that never produced a value resolves the paired
/// future with [`StateError::BrokenPromise`].
pub struct Promise<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    /// Returns the paired future. At most one future exists per promise;
    /// a second retrieval fails with [`StateError::FutureAlreadyRetrieved`].
    pub fn future(&self) -> Result<RpcFuture<T>> {
        let mut guard = self.shared.inner.lock().unwrap();
        if guard.retrieved {
            return Err(StateError::FutureAlreadyRetrieved.into());
        }
        guard.retrieved = true;
        drop(guard);
        Ok(RpcFuture {
            shared: Arc::clone(&self.shared),
            executor: None,
        })
    }

    /// Resolves with a value. Fails with
    /// [`StateError::PromiseAlreadySatisfied`] on a second resolution.
    pub fn set_value(&self, value: T) -> Result<()> {
        self.shared.resolve(Ok(value)).map_err(Error::from)
    }

    /// Resolves with an error.
    pub fn set_error(&self, error: Error) -> Result<()> {
        self.shared.resolve(Err(error)).map_err(Error::from)
    }

    /// Like [`set_value`](Self::set_value), silently discarding a second
    /// resolution.
    pub fn try_set_value(&self, value: T) {
        let _ = self.shared.resolve(Ok(value));
    }

    /// Like [`set_error`](Self::set_error), silently discarding a second
    /// resolution.
    pub fn try_set_error(&self, error: Error) {
        let _ = self.shared.resolve(Err(error));
    }

    /// Resolves with a full outcome, discarding a second resolution.
    pub fn try_complete(&self, result: Result<T>) {
        let _ = self.shared.resolve(result);
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        let _ = self
            .shared
            .resolve(Err(StateError::BrokenPromise.into()));
    }
}

/// The consuming half of a one-shot asynchronous value.
pub struct RpcFuture<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    executor: Option<Executor>,
}

impl<T: Send + 'static> RpcFuture<T> {
    /// A future that is already resolved with `value`.
    pub fn ready_ok(value: T) -> Self {
        Self::resolved(Ok(value))
    }

    /// A future that is already resolved with `error`.
    pub fn ready_err(error: Error) -> Self {
        Self::resolved(Err(error))
    }

    /// A future that is already resolved with `result`.
    pub fn resolved(result: Result<T>) -> Self {
        let shared = Shared::new();
        {
            let mut guard = shared.inner.lock().unwrap();
            guard.retrieved = true;
            guard.satisfied = true;
            guard.outcome = Some(result);
        }
        Self {
            shared,
            executor: None,
        }
    }

    /// Binds an executor; continuations attached afterwards are posted to
    /// it instead of running on the resolver's task.
    pub fn with_executor(mut self, executor: Option<Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Whether the outcome is available without waiting.
    pub fn ready(&self) -> bool {
        self.shared.inner.lock().unwrap().outcome.is_some()
    }

    /// Consumes the future, suspending until the outcome is available.
    pub async fn get(self) -> Result<T> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.shared.inner.lock().unwrap();
                if let Some(outcome) = guard.outcome.take() {
                    return outcome;
                }
            }
            notified.await;
        }
    }

    /// Suspends until the outcome is available, without consuming it.
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.ready() {
                return;
            }
            notified.await;
        }
    }

    /// Waits at most `timeout`. Returns whether the future became ready.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Waits until `deadline`. Returns whether the future became ready.
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.wait()).await.is_ok()
    }

    /// Attaches the continuation `f`, consuming this future. The returned
    /// future resolves with `f`'s result. `f` runs exactly once: on the
    /// resolver's task at resolution time, immediately if the outcome is
    /// already available, or on the bound executor when one is present.
    pub fn then<R, F>(self, f: F) -> RpcFuture<R>
    where
        R: Send + 'static,
        F: FnOnce(Result<T>) -> Result<R> + Send + 'static,
    {
        let (promise, future) = promise_pair();
        let continuation: Continuation<T> = match self.executor.clone() {
            Some(executor) => Box::new(move |outcome| {
                executor(Box::new(move || promise.try_complete(f(outcome))));
            }),
            None => Box::new(move |outcome| promise.try_complete(f(outcome))),
        };
        self.shared.attach(continuation);
        future
    }
}

impl<T: Send + 'static> RpcFuture<RpcFuture<T>> {
    /// Flattens a future of a future: readiness of the result tracks the
    /// inner future.
    pub fn unwrap(self) -> RpcFuture<T> {
        let (promise, future) = promise_pair();
        self.shared.attach(Box::new(move |outer| match outer {
            Ok(inner) => {
                inner
                    .shared
                    .attach(Box::new(move |outcome| promise.try_complete(outcome)));
            }
            Err(error) => promise.try_complete(Err(error)),
        }));
        future
    }
}
