//! Multi-value asynchronous sequence shared between a [`Stream`] (write end)
//! and a [`Generator`] (read end).
//!
//! Built on the same shared-state pattern as [`crate::future`]: a
//! mutex-guarded queue plus a [`Notify`] for waiters. Values are consumed
//! FIFO. Closing is terminal; a terminal error closes implicitly and is
//! observed once, after any values queued before it.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::{
    sync::Notify,
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result, StateError},
    future::{promise_pair, Executor, RpcFuture, Task},
};

/// What a per-item callback is fired with.
enum StreamEvent<T> {
    Item(T),
    Error(Error),
    Closed,
}

type EachCallback<T> = Box<dyn FnMut(StreamEvent<T>) + Send + 'static>;

struct StreamInner<T> {
    queue: VecDeque<T>,
    error: Option<Error>,
    closed: bool,
    generator_taken: bool,
    /// One-shot callback armed by `then`, fired on first readiness.
    once: Option<Task>,
    /// Per-item callback armed by `map`.
    each: Option<EachCallback<T>>,
    /// Close callback armed by `gather`.
    on_close: Option<Task>,
    /// Set while a thread is draining `each`, so concurrent producers do
    /// not interleave callback invocations out of push order.
    dispatching: bool,
}

pub(crate) struct SharedStream<T> {
    inner: Mutex<StreamInner<T>>,
    ready: Notify,
}

impl<T: Send + 'static> SharedStream<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StreamInner {
                queue: VecDeque::new(),
                error: None,
                closed: false,
                generator_taken: false,
                once: None,
                each: None,
                on_close: None,
                dispatching: false,
            }),
            ready: Notify::new(),
        })
    }

    /// Wakes waiters and dispatches armed callbacks. Callbacks run with the
    /// lock released; the `dispatching` flag keeps per-item callbacks in
    /// push order when producers race.
    fn wake<'a>(&'a self, mut guard: MutexGuard<'a, StreamInner<T>>) {
        if guard.once.is_some()
            && (!guard.queue.is_empty() || guard.error.is_some() || guard.closed)
        {
            let callback = guard.once.take().expect("checked above");
            drop(guard);
            self.ready.notify_waiters();
            callback();
            return;
        }

        if guard.each.is_some() && !guard.dispatching {
            guard.dispatching = true;
            loop {
                let event = if let Some(value) = guard.queue.pop_front() {
                    StreamEvent::Item(value)
                } else if let Some(error) = guard.error.take() {
                    StreamEvent::Error(error)
                } else if guard.closed {
                    StreamEvent::Closed
                } else {
                    break;
                };
                let terminal = !matches!(event, StreamEvent::Item(_));
                let mut callback = match guard.each.take() {
                    Some(callback) => callback,
                    None => break,
                };
                drop(guard);
                callback(event);
                guard = self.inner.lock().unwrap();
                if terminal {
                    break;
                }
                guard.each = Some(callback);
            }
            guard.dispatching = false;
        }

        drop(guard);
        self.ready.notify_waiters();
    }

    fn close_locked(&self, mut guard: MutexGuard<'_, StreamInner<T>>) {
        guard.closed = true;
        let on_close = guard.on_close.take();
        self.wake(guard);
        if let Some(callback) = on_close {
            callback();
        }
    }

    fn arm_once(&self, callback: Task) {
        let mut guard = self.inner.lock().unwrap();
        guard.once = Some(callback);
        self.wake(guard);
    }

    fn arm_each(&self, callback: EachCallback<T>) {
        let mut guard = self.inner.lock().unwrap();
        guard.each = Some(callback);
        self.wake(guard);
    }

    fn arm_on_close(&self, callback: Task) {
        let guard = self.inner.lock().unwrap();
        if guard.closed {
            drop(guard);
            callback();
        } else {
            let mut guard = guard;
            guard.on_close = Some(callback);
        }
    }
}

/// Creates a linked stream/generator pair.
pub(crate) fn stream_pair<T: Send + 'static>() -> (Stream<T>, Generator<T>) {
    let shared = SharedStream::new();
    shared.inner.lock().unwrap().generator_taken = true;
    (
        Stream {
            shared: Arc::clone(&shared),
        },
        Generator {
            shared,
            executor: None,
        },
    )
}

/// The write end of an asynchronous sequence.
///
/// Dropping the stream closes it, so a producer that goes away never leaves
/// the consumer waiting.
pub struct Stream<T: Send + 'static> {
    shared: Arc<SharedStream<T>>,
}

impl<T: Send + 'static> Stream<T> {
    pub fn new() -> Self {
        Self {
            shared: SharedStream::new(),
        }
    }

    /// Returns the paired generator. At most one generator exists per
    /// stream; a second retrieval fails with
    /// [`StateError::FutureAlreadyRetrieved`].
    pub fn generator(&self) -> Result<Generator<T>> {
        let mut guard = self.shared.inner.lock().unwrap();
        if guard.generator_taken {
            return Err(StateError::FutureAlreadyRetrieved.into());
        }
        guard.generator_taken = true;
        drop(guard);
        Ok(Generator {
            shared: Arc::clone(&self.shared),
            executor: None,
        })
    }

    /// Appends a value. Fails with [`StateError::PromiseAlreadySatisfied`]
    /// on a closed stream.
    pub fn push(&self, value: T) -> Result<()> {
        let mut guard = self.shared.inner.lock().unwrap();
        if guard.closed {
            return Err(StateError::PromiseAlreadySatisfied.into());
        }
        guard.queue.push_back(value);
        self.shared.wake(guard);
        Ok(())
    }

    /// Like [`push`](Self::push), silently dropping the value on a closed
    /// stream.
    pub fn try_push(&self, value: T) {
        let _ = self.push(value);
    }

    /// Records a terminal failure and closes the stream. Values queued
    /// before the error are still delivered first.
    pub fn set_error(&self, error: Error) -> Result<()> {
        let mut guard = self.shared.inner.lock().unwrap();
        if guard.closed {
            return Err(StateError::PromiseAlreadySatisfied.into());
        }
        guard.error = Some(error);
        self.shared.close_locked(guard);
        Ok(())
    }

    /// Like [`set_error`](Self::set_error), silently dropping the error on
    /// a closed stream.
    pub fn try_set_error(&self, error: Error) {
        let _ = self.set_error(error);
    }

    /// Marks end-of-stream. Fails with
    /// [`StateError::PromiseAlreadySatisfied`] when already closed.
    pub fn close(&self) -> Result<()> {
        let guard = self.shared.inner.lock().unwrap();
        if guard.closed {
            return Err(StateError::PromiseAlreadySatisfied.into());
        }
        self.shared.close_locked(guard);
        Ok(())
    }

    /// Idempotent close.
    pub fn try_close(&self) {
        let _ = self.close();
    }

    /// Whether the stream has been closed.
    pub fn closed(&self) -> bool {
        self.shared.inner.lock().unwrap().closed
    }
}

impl<T: Send + 'static> Default for Stream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for Stream<T> {
    fn drop(&mut self) {
        self.try_close();
    }
}

/// The read end of an asynchronous sequence.
pub struct Generator<T: Send + 'static> {
    shared: Arc<SharedStream<T>>,
    executor: Option<Executor>,
}

impl<T: Send + 'static> Generator<T> {
    /// Binds a default executor for `then` and `map` callbacks.
    pub fn with_executor(mut self, executor: Option<Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Returns the next value, the recorded terminal error (once), or
    /// [`StateError::StreamClosed`] when the stream is closed and drained.
    pub async fn next(&mut self) -> Result<T> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.shared.inner.lock().unwrap();
                if let Some(value) = guard.queue.pop_front() {
                    return Ok(value);
                }
                if let Some(error) = guard.error.take() {
                    return Err(error);
                }
                if guard.closed {
                    return Err(StateError::StreamClosed.into());
                }
            }
            notified.await;
        }
    }

    /// Whether [`next`](Self::next) would return without waiting.
    pub fn ready(&self) -> bool {
        let guard = self.shared.inner.lock().unwrap();
        guard.closed || !guard.queue.is_empty()
    }

    /// Whether the stream has been closed.
    pub fn closed(&self) -> bool {
        self.shared.inner.lock().unwrap().closed
    }

    /// Suspends until the generator is ready.
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

    /// Waits at most `timeout`. Returns whether the generator became ready.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Waits until `deadline`. Returns whether the generator became ready.
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.wait()).await.is_ok()
    }

    /// Arms a one-shot callback fired on the first of: item available,
    /// error set, stream closed. Consumes this generator; the callback
    /// receives a fresh generator over the same state.
    pub fn then<R, F>(self, f: F) -> RpcFuture<R>
    where
        R: Send + 'static,
        F: FnOnce(Generator<T>) -> Result<R> + Send + 'static,
    {
        let (promise, future) = promise_pair();
        let weak = Arc::downgrade(&self.shared);
        let executor = self.executor.clone();
        let fire: Task = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let generator = Generator {
                    shared,
                    executor: None,
                };
                promise.try_complete(f(generator));
            }
        });
        let task: Task = match executor {
            Some(executor) => Box::new(move || executor(fire)),
            None => fire,
        };
        self.shared.arm_once(task);
        future
    }

    /// Arms a per-item callback. `f` is fired once per pushed value (in
    /// push order), once more for the terminal error if one is set, and
    /// never after close. The returned generator yields the futures of
    /// each `f` application.
    pub fn map<R, F>(self, f: F) -> Generator<RpcFuture<R>>
    where
        R: Send + 'static,
        F: FnMut(Result<T>) -> Result<R> + Send + 'static,
    {
        let (out_stream, out_generator) = stream_pair();
        let executor = self.executor.clone();
        let f = Arc::new(Mutex::new(f));
        let each: EachCallback<T> = Box::new(move |event| {
            let input = match event {
                StreamEvent::Item(value) => Ok(value),
                StreamEvent::Error(error) => Err(error),
                // The callback is dropped right after this event, closing
                // `out_stream` with it.
                StreamEvent::Closed => return,
            };
            match &executor {
                None => {
                    let outcome = (f.lock().unwrap())(input);
                    out_stream.try_push(RpcFuture::resolved(outcome));
                }
                Some(executor) => {
                    let (promise, future) = promise_pair();
                    out_stream.try_push(future);
                    let f = Arc::clone(&f);
                    executor(Box::new(move || {
                        let outcome = (f.lock().unwrap())(input);
                        promise.try_complete(outcome);
                    }));
                }
            }
        });
        self.shared.arm_each(each);
        out_generator
    }

    /// Arms a close callback and consumes this generator. The returned
    /// future resolves at close time with every value pushed up to the
    /// close, in order, or with the recorded terminal error.
    pub fn gather(self) -> RpcFuture<Vec<T>> {
        let (promise, future) = promise_pair();
        let weak = Arc::downgrade(&self.shared);
        self.shared.arm_on_close(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let mut guard = shared.inner.lock().unwrap();
                let outcome = match guard.error.take() {
                    Some(error) => Err(error),
                    None => Ok(guard.queue.drain(..).collect()),
                };
                drop(guard);
                promise.try_complete(outcome);
            }
        }));
        future
    }
}
