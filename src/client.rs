//! The typed session facade.
//!
//! [`Client`] wraps a shared [`BasicSession`]: it serialises concurrent
//! `connect` calls onto one outcome, assigns spans, encodes invocation
//! frames from the event's registry entry, and projects the untyped
//! channel halves into event-typed ones.

use std::sync::{Arc, Mutex};

use rmpv::Value;
use tracing::trace;

use crate::{
    channel::{Receiver, Sender},
    codec::encode_frame,
    error::Error,
    future::{promise_pair, Promise, RpcFuture},
    protocol::Event,
    session::{BasicSession, Endpoint, SessionConfig},
};

struct InFlight {
    endpoint: Endpoint,
    waiters: Vec<Promise<()>>,
}

struct ClientInner {
    session: Arc<BasicSession>,
    /// Present while a connect is in flight; later callers for the same
    /// endpoint latch onto it.
    connecting: Mutex<Option<InFlight>>,
    connected_to: Mutex<Option<Endpoint>>,
}

/// A cheaply cloneable handle to one session, with event-typed invocation.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::from_session(BasicSession::new(config))
    }

    /// Wraps an existing session.
    pub fn from_session(session: Arc<BasicSession>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session,
                connecting: Mutex::new(None),
                connected_to: Mutex::new(None),
            }),
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<BasicSession> {
        &self.inner.session
    }

    pub fn connected(&self) -> bool {
        self.inner.session.connected()
    }

    /// Connects the session.
    ///
    /// While a connect to the same endpoint is in flight, further calls
    /// latch onto the same outcome; a different endpoint fails with
    /// [`Error::AlreadyStarted`]. When already connected, the same endpoint
    /// resolves `Ok(())` immediately and a different one fails with
    /// [`Error::AlreadyConnected`].
    pub fn connect(&self, endpoint: Endpoint) -> RpcFuture<()> {
        let mut guard = self.inner.connecting.lock().unwrap();
        if let Some(inflight) = guard.as_mut() {
            if inflight.endpoint == endpoint {
                let (promise, future) = promise_pair();
                inflight.waiters.push(promise);
                return future;
            }
            return RpcFuture::ready_err(Error::AlreadyStarted);
        }
        if self.inner.session.connected() {
            let same = self.inner.connected_to.lock().unwrap().as_ref() == Some(&endpoint);
            return if same {
                RpcFuture::ready_ok(())
            } else {
                RpcFuture::ready_err(Error::AlreadyConnected)
            };
        }
        let future = self.inner.session.connect(endpoint.clone());
        *guard = Some(InFlight {
            endpoint: endpoint.clone(),
            waiters: Vec::new(),
        });
        drop(guard);
        let inner = Arc::clone(&self.inner);
        future.then(move |outcome| {
            let inflight = inner.connecting.lock().unwrap().take();
            if outcome.is_ok() {
                *inner.connected_to.lock().unwrap() = Some(endpoint);
            }
            if let Some(inflight) = inflight {
                for waiter in inflight.waiters {
                    waiter.try_complete(outcome.clone());
                }
            }
            outcome
        })
    }

    /// Invokes the event `E`: allocates a span, encodes the initial frame
    /// and opens the channel. Resolves with the event-typed sender and
    /// receiver halves.
    pub fn invoke<E: Event>(&self, args: &[Value]) -> RpcFuture<(Sender<E>, Receiver<E>)> {
        let session = &self.inner.session;
        let span = session.next();
        let bytes = match encode_frame(span, E::ID, args) {
            Ok(bytes) => bytes,
            Err(e) => return RpcFuture::ready_err(e),
        };
        trace!(span, event = E::NAME, "invoking");
        session
            .invoke(span, bytes, E::upstream())
            .then(|outcome| outcome.map(|(tx, rx)| (Sender::new(tx), Receiver::new(rx))))
    }

    /// Like [`invoke`](Self::invoke), serializing any `serde` value into
    /// the argument array.
    #[cfg(feature = "serde")]
    pub fn invoke_args<E, A>(&self, args: &A) -> RpcFuture<(Sender<E>, Receiver<E>)>
    where
        E: Event,
        A: serde::Serialize,
    {
        let value = match rmpv::ext::to_value(args) {
            Ok(value) => value,
            Err(e) => return RpcFuture::ready_err(e.into()),
        };
        let args = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        self.invoke::<E>(&args)
    }

    /// Disconnects the underlying session, failing everything outstanding
    /// with [`Error::OperationAborted`].
    pub fn disconnect(&self) {
        self.inner.session.disconnect();
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
