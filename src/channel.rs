//! Per-span channel state and the sender/receiver halves handed to callers.
//!
//! A channel owns the stream state for its span; the session's read loop
//! enqueues incoming messages through it. The sender half holds only a weak
//! back-reference to the session, upgraded for the duration of a write, so
//! a sender outliving its session degrades to *not connected* instead of
//! keeping the session alive.

use std::{
    fmt,
    marker::PhantomData,
    sync::{Mutex, Weak},
};

use rmpv::Value;
use tracing::warn;

use crate::{
    codec::{encode_frame, Message},
    error::{Error, ProtocolError, Result},
    future::RpcFuture,
    protocol::{Event, ProtocolDescriptor, Transition, MUTE},
    session::BasicSession,
    stream::{stream_pair, Generator, Stream},
};

/// Whether a processed message left the channel usable.
pub(crate) enum Disposition {
    Open,
    Closed,
}

/// Session-side state of one channel: the stream write end plus the current
/// upstream protocol.
pub(crate) struct Channel {
    span: u64,
    stream: Stream<Message>,
    proto: Mutex<&'static ProtocolDescriptor>,
}

impl Channel {
    pub(crate) fn new(
        span: u64,
        upstream: &'static ProtocolDescriptor,
    ) -> (Self, Generator<Message>) {
        let (stream, generator) = stream_pair();
        (
            Self {
                span,
                stream,
                proto: Mutex::new(upstream),
            },
            generator,
        )
    }

    /// Enqueues one incoming message, validated against the current
    /// protocol. Terminal messages close the stream; silent ones (choke)
    /// close it without being delivered.
    pub(crate) fn process(&self, message: Message) -> Disposition {
        let mut proto = self.proto.lock().unwrap();
        let spec = match proto.message(message.ty) {
            Some(spec) => *spec,
            None => {
                warn!(
                    span = self.span,
                    ty = message.ty,
                    protocol = proto.name,
                    "unexpected message type on channel"
                );
                drop(proto);
                self.stream.try_set_error(
                    ProtocolError::UnexpectedType {
                        span: self.span,
                        ty: message.ty,
                    }
                    .into(),
                );
                return Disposition::Closed;
            }
        };
        if let Transition::To(next) = spec.transition {
            *proto = next;
        }
        drop(proto);
        if spec.delivered {
            self.stream.try_push(message);
        }
        match spec.transition {
            Transition::Terminal => {
                self.stream.try_close();
                Disposition::Closed
            }
            _ => Disposition::Open,
        }
    }

    /// Fails the channel's stream, e.g. on transport error or disconnect.
    pub(crate) fn error(&self, error: Error) {
        self.stream.try_set_error(error);
    }
}

/// Untyped sender half of a channel.
#[derive(Clone)]
pub struct RawSender {
    span: u64,
    session: Weak<BasicSession>,
}

impl RawSender {
    pub(crate) fn new(span: u64, session: Weak<BasicSession>) -> Self {
        Self { span, session }
    }

    pub fn span(&self) -> u64 {
        self.span
    }

    /// Encodes and writes a further frame on this channel's span.
    pub fn send(&self, ty: u64, args: &[Value]) -> RpcFuture<()> {
        let session = match self.session.upgrade() {
            Some(session) => session,
            None => return RpcFuture::ready_err(Error::NotConnected),
        };
        let bytes = match encode_frame(self.span, ty, args) {
            Ok(bytes) => bytes,
            Err(e) => return RpcFuture::ready_err(e),
        };
        session.push(bytes)
    }
}

/// Untyped receiver half of a channel.
pub struct RawReceiver {
    span: u64,
    generator: Generator<Message>,
}

impl RawReceiver {
    pub(crate) fn new(span: u64, generator: Generator<Message>) -> Self {
        Self { span, generator }
    }

    pub fn span(&self) -> u64 {
        self.span
    }

    /// Returns the next message the peer sent on this span.
    pub async fn next(&mut self) -> Result<Message> {
        self.generator.next().await
    }

    pub fn ready(&self) -> bool {
        self.generator.ready()
    }

    pub fn closed(&self) -> bool {
        self.generator.closed()
    }

    /// Unwraps into the underlying generator, for `then`/`map`/`gather`.
    pub fn into_generator(self) -> Generator<Message> {
        self.generator
    }
}

/// Event-typed sender half: outgoing message types are checked against the
/// event's dispatch protocol before hitting the wire.
pub struct Sender<E: Event> {
    raw: RawSender,
    proto: Mutex<&'static ProtocolDescriptor>,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> Sender<E> {
    pub(crate) fn new(raw: RawSender) -> Self {
        Self {
            raw,
            proto: Mutex::new(E::dispatch()),
            _event: PhantomData,
        }
    }

    pub fn span(&self) -> u64 {
        self.raw.span()
    }

    /// Sends a message, rejecting type codes the dispatch protocol does not
    /// allow in its current state.
    pub fn send(&self, ty: u64, args: &[Value]) -> RpcFuture<()> {
        let mut proto = self.proto.lock().unwrap();
        let spec = match proto.message(ty) {
            Some(spec) => *spec,
            None => {
                return RpcFuture::ready_err(
                    ProtocolError::UnexpectedType {
                        span: self.raw.span(),
                        ty,
                    }
                    .into(),
                )
            }
        };
        match spec.transition {
            Transition::To(next) => *proto = next,
            Transition::Terminal => *proto = &MUTE,
            Transition::Stay => {}
        }
        drop(proto);
        self.raw.send(ty, args)
    }
}

impl<E: Event> fmt::Debug for Sender<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").field("span", &self.span()).finish()
    }
}

/// Event-typed receiver half.
pub struct Receiver<E: Event> {
    raw: RawReceiver,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> Receiver<E> {
    pub(crate) fn new(raw: RawReceiver) -> Self {
        Self {
            raw,
            _event: PhantomData,
        }
    }

    pub fn span(&self) -> u64 {
        self.raw.span()
    }

    /// The upstream protocol this receiver interprets messages against.
    pub fn protocol(&self) -> &'static ProtocolDescriptor {
        E::upstream()
    }

    /// Returns the next message, already validated by the session against
    /// the upstream protocol.
    pub async fn next(&mut self) -> Result<Message> {
        self.raw.next().await
    }

    pub fn ready(&self) -> bool {
        self.raw.ready()
    }

    pub fn closed(&self) -> bool {
        self.raw.closed()
    }

    /// Collects every remaining message up to channel close.
    pub fn gather(self) -> RpcFuture<Vec<Message>> {
        self.raw.into_generator().gather()
    }

    /// Unwraps into the underlying generator, for `then`/`map`/`gather`.
    pub fn into_generator(self) -> Generator<Message> {
        self.raw.into_generator()
    }
}

impl<E: Event> fmt::Debug for Receiver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").field("span", &self.span()).finish()
    }
}
