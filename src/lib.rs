//! Client core of a multiplexed, MessagePack-framed RPC protocol.
//!
//! A [`BasicSession`] owns one connection to a peer and multiplexes many
//! logical conversations ("channels") over it. Each channel is identified
//! by a 64-bit span and carries one RPC invocation: the sender half writes
//! further frames on the span, the receiver half observes the peer's
//! messages, validated against the event's upstream protocol.
//!
//! To talk to a peer:
//! 1. Create a [`Client`] (or wrap your own [`BasicSession`])
//! 2. Call `client.connect(endpoint)` and await the returned future
//! 3. Call `client.invoke::<MyEvent>(&args)` to open a channel
//! 4. Drive the typed [`Sender`]/[`Receiver`] pair
//!
//! The session's API is built on two in-crate async primitives that are
//! also exported: a one-shot [`Promise`]/[`RpcFuture`] pair and a
//! multi-value [`Stream`]/[`Generator`] pair, both supporting
//! continuations (`then`, `map`, `gather`), executor binding and
//! unwrapping of nested futures.
//!
//! Uses `tokio` for async I/O and `rmpv` for MessagePack framing.

mod channel;
mod client;
mod codec;
mod error;
mod future;
mod protocol;
mod session;
mod stream;

pub use channel::{RawReceiver, RawSender, Receiver, Sender};
pub use client::Client;
pub use codec::{encode_frame, Frame, FrameDecoder, Message};
pub use error::{Error, ProtocolError, Result, StateError};
pub use future::{spawn_executor, Executor, Promise, RpcFuture, Task};
pub use protocol::{streaming, Event, MessageSpec, ProtocolDescriptor, Transition, MUTE};
pub use session::{BasicSession, Endpoint, SessionConfig, CONTROL_SPAN};
pub use stream::{Generator, Stream};

pub use rmpv::Value;
