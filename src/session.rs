//! The basic session: owns one connection to a peer and multiplexes many
//! logical channels over it.
//!
//! All transport I/O runs on a single driver task spawned at connect time;
//! it multiplexes the serialised write queue and incoming frame reads with
//! `tokio::select!`. User-facing operations never block: they enqueue work
//! and hand back a future. The session is always held in an [`Arc`]
//! because senders and receivers it hands out can outlive the caller's
//! scope and are driven from arbitrary tasks.

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixStream},
    sync::{mpsc, watch},
};
use tracing::{trace, warn};

use crate::{
    channel::{Channel, Disposition, RawReceiver, RawSender},
    codec::{Frame, FrameDecoder},
    error::{Error, Result},
    future::{promise_pair, Promise, RpcFuture},
    protocol::ProtocolDescriptor,
};

/// Span reserved for session-level control messages. Never allocated to a
/// channel.
pub const CONTROL_SPAN: u64 = 0;

/// A transport address the session can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial capacity of the frame read buffer.
    pub read_buffer: usize,
    /// First span handed out by [`BasicSession::next`]. Clamped to be
    /// nonzero.
    pub first_span: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer: 8192,
            first_span: 1,
        }
    }
}

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

struct WriteOp {
    bytes: Vec<u8>,
    done: Promise<()>,
}

/// Handles to the driver task of the current connection.
struct Link {
    writes: mpsc::UnboundedSender<WriteOp>,
    shutdown: watch::Sender<bool>,
}

enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpStream::connect(addr).await?)),
            Endpoint::Unix(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
        }
    }
}

/// A session over one connection.
///
/// Thread-safe: `connect`, `invoke`, `push`, `revoke`, `disconnect` and
/// `connected` may be called from any task concurrently. After any entry
/// into the disconnected state the session is terminal; callers wanting to
/// reconnect create a fresh session.
pub struct BasicSession {
    this: Weak<BasicSession>,
    config: SessionConfig,
    state: AtomicU8,
    terminated: AtomicBool,
    counter: AtomicU64,
    /// Also serves as the state-transition mutex.
    link: Mutex<Option<Link>>,
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
}

impl BasicSession {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let first_span = config.first_span.max(CONTROL_SPAN + 1);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            state: AtomicU8::new(DISCONNECTED),
            terminated: AtomicBool::new(false),
            counter: AtomicU64::new(first_span),
            link: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Whether the session is currently connected. Lock-free; the session
    /// does passive monitoring only, so a lost peer is noticed on the next
    /// read or write.
    pub fn connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONNECTED
    }

    /// Connects to a single endpoint. Resolves with `Ok(())` once the
    /// connection is established, or with the transport failure.
    pub fn connect(&self, endpoint: Endpoint) -> RpcFuture<()> {
        self.connect_any(vec![endpoint])
    }

    /// Connects to the first reachable endpoint of an ordered list.
    /// Resolves on the first success or with the last failure.
    pub fn connect_any(&self, endpoints: Vec<Endpoint>) -> RpcFuture<()> {
        if endpoints.is_empty() {
            return RpcFuture::ready_err(Error::Connect {
                source: Arc::new(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no endpoints given",
                )),
            });
        }
        let session = match self.this.upgrade() {
            Some(session) => session,
            None => return RpcFuture::ready_err(Error::NotConnected),
        };
        {
            let _guard = self.link.lock().unwrap();
            match self.state.load(Ordering::Acquire) {
                CONNECTED => return RpcFuture::ready_err(Error::AlreadyConnected),
                CONNECTING => return RpcFuture::ready_err(Error::AlreadyStarted),
                _ => {
                    if self.terminated.load(Ordering::Acquire) {
                        return RpcFuture::ready_err(Error::NotConnected);
                    }
                    self.state.store(CONNECTING, Ordering::Release);
                }
            }
        }
        let (promise, future) = promise_pair();
        tokio::spawn(async move {
            session.run_connect(endpoints, promise).await;
        });
        future
    }

    async fn run_connect(self: Arc<Self>, endpoints: Vec<Endpoint>, promise: Promise<()>) {
        let mut last = io::Error::new(io::ErrorKind::InvalidInput, "no endpoints given");
        for endpoint in endpoints {
            trace!(%endpoint, "connecting");
            match Transport::connect(&endpoint).await {
                Ok(transport) => {
                    if self.start(transport) {
                        trace!(%endpoint, "connection established");
                        promise.try_set_value(());
                    } else {
                        // Disconnected while the handshake was in flight.
                        promise.try_set_error(Error::OperationAborted);
                    }
                    return;
                }
                Err(e) => {
                    trace!(%endpoint, error = %e, "connect attempt failed");
                    last = e;
                }
            }
        }
        {
            let _guard = self.link.lock().unwrap();
            self.terminated.store(true, Ordering::Release);
            self.state.store(DISCONNECTED, Ordering::Release);
        }
        promise.try_set_error(Error::Connect {
            source: Arc::new(last),
        });
    }

    /// Installs the connection and spawns its driver. Returns false when a
    /// concurrent `disconnect` already made the session terminal.
    fn start(&self, transport: Transport) -> bool {
        let session = match self.this.upgrade() {
            Some(session) => session,
            None => return false,
        };
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut guard = self.link.lock().unwrap();
            if self.terminated.load(Ordering::Acquire) {
                return false;
            }
            *guard = Some(Link {
                writes: write_tx,
                shutdown: shutdown_tx,
            });
            self.state.store(CONNECTED, Ordering::Release);
        }
        match transport {
            Transport::Tcp(stream) => {
                tokio::spawn(drive(session, stream, write_rx, shutdown_rx));
            }
            Transport::Unix(stream) => {
                tokio::spawn(drive(session, stream, write_rx, shutdown_rx));
            }
        }
        true
    }

    /// Allocates the next span. Monotonically increasing, unique within
    /// this session's lifetime, never [`CONTROL_SPAN`].
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a channel on `span` by writing the pre-encoded initial frame.
    /// Resolves with the channel's sender and receiver halves once the
    /// frame has been accepted by the transport.
    ///
    /// The caller encodes with the span it reserved through
    /// [`next`](Self::next); the typed facade keeps span assignment and
    /// framing in one place. When `upstream` is mute no channel-map entry
    /// is made and the receiver is born closed.
    pub fn invoke(
        &self,
        span: u64,
        bytes: Vec<u8>,
        upstream: &'static ProtocolDescriptor,
    ) -> RpcFuture<(RawSender, RawReceiver)> {
        if !self.connected() {
            return RpcFuture::ready_err(Error::NotConnected);
        }
        let (channel, generator) = Channel::new(span, upstream);
        let tx = RawSender::new(span, self.this.clone());
        let rx = RawReceiver::new(span, generator);
        if upstream.is_mute() {
            // Dropping the write end closes the receiver's stream.
            drop(channel);
        } else {
            self.channels.lock().unwrap().insert(span, Arc::new(channel));
        }
        let session = self.this.clone();
        self.push(bytes).then(move |outcome| match outcome {
            Ok(()) => Ok((tx, rx)),
            Err(e) => {
                if let Some(session) = session.upgrade() {
                    session.revoke(span);
                }
                Err(e)
            }
        })
    }

    /// Enqueues one pre-encoded frame. The future resolves after the bytes
    /// are handed to the transport; it does not imply the peer received
    /// them.
    pub fn push(&self, bytes: Vec<u8>) -> RpcFuture<()> {
        let guard = self.link.lock().unwrap();
        let link = match guard.as_ref() {
            Some(link) if self.state.load(Ordering::Acquire) == CONNECTED => link,
            _ => return RpcFuture::ready_err(Error::NotConnected),
        };
        let (promise, future) = promise_pair();
        if let Err(mpsc::error::SendError(op)) = link.writes.send(WriteOp {
            bytes,
            done: promise,
        }) {
            op.done.try_set_error(Error::NotConnected);
        }
        future
    }

    /// Drops the channel bound to `span`, if any. Idempotent,
    /// fire-and-forget.
    pub fn revoke(&self, span: u64) {
        if self.channels.lock().unwrap().remove(&span).is_some() {
            trace!(span, "channel revoked");
        }
    }

    /// Number of live channels. Diagnostic.
    pub fn active_channels(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Shuts the connection down and fails every outstanding operation
    /// with [`Error::OperationAborted`]. Idempotent; the session is
    /// terminal afterwards.
    pub fn disconnect(&self) {
        let link = {
            let mut guard = self.link.lock().unwrap();
            self.terminated.store(true, Ordering::Release);
            self.state.store(DISCONNECTED, Ordering::Release);
            guard.take()
        };
        if let Some(link) = link {
            let _ = link.shutdown.send(true);
            // Dropping `link.writes` closes the queue; the driver drains
            // and fails whatever was still enqueued.
        }
        self.fail_channels(Error::OperationAborted);
    }

    /// Driver-side teardown on read or write failure.
    fn terminate(&self, error: Error) {
        {
            let mut guard = self.link.lock().unwrap();
            self.terminated.store(true, Ordering::Release);
            self.state.store(DISCONNECTED, Ordering::Release);
            guard.take();
        }
        self.fail_channels(error);
    }

    fn fail_channels(&self, error: Error) {
        let drained: Vec<Arc<Channel>> = {
            let mut map = self.channels.lock().unwrap();
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in drained {
            channel.error(error.clone());
        }
    }

    /// Routes one decoded frame to its channel. Unknown spans are dropped
    /// with a warning; they are not fatal.
    fn dispatch(&self, frame: Frame) {
        let (span, message) = frame.into_message();
        trace!(span, ty = message.ty, "frame received");
        let channel = self.channels.lock().unwrap().get(&span).cloned();
        match channel {
            Some(channel) => {
                if let Disposition::Closed = channel.process(message) {
                    self.channels.lock().unwrap().remove(&span);
                }
            }
            None => warn!(span, ty = message.ty, "dropping frame for unknown span"),
        }
    }
}

/// The per-connection driver: the only task that touches the socket.
async fn drive<S>(
    session: Arc<BasicSession>,
    stream: S,
    mut writes: mpsc::UnboundedReceiver<WriteOp>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::with_capacity(session.config.read_buffer);
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break Error::OperationAborted;
                }
            }
            op = writes.recv() => match op {
                Some(WriteOp { bytes, done }) => {
                    match write_frame(&mut writer, &bytes).await {
                        Ok(()) => done.try_set_value(()),
                        Err(e) => {
                            let error = Error::from(e);
                            done.try_set_error(error.clone());
                            break error;
                        }
                    }
                }
                None => break Error::OperationAborted,
            },
            frame = read_frame(&mut reader, &mut decoder) => match frame {
                Ok(Some(frame)) => session.dispatch(frame),
                Ok(None) => break Error::Disconnected { source: None },
                Err(e) => break e,
            },
        }
    };
    trace!(error = %reason, "session driver exiting");
    session.terminate(reason.clone());
    writes.close();
    while let Ok(WriteOp { done, .. }) = writes.try_recv() {
        done.try_set_error(reason.clone());
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Reads until the buffer holds one complete frame. Cancel-safe: buffered
/// bytes live in the decoder, so a cancelled read loses nothing.
async fn read_frame<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        let read = reader
            .read_buf(decoder.buffer_mut())
            .await
            .map_err(Error::from)?;
        if read == 0 {
            if decoder.is_empty() {
                return Ok(None);
            }
            // EOF in the middle of a frame.
            return Err(Error::Disconnected {
                source: Some(Arc::new(io::ErrorKind::UnexpectedEof.into())),
            });
        }
    }
}
