//! Stream multiplexing over a single byte duplex
//!
//! A [`MuxSession`] runs two background tasks over the underlying
//! connection: a writer draining a frame queue, and a reader dispatching
//! incoming frames to per-stream channels. Streams are opened with an
//! `Open` frame whose payload is an opaque header (the serialized stream
//! kind), so no round trip is needed before writing.
//!
//! Frame format (see [`agentgate_proto::Frame`]):
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: frame type (0=open, 1=data, 2=close, 3=reset, 4=window update)
//! - 4 bytes: payload length
//! - payload
//!
//! Client-opened streams use odd IDs and server-opened streams even IDs.
//!
//! Each direction of a stream has a fixed receive window. A writer may only
//! have [`STREAM_WINDOW`] unacknowledged bytes in flight; the reading side
//! grants more with `WindowUpdate` frames as the application consumes data.
//! The reader task therefore never waits on a slow stream, and one stalled
//! consumer cannot hold up the other streams of the session.

use agentgate_proto::{Frame, FrameCodec, FrameType, StreamId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::{TransportError, TransportResult};

/// Frames queued for the writer task
const FRAME_QUEUE: usize = 1024;
/// Bytes a peer may send on one stream before waiting for a window update
pub const STREAM_WINDOW: usize = 256 * 1024;
/// Consumed bytes acknowledged at once
const WINDOW_UPDATE_THRESHOLD: usize = STREAM_WINDOW / 2;
/// Incoming streams waiting to be accepted
const ACCEPT_BACKLOG: usize = 64;
/// Largest data frame produced by a single write
const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Which side of the session this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(&self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether the peer is allowed to open a stream with this ID
    fn accepts_remote(&self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 0 && id != 0,
            Role::Server => id % 2 == 1,
        }
    }
}

/// Send credit granted by the peer for one stream
#[derive(Debug)]
struct SendWindow {
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    available: usize,
    closed: bool,
    waker: Option<Waker>,
}

impl SendWindow {
    fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                available: STREAM_WINDOW,
                closed: false,
                waker: None,
            }),
        }
    }

    /// Credit currently available, or `None` once the stream is gone
    fn poll_available(&self, cx: &mut Context<'_>) -> Poll<Option<usize>> {
        let Ok(mut state) = self.state.lock() else {
            return Poll::Ready(None);
        };
        if state.closed {
            return Poll::Ready(None);
        }
        if state.available == 0 {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(Some(state.available))
    }

    fn consume(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.available = state.available.saturating_sub(n);
        }
    }

    fn grant(&self, n: usize) {
        let waker = match self.state.lock() {
            Ok(mut state) => {
                state.available = state.available.saturating_add(n);
                state.waker.take()
            }
            Err(_) => None,
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake a writer waiting for credit so it observes the reset
    fn close(&self) {
        let waker = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                state.waker.take()
            }
            Err(_) => None,
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// State shared by a stream and its registration in the session
#[derive(Debug, Clone)]
struct StreamState {
    reset: Arc<AtomicBool>,
    window: Arc<SendWindow>,
    /// Bytes received but not yet acknowledged to the peer
    buffered: Arc<AtomicUsize>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            reset: Arc::new(AtomicBool::new(false)),
            window: Arc::new(SendWindow::new()),
            buffered: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn mark_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.window.close();
    }
}

/// Receiving half registered for a stream
struct StreamSlot {
    tx: mpsc::UnboundedSender<Bytes>,
    state: StreamState,
}

type StreamMap = Arc<Mutex<HashMap<StreamId, StreamSlot>>>;

struct SessionInner {
    session_id: String,
    role: Role,
    next_stream_id: AtomicU32,
    streams: StreamMap,
    frame_tx: mpsc::Sender<Frame>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    cancel: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Multiplexed session over one connection
///
/// Cloning is cheap; dropping the last handle closes the session.
#[derive(Clone)]
pub struct MuxSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSession")
            .field("session_id", &self.inner.session_id)
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MuxSession {
    /// Start the client side of a session
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Client, CancellationToken::new())
    }

    /// Start the server side of a session
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Server, CancellationToken::new())
    }

    /// Start a session that also closes when `cancel` fires
    pub fn new<T>(io: T, role: Role, cancel: CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = format!("mux-{}", uuid::Uuid::new_v4());
        let (read_half, write_half) = tokio::io::split(io);

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(ACCEPT_BACKLOG);
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(writer_task(
            FramedWrite::new(write_half, FrameCodec),
            frame_rx,
            cancel.clone(),
            session_id.clone(),
        ));

        tokio::spawn(
            Reader {
                role,
                streams: streams.clone(),
                frame_tx: frame_tx.clone(),
                accept_tx,
                cancel: cancel.clone(),
                session_id: session_id.clone(),
            }
            .run(FramedRead::new(read_half, FrameCodec)),
        );

        debug!(session = %session_id, ?role, "Mux session started");

        Self {
            inner: Arc::new(SessionInner {
                session_id,
                role,
                next_stream_id: AtomicU32::new(role.first_stream_id()),
                streams,
                frame_tx,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                cancel,
            }),
        }
    }

    /// Open a new stream announcing `header` to the peer
    pub async fn open_stream(&self, header: Bytes) -> TransportResult<MuxStream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let state = StreamState::new();

        if let Ok(mut streams) = self.inner.streams.lock() {
            streams.insert(
                id,
                StreamSlot {
                    tx,
                    state: state.clone(),
                },
            );
        }

        if self
            .inner
            .frame_tx
            .send(Frame::open(id, header.clone()))
            .await
            .is_err()
        {
            if let Ok(mut streams) = self.inner.streams.lock() {
                streams.remove(&id);
            }
            return Err(TransportError::ConnectionClosed);
        }

        trace!(session = %self.inner.session_id, stream_id = id, "Opened stream");

        Ok(MuxStream::new(
            id,
            header,
            rx,
            state,
            self.inner.frame_tx.clone(),
            self.inner.streams.clone(),
            self.inner.cancel.clone(),
        ))
    }

    /// Accept the next stream opened by the peer
    ///
    /// Returns `None` once the session is closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut accept_rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            stream = accept_rx.recv() => stream,
            _ = self.inner.cancel.cancelled() => None,
        }
    }

    /// Close the session and every stream on it
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(session = %self.inner.session_id, "Closing mux session");
        }
        self.inner.cancel.cancel();
    }

    /// Resolves once the session is closed, for any reason
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token cancelled when the session closes
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Number of streams with a live receiving half
    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().map(|s| s.len()).unwrap_or(0)
    }
}

async fn writer_task<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    session_id: String,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = cancel.cancelled() => break,
        };

        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
            warn!(session = %session_id, "Mux write failed: {}", e);
            break;
        }
    }

    // Flush frames queued before the close, such as final close frames
    while let Ok(frame) = rx.try_recv() {
        if sink.feed(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;

    cancel.cancel();
    debug!(session = %session_id, "Mux writer task ended");
}

struct Reader {
    role: Role,
    streams: StreamMap,
    frame_tx: mpsc::Sender<Frame>,
    accept_tx: mpsc::Sender<MuxStream>,
    cancel: CancellationToken,
    session_id: String,
}

impl Reader {
    async fn run<R>(self, mut source: FramedRead<R, FrameCodec>)
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = self.cancel.cancelled() => break,
            };

            match next {
                Some(Ok(frame)) => self.dispatch(frame),
                Some(Err(e)) => {
                    warn!(session = %self.session_id, "Mux read failed: {}", e);
                    break;
                }
                None => {
                    debug!(session = %self.session_id, "Mux peer closed connection");
                    break;
                }
            }
        }

        self.cancel.cancel();
        // Dropping the senders fails every pending read
        if let Ok(mut streams) = self.streams.lock() {
            for slot in streams.values() {
                slot.state.mark_reset();
            }
            streams.clear();
        }
        debug!(session = %self.session_id, "Mux reader task ended");
    }

    fn dispatch(&self, frame: Frame) {
        let id = frame.stream_id;
        trace!(
            session = %self.session_id,
            stream_id = id,
            frame_type = ?frame.frame_type,
            len = frame.payload.len(),
            "Received frame"
        );

        match frame.frame_type {
            FrameType::Open => self.accept(id, frame.payload),
            FrameType::Data => self.deliver(id, frame.payload),
            FrameType::Close => {
                // The slot stays registered: the local side may still be
                // writing and needs the peer's window updates
                if let Some(slot) = self.slot(id) {
                    let _ = slot.tx.send(Bytes::new());
                }
            }
            FrameType::Reset => {
                let slot = self.streams.lock().ok().and_then(|mut s| s.remove(&id));
                if let Some(slot) = slot {
                    slot.state.mark_reset();
                }
            }
            FrameType::WindowUpdate => match frame.window_credit() {
                Some(credit) => {
                    if let Some(slot) = self.slot(id) {
                        slot.state.window.grant(credit as usize);
                    }
                }
                None => {
                    warn!(session = %self.session_id, stream_id = id, "Malformed window update");
                }
            },
        }
    }

    fn deliver(&self, id: StreamId, payload: Bytes) {
        // Empty chunks mark end of stream locally; never take them from the wire
        if payload.is_empty() {
            return;
        }
        let Some(slot) = self.slot(id) else {
            return;
        };

        let len = payload.len();
        let buffered = slot.state.buffered.fetch_add(len, Ordering::SeqCst) + len;
        if buffered > STREAM_WINDOW {
            warn!(
                session = %self.session_id,
                stream_id = id,
                buffered,
                "Peer overran the stream window, resetting stream"
            );
            if let Ok(mut streams) = self.streams.lock() {
                streams.remove(&id);
            }
            slot.state.mark_reset();
            let _ = self.frame_tx.try_send(Frame::reset(id));
            return;
        }

        if slot.tx.send(payload).is_err() {
            trace!(session = %self.session_id, stream_id = id, "Stream receiver dropped");
        }
    }

    fn slot(&self, id: StreamId) -> Option<StreamSlot> {
        self.streams.lock().ok().and_then(|s| {
            s.get(&id).map(|slot| StreamSlot {
                tx: slot.tx.clone(),
                state: slot.state.clone(),
            })
        })
    }

    fn accept(&self, id: StreamId, header: Bytes) {
        if !self.role.accepts_remote(id) {
            warn!(session = %self.session_id, stream_id = id, "Peer opened stream with invalid ID");
            let _ = self.frame_tx.try_send(Frame::reset(id));
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = StreamState::new();

        {
            let Ok(mut streams) = self.streams.lock() else {
                return;
            };
            if streams.contains_key(&id) {
                warn!(session = %self.session_id, stream_id = id, "Peer reopened an existing stream");
                let _ = self.frame_tx.try_send(Frame::reset(id));
                return;
            }
            streams.insert(
                id,
                StreamSlot {
                    tx,
                    state: state.clone(),
                },
            );
        }

        let stream = MuxStream::new(
            id,
            header,
            rx,
            state,
            self.frame_tx.clone(),
            self.streams.clone(),
            self.cancel.clone(),
        );

        if let Err(e) = self.accept_tx.try_send(stream) {
            warn!(session = %self.session_id, stream_id = id, "Accept backlog full, resetting stream");
            // Dropping the rejected stream sends the reset
            drop(e);
        }
    }
}

/// One logical stream of a [`MuxSession`]
pub struct MuxStream {
    id: StreamId,
    header: Bytes,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    read_eof: bool,
    write_closed: bool,
    state: StreamState,
    /// Consumed bytes not yet returned to the peer as window
    unacked: usize,
    sink: PollSender<Frame>,
    frame_tx: mpsc::Sender<Frame>,
    streams: StreamMap,
    cancel: CancellationToken,
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("read_eof", &self.read_eof)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

impl MuxStream {
    fn new(
        id: StreamId,
        header: Bytes,
        rx: mpsc::UnboundedReceiver<Bytes>,
        state: StreamState,
        frame_tx: mpsc::Sender<Frame>,
        streams: StreamMap,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            header,
            rx,
            pending: Bytes::new(),
            read_eof: false,
            write_closed: false,
            state,
            unacked: 0,
            sink: PollSender::new(frame_tx.clone()),
            frame_tx,
            streams,
            cancel,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Header announced when the stream was opened
    pub fn header(&self) -> &Bytes {
        &self.header
    }

    fn is_reset(&self) -> bool {
        self.state.reset.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Return consumed bytes to the peer's send window
    fn acknowledge(&mut self, n: usize) {
        self.unacked += n;
        if self.unacked < WINDOW_UPDATE_THRESHOLD || self.is_reset() {
            return;
        }

        let credit = std::mem::take(&mut self.unacked);
        self.state.buffered.fetch_sub(credit, Ordering::SeqCst);

        let frame = Frame::window_update(self.id, credit as u32);
        if let Err(TrySendError::Full(frame)) = self.frame_tx.try_send(frame) {
            // Never drop credit: the peer would wait for it forever
            let frame_tx = self.frame_tx.clone();
            tokio::spawn(async move {
                let _ = frame_tx.send(frame).await;
            });
        }
    }
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(data) if data.is_empty() => {
                    this.read_eof = true;
                }
                Some(data) => {
                    this.acknowledge(data.len());
                    this.pending = data;
                }
                None => return Poll::Ready(Err(reset_error())),
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Err(closed_error()));
        }
        if this.is_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let Some(available) = ready!(this.state.window.poll_available(cx)) else {
            return Poll::Ready(Err(reset_error()));
        };
        ready!(this.sink.poll_reserve(cx)).map_err(|_| closed_error())?;

        let n = buf.len().min(MAX_DATA_CHUNK).min(available);
        this.state.window.consume(n);
        this.sink
            .send_item(Frame::data(this.id, Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| closed_error())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task as soon as they are produced
        if self.is_reset() && !self.write_closed {
            return Poll::Ready(Err(reset_error()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        if this.is_reset() {
            this.write_closed = true;
            return Poll::Ready(Ok(()));
        }

        ready!(this.sink.poll_reserve(cx)).map_err(|_| closed_error())?;
        this.sink
            .send_item(Frame::close(this.id))
            .map_err(|_| closed_error())?;
        this.write_closed = true;

        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&self.id);
        }

        if self.cancel.is_cancelled() || self.state.reset.load(Ordering::SeqCst) {
            return;
        }
        if !(self.write_closed && self.read_eof) {
            let _ = self.frame_tx.try_send(Frame::reset(self.id));
        }
    }
}
