//! Adapters from an upgraded axum [`WebSocket`] to the transport traits
//!
//! - [`WebSocketIo`]: a byte stream carried in binary messages
//! - [`WebSocketMessages`]: a [`MessageTransport`] carried in text messages
//! - [`serve_with_close_status`]: runs a byte-stream server and closes the
//!   socket with the status it returns

use agentgate_control::CloseStatus;
use agentgate_transport::{memory_pipe, CloseCode, MessageTransport, TransportError, TransportResult};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures::{ready, Sink, Stream};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tracing::debug;

/// Close reasons longer than this are rejected by the WebSocket protocol
pub const MAX_CLOSE_REASON: usize = 123;

/// Truncate `reason` to fit a close frame without splitting a character
pub fn websocket_close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn close_frame(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.as_u16(),
        reason: websocket_close_reason(reason).into(),
    }))
}

/// Send a close frame, ignoring a peer that is already gone
pub async fn close_websocket(socket: &mut WebSocket, code: CloseCode, reason: &str) {
    if let Err(e) = socket.send(close_frame(code, reason)).await {
        debug!("Failed to close websocket: {}", e);
    }
}

/// A WebSocket used as a byte stream
///
/// Every write becomes one binary message. Text messages are rejected.
/// Shutting down the write side sends a normal close frame.
pub struct WebSocketIo {
    socket: WebSocket,
    pending: Bytes,
    read_eof: bool,
    close_sent: bool,
}

impl WebSocketIo {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            pending: Bytes::new(),
            read_eof: false,
            close_sent: false,
        }
    }

    /// Run `work` while watching for the client to go away
    ///
    /// Binary messages that arrive meanwhile are kept for the byte stream.
    /// Returns `None`, dropping `work`, when the client closes first.
    pub async fn until_closed<F: Future>(&mut self, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        let mut early = BytesMut::from(&self.pending[..]);

        let output = loop {
            tokio::select! {
                output = &mut work => break Some(output),
                message = self.socket.recv(), if !self.read_eof => match message {
                    Some(Ok(Message::Binary(data))) => early.extend_from_slice(&data),
                    Some(Ok(Message::Close(_))) | None => {
                        self.read_eof = true;
                        break None;
                    }
                    Some(Ok(Message::Text(_))) | Some(Err(_)) => break None,
                    Some(Ok(_)) => {}
                },
            }
        };

        self.pending = early.freeze();
        output
    }

    /// Send a close frame unless one already went out
    pub async fn close(&mut self, code: CloseCode, reason: &str) {
        if !self.close_sent {
            self.close_sent = true;
            close_websocket(&mut self.socket, code, reason).await;
        }
    }
}

impl AsyncRead for WebSocketIo {
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

            match ready!(Pin::new(&mut this.socket).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = data,
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected text message",
                    )));
                }
                Some(Ok(Message::Close(_))) | None => this.read_eof = true,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
    }
}

impl AsyncWrite for WebSocketIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.close_sent {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")));
        }

        let mut socket = Pin::new(&mut this.socket);
        ready!(socket.as_mut().poll_ready(cx)).map_err(io::Error::other)?;
        socket
            .as_mut()
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;

        // Push the frame out now; a pending flush completes on the next call
        if let Poll::Ready(Err(e)) = socket.poll_flush(cx) {
            return Poll::Ready(Err(io::Error::other(e)));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut socket = Pin::new(&mut this.socket);

        if !this.close_sent {
            ready!(socket.as_mut().poll_ready(cx)).map_err(io::Error::other)?;
            socket
                .as_mut()
                .start_send(close_frame(CloseCode::Normal, ""))
                .map_err(io::Error::other)?;
            this.close_sent = true;
        }

        socket.poll_close(cx).map_err(io::Error::other)
    }
}

/// A WebSocket carrying one JSON document per text message
pub struct WebSocketMessages {
    socket: WebSocket,
    closed: bool,
}

impl WebSocketMessages {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }
}

#[async_trait]
impl MessageTransport for WebSocketMessages {
    async fn send(&mut self, message: Bytes) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let text = String::from_utf8(message.to_vec())
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::IoError(io::Error::other(e)))
    }

    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())))
                }
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::IoError(io::Error::other(e))),
            }
        }
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        if !self.closed {
            self.closed = true;
            close_websocket(&mut self.socket, code, reason).await;
        }
    }
}

const PUMP_BUFFER: usize = 16 * 1024;

enum PumpEvent {
    FromSocket(Option<Message>),
    FromServer(io::Result<usize>),
}

/// Copy between the socket and an in-process pipe until either side ends
async fn pump(socket: &mut WebSocket, io: &mut DuplexStream) {
    let mut buf = vec![0u8; PUMP_BUFFER];

    loop {
        let event = tokio::select! {
            message = socket.recv() => PumpEvent::FromSocket(message.and_then(Result::ok)),
            read = io.read(&mut buf) => PumpEvent::FromServer(read),
        };

        match event {
            PumpEvent::FromSocket(Some(Message::Binary(data))) => {
                if io.write_all(&data).await.is_err() {
                    return;
                }
            }
            PumpEvent::FromSocket(Some(Message::Close(_)) | Some(Message::Text(_)) | None) => {
                return
            }
            PumpEvent::FromSocket(Some(_)) => {}
            PumpEvent::FromServer(Ok(0) | Err(_)) => return,
            PumpEvent::FromServer(Ok(n)) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if socket.send(Message::Binary(data)).await.is_err() {
                    return;
                }
            }
        }
    }
}

enum Ended {
    Served(CloseStatus),
    Disconnected,
}

/// Serve a byte stream over `socket` and close it with the resulting status
///
/// `serve` gets one end of an in-process pipe; the other end is copied to
/// and from the socket. When the client goes away first, the pipe is closed
/// and `serve` is left to observe the EOF and finish.
pub async fn serve_with_close_status<F, Fut>(mut socket: WebSocket, serve: F)
where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: Future<Output = CloseStatus>,
{
    let (local, mut remote) = memory_pipe();
    let serve = serve(local);
    tokio::pin!(serve);

    let ended = tokio::select! {
        status = &mut serve => Ended::Served(status),
        _ = pump(&mut socket, &mut remote) => Ended::Disconnected,
    };

    let status = match ended {
        Ended::Served(status) => status,
        Ended::Disconnected => {
            drop(remote);
            serve.await
        }
    };

    debug!(code = %status.code, reason = %status.reason, "Closing websocket");
    close_websocket(&mut socket, status.code, &status.reason).await;
}
