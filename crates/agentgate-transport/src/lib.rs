//! Transport abstraction layer for agent tunnels
//!
//! This crate provides the pieces the control plane needs to turn one
//! negotiated duplex connection into many logical streams:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Control plane (listen, dial, pty, stats)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │   MuxSession / MuxStream        MessageTransport         │
//! │   (framed logical streams)      (JSON request/response)  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           ↓
//! ┌──────────────┬──────────────┬──────────────┬────────────┐
//! │  WebSocket   │  Relay pipe  │  Direct TCP  │  In-memory │
//! └──────────────┴──────────────┴──────────────┴────────────┘
//! ```

pub mod message;
pub mod session;

pub use message::{recv_json, send_json, CloseCode, LengthDelimited, MessageTransport};
pub use session::{MuxSession, MuxStream, Role};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// Buffer size of in-process pipes
pub const MEMORY_PIPE_BUFFER: usize = 64 * 1024;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::ProtocolError(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Any bidirectional byte stream that can be moved across tasks
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased duplex
pub type BoxedIo = Box<dyn AsyncReadWrite>;

/// A connected pair of in-process byte pipes
pub fn memory_pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(MEMORY_PIPE_BUFFER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_boxed_memory_pipe() {
        let (a, b) = memory_pipe();
        let mut a: BoxedIo = Box::new(a);
        let mut b: BoxedIo = Box::new(b);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
