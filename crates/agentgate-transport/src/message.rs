//! Message-oriented transports
//!
//! Some endpoints (statistics reporting, node updates) exchange whole JSON
//! documents rather than byte streams. [`MessageTransport`] abstracts over a
//! WebSocket carrying text frames and a length-delimited byte pipe.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{TransportError, TransportResult};

/// Reason a transport was closed, mirroring WebSocket close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    Abnormal,
    PolicyViolation,
    InternalError,
}

impl CloseCode {
    /// Numeric WebSocket close code
    pub fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            // 1006 is reserved and must not be sent on the wire
            CloseCode::Abnormal => 1002,
            CloseCode::PolicyViolation => 1008,
            CloseCode::InternalError => 1011,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "normal",
            CloseCode::GoingAway => "going away",
            CloseCode::Abnormal => "abnormal",
            CloseCode::PolicyViolation => "policy violation",
            CloseCode::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Duplex transport of discrete messages
#[async_trait]
pub trait MessageTransport: Send {
    /// Send one message
    async fn send(&mut self, message: Bytes) -> TransportResult<()>;

    /// Receive one message
    ///
    /// Returns `None` once the peer has closed the transport.
    async fn recv(&mut self) -> TransportResult<Option<Bytes>>;

    /// Close the transport with a status and a short reason
    async fn close(&mut self, code: CloseCode, reason: &str);
}

/// Serialize and send a JSON message
pub async fn send_json<M, T>(transport: &mut M, value: &T) -> TransportResult<()>
where
    M: MessageTransport + ?Sized,
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(value)?;
    transport.send(Bytes::from(body)).await
}

/// Receive and deserialize a JSON message
///
/// A closed transport is reported as [`TransportError::ConnectionClosed`].
pub async fn recv_json<M, T>(transport: &mut M) -> TransportResult<T>
where
    M: MessageTransport + ?Sized,
    T: DeserializeOwned,
{
    match transport.recv().await? {
        Some(message) => Ok(serde_json::from_slice(&message)?),
        None => Err(TransportError::ConnectionClosed),
    }
}

/// Length-delimited messages over a byte stream
pub struct LengthDelimited<T> {
    inner: Framed<T, LengthDelimitedCodec>,
    closed_with: Option<(CloseCode, String)>,
}

impl<T> LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite,
{
    pub fn new(io: T) -> Self {
        Self {
            inner: Framed::new(io, LengthDelimitedCodec::new()),
            closed_with: None,
        }
    }

    /// Close status recorded by [`MessageTransport::close`]
    pub fn closed_with(&self) -> Option<&(CloseCode, String)> {
        self.closed_with.as_ref()
    }
}

impl<T> fmt::Debug for LengthDelimited<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthDelimited")
            .field("closed_with", &self.closed_with)
            .finish()
    }
}

#[async_trait]
impl<T> MessageTransport for LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, message: Bytes) -> TransportResult<()> {
        if self.closed_with.is_some() {
            return Err(TransportError::ConnectionClosed);
        }
        self.inner.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        match self.inner.next().await {
            Some(Ok(message)) => Ok(Some(message.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        if self.closed_with.is_none() {
            self.closed_with = Some((code, reason.to_string()));
            let _ = SinkExt::<Bytes>::close(&mut self.inner).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pipe;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[tokio::test]
    async fn test_json_over_length_delimited() {
        let (a, b) = memory_pipe();
        let mut a = LengthDelimited::new(a);
        let mut b = LengthDelimited::new(b);

        send_json(&mut a, &Ping { seq: 1 }).await.unwrap();
        send_json(&mut a, &Ping { seq: 2 }).await.unwrap();

        let first: Ping = recv_json(&mut b).await.unwrap();
        let second: Ping = recv_json(&mut b).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[tokio::test]
    async fn test_close_is_observed_by_peer() {
        let (a, b) = memory_pipe();
        let mut a = LengthDelimited::new(a);
        let mut b = LengthDelimited::new(b);

        a.close(CloseCode::GoingAway, "").await;
        assert_eq!(a.closed_with().unwrap().0, CloseCode::GoingAway);
        assert!(a.send(Bytes::from_static(b"late")).await.is_err());

        drop(a);
        let result: TransportResult<Ping> = recv_json(&mut b).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::GoingAway.as_u16(), 1001);
        assert_eq!(CloseCode::InternalError.as_u16(), 1011);
    }
}
