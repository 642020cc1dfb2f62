//! Transport decorator that cancels a context on failure

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Wraps a duplex and cancels `token` on the first I/O error or shutdown
///
/// The wrapper never closes the inner transport by itself; whoever owns the
/// token is expected to tear down the rest of the connection.
#[derive(Debug)]
pub struct CancelOnError<T> {
    inner: T,
    token: CancellationToken,
}

impl<T> CancelOnError<T> {
    pub fn new(inner: T, token: CancellationToken) -> Self {
        Self { inner, token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn observe<R>(&self, result: Poll<io::Result<R>>) -> Poll<io::Result<R>> {
        if let Poll::Ready(Err(e)) = &result {
            if !self.token.is_cancelled() {
                trace!("Cancelling context after transport error: {}", e);
            }
            self.token.cancel();
        }
        result
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CancelOnError<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.observe(result)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CancelOnError<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.observe(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_flush(cx);
        this.observe(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_shutdown(cx);
        if result.is_ready() {
            this.token.cancel();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_healthy_traffic_keeps_token() {
        let token = CancellationToken::new();
        let (a, mut b) = tokio::io::duplex(64);
        let mut wrapped = CancelOnError::new(a, token.clone());

        wrapped.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();

        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_write_error_cancels() {
        let token = CancellationToken::new();
        let (a, b) = tokio::io::duplex(64);
        let mut wrapped = CancelOnError::new(a, token.clone());
        drop(b);

        assert!(wrapped.write_all(b"lost").await.is_err());
        assert!(token.is_cancelled());

        // Further failures are harmless
        assert!(wrapped.write_all(b"lost").await.is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_cancels() {
        let token = CancellationToken::new();
        let (a, _b) = tokio::io::duplex(64);
        let mut wrapped = CancelOnError::new(a, token.clone());

        wrapped.shutdown().await.unwrap();
        assert!(token.is_cancelled());
    }
}
