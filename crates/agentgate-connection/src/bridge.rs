//! Bidirectional byte copying between two duplexes

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes copied in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

const COPY_BUFFER: usize = 16 * 1024;

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}

/// Copy between `a` and `b` until either direction finishes
///
/// Whichever direction ends first (EOF or error), both ends are shut down and
/// the byte counts so far are returned.
pub async fn bridge<A, B>(a: A, b: B) -> BridgeStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut stats = BridgeStats::default();

    let result = tokio::select! {
        r = copy_half(&mut a_read, &mut b_write, &mut stats.a_to_b) => r,
        r = copy_half(&mut b_read, &mut a_write, &mut stats.b_to_a) => r,
    };

    if let Err(e) = result {
        debug!("Bridge ended with error: {}", e);
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_copies_both_ways() {
        let (client, a) = tokio::io::duplex(1024);
        let (b, server) = tokio::io::duplex(1024);

        let handle = tokio::spawn(bridge(a, b));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        server_write.write_all(b"resp").await.unwrap();
        let mut buf = [0u8; 4];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"resp");

        // EOF from the client ends the bridge and closes the server side
        client_write.shutdown().await.unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.a_to_b, 7);
        assert_eq!(stats.b_to_a, 4);

        let mut rest = Vec::new();
        server_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
