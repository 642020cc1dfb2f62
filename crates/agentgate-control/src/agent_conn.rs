//! Logical streams over an established agent tunnel

use agentgate_broker::PeerConn;
use agentgate_connection::{Stats, StatsStream};
use agentgate_proto::{read_json, write_json, DialResponse, StreamKind};
use agentgate_transport::MuxStream;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{TunnelError, TunnelResult};

/// Tunnel to a workspace agent
///
/// Every stream handed out is accounted in the shared [`Stats`] under the
/// protocol of its [`StreamKind`].
#[derive(Debug, Clone)]
pub struct AgentConn {
    peer: PeerConn,
    stats: Stats,
}

impl AgentConn {
    pub fn new(peer: PeerConn, stats: Stats) -> Self {
        Self { peer, stats }
    }

    pub fn peer(&self) -> &PeerConn {
        &self.peer
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Open a stream announcing `kind` to the agent
    pub async fn open_stream(&self, kind: &StreamKind) -> TunnelResult<StatsStream<MuxStream>> {
        if self.peer.is_closed() {
            return Err(TunnelError::Closed);
        }
        let stream = self.peer.session().open_stream(kind.encode()?).await?;
        // The mux is reliable and ordered; UDP dials only record the request
        debug!(
            stream_id = stream.id(),
            protocol = kind.protocol(),
            unordered = kind.unordered(),
            "Opened stream"
        );
        Ok(self.stats.track(stream, kind.protocol()))
    }

    /// Stream to the agent's SSH server
    pub async fn ssh(&self) -> TunnelResult<StatsStream<MuxStream>> {
        self.open_stream(&StreamKind::Ssh).await
    }

    /// Attach to (or start) the terminal identified by `session_id`
    pub async fn reconnecting_pty(
        &self,
        session_id: Uuid,
        height: u16,
        width: u16,
        command: &str,
    ) -> TunnelResult<StatsStream<MuxStream>> {
        self.open_stream(&StreamKind::ReconnectingPty {
            session_id,
            height,
            width,
            command: command.to_string(),
        })
        .await
    }

    /// Dial `address` from inside the workspace
    ///
    /// Resolves once the agent reports the outcome of its own dial; a
    /// failure on the agent side closes the stream.
    pub async fn dial(&self, network: &str, address: &str) -> TunnelResult<StatsStream<MuxStream>> {
        let kind = StreamKind::dial(network, address)?;
        let mut stream = self.open_stream(&kind).await?;

        let response: DialResponse = read_json(&mut stream).await?;
        if !response.is_ok() {
            let _ = stream.shutdown().await;
            return Err(TunnelError::RemoteDial(response.error));
        }
        Ok(stream)
    }

    /// Accept the next stream opened by the other side
    ///
    /// Streams with an unreadable header are reset and skipped. Returns
    /// `None` once the tunnel is closed.
    pub async fn accept(&self) -> Option<(StreamKind, StatsStream<MuxStream>)> {
        loop {
            let stream = self.peer.session().accept_stream().await?;
            match StreamKind::decode(stream.header()) {
                Ok(kind) => {
                    debug!(stream_id = stream.id(), protocol = kind.protocol(), "Accepted stream");
                    let stream = self.stats.track(stream, kind.protocol());
                    return Some((kind, stream));
                }
                Err(e) => warn!(stream_id = stream.id(), "Rejecting stream: {}", e),
            }
        }
    }

    pub fn close(&self) {
        self.peer.close();
    }

    pub async fn closed(&self) {
        self.peer.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }
}

/// Report the outcome of an agent-side dial as the first message on the stream
pub async fn write_dial_response<W>(stream: &mut W, response: &DialResponse) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_json(stream, response).await?;
    Ok(())
}
