//! Peer connection negotiation
//!
//! The dialing side sends an offer, waits for the answer, then picks a path:
//! a direct connection to one of the answerer's host candidates if one is
//! accepted within [`DialOptions::acceptance_wait`], otherwise the relay.
//! The choice is announced with a `Selected` signal so the answerer follows.
//!
//! A direct connection starts with the 16 bytes of the negotiation's session
//! id so the answerer can tell it apart from unrelated connections.

use agentgate_proto::{
    read_json, write_json, Candidate, CandidateKind, IceServer, SelectedPath,
    SessionDescription, SignalMessage,
};
use agentgate_transport::{BoxedIo, MuxSession, Role};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::relay::{RelayDialer, RelayRequest};
use crate::{BrokerError, BrokerResult};

/// How long the answerer waits for the dialer's direct connection
const DIRECT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for the peer's answer or selection
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Negotiation options shared by both sides
#[derive(Clone)]
pub struct DialOptions {
    /// Time allowed for direct connectivity before falling back to the relay
    ///
    /// Zero skips direct attempts entirely and always relays, which favours
    /// fast setup in constrained networks.
    pub acceptance_wait: Duration,
    /// Time allowed for the peer to reply to our offer or answer
    pub negotiation_timeout: Duration,
    /// Relay used when no direct path is available
    pub relay_dialer: Option<Arc<dyn RelayDialer>>,
    /// Caller addresses passed to the relay for quota accounting
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Address to bind a host candidate on (answering side only)
    pub listen_address: Option<SocketAddr>,
    /// Cancelled when the resulting peer connection closes
    pub context: CancellationToken,
}

impl Default for DialOptions {
    fn default() -> Self {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Self {
            acceptance_wait: Duration::ZERO,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            relay_dialer: None,
            remote_addr: unspecified,
            local_addr: unspecified,
            listen_address: None,
            context: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("acceptance_wait", &self.acceptance_wait)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("relay_dialer", &self.relay_dialer.is_some())
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("listen_address", &self.listen_address)
            .finish()
    }
}

impl DialOptions {
    fn relay_request(&self, allocation: Uuid) -> RelayRequest {
        RelayRequest {
            allocation,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
        }
    }

    async fn dial_relay(&self, allocation: Uuid) -> BrokerResult<BoxedIo> {
        let dialer = self
            .relay_dialer
            .as_ref()
            .ok_or_else(|| BrokerError::Negotiation("no direct path and no relay".to_string()))?;
        dialer.dial(self.relay_request(allocation)).await
    }
}

/// Negotiated connection to a peer
///
/// Closing it cancels the negotiation context, which unwinds the signaling
/// relays and the underlying transport.
#[derive(Debug, Clone)]
pub struct PeerConn {
    session: MuxSession,
    selected: SelectedPath,
    cancel: CancellationToken,
}

impl PeerConn {
    fn new(io: BoxedIo, role: Role, selected: SelectedPath, cancel: CancellationToken) -> Self {
        let session = MuxSession::new(io, role, cancel.clone());
        Self {
            session,
            selected,
            cancel,
        }
    }

    /// Multiplexed session over the negotiated transport
    pub fn session(&self) -> &MuxSession {
        &self.session
    }

    pub fn selected(&self) -> &SelectedPath {
        &self.selected
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(&self) {
        self.session.close();
        self.cancel.cancel();
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn expect_signal<S>(signaling: &mut S) -> BrokerResult<SignalMessage>
where
    S: AsyncRead + Unpin,
{
    match read_json(signaling).await? {
        SignalMessage::Error { message } => Err(BrokerError::Negotiation(message)),
        signal => Ok(signal),
    }
}

/// Wait for the peer's reply to a signal we sent
async fn expect_reply<S>(signaling: &mut S, wait: Duration, what: &str) -> BrokerResult<SignalMessage>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(wait, expect_signal(signaling))
        .await
        .map_err(|_| BrokerError::Negotiation(format!("timed out waiting for {}", what)))?
}

async fn connect_direct(
    candidates: &[Candidate],
    session_id: Uuid,
    wait: Duration,
) -> Option<(TcpStream, String)> {
    if wait.is_zero() {
        return None;
    }

    for candidate in candidates.iter().filter(|c| c.kind == CandidateKind::Host) {
        let Ok(addr) = candidate.address.parse::<SocketAddr>() else {
            debug!(address = %candidate.address, "Skipping unparseable candidate");
            continue;
        };

        match tokio::time::timeout(wait, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                if stream.write_all(session_id.as_bytes()).await.is_ok() {
                    let _ = stream.set_nodelay(true);
                    return Some((stream, candidate.address.clone()));
                }
            }
            Ok(Err(e)) => debug!(address = %addr, "Direct connection failed: {}", e),
            Err(_) => debug!(address = %addr, "Direct connection timed out"),
        }
    }
    None
}

async fn fail<S>(signaling: &mut S, error: BrokerError) -> BrokerError
where
    S: AsyncWrite + Unpin,
{
    let _ = write_json(
        signaling,
        &SignalMessage::Error {
            message: error.to_string(),
        },
    )
    .await;
    error
}

/// Negotiate a peer connection as the offering side
///
/// Negotiation failures are returned as-is; retrying is up to the caller.
pub async fn dial<S>(
    mut signaling: S,
    ice_servers: Vec<IceServer>,
    options: DialOptions,
) -> BrokerResult<PeerConn>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let session_id = Uuid::new_v4();
    let cancel = options.context.clone();

    let negotiate = async {
        write_json(
            &mut signaling,
            &SignalMessage::Offer {
                description: SessionDescription {
                    session_id,
                    candidates: Vec::new(),
                    ice_servers,
                },
            },
        )
        .await?;

        let answer = match expect_reply(&mut signaling, options.negotiation_timeout, "answer")
            .await?
        {
            SignalMessage::Answer { description } => description,
            other => {
                return Err(BrokerError::Negotiation(format!(
                    "expected answer, got {:?}",
                    other
                )))
            }
        };
        if answer.session_id != session_id {
            return Err(BrokerError::Negotiation(
                "answer for a different session".to_string(),
            ));
        }

        let (io, selected): (BoxedIo, SelectedPath) =
            match connect_direct(&answer.candidates, session_id, options.acceptance_wait).await {
                Some((stream, address)) => {
                    (Box::new(stream) as BoxedIo, SelectedPath::Direct { address })
                }
                None => {
                    let io = match options.dial_relay(session_id).await {
                        Ok(io) => io,
                        Err(e) => return Err(fail(&mut signaling, e).await),
                    };
                    (io, SelectedPath::Relay)
                }
            };

        write_json(
            &mut signaling,
            &SignalMessage::Selected {
                selected: selected.clone(),
            },
        )
        .await?;
        let _ = signaling.shutdown().await;

        Ok::<_, BrokerError>((io, selected))
    };

    let (io, selected) = tokio::select! {
        result = negotiate => result?,
        _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
    };

    info!(session_id = %session_id, ?selected, "Peer connection established");
    Ok(PeerConn::new(io, Role::Client, selected, cancel))
}

async fn accept_direct(listener: &TcpListener, session_id: Uuid) -> BrokerResult<TcpStream> {
    loop {
        let (mut stream, remote) = listener.accept().await?;
        let mut id = [0u8; 16];
        match stream.read_exact(&mut id).await {
            Ok(_) if id == *session_id.as_bytes() => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(_) => warn!(remote = %remote, "Direct connection for another session"),
            Err(e) => debug!(remote = %remote, "Direct connection dropped: {}", e),
        }
    }
}

/// Negotiate a peer connection as the answering side
///
/// Binds a host candidate on [`DialOptions::listen_address`] when set and
/// follows whichever path the offering side selects.
pub async fn answer<S>(mut signaling: S, options: DialOptions) -> BrokerResult<PeerConn>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cancel = options.context.clone();

    let negotiate = async {
        let offer = match expect_signal(&mut signaling).await? {
            SignalMessage::Offer { description } => description,
            other => {
                return Err(BrokerError::Negotiation(format!(
                    "expected offer, got {:?}",
                    other
                )))
            }
        };
        let session_id = offer.session_id;

        let listener = match options.listen_address {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let candidates = match &listener {
            Some(listener) => vec![Candidate::host(listener.local_addr()?.to_string())],
            None => Vec::new(),
        };

        write_json(
            &mut signaling,
            &SignalMessage::Answer {
                description: SessionDescription {
                    session_id,
                    candidates,
                    ice_servers: Vec::new(),
                },
            },
        )
        .await?;

        let selected = match expect_reply(&mut signaling, options.negotiation_timeout, "selection")
            .await?
        {
            SignalMessage::Selected { selected } => selected,
            other => {
                return Err(BrokerError::Negotiation(format!(
                    "expected selection, got {:?}",
                    other
                )))
            }
        };

        let io: BoxedIo = match (&selected, &listener) {
            (SelectedPath::Direct { .. }, Some(listener)) => {
                let accepted =
                    tokio::time::timeout(DIRECT_ACCEPT_TIMEOUT, accept_direct(listener, session_id))
                        .await
                        .map_err(|_| {
                            BrokerError::Negotiation("direct connection never arrived".to_string())
                        })??;
                Box::new(accepted) as BoxedIo
            }
            (SelectedPath::Direct { .. }, None) => {
                return Err(BrokerError::Negotiation(
                    "direct path selected without a host candidate".to_string(),
                ))
            }
            (SelectedPath::Relay, _) => options.dial_relay(session_id).await?,
        };
        let _ = signaling.shutdown().await;

        Ok::<_, BrokerError>((io, selected, session_id))
    };

    let (io, selected, session_id) = tokio::select! {
        result = negotiate => result?,
        _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
    };

    info!(session_id = %session_id, ?selected, "Answered peer connection");
    Ok(PeerConn::new(io, Role::Server, selected, cancel))
}
