//! Relaying signaling streams over the bus
//!
//! The client-facing side runs [`proxy_listen`] on the session its dialer
//! writes to; the agent-facing side runs [`proxy_dial`] on the session of
//! the connected agent. Each negotiation gets its own id so concurrent
//! negotiations with the same agent never mix.

use agentgate_proto::{
    read_json, write_json, BusDirection, BusEnvelope, CodecError, SignalMessage, StreamKind,
};
use agentgate_transport::{MuxSession, MuxStream};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::pubsub::{agent_prefixed, strip_agent_prefix, Handler, Pubsub};
use crate::{BrokerError, BrokerResult};

/// Bus topic carrying every signaling message
pub const PEERBROKER_TOPIC: &str = "peerbroker";

type Routes = HashMap<Uuid, mpsc::UnboundedSender<SignalMessage>>;

/// Decode a bus message if it belongs to `agent_id`
fn decode_envelope(agent_id: Uuid, message: &[u8]) -> Option<BusEnvelope> {
    let payload = strip_agent_prefix(agent_id, message)?;
    match serde_json::from_slice(payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            error!(agent_id = %agent_id, "Invalid signaling message on bus: {}", e);
            None
        }
    }
}

async fn publish_envelope(
    bus: &dyn Pubsub,
    agent_id: Uuid,
    envelope: &BusEnvelope,
) -> BrokerResult<()> {
    let payload = serde_json::to_vec(envelope)?;
    bus.publish(PEERBROKER_TOPIC, agent_prefixed(agent_id, &payload))
        .await
}

/// Subscribe to the signaling topic, forwarding raw messages to a channel
async fn subscribe_channel(
    bus: &dyn Pubsub,
) -> BrokerResult<(crate::Subscription, mpsc::UnboundedReceiver<Bytes>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Handler = Box::new(move |message| {
        let _ = tx.send(message);
    });
    let subscription = bus.subscribe(PEERBROKER_TOPIC, handler).await?;
    Ok((subscription, rx))
}

/// Route a decoded envelope to its negotiation, dropping stale routes
fn route(routes: &mut Routes, envelope: BusEnvelope) -> Option<BusEnvelope> {
    routes.retain(|_, tx| !tx.is_closed());
    match routes.get(&envelope.negotiation_id) {
        Some(tx) => {
            let _ = tx.send(envelope.signal);
            None
        }
        None => Some(envelope),
    }
}

/// Copy signals between one stream and the bus until either side ends
///
/// Signals read from the stream are published with `direction`; signals
/// received on `inbound` are written to the stream.
async fn relay_signals(
    stream: MuxStream,
    mut inbound: mpsc::UnboundedReceiver<SignalMessage>,
    bus: Arc<dyn Pubsub>,
    agent_id: Uuid,
    negotiation_id: Uuid,
    direction: BusDirection,
) -> BrokerResult<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let to_stream = async {
        while let Some(signal) = inbound.recv().await {
            write_json(&mut writer, &signal).await?;
        }
        Ok::<_, BrokerError>(())
    };

    let from_stream = async {
        loop {
            let signal: SignalMessage = match read_json(&mut reader).await {
                Ok(signal) => signal,
                Err(CodecError::Closed) => return Ok::<(), BrokerError>(()),
                Err(e) => return Err(BrokerError::from(e)),
            };
            let envelope = BusEnvelope {
                negotiation_id,
                direction,
                signal,
            };
            publish_envelope(bus.as_ref(), agent_id, &envelope).await?;
        }
    };

    let result = tokio::select! {
        r = to_stream => r,
        r = from_stream => r,
    };

    debug!(agent_id = %agent_id, negotiation_id = %negotiation_id, "Signaling relay finished");
    result
}

/// Relay negotiations from a client-facing session to the agent over the bus
///
/// Every stream accepted on `session` starts a new negotiation. Returns when
/// the session closes or `cancel` fires; a subscription failure or a stream
/// read/write failure ends the relay and is returned.
pub async fn proxy_listen(
    agent_id: Uuid,
    bus: Arc<dyn Pubsub>,
    session: MuxSession,
    cancel: CancellationToken,
) -> BrokerResult<()> {
    let (_subscription, mut messages) = subscribe_channel(bus.as_ref()).await?;
    let mut routes = Routes::new();
    let mut relays: JoinSet<BrokerResult<()>> = JoinSet::new();

    debug!(agent_id = %agent_id, "Proxy listen started");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = session.closed() => break Ok(()),
            stream = session.accept_stream() => {
                let Some(stream) = stream else { break Ok(()) };

                match StreamKind::decode(stream.header()) {
                    Ok(StreamKind::Negotiate) => {}
                    other => {
                        warn!(agent_id = %agent_id, "Rejecting non-negotiation stream: {:?}", other);
                        continue;
                    }
                }

                let negotiation_id = Uuid::new_v4();
                let (tx, rx) = mpsc::unbounded_channel();
                routes.insert(negotiation_id, tx);
                relays.spawn(relay_signals(
                    stream,
                    rx,
                    bus.clone(),
                    agent_id,
                    negotiation_id,
                    BusDirection::ToAgent,
                ));
            }
            message = messages.recv() => {
                let Some(message) = message else {
                    break Err(BrokerError::Subscribe("subscription closed".to_string()));
                };
                let Some(envelope) = decode_envelope(agent_id, &message) else { continue };
                if envelope.direction != BusDirection::ToClient {
                    continue;
                }
                if let Some(unrouted) = route(&mut routes, envelope) {
                    debug!(
                        agent_id = %agent_id,
                        negotiation_id = %unrouted.negotiation_id,
                        "Dropping signal for unknown negotiation"
                    );
                }
            }
            Some(joined) = relays.join_next(), if !relays.is_empty() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(BrokerError::Negotiation(e.to_string())),
                }
            }
        }
    };

    relays.abort_all();
    debug!(agent_id = %agent_id, "Proxy listen stopped");
    result
}

/// Handle to a running [`proxy_dial`] relay
#[derive(Debug)]
pub struct ProxyDialer {
    cancel: CancellationToken,
}

impl ProxyDialer {
    /// Stop relaying and release the bus subscription
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ProxyDialer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Relay negotiations addressed to `agent_id` onto the agent's session
///
/// The first signal of an unknown negotiation opens a `Negotiate` stream on
/// `session`; later signals are written to the same stream and everything
/// the agent writes back is published for the client side.
pub async fn proxy_dial(
    agent_id: Uuid,
    bus: Arc<dyn Pubsub>,
    session: MuxSession,
) -> BrokerResult<ProxyDialer> {
    let (subscription, messages) = subscribe_channel(bus.as_ref()).await?;
    let cancel = session.cancel_token().child_token();

    tokio::spawn(dial_loop(
        agent_id,
        bus,
        session,
        messages,
        subscription,
        cancel.clone(),
    ));

    Ok(ProxyDialer { cancel })
}

async fn dial_loop(
    agent_id: Uuid,
    bus: Arc<dyn Pubsub>,
    session: MuxSession,
    mut messages: mpsc::UnboundedReceiver<Bytes>,
    subscription: crate::Subscription,
    cancel: CancellationToken,
) {
    let mut routes = Routes::new();
    let mut relays = JoinSet::new();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv() => message,
        };
        let Some(message) = message else { break };

        let Some(envelope) = decode_envelope(agent_id, &message) else { continue };
        if envelope.direction != BusDirection::ToAgent {
            continue;
        }
        let Some(envelope) = route(&mut routes, envelope) else { continue };

        let header = match StreamKind::Negotiate.encode() {
            Ok(header) => header,
            Err(e) => {
                error!(agent_id = %agent_id, "Failed to encode stream header: {}", e);
                break;
            }
        };
        let stream = match session.open_stream(header).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(agent_id = %agent_id, "Failed to open negotiation stream: {}", e);
                break;
            }
        };

        let negotiation_id = envelope.negotiation_id;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(envelope.signal);
        routes.insert(negotiation_id, tx);

        let bus = bus.clone();
        relays.spawn(async move {
            if let Err(e) = relay_signals(
                stream,
                rx,
                bus,
                agent_id,
                negotiation_id,
                BusDirection::ToClient,
            )
            .await
            {
                warn!(agent_id = %agent_id, negotiation_id = %negotiation_id, "Signaling relay failed: {}", e);
            }
        });

        while relays.try_join_next().is_some() {}
    }

    subscription.cancel();
    relays.abort_all();
    debug!(agent_id = %agent_id, "Proxy dial stopped");
}
