//! End-to-end negotiation through the bus and the colocated relay

use agentgate_broker::{
    answer, dial, proxy_dial, proxy_listen, BrokerError, DialOptions, MemoryPubsub, PeerConn,
    PipeRelayDialer, Pubsub, RelayServer, PEERBROKER_TOPIC,
};
use agentgate_proto::{SelectedPath, StreamKind};
use agentgate_transport::{memory_pipe, MuxSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Agent connected to the control plane, answering every negotiation
fn spawn_agent(session: MuxSession, options: DialOptions) -> JoinHandle<PeerConn> {
    tokio::spawn(async move {
        let stream = session.accept_stream().await.unwrap();
        assert_eq!(
            StreamKind::decode(stream.header()).unwrap(),
            StreamKind::Negotiate
        );
        let peer = answer(stream, options).await.unwrap();

        // Echo every stream the dialer opens
        let session = peer.session().clone();
        tokio::spawn(async move {
            while let Some(mut stream) = session.accept_stream().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        peer
    })
}

struct Harness {
    bus: Arc<MemoryPubsub>,
    relay: RelayServer,
    agent_id: Uuid,
    _agent_session: MuxSession,
    _proxy_dialer: agentgate_broker::ProxyDialer,
    agent: JoinHandle<PeerConn>,
}

async fn harness(agent_options: DialOptions) -> Harness {
    init_tracing();
    let bus = Arc::new(MemoryPubsub::new());
    let relay = RelayServer::default();
    let agent_id = Uuid::new_v4();

    // Control plane side of the agent's listen connection
    let (server_io, agent_io) = memory_pipe();
    let server_session = MuxSession::server(server_io);
    let proxy_dialer = proxy_dial(agent_id, bus.clone() as Arc<dyn Pubsub>, server_session)
        .await
        .unwrap();

    let agent_session = MuxSession::client(agent_io);
    let agent = spawn_agent(
        agent_session.clone(),
        DialOptions {
            relay_dialer: Some(Arc::new(PipeRelayDialer::new(relay.clone()))),
            ..agent_options
        },
    );

    Harness {
        bus,
        relay,
        agent_id,
        _agent_session: agent_session,
        _proxy_dialer: proxy_dialer,
        agent,
    }
}

async fn client_dial(
    h: &Harness,
    options: DialOptions,
) -> (PeerConn, JoinHandle<Result<(), BrokerError>>) {
    let (client_io, server_io) = memory_pipe();
    let context = options.context.clone();

    let listen = tokio::spawn(proxy_listen(
        h.agent_id,
        h.bus.clone() as Arc<dyn Pubsub>,
        MuxSession::server(server_io),
        context,
    ));

    let signaling = MuxSession::client(client_io);
    let stream = signaling
        .open_stream(StreamKind::Negotiate.encode().unwrap())
        .await
        .unwrap();

    let peer = dial(
        stream,
        Vec::new(),
        DialOptions {
            relay_dialer: Some(Arc::new(PipeRelayDialer::new(h.relay.clone()))),
            ..options
        },
    )
    .await
    .unwrap();

    // Keep the signaling session open for the lifetime of the peer
    let token = peer.cancel_token();
    tokio::spawn(async move {
        token.cancelled().await;
        signaling.close();
    });

    (peer, listen)
}

async fn echo(peer: &PeerConn, payload: &[u8]) -> Vec<u8> {
    let mut stream = peer
        .session()
        .open_stream(StreamKind::Ssh.encode().unwrap())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_negotiation_falls_back_to_relay() {
    let h = harness(DialOptions::default()).await;
    let (peer, listen) = client_dial(&h, DialOptions::default()).await;

    assert_eq!(peer.selected(), &SelectedPath::Relay);
    assert_eq!(echo(&peer, b"over the relay").await, b"over the relay");

    let agent_peer = h.agent.await.unwrap();
    assert_eq!(agent_peer.selected(), &SelectedPath::Relay);

    // Closing the peer unwinds the client-side signaling relay
    peer.close();
    tokio::time::timeout(Duration::from_secs(5), listen)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // ...and the relay, which closes the agent's end
    tokio::time::timeout(Duration::from_secs(5), agent_peer.closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_negotiation_prefers_direct_when_waiting() {
    let h = harness(DialOptions {
        listen_address: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    })
    .await;

    let (peer, _listen) = client_dial(
        &h,
        DialOptions {
            acceptance_wait: Duration::from_secs(2),
            ..Default::default()
        },
    )
    .await;

    assert!(matches!(peer.selected(), SelectedPath::Direct { .. }));
    assert_eq!(echo(&peer, b"direct").await, b"direct");
    peer.close();
}

#[tokio::test]
async fn test_signals_for_other_agents_are_ignored() {
    let h = harness(DialOptions::default()).await;

    // Garbage and foreign-agent traffic on the shared topic
    h.bus
        .publish(PEERBROKER_TOPIC, bytes::Bytes::from_static(b"short"))
        .await
        .unwrap();
    h.bus
        .publish(
            PEERBROKER_TOPIC,
            agentgate_broker::agent_prefixed(Uuid::new_v4(), b"{\"not\":\"ours\"}"),
        )
        .await
        .unwrap();

    let (peer, _listen) = client_dial(&h, DialOptions::default()).await;
    assert_eq!(echo(&peer, b"still works").await, b"still works");
}

#[tokio::test]
async fn test_proxy_listen_stops_on_cancel() {
    let bus: Arc<dyn Pubsub> = Arc::new(MemoryPubsub::new());
    let (_client_io, server_io) = memory_pipe();
    let cancel = CancellationToken::new();

    let listen = tokio::spawn(proxy_listen(
        Uuid::new_v4(),
        bus,
        MuxSession::server(server_io),
        cancel.clone(),
    ));

    cancel.cancel();
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dial_times_out_when_agent_never_answers() {
    init_tracing();
    let (client_io, agent_io) = memory_pipe();
    let client = MuxSession::client(client_io);
    let agent = MuxSession::server(agent_io);

    // The agent takes the offer and goes quiet
    let silent = tokio::spawn(async move {
        let mut stream = agent.accept_stream().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let _ = stream.read(&mut buf).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    let stream = client
        .open_stream(StreamKind::Negotiate.encode().unwrap())
        .await
        .unwrap();
    let started = tokio::time::Instant::now();
    let result = dial(
        stream,
        Vec::new(),
        DialOptions {
            negotiation_timeout: Duration::from_millis(100),
            ..DialOptions::default()
        },
    )
    .await;

    match result {
        Err(BrokerError::Negotiation(message)) => assert!(message.contains("answer")),
        other => panic!("expected negotiation timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    silent.abort();
}
