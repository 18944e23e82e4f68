//! Fault-injection behaviour of the channel as seen by real endpoints.
//!
//! Drop probabilities of 1.0 make the outcomes deterministic: only the
//! startup and teardown exemptions let anything through.

use std::net::SocketAddr;
use std::time::Duration;

use rdt_udp::{
    channel::{Channel, ChannelConfig, ChannelHandle, ChannelParams},
    client::{Client, ClientConfig},
    connection::ConnError,
    server::{Server, ServerConfig},
    sink::MemorySink,
    state::ConnectionState,
    timer::TimerConfig,
};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast_timers() -> TimerConfig {
    TimerConfig {
        recv_timeout: Duration::from_millis(100),
        msl: Duration::from_millis(10),
    }
}

/// Server (stepping forever in the background) behind a channel with the
/// given drop probabilities; returns a client config aimed at the channel.
async fn setup(p_drop_client: f64, p_drop_server: f64) -> (ClientConfig, ChannelHandle) {
    let server = Server::bind(
        ServerConfig {
            bind: loopback(),
            timers: fast_timers(),
        },
        MemorySink::default(),
    )
    .await
    .unwrap();
    let server_addr = server.local_addr();
    tokio::spawn(server.run());

    let params = ChannelParams {
        sleep_v: Duration::from_millis(1),
        sleep_factor: 2.0,
        p_drop_server,
        p_drop_client,
    };
    let channel = Channel::bind(ChannelConfig {
        listen: loopback(),
        server: server_addr,
        params,
        recv_timeout: Duration::from_millis(500),
        supervise_interval: Duration::from_millis(50),
        ..ChannelConfig::default()
    })
    .await
    .unwrap();
    let handle = channel.handle();
    let channel_addr = channel.local_addr();
    tokio::spawn(channel.run());

    let config = ClientConfig {
        bind: loopback(),
        server: channel_addr,
        max_segment_size: 4,
        max_attempts: 3,
        timers: fast_timers(),
        channel: params,
    };
    (config, handle)
}

/// Every payload segment is doomed, yet the handshake completes and the
/// first chunk (sent before two rounds have passed) gets through.
#[tokio::test]
async fn startup_rounds_spare_handshake_and_first_chunk() {
    let (config, channel) = setup(1.0, 0.0).await;
    let mut client = Client::bind(config).await.unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Established);

    let err = client.send_reliable(b"HELLO WORLD").await.unwrap_err();
    match err {
        ConnError::AttemptsExhausted { chunk, attempts } => assert_eq!((chunk, attempts), (1, 3)),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(!client.peer_alive());
    assert_eq!(client.state(), ConnectionState::Closed);

    let stats = channel.stats();
    assert_eq!(stats.client_msg_drop_count, 3);
    assert_eq!(stats.server_ack_drop_count, 0);
    channel.shutdown();
}

/// Every pure ACK after startup is doomed; the transfer stalls on the
/// second chunk.
#[tokio::test]
async fn server_ack_drops_stall_second_chunk() {
    let (config, channel) = setup(0.0, 1.0).await;
    let mut client = Client::bind(config).await.unwrap();
    client.connect().await.unwrap();

    let err = client.send_reliable(b"HELLO WORLD").await.unwrap_err();
    assert!(matches!(err, ConnError::AttemptsExhausted { chunk: 1, .. }));
    assert!(channel.stats().server_ack_drop_count >= 1);
    channel.shutdown();
}

/// Teardown is never dropped, whatever the probabilities.
#[tokio::test]
async fn teardown_survives_certain_loss() {
    let (config, channel) = setup(1.0, 1.0).await;
    let mut client = Client::bind(config).await.unwrap();
    client.connect().await.unwrap();

    let records = client.send_reliable(b"HELL").await.unwrap();
    assert_eq!(records.len(), 1);

    let conn = client.terminate().await.unwrap();
    assert_eq!(conn.state, ConnectionState::Closed);
    assert_eq!(channel.stats().client_msg_drop_count, 0);
    channel.shutdown();
}
