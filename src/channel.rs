//! Lossy relay between client and server.
//!
//! Real networks drop and delay packets.  To exercise the reliability
//! mechanisms on a single machine, the [`Channel`] sits between the two
//! endpoints: the client addresses the channel instead of the server, and
//! the channel relays every datagram, byte for byte, after applying a
//! configurable fault model:
//!
//! | Fault   | Description                                                    |
//! |---------|----------------------------------------------------------------|
//! | Delay   | Each datagram waits uniformly in `[sleep_v, sleep_factor × sleep_v]`. |
//! | Loss    | Payload segments (client → server) are dropped with `p_drop_client`, pure ACKs (server → client) with `p_drop_server`. |
//!
//! Handshake and teardown always get through: nothing is dropped before
//! `startup_rounds` server → client relays have happened, nor once a FIN has
//! been seen, and segments carrying SYN or FIN are never eligible anyway.
//!
//! # Tasks
//!
//! ```text
//!            client-facing socket                 server-facing socket
//!  client ──▶ forward_client ── delay, drop? ──────────────────────▶ server
//!                  │ notify_one()
//!                  ▼
//!  client ◀── forward_server ◀── drop?, delay ◀─────────────────── server
//!
//!  supervisor: polls both tasks every `supervise_interval`
//! ```
//!
//! The server-side forwarder must not receive before the client side has
//! relayed something.  The two meet through a single-permit
//! rendezvous built on [`Notify`]: each successful relay stores the permit, each server-side
//! receive consumes it first, so a burst of relays counts once.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::packet::Header;
use crate::socket::{is_peer_gone, Socket, SocketError};

/// Default client-facing port.
pub const DEFAULT_PORT: u16 = 5007;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fault-model parameters.
///
/// Clients carry a copy too, to tag their latency records with the
/// conditions the data travelled under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelParams {
    /// Base delay.
    pub sleep_v: Duration,
    /// Maximum delay as a multiple of `sleep_v`.
    pub sleep_factor: f64,
    /// Probability of dropping a pure ACK from the server.
    pub p_drop_server: f64,
    /// Probability of dropping a payload segment from the client.
    pub p_drop_client: f64,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            sleep_v: Duration::from_millis(50),
            sleep_factor: 4.0,
            p_drop_server: 0.0,
            p_drop_client: 0.0,
        }
    }
}

impl ChannelParams {
    pub fn validate(&self) -> Result<(), ChannelError> {
        for (name, p) in [
            ("p_drop_server", self.p_drop_server),
            ("p_drop_client", self.p_drop_client),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ChannelError::InvalidConfig(format!(
                    "{name} must lie in [0, 1], got {p}"
                )));
            }
        }
        if !(self.sleep_factor >= 1.0 && self.sleep_factor.is_finite()) {
            return Err(ChannelError::InvalidConfig(format!(
                "sleep_factor must be a finite value >= 1, got {}",
                self.sleep_factor
            )));
        }
        if self.sleep_v.is_zero() {
            return Err(ChannelError::InvalidConfig("sleep_v must be positive".into()));
        }
        Ok(())
    }

    /// Draw a propagation delay in `[sleep_v, sleep_factor × sleep_v]`.
    pub fn delay(&self) -> Duration {
        let lo = self.sleep_v.as_secs_f64();
        let hi = lo * self.sleep_factor;
        if hi > lo {
            Duration::from_secs_f64(rand::rng().random_range(lo..=hi))
        } else {
            self.sleep_v
        }
    }
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Client-facing address to bind.
    pub listen: SocketAddr,
    /// Where the server listens.
    pub server: SocketAddr,
    pub params: ChannelParams,
    /// Bound on each relay receive; expiry only means "nothing this cycle".
    pub recv_timeout: Duration,
    /// Server → client relays to let through before any drop.
    pub startup_rounds: u32,
    /// How often the supervisor checks on the forwarders.
    pub supervise_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server: SocketAddr::from(([127, 0, 0, 1], crate::server::DEFAULT_PORT)),
            params: ChannelParams::default(),
            recv_timeout: Duration::from_secs(3),
            startup_rounds: 2,
            supervise_interval: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ChannelError> {
        self.params.validate()?;
        if self.recv_timeout.is_zero() || self.supervise_interval.is_zero() {
            return Err(ChannelError::InvalidConfig(
                "recv_timeout and supervise_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Errors raised by the channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Link state and the drop decision
// ---------------------------------------------------------------------------

/// State shared by both forwarders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    /// Completed server → client relays.
    pub round: u32,
    /// A FIN has passed; nothing is dropped any more.
    pub teardown_started: bool,
    pub client_msg_drop_count: u64,
    pub server_ack_drop_count: u64,
    /// Most recent client address; server replies are relayed there.
    pub client_addr: Option<SocketAddr>,
}

/// Counters reported by a running or finished channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub rounds: u32,
    pub client_msg_drop_count: u64,
    pub server_ack_drop_count: u64,
}

impl From<&LinkState> for ChannelStats {
    fn from(link: &LinkState) -> Self {
        Self {
            rounds: link.round,
            client_msg_drop_count: link.client_msg_drop_count,
            server_ack_drop_count: link.server_ack_drop_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Whether a datagram with `header` travelling in `direction` is dropped,
/// given a uniform `roll` in `[0, 1)`.
///
/// Only payload segments (client side) and pure ACKs (server side) are
/// eligible, and only after the startup rounds and before teardown.
pub fn should_drop(
    direction: Direction,
    header: &Header,
    link: &LinkState,
    startup_rounds: u32,
    probability: f64,
    roll: f64,
) -> bool {
    let eligible = match direction {
        Direction::ClientToServer => header.is_payload(),
        Direction::ServerToClient => header.is_pure_ack(),
    };
    eligible && link.round >= startup_rounds && !link.teardown_started && roll < probability
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Single-permit wake-up from the client-side forwarder to the server side.
///
/// Signals that arrive before a `wait` collapse into one: a burst of relayed
/// segments lets the server side read exactly one reply.
#[derive(Debug, Default)]
struct Rendezvous(Notify);

impl Rendezvous {
    fn signal(&self) {
        self.0.notify_one();
    }

    async fn wait(&self) {
        self.0.notified().await;
    }
}

/// Everything a forwarder task needs.
#[derive(Clone)]
struct Relay {
    client_side: Arc<Socket>,
    server_side: Arc<Socket>,
    server: SocketAddr,
    params: ChannelParams,
    recv_timeout: Duration,
    startup_rounds: u32,
    link: Arc<Mutex<LinkState>>,
    wake_server: Arc<Rendezvous>,
}

impl Relay {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stops a channel and reads its counters from another task.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    shutdown: Arc<watch::Sender<bool>>,
    link: Arc<Mutex<LinkState>>,
}

impl ChannelHandle {
    /// Ask both forwarders and the supervisor to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats::from(&*self.link.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A bound, not yet running, lossy relay.
pub struct Channel {
    relay: Relay,
    supervise_interval: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Channel {
    /// Bind the client-facing socket on `config.listen` and an ephemeral
    /// server-facing socket.
    pub async fn bind(config: ChannelConfig) -> Result<Self, ChannelError> {
        config.validate()?;

        let client_side = Socket::bind(config.listen).await?;
        let unspecified = if config.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let server_side = Socket::bind(unspecified).await?;
        log::info!(
            "[channel] relaying {} <-> {} via {}",
            client_side.local_addr,
            config.server,
            server_side.local_addr
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            relay: Relay {
                client_side: Arc::new(client_side),
                server_side: Arc::new(server_side),
                server: config.server,
                params: config.params,
                recv_timeout: config.recv_timeout,
                startup_rounds: config.startup_rounds,
                link: Arc::new(Mutex::new(LinkState::default())),
                wake_server: Arc::new(Rendezvous::default()),
            },
            supervise_interval: config.supervise_interval,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Address clients should send to.
    pub fn local_addr(&self) -> SocketAddr {
        self.relay.client_side.local_addr
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shutdown: Arc::clone(&self.shutdown),
            link: Arc::clone(&self.relay.link),
        }
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats::from(&*self.relay.link())
    }

    /// Run both forwarders under the supervisor until either forwarder
    /// exits or shutdown is requested; returns the final counters.
    pub async fn run(self) -> ChannelStats {
        let client_task: JoinHandle<Result<(), ChannelError>> =
            tokio::spawn(forward_client(self.relay.clone(), self.shutdown.subscribe()));
        let server_task: JoinHandle<Result<(), ChannelError>> =
            tokio::spawn(forward_server(self.relay.clone(), self.shutdown.subscribe()));

        let mut stop = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.supervise_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.stats();
                    log::info!(
                        "[channel] round: {} ongoing; dropped {} client messages, {} server acks",
                        stats.rounds,
                        stats.client_msg_drop_count,
                        stats.server_ack_drop_count
                    );
                    if client_task.is_finished() || server_task.is_finished() {
                        log::info!("[channel] shutting down channel; client/server forwarders not running");
                        break;
                    }
                }
                _ = stop.changed() => {
                    log::info!("[channel] shutdown requested");
                    break;
                }
            }
        }

        self.shutdown.send_replace(true);
        for (name, task) in [("client", client_task), ("server", server_task)] {
            match task.await {
                Ok(Ok(())) => log::debug!("[channel] {name} forwarder stopped"),
                Ok(Err(e)) => log::error!("[channel] {name} forwarder failed: {e}"),
                Err(e) => log::error!("[channel] {name} forwarder panicked: {e}"),
            }
        }
        self.stats()
    }
}

// ---------------------------------------------------------------------------
// Forwarders
// ---------------------------------------------------------------------------

/// Outcome of one bounded relay receive.
enum Received {
    Datagram(Vec<u8>, Header, SocketAddr),
    Nothing,
    Stop,
}

async fn receive(
    socket: &Socket,
    wait: Duration,
    stop: &mut watch::Receiver<bool>,
    side: &str,
) -> Result<Received, ChannelError> {
    let result = tokio::select! {
        _ = stop.changed() => return Ok(Received::Stop),
        r = socket.recv_bytes_from(wait) => r,
    };
    let (datagram, from) = match result {
        Ok(received) => received,
        Err(SocketError::ReceiveTimeout) => {
            log::warn!("[channel] {side} channel timeout, message lost");
            return Ok(Received::Nothing);
        }
        Err(SocketError::Io(e)) if is_peer_gone(&e) => {
            log::warn!("[channel] {side} unreachable: {e}");
            return Ok(Received::Nothing);
        }
        Err(e) => return Err(e.into()),
    };
    match Header::decode(&datagram) {
        Ok(header) => Ok(Received::Datagram(datagram, header, from)),
        Err(e) => {
            log::warn!("[channel] {side} sent an undecodable datagram: {e}");
            Ok(Received::Nothing)
        }
    }
}

/// Relay `datagram`; a transient send failure loses it, anything else ends
/// the forwarder.
async fn relay_to(socket: &Socket, datagram: &[u8], dest: SocketAddr) -> Result<bool, ChannelError> {
    match socket.send_bytes_to(datagram, dest).await {
        Ok(()) => Ok(true),
        Err(SocketError::SendTimeout(e)) => {
            log::warn!("[channel] relay to {dest} failed, message lost: {e}");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn forward_client(relay: Relay, mut stop: watch::Receiver<bool>) -> Result<(), ChannelError> {
    loop {
        if *stop.borrow() {
            log::info!("[channel] terminate is set; leaving client loop");
            return Ok(());
        }
        log::debug!("[channel] waiting on client");

        let (datagram, header, from) =
            match receive(&relay.client_side, relay.recv_timeout, &mut stop, "client").await? {
                Received::Datagram(datagram, header, from) => (datagram, header, from),
                Received::Nothing => continue,
                Received::Stop => return Ok(()),
            };

        let wait = relay.params.delay();
        tokio::time::sleep(wait).await;
        log::info!("[channel] channel delaying client->server for {wait:?}");

        let dropped = {
            let mut link = relay.link();
            link.client_addr = Some(from);
            if header.fin {
                link.teardown_started = true;
            }
            let roll: f64 = rand::rng().random();
            let dropped = should_drop(
                Direction::ClientToServer,
                &header,
                &link,
                relay.startup_rounds,
                relay.params.p_drop_client,
                roll,
            );
            if dropped {
                link.client_msg_drop_count += 1;
            }
            dropped
        };
        if dropped {
            log::info!("[channel] DROPPING MESSAGE FROM CLIENT");
            continue;
        }

        log::info!("[channel] channel forwarding to server");
        if !relay_to(&relay.server_side, &datagram, relay.server).await? {
            continue;
        }
        tokio::time::sleep(relay.params.sleep_v).await;
        relay.wake_server.signal();
    }
}

async fn forward_server(relay: Relay, mut stop: watch::Receiver<bool>) -> Result<(), ChannelError> {
    loop {
        if *stop.borrow() {
            log::info!("[channel] terminate is set; leaving server loop");
            return Ok(());
        }
        log::debug!("[channel] waiting on server response (can hang if server does not resend)");

        tokio::select! {
            _ = stop.changed() => return Ok(()),
            _ = relay.wake_server.wait() => {}
        }

        let (datagram, header) =
            match receive(&relay.server_side, relay.recv_timeout, &mut stop, "server").await? {
                Received::Datagram(datagram, header, _) => (datagram, header),
                Received::Nothing => continue,
                Received::Stop => return Ok(()),
            };

        let (dropped, client) = {
            let mut link = relay.link();
            let roll: f64 = rand::rng().random();
            let dropped = should_drop(
                Direction::ServerToClient,
                &header,
                &link,
                relay.startup_rounds,
                relay.params.p_drop_server,
                roll,
            );
            if dropped {
                link.server_ack_drop_count += 1;
            }
            (dropped, link.client_addr)
        };
        if dropped {
            log::info!("[channel] DROPPING ACK FROM SERVER");
            continue;
        }
        let Some(client) = client else {
            log::warn!("[channel] no client address yet; discarding server datagram");
            continue;
        };

        log::info!("[channel] channel forwarding to client (addr = {client})");
        let wait = relay.params.delay();
        tokio::time::sleep(wait).await;
        log::info!("[channel] channel delaying server->client for {wait:?}");

        if !relay_to(&relay.client_side, &datagram, client).await? {
            continue;
        }
        tokio::time::sleep(relay.params.sleep_v).await;
        relay.link().round += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Segment;

    fn link(round: u32, teardown_started: bool) -> LinkState {
        LinkState {
            round,
            teardown_started,
            ..LinkState::default()
        }
    }

    #[test]
    fn payload_dropped_only_after_startup_rounds() {
        let data = Segment::data(1, 1, b"x".to_vec()).header;
        let c2s = Direction::ClientToServer;
        assert!(!should_drop(c2s, &data, &link(0, false), 2, 1.0, 0.0));
        assert!(!should_drop(c2s, &data, &link(1, false), 2, 1.0, 0.0));
        assert!(should_drop(c2s, &data, &link(2, false), 2, 1.0, 0.0));
    }

    #[test]
    fn control_segments_are_never_dropped() {
        let c2s = Direction::ClientToServer;
        let s2c = Direction::ServerToClient;
        let busy = link(10, false);
        for seg in [Segment::syn(1, 12), Segment::ack(1, 1), Segment::fin(1, 1)] {
            assert!(!should_drop(c2s, &seg.header, &busy, 2, 1.0, 0.0));
        }
        for seg in [Segment::syn_ack(1, 1), Segment::fin_ack(1, 1)] {
            assert!(!should_drop(s2c, &seg.header, &busy, 2, 1.0, 0.0));
        }
        assert!(should_drop(s2c, &Segment::ack(1, 1).header, &busy, 2, 1.0, 0.0));
    }

    #[test]
    fn nothing_dropped_after_teardown_started() {
        let data = Segment::data(1, 1, b"x".to_vec()).header;
        assert!(!should_drop(Direction::ClientToServer, &data, &link(5, true), 2, 1.0, 0.0));
        let ack = Segment::ack(1, 1).header;
        assert!(!should_drop(Direction::ServerToClient, &ack, &link(5, true), 2, 1.0, 0.0));
    }

    #[test]
    fn zero_probability_never_drops() {
        let data = Segment::data(1, 1, b"x".to_vec()).header;
        assert!(!should_drop(Direction::ClientToServer, &data, &link(5, false), 2, 0.0, 0.0));
    }

    #[test]
    fn delay_stays_within_bounds() {
        let params = ChannelParams {
            sleep_v: Duration::from_millis(10),
            sleep_factor: 3.0,
            ..ChannelParams::default()
        };
        for _ in 0..100 {
            let d = params.delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(30));
        }
    }

    #[test]
    fn invalid_params_are_rejected() {
        let bad_p = ChannelParams {
            p_drop_client: 1.5,
            ..ChannelParams::default()
        };
        assert!(matches!(bad_p.validate(), Err(ChannelError::InvalidConfig(_))));

        let bad_factor = ChannelParams {
            sleep_factor: 0.5,
            ..ChannelParams::default()
        };
        assert!(bad_factor.validate().is_err());

        let bad_sleep = ChannelParams {
            sleep_v: Duration::ZERO,
            ..ChannelParams::default()
        };
        assert!(bad_sleep.validate().is_err());
        assert!(ChannelParams::default().validate().is_ok());
    }

    #[tokio::test]
    async fn rendezvous_burst_wakes_once() {
        let rendezvous = Rendezvous::default();
        for _ in 0..3 {
            rendezvous.signal();
        }

        tokio::time::timeout(Duration::from_millis(50), rendezvous.wait())
            .await
            .expect("stored signal should wake the first wait");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rendezvous.wait())
                .await
                .is_err(),
            "a burst of signals must count once"
        );
    }

    #[tokio::test]
    async fn rendezvous_wait_blocks_until_signalled() {
        let rendezvous = Arc::new(Rendezvous::default());
        let waiter = tokio::spawn({
            let rendezvous = Arc::clone(&rendezvous);
            async move { rendezvous.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        rendezvous.signal();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn handle_stops_a_running_channel() {
        let channel = Channel::bind(ChannelConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            server: "127.0.0.1:9".parse().unwrap(),
            recv_timeout: Duration::from_millis(50),
            supervise_interval: Duration::from_millis(20),
            ..ChannelConfig::default()
        })
        .await
        .unwrap();
        let handle = channel.handle();
        let running = tokio::spawn(channel.run());

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown();
        let stats = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("channel did not stop")
            .unwrap();
        assert_eq!(stats, ChannelStats::default());
    }
}
