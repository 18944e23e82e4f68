//! Client endpoint: the active opener.
//!
//! A [`Client`] owns one UDP socket addressed at a single peer (the server,
//! or a channel standing in front of it) and drives the connection through
//!
//! ```text
//! CLOSED ─SYN→ SYN_SENT ─SYN-ACK→ SYNACK_RECEIVED → ACK_SENT → ESTABLISHED
//! ESTABLISHED ─FIN→ FIN_SENT ─FIN-ACK→ FINACK_RECEIVED → ACK_SENT → TIME_WAIT
//! ```
//!
//! Data is sent stop-and-wait: one chunk of at most `max_segment_size`
//! bytes in flight, resent on every receive timeout until acknowledged or
//! until the attempt ceiling is reached.  The endpoint runs on a single task
//! and performs one bounded receive at a time.

use std::net::SocketAddr;

use tokio::time::Instant;

use crate::channel::ChannelParams;
use crate::connection::{initial_sequence_number, ConnError, Connection};
use crate::packet::{Segment, MSS_MAX};
use crate::sender::{AckOutcome, ChunkAck, Sender, DEFAULT_MAX_ATTEMPTS};
use crate::socket::{is_peer_gone, Socket, SocketError};
use crate::state::ConnectionState;
use crate::timer::{time_wait, TimerConfig};

/// Default maximum segment size announced in the SYN.
pub const DEFAULT_MSS: u8 = 12;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local address; port `0` picks an ephemeral one.
    pub bind: SocketAddr,
    /// Where segments are sent: the server or a channel.
    pub server: SocketAddr,
    /// Chunk size announced to the server, `1..=15`.
    pub max_segment_size: u8,
    /// Timeouts tolerated per chunk (and for the FIN) before giving up.
    pub max_attempts: u32,
    pub timers: TimerConfig,
    /// Copied into every [`ChunkAck`].
    pub channel: ChannelParams,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            server: SocketAddr::from(([127, 0, 0, 1], crate::channel::DEFAULT_PORT)),
            max_segment_size: DEFAULT_MSS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timers: TimerConfig::default(),
            channel: ChannelParams::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConnError> {
        if !(1..=MSS_MAX).contains(&self.max_segment_size) {
            return Err(ConnError::InvalidConfig(format!(
                "max_segment_size must lie in 1..={MSS_MAX}, got {}",
                self.max_segment_size
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConnError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.timers.recv_timeout.is_zero() {
            return Err(ConnError::InvalidConfig("recv_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// The active-opener endpoint.
pub struct Client {
    socket: Socket,
    peer: SocketAddr,
    conn: Connection,
    config: ClientConfig,
    peer_alive: bool,
}

impl Client {
    /// Bind the local socket; the connection starts in `CLOSED`.
    pub async fn bind(config: ClientConfig) -> Result<Self, ConnError> {
        config.validate()?;
        let socket = Socket::bind(config.bind).await?;
        log::debug!(
            "[client] bound {} for peer {}",
            socket.local_addr,
            config.server
        );
        Ok(Self {
            socket,
            peer: config.server,
            conn: Connection::new("client", config.max_segment_size),
            config,
            peer_alive: true,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// `false` once a transfer gave up on the peer.
    pub fn peer_alive(&self) -> bool {
        self.peer_alive
    }

    /// One handshake attempt.
    ///
    /// Sends a SYN with a fresh initial sequence number and waits one
    /// receive timeout for the matching SYN-ACK.  Without it the client is
    /// back in `CLOSED` and the error is
    /// [`SocketError::ReceiveTimeout`]; calling again retries.
    pub async fn handshake(&mut self) -> Result<(), ConnError> {
        self.conn.require(ConnectionState::Closed)?;

        let isn = initial_sequence_number();
        self.conn.seq_num = isn;
        self.conn.ack_num = 0;
        let syn = Segment::syn(isn, self.conn.max_segment_size);
        log::debug!("[client] SENDING SYN to {}\n{}", self.peer, syn.header);
        self.socket.send_retrying(&syn, self.peer, None).await?;
        self.conn.update_state(ConnectionState::SynSent);

        let deadline = Instant::now() + self.config.timers.recv_timeout;
        let synack = loop {
            match self.recv_from_peer(deadline).await {
                Ok(reply) => {
                    let h = reply.header;
                    if h.syn && h.ack && h.ack_num == isn.wrapping_add(1) {
                        break h;
                    }
                    log::debug!("[client] not the SYN-ACK for isn {isn}, still waiting");
                }
                Err(e) => {
                    log::info!("[client] handshake did not complete: {e}");
                    self.conn.update_state(ConnectionState::Closed);
                    return Err(e);
                }
            }
        };

        self.conn.update_state(ConnectionState::SynAckReceived);
        self.conn.sync_from(&synack);
        self.conn.trace_numbers();

        let ack = Segment::ack(self.conn.seq_num, self.conn.ack_num);
        log::debug!("[client] SENDING handshake ACK\n{}", ack.header);
        self.send(&ack).await?;
        self.conn.update_state(ConnectionState::AckSent);
        self.conn.update_state(ConnectionState::Established);
        Ok(())
    }

    /// Repeat [`handshake`](Self::handshake) until the connection is
    /// established.  There is no attempt limit.
    pub async fn connect(&mut self) -> Result<(), ConnError> {
        loop {
            match self.handshake().await {
                Ok(()) => return Ok(()),
                Err(ConnError::Socket(SocketError::ReceiveTimeout)) => {
                    log::info!("[client] no SYN-ACK, resending SYN");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send `message` reliably, one chunk at a time.
    ///
    /// Returns one [`ChunkAck`] per chunk, in order.  When a chunk stays
    /// unacknowledged for `max_attempts` timeouts the transfer is abandoned:
    /// the remaining chunks are not sent, the client is back in `CLOSED` and
    /// [`peer_alive`](Self::peer_alive) turns `false`.
    pub async fn send_reliable(&mut self, message: &[u8]) -> Result<Vec<ChunkAck>, ConnError> {
        self.conn.require(ConnectionState::Established)?;

        let mss = usize::from(self.conn.max_segment_size);
        let mut sender = Sender::new(self.config.max_attempts, self.config.channel);

        for (index, chunk) in message.chunks(mss).enumerate() {
            let segment = Segment::data(self.conn.seq_num, self.conn.ack_num, chunk.to_vec());
            log::debug!(
                "[client] SENDING chunk {index} ({} bytes)\n{}",
                chunk.len(),
                segment.header
            );
            self.send(&segment).await?;
            sender.record_sent(index, segment);

            let mut deadline = Instant::now() + self.config.timers.recv_timeout;
            loop {
                let reply = match self.recv_from_peer(deadline).await {
                    Ok(reply) => reply,
                    Err(ConnError::Socket(SocketError::ReceiveTimeout)) => {
                        let resend = match sender.on_timeout() {
                            Ok(segment) => segment.clone(),
                            Err(e) => {
                                log::error!("[client] {e}");
                                self.peer_alive = false;
                                self.conn.update_state(ConnectionState::Closed);
                                return Err(e);
                            }
                        };
                        log::info!(
                            "[client] timeout waiting for ACK of chunk {index} (attempt {}), resending",
                            sender.attempts()
                        );
                        self.send(&resend).await?;
                        deadline = Instant::now() + self.config.timers.recv_timeout;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                match sender.classify(&reply.header) {
                    AckOutcome::Acknowledged => {
                        self.conn.sync_from(&reply.header);
                        self.conn.trace_numbers();
                        if let Some(record) = sender.on_ack() {
                            log::info!(
                                "[client] chunk {index} acknowledged after {:?}",
                                record.time_to_ack
                            );
                        }
                        break;
                    }
                    AckOutcome::Stale => {
                        log::debug!(
                            "[client] stale ACK (seq_num={}, ack_num={}) answers an earlier send, still waiting",
                            reply.header.seq_num,
                            reply.header.ack_num
                        );
                    }
                    AckOutcome::Ignored => {
                        log::debug!("[client] ignoring non-ACK reply while waiting");
                    }
                }
            }
        }

        Ok(sender.into_records())
    }

    /// Close the connection: FIN, wait for FIN-ACK, final ACK, `TIME_WAIT`.
    ///
    /// Consumes the client; the socket is released after `TIME_WAIT` and the
    /// final connection state is returned.
    pub async fn terminate(mut self) -> Result<Connection, ConnError> {
        self.conn.require(ConnectionState::Established)?;

        let fin = Segment::fin(self.conn.seq_num, self.conn.ack_num);
        log::debug!("[client] SENDING FIN\n{}", fin.header);
        self.send(&fin).await?;
        self.conn.update_state(ConnectionState::FinSent);

        let mut attempts = 0u32;
        let mut deadline = Instant::now() + self.config.timers.recv_timeout;
        let finack = loop {
            match self.recv_from_peer(deadline).await {
                Ok(reply) if reply.header.fin && reply.header.ack => break reply.header,
                Ok(_) => log::debug!("[client] waiting for FIN-ACK, ignoring reply"),
                Err(ConnError::Socket(SocketError::ReceiveTimeout)) => {
                    attempts += 1;
                    if attempts >= self.config.max_attempts {
                        self.peer_alive = false;
                        self.conn.update_state(ConnectionState::Closed);
                        return Err(ConnError::TeardownExhausted { attempts });
                    }
                    log::info!("[client] no FIN-ACK (attempt {attempts}), resending FIN");
                    self.send(&fin).await?;
                    deadline = Instant::now() + self.config.timers.recv_timeout;
                }
                Err(e) => return Err(e),
            }
        };

        self.conn.update_state(ConnectionState::FinAckReceived);
        self.conn.sync_from(&finack);
        self.conn.trace_numbers();

        let ack = Segment::ack(self.conn.seq_num, self.conn.ack_num);
        log::debug!("[client] SENDING final ACK\n{}", ack.header);
        self.send(&ack).await?;
        self.conn.update_state(ConnectionState::AckSent);
        self.conn.update_state(ConnectionState::TimeWait);

        time_wait(&self.config.timers, "client").await;
        log::debug!("[client] TIME_WAIT over, closing socket");
        self.conn.update_state(ConnectionState::Closed);
        Ok(self.conn)
    }

    // -----------------------------------------------------------------------
    // I/O helpers
    // -----------------------------------------------------------------------

    async fn send(&self, segment: &Segment) -> Result<(), ConnError> {
        self.socket
            .send_retrying(segment, self.peer, Some(self.config.max_attempts))
            .await?;
        Ok(())
    }

    /// Next decodable segment from the peer, or `ReceiveTimeout` at
    /// `deadline`.  Datagrams from anyone else are dropped.
    async fn recv_from_peer(&self, deadline: Instant) -> Result<Segment, ConnError> {
        loop {
            match self.socket.recv_until(deadline).await {
                Ok((segment, from)) if from == self.peer => {
                    log::debug!(
                        "[client] RECEIVED ({} body bytes)\n{}",
                        segment.body.len(),
                        segment.header
                    );
                    return Ok(segment);
                }
                Ok((_, from)) => log::warn!("[client] ignoring datagram from stranger {from}"),
                Err(SocketError::Decode(e)) => log::warn!("[client] {e}"),
                Err(SocketError::Io(e)) if is_peer_gone(&e) => {
                    log::warn!("[client] peer unreachable: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn mss_outside_header_field_is_rejected() {
        for mss in [0, 16] {
            let config = ClientConfig {
                max_segment_size: mss,
                ..ClientConfig::default()
            };
            assert!(matches!(config.validate(), Err(ConnError::InvalidConfig(_))));
        }
    }

    #[tokio::test]
    async fn data_before_handshake_is_refused() {
        let mut client = Client::bind(ClientConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            server: "127.0.0.1:9".parse().unwrap(),
            ..ClientConfig::default()
        })
        .await
        .unwrap();

        let err = client.send_reliable(b"early").await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::BadState {
                expected: ConnectionState::Established,
                actual: ConnectionState::Closed
            }
        ));
    }

    #[tokio::test]
    async fn silent_peer_leaves_client_closed() {
        let silent = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut client = Client::bind(ClientConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            server: silent.local_addr,
            timers: TimerConfig {
                recv_timeout: Duration::from_millis(30),
                msl: Duration::from_millis(1),
            },
            ..ClientConfig::default()
        })
        .await
        .unwrap();

        let err = client.handshake().await.unwrap_err();
        assert!(matches!(err, ConnError::Socket(SocketError::ReceiveTimeout)));
        assert_eq!(client.state(), ConnectionState::Closed);

        let (syn, _) = silent.recv_from(Duration::from_secs(1)).await.unwrap();
        assert!(syn.header.syn && !syn.header.ack);
        assert_eq!(syn.header.mss, DEFAULT_MSS);
    }
}
