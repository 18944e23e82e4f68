//! Server endpoint: socket driver around the passive-opener state machine.
//!
//! [`Server`] owns the UDP socket, the [`Receiver`] transition function and
//! an injected [`PayloadSink`].  Each [`step`](Server::step) performs one
//! time-bounded receive, feeds the segment to the receiver and carries out
//! the resulting effects.  After a connection's `TIME_WAIT` the server is
//! back in `LISTEN`; [`run`](Server::run) keeps doing this forever.

use std::net::SocketAddr;

use crate::connection::ConnError;
use crate::packet::{Header, Segment};
use crate::receiver::{Effect, Receiver};
use crate::sink::PayloadSink;
use crate::socket::{is_peer_gone, Socket, SocketError};
use crate::state::ConnectionState;
use crate::timer::{time_wait, TimerConfig};

/// Default server port.
pub const DEFAULT_PORT: u16 = 5008;

/// Transient send failures tolerated per reply.
const REPLY_SEND_TRIES: u32 = 5;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind.
    pub bind: SocketAddr,
    pub timers: TimerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            timers: TimerConfig::default(),
        }
    }
}

/// A listening server endpoint.
pub struct Server<S: PayloadSink> {
    socket: Socket,
    receiver: Receiver,
    sink: S,
    timers: TimerConfig,
}

impl<S: PayloadSink> Server<S> {
    /// Bind the socket and move straight to `LISTEN`.
    pub async fn bind(config: ServerConfig, sink: S) -> Result<Self, ConnError> {
        let socket = Socket::bind(config.bind).await?;
        log::debug!("[server] Starting server on {}", socket.local_addr);

        let mut receiver = Receiver::new();
        receiver.listen();
        Ok(Self {
            socket,
            receiver,
            sink,
            timers: config.timers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.receiver.state()
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Receive at most one segment and apply it.
    ///
    /// Returns the finished connection's message once its `TIME_WAIT` has
    /// been served, `None` otherwise (including when nothing arrived).
    pub async fn step(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        let (segment, addr) = match self.socket.recv_from(self.timers.recv_timeout).await {
            Ok(received) => received,
            Err(SocketError::ReceiveTimeout) => return Ok(None),
            Err(SocketError::Decode(e)) => {
                log::warn!("[server] {e}");
                return Ok(None);
            }
            Err(SocketError::Io(e)) if is_peer_gone(&e) => {
                log::warn!("[server] peer unreachable: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        log::debug!(
            "[server] RECEIVED from {addr} ({} body bytes)\n{}",
            segment.body.len(),
            segment.header
        );

        let mut persist_err = None;
        let mut finished = None;
        for effect in self.receiver.on_segment(&segment) {
            match effect {
                Effect::Reply(header) => self.reply(header, addr).await,
                Effect::Deliver { seq_num, body } => {
                    let message = self.receiver.message();
                    if let Err(e) = self.sink.deliver(seq_num, &body, &message) {
                        log::error!("[server] could not persist seq_num {seq_num}: {e}");
                        persist_err.get_or_insert(e);
                    }
                }
                Effect::Duplicate { .. } => {}
                Effect::EnterTimeWait => {
                    time_wait(&self.timers, "server").await;
                    finished = Some(self.receiver.finish_time_wait());
                }
            }
        }

        match persist_err {
            Some(e) => Err(ConnError::Persist(e)),
            None => Ok(finished),
        }
    }

    /// Step until one connection has been torn down and the server is
    /// listening again; returns that connection's message.
    ///
    /// Persistence failures are logged and do not end the connection.
    pub async fn serve_connection(&mut self) -> Result<Vec<u8>, ConnError> {
        loop {
            match self.step().await {
                Ok(Some(message)) => return Ok(message),
                Ok(None) | Err(ConnError::Persist(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Serve connections forever.
    pub async fn run(mut self) -> Result<(), ConnError> {
        log::debug!("[server] Beginning infinite loop to listen for client connections");
        loop {
            let message = self.serve_connection().await?;
            log::info!(
                "[server] connection closed after delivering {} bytes",
                message.len()
            );
        }
    }

    /// Send a header-only reply.  A failed send is logged, not raised: the
    /// client retransmits and the reply is produced again.
    async fn reply(&self, header: Header, dest: SocketAddr) {
        log::debug!("[server] SENDING to {dest}\n{header}");
        let segment = Segment::control(header);
        if let Err(e) = self
            .socket
            .send_retrying(&segment, dest, Some(REPLY_SEND_TRIES))
            .await
        {
            log::error!("[server] reply to {dest} lost: {e}");
        }
    }
}
