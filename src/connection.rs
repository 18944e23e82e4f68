//! Per-connection state shared by both endpoint roles.
//!
//! A [`Connection`] is the Connection State of one endpoint: the FSM state,
//! the local sequence / acknowledgment numbers and the negotiated maximum
//! segment size.  It is created when the endpoint starts, mutated only by
//! that endpoint's own event loop, and dropped with the endpoint.
//!
//! Sequence arithmetic is modular (`wrapping_add`), as in TCP; nothing here
//! ever compares sequence numbers for ordering, only for equality.

use std::io;

use rand::Rng;
use thiserror::Error;

use crate::packet::Header;
use crate::socket::SocketError;
use crate::state::ConnectionState;

/// Initial sequence numbers are drawn from `0..ISN_SPACE`.
///
/// Kept deliberately small so traces stay readable.
pub const ISN_SPACE: u32 = 32;

/// Choose a random initial sequence number.
pub fn initial_sequence_number() -> u32 {
    rand::rng().random_range(0..ISN_SPACE)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the client and server endpoints.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// The retransmission ceiling was reached; the peer is considered gone
    /// and the remaining chunks were not sent.
    #[error("chunk {chunk} unacknowledged after {attempts} attempts, peer unreachable")]
    AttemptsExhausted { chunk: usize, attempts: u32 },
    /// No FIN-ACK arrived before the retransmission ceiling.
    #[error("FIN unacknowledged after {attempts} attempts, peer unreachable")]
    TeardownExhausted { attempts: u32 },
    /// The operation is only valid in `expected`.
    #[error("operation requires {expected}, connection is {actual}")]
    BadState {
        expected: ConnectionState,
        actual: ConnectionState,
    },
    /// The persistence collaborator refused a delivered chunk.
    #[error("failed to persist delivered payload: {0}")]
    Persist(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Mutable state of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Current FSM state.
    pub state: ConnectionState,
    /// Local sequence number placed in outgoing headers.
    pub seq_num: u32,
    /// Next sequence number expected from the peer.
    pub ack_num: u32,
    /// Negotiated maximum segment size in bytes.
    pub max_segment_size: u8,
    role: &'static str,
}

impl Connection {
    /// A fresh connection in `CLOSED`; `role` prefixes every log line.
    pub fn new(role: &'static str, max_segment_size: u8) -> Self {
        Self {
            state: ConnectionState::Closed,
            seq_num: 0,
            ack_num: 0,
            max_segment_size,
            role,
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Move to `next`, tracing the transition.
    pub fn update_state(&mut self, next: ConnectionState) {
        log::debug!("[{}] {} -> {}", self.role, self.state, next);
        self.state = next;
    }

    /// Adopt the peer's view after a reply: our next `seq_num` is the
    /// peer's `ack_num`, and we expect the peer's `seq_num + 1` next.
    pub fn sync_from(&mut self, header: &Header) {
        self.seq_num = header.ack_num;
        self.ack_num = header.seq_num.wrapping_add(1);
    }

    /// Fail with [`ConnError::BadState`] unless the connection is in `expected`.
    pub fn require(&self, expected: ConnectionState) -> Result<(), ConnError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConnError::BadState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Trace the current numbers, as every send/receive in a trace does.
    pub fn trace_numbers(&self) {
        log::debug!(
            "[{}] Current seq_num={}, ack_num={}",
            self.role,
            self.seq_num,
            self.ack_num
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isn_is_small() {
        for _ in 0..200 {
            assert!(initial_sequence_number() < ISN_SPACE);
        }
    }

    #[test]
    fn sync_from_adopts_peer_numbers() {
        let mut conn = Connection::new("test", 12);
        let reply = Header {
            seq_num: 9,
            ack_num: 41,
            ack: true,
            ..Header::default()
        };
        conn.sync_from(&reply);
        assert_eq!((conn.seq_num, conn.ack_num), (41, 10));
    }

    #[test]
    fn sync_from_wraps_at_u32_max() {
        let mut conn = Connection::new("test", 12);
        conn.sync_from(&Header {
            seq_num: u32::MAX,
            ..Header::default()
        });
        assert_eq!(conn.ack_num, 0);
    }

    #[test]
    fn require_reports_both_states() {
        let conn = Connection::new("test", 12);
        let err = conn.require(ConnectionState::Established).unwrap_err();
        assert!(matches!(
            err,
            ConnError::BadState {
                expected: ConnectionState::Established,
                actual: ConnectionState::Closed
            }
        ));
        assert_eq!(
            err.to_string(),
            "operation requires ESTABLISHED, connection is CLOSED"
        );
    }
}
