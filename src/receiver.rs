//! Passive-opener state machine: the server's transition function.
//!
//! [`Receiver::on_segment`] maps `(current state, inbound segment)` to a new
//! state plus a list of [`Effect`]s.  It performs no I/O: the
//! [`crate::server::Server`] driver sends the replies, hands delivered chunks
//! to the persistence collaborator and serves `TIME_WAIT`.
//!
//! Responsibilities:
//! - Answering the handshake, including a SYN repeated because our SYN-ACK
//!   was lost.
//! - Accepting PSH segments in `ESTABLISHED`, suppressing duplicates by
//!   comparing against the last received sequence number, and acknowledging
//!   every one of them (duplicates included) with a byte-accumulating
//!   `ack_num`.
//! - Answering the teardown, including a FIN repeated because our FIN-ACK
//!   was lost.
//!
//! Segments that make no sense in the current state produce no effects.

use crate::connection::{initial_sequence_number, Connection};
use crate::packet::{Header, Segment};
use crate::state::ConnectionState;

/// Something the driver must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send this header (no body) back to the peer.
    Reply(Header),
    /// A new chunk was appended to the delivered message.
    Deliver { seq_num: u32, body: Vec<u8> },
    /// A retransmitted chunk was recognised and not appended again.
    Duplicate { seq_num: u32 },
    /// Teardown complete; hold for `2 × MSL`, then call
    /// [`Receiver::finish_time_wait`].
    EnterTimeWait,
}

/// Server-side connection state plus the delivered-message buffer.
#[derive(Debug)]
pub struct Receiver {
    conn: Connection,
    last_received_seq_num: Option<u32>,
    delivered: Vec<Vec<u8>>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    /// A receiver in `CLOSED`; call [`listen`](Self::listen) to start.
    pub fn new() -> Self {
        Self {
            conn: Connection::new("server", 0),
            last_received_seq_num: None,
            delivered: Vec::new(),
        }
    }

    /// `CLOSED -> LISTEN`.
    pub fn listen(&mut self) {
        if self.conn.state == ConnectionState::Closed {
            self.conn.update_state(ConnectionState::Listen);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Delivered chunks of the current connection, in arrival order.
    pub fn delivered(&self) -> &[Vec<u8>] {
        &self.delivered
    }

    /// The reassembled message of the current connection.
    pub fn message(&self) -> Vec<u8> {
        self.delivered.concat()
    }

    /// Apply one inbound segment.
    pub fn on_segment(&mut self, segment: &Segment) -> Vec<Effect> {
        let h = &segment.header;
        match self.conn.state {
            ConnectionState::Listen => {
                if h.syn && !h.ack {
                    self.accept_syn(h)
                } else {
                    Vec::new()
                }
            }
            ConnectionState::SynAckSent => {
                if h.syn && !h.ack {
                    log::info!("[server] SYN repeated, SYN-ACK presumed lost; answering again");
                    self.accept_syn(h)
                } else if h.ack && !h.syn {
                    self.conn.update_state(ConnectionState::AckReceived);
                    self.conn.update_state(ConnectionState::Established);
                    Vec::new()
                } else {
                    Vec::new()
                }
            }
            ConnectionState::Established => {
                if h.fin {
                    self.accept_fin(h)
                } else if h.psh {
                    self.accept_data(h, &segment.body)
                } else {
                    Vec::new()
                }
            }
            ConnectionState::FinAckSent => {
                if h.fin && !h.ack {
                    log::info!("[server] FIN repeated, FIN-ACK presumed lost; answering again");
                    self.conn.sync_from(h);
                    vec![Effect::Reply(
                        Segment::fin_ack(self.conn.seq_num, self.conn.ack_num).header,
                    )]
                } else if h.ack {
                    self.conn.sync_from(h);
                    self.conn.trace_numbers();
                    self.conn.update_state(ConnectionState::AckReceived);
                    log::debug!("[server] Completed teardown");
                    self.conn.update_state(ConnectionState::TimeWait);
                    vec![Effect::EnterTimeWait]
                } else {
                    Vec::new()
                }
            }
            // Resting states never reached by a listening server, or in
            // which inbound segments are not consumed.
            ConnectionState::Closed
            | ConnectionState::TimeWait
            | ConnectionState::SynSent
            | ConnectionState::SynReceived
            | ConnectionState::SynAckReceived
            | ConnectionState::AckSent
            | ConnectionState::AckReceived
            | ConnectionState::FinSent
            | ConnectionState::FinReceived
            | ConnectionState::FinAckReceived => Vec::new(),
        }
    }

    /// `TIME_WAIT -> LISTEN`; the finished connection's buffer is returned.
    pub fn finish_time_wait(&mut self) -> Vec<u8> {
        let message = std::mem::take(&mut self.delivered).concat();
        if self.conn.state == ConnectionState::TimeWait {
            log::debug!("[server] TIME_WAIT over, can listen again");
            self.conn.update_state(ConnectionState::Listen);
        }
        self.last_received_seq_num = None;
        message
    }

    // -----------------------------------------------------------------------
    // Transition helpers
    // -----------------------------------------------------------------------

    fn accept_syn(&mut self, h: &Header) -> Vec<Effect> {
        log::debug!("[server] SYN received, new handshake started by client");
        self.conn.update_state(ConnectionState::SynReceived);
        self.delivered.clear();
        self.conn.seq_num = initial_sequence_number();
        self.conn.ack_num = h.seq_num.wrapping_add(1);
        self.conn.max_segment_size = h.mss;
        self.last_received_seq_num = Some(h.seq_num);

        let reply = Segment::syn_ack(self.conn.seq_num, self.conn.ack_num).header;
        self.conn.trace_numbers();
        self.conn.update_state(ConnectionState::SynAckSent);
        vec![Effect::Reply(reply)]
    }

    fn accept_data(&mut self, h: &Header, body: &[u8]) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(2);
        log::debug!("[server] Payload length: {}", body.len());

        if self.last_received_seq_num == Some(h.seq_num) {
            log::debug!(
                "[server] Duplicate! seq_num {} matches previous seq num",
                h.seq_num
            );
            effects.push(Effect::Duplicate { seq_num: h.seq_num });
        } else {
            self.delivered.push(body.to_vec());
            effects.push(Effect::Deliver {
                seq_num: h.seq_num,
                body: body.to_vec(),
            });
        }

        self.conn.seq_num = h.ack_num;
        self.conn.ack_num = self.conn.ack_num.wrapping_add(body.len() as u32);
        self.last_received_seq_num = Some(h.seq_num);
        self.conn.trace_numbers();

        effects.push(Effect::Reply(
            Segment::ack(self.conn.seq_num, self.conn.ack_num).header,
        ));
        effects
    }

    fn accept_fin(&mut self, h: &Header) -> Vec<Effect> {
        self.conn.update_state(ConnectionState::FinReceived);
        self.conn.sync_from(h);
        self.conn.trace_numbers();
        let reply = Segment::fin_ack(self.conn.seq_num, self.conn.ack_num).header;
        self.conn.update_state(ConnectionState::FinAckSent);
        vec![Effect::Reply(reply)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replies(effects: &[Effect]) -> Vec<Header> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Reply(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    /// Drive a receiver through the handshake with client ISN 7.
    fn established() -> Receiver {
        let mut rx = Receiver::new();
        rx.listen();
        let out = rx.on_segment(&Segment::syn(7, 4));
        let synack = replies(&out)[0];
        assert!(synack.syn && synack.ack);
        assert_eq!(synack.ack_num, 8);
        rx.on_segment(&Segment::ack(8, synack.seq_num.wrapping_add(1)));
        assert_eq!(rx.state(), ConnectionState::Established);
        rx
    }

    #[test]
    fn handshake_adopts_peer_mss() {
        let rx = established();
        assert_eq!(rx.connection().max_segment_size, 4);
        assert_eq!(rx.connection().ack_num, 8);
    }

    #[test]
    fn data_is_delivered_and_acked_with_byte_count() {
        let mut rx = established();
        let server_seq = rx.connection().seq_num;
        let out = rx.on_segment(&Segment::data(8, server_seq + 1, b"HELL".to_vec()));

        assert_eq!(
            out[0],
            Effect::Deliver {
                seq_num: 8,
                body: b"HELL".to_vec()
            }
        );
        let ack = replies(&out)[0];
        assert!(ack.is_pure_ack());
        assert_eq!(ack.seq_num, server_seq + 1);
        assert_eq!(ack.ack_num, 12);
        assert_eq!(rx.message(), b"HELL");
    }

    #[test]
    fn retransmitted_chunk_is_acked_but_not_appended() {
        let mut rx = established();
        let chunk = Segment::data(8, 1, b"HELL".to_vec());
        rx.on_segment(&chunk);
        let out = rx.on_segment(&chunk);

        assert_eq!(out[0], Effect::Duplicate { seq_num: 8 });
        assert_eq!(replies(&out).len(), 1);
        assert!(replies(&out)[0].ack);
        assert_eq!(rx.delivered().len(), 1);
        assert_eq!(rx.message(), b"HELL");
    }

    #[test]
    fn out_of_state_segments_are_ignored() {
        let mut rx = Receiver::new();
        rx.listen();
        assert!(rx.on_segment(&Segment::data(1, 1, b"x".to_vec())).is_empty());
        assert!(rx.on_segment(&Segment::fin(1, 1)).is_empty());
        assert_eq!(rx.state(), ConnectionState::Listen);

        let mut rx = established();
        assert!(rx.on_segment(&Segment::syn(3, 12)).is_empty());
        assert_eq!(rx.state(), ConnectionState::Established);
    }

    #[test]
    fn repeated_syn_gets_fresh_synack() {
        let mut rx = Receiver::new();
        rx.listen();
        rx.on_segment(&Segment::syn(3, 12));
        let out = rx.on_segment(&Segment::syn(20, 12));
        let synack = replies(&out)[0];
        assert!(synack.syn && synack.ack);
        assert_eq!(synack.ack_num, 21);
        assert_eq!(rx.state(), ConnectionState::SynAckSent);
    }

    #[test]
    fn teardown_returns_to_listen() {
        let mut rx = established();
        rx.on_segment(&Segment::data(8, 1, b"abc".to_vec()));

        let out = rx.on_segment(&Segment::fin(11, 2));
        let finack = replies(&out)[0];
        assert!(finack.fin && finack.ack);
        assert_eq!((finack.seq_num, finack.ack_num), (2, 12));
        assert_eq!(rx.state(), ConnectionState::FinAckSent);

        // FIN-ACK lost: the client repeats its FIN.
        let again = replies(&rx.on_segment(&Segment::fin(11, 2)))[0];
        assert_eq!(again, finack);

        let out = rx.on_segment(&Segment::ack(2, 13));
        assert_eq!(out, vec![Effect::EnterTimeWait]);
        assert_eq!(rx.state(), ConnectionState::TimeWait);

        assert_eq!(rx.finish_time_wait(), b"abc");
        assert_eq!(rx.state(), ConnectionState::Listen);
        assert!(rx.delivered().is_empty());
    }
}
