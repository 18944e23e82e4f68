//! Connection finite-state machine (FSM) types.
//!
//! Both endpoints draw their states from the same [`ConnectionState`] enum;
//! the client walks the active-open path and the server the passive-open
//! path.  Transitions live in [`crate::client`] and [`crate::receiver`].
//!
//! ```text
//!  client                                   server
//!  CLOSED ──SYN──▶ SYN_SENT                 CLOSED ─▶ LISTEN
//!    SYNACK_RECEIVED ─▶ ACK_SENT             LISTEN ──SYN──▶ SYN_RECEIVED ─▶ SYNACK_SENT
//!    ─▶ ESTABLISHED                          SYNACK_SENT ──ACK──▶ ACK_RECEIVED ─▶ ESTABLISHED
//!  ESTABLISHED ──FIN──▶ FIN_SENT             ESTABLISHED ──FIN──▶ FIN_RECEIVED ─▶ FINACK_SENT
//!    FINACK_RECEIVED ─▶ ACK_SENT             FINACK_SENT ──ACK──▶ ACK_RECEIVED ─▶ TIME_WAIT
//!    ─▶ TIME_WAIT ─▶ (socket closed)         TIME_WAIT ─▶ LISTEN
//! ```

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection exists; initial state.
    #[default]
    Closed,
    /// Server is waiting for a SYN.
    Listen,
    /// SYN has been sent; waiting for SYN-ACK.
    SynSent,
    /// SYN received; SYN-ACK about to be sent.
    SynReceived,
    /// SYN-ACK sent; waiting for the final handshake ACK.
    SynAckSent,
    /// SYN-ACK received; final handshake ACK about to be sent.
    SynAckReceived,
    AckSent,
    AckReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// FIN sent; waiting for FIN-ACK.
    FinSent,
    FinReceived,
    /// FIN-ACK sent; waiting for the last ACK of the teardown.
    FinAckSent,
    FinAckReceived,
    /// Waiting 2×MSL before releasing the socket (client) or listening
    /// again (server).
    TimeWait,
}

impl ConnectionState {
    /// Name as printed in protocol traces, e.g. `SYNACK_SENT`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::SynAckSent => "SYNACK_SENT",
            Self::SynAckReceived => "SYNACK_RECEIVED",
            Self::AckSent => "ACK_SENT",
            Self::AckReceived => "ACK_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinSent => "FIN_SENT",
            Self::FinReceived => "FIN_RECEIVED",
            Self::FinAckSent => "FINACK_SENT",
            Self::FinAckReceived => "FINACK_RECEIVED",
            Self::TimeWait => "TIME_WAIT",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_closed() {
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
    }

    #[test]
    fn display_uses_trace_names() {
        assert_eq!(ConnectionState::SynAckSent.to_string(), "SYNACK_SENT");
        assert_eq!(ConnectionState::FinAckReceived.to_string(), "FINACK_RECEIVED");
        assert_eq!(ConnectionState::TimeWait.to_string(), "TIME_WAIT");
    }
}
