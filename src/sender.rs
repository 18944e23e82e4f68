//! Outbound segment state for stop-and-wait reliability.
//!
//! [`Sender`] tracks the single in-flight data segment of the client.
//! It does **not** touch the socket; [`crate::client::Client`] calls these
//! methods and owns the actual send/receive loop.
//!
//! # Stop-and-Wait contract
//! - At most **one** segment is in flight at any moment (`unacked`).
//! - A new segment may only be sent once `unacked` is `None`.
//! - On ACK: clear `unacked` and record the chunk's acknowledgment latency,
//!   measured from its *first* transmission.
//! - On timeout: count the attempt and resend the same segment unchanged,
//!   until the attempt ceiling is reached.

use std::time::{Duration, Instant};

use crate::channel::ChannelParams;
use crate::connection::ConnError;
use crate::packet::{Header, Segment};

/// Default retransmission ceiling per chunk.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

// ---------------------------------------------------------------------------
// ChunkAck
// ---------------------------------------------------------------------------

/// Per-chunk record handed to whoever collects transfer statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAck {
    /// Payload bytes of the chunk.
    pub chunk: Vec<u8>,
    /// Time from the chunk's first transmission to its acknowledgment.
    pub time_to_ack: Duration,
    /// Channel parameters in effect while the chunk travelled.
    pub channel: ChannelParams,
}

/// Mean acknowledgment latency over `records`, `None` when empty.
pub fn average_time_to_ack(records: &[ChunkAck]) -> Option<Duration> {
    let count = u32::try_from(records.len()).ok().filter(|&n| n > 0)?;
    let total: Duration = records.iter().map(|r| r.time_to_ack).sum();
    Some(total / count)
}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

/// A segment that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    /// The segment on the wire.
    pub segment: Segment,
    /// Position of the chunk within the message.
    pub index: usize,
    /// Timeouts suffered so far.
    pub attempts: u32,
    /// Wall-clock time of the first transmission.
    pub first_sent: Instant,
}

/// How a reply relates to the in-flight segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// ACK for the in-flight segment.
    Acknowledged,
    /// ACK that acknowledges nothing new (a late duplicate of an earlier one).
    Stale,
    /// Not an acknowledgment, or nothing is in flight.
    Ignored,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Stop-and-wait send-side state for one transfer.
#[derive(Debug)]
pub struct Sender {
    unacked: Option<InFlight>,
    max_attempts: u32,
    channel: ChannelParams,
    records: Vec<ChunkAck>,
}

impl Sender {
    pub fn new(max_attempts: u32, channel: ChannelParams) -> Self {
        Self {
            unacked: None,
            max_attempts,
            channel,
            records: Vec::new(),
        }
    }

    /// Move `segment` into the in-flight slot and start its latency clock.
    ///
    /// Panics in debug mode if a segment is already in flight.
    pub fn record_sent(&mut self, index: usize, segment: Segment) {
        debug_assert!(
            self.unacked.is_none(),
            "record_sent called while a segment is already in flight"
        );
        self.unacked = Some(InFlight {
            segment,
            index,
            attempts: 0,
            first_sent: Instant::now(),
        });
    }

    /// Decide what `reply` means for the in-flight segment.
    ///
    /// The server answers a PSH segment with its own `seq_num` set to the
    /// segment's `ack_num`, and every acknowledged chunk moves our `ack_num`
    /// on by one.  An ACK carrying any other `seq_num` answers an earlier
    /// transmission (a late reply to a retransmitted chunk) and is stale.
    pub fn classify(&self, reply: &Header) -> AckOutcome {
        match &self.unacked {
            Some(entry) if reply.ack => {
                if reply.seq_num == entry.segment.header.ack_num {
                    AckOutcome::Acknowledged
                } else {
                    AckOutcome::Stale
                }
            }
            _ => AckOutcome::Ignored,
        }
    }

    /// Clear the in-flight slot and record the chunk's latency.
    ///
    /// Returns `None` if nothing was in flight.
    pub fn on_ack(&mut self) -> Option<&ChunkAck> {
        let entry = self.unacked.take()?;
        self.records.push(ChunkAck {
            chunk: entry.segment.body,
            time_to_ack: entry.first_sent.elapsed(),
            channel: self.channel,
        });
        self.records.last()
    }

    /// Count a timeout for the in-flight segment.
    ///
    /// Returns the segment to resend, or [`ConnError::AttemptsExhausted`]
    /// once the ceiling is reached.
    pub fn on_timeout(&mut self) -> Result<&Segment, ConnError> {
        let Some(entry) = self.unacked.as_mut() else {
            return Err(ConnError::AttemptsExhausted {
                chunk: self.records.len(),
                attempts: 0,
            });
        };
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            return Err(ConnError::AttemptsExhausted {
                chunk: entry.index,
                attempts: entry.attempts,
            });
        }
        Ok(&entry.segment)
    }

    /// Number of timeouts the in-flight segment has suffered, or `0` when idle.
    pub fn attempts(&self) -> u32 {
        self.unacked.as_ref().map_or(0, |e| e.attempts)
    }

    pub fn into_records(self) -> Vec<ChunkAck> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Server ACK answering a segment whose `ack_num` was `echo`.
    fn ack(echo: u32, ack_num: u32) -> Header {
        Segment::ack(echo, ack_num).header
    }

    #[test]
    fn ack_clears_slot_and_records_chunk() {
        let mut s = Sender::new(3, ChannelParams::default());
        s.record_sent(0, Segment::data(10, 1, b"HELL".to_vec()));
        assert_eq!(s.attempts(), 0);

        assert_eq!(s.classify(&ack(1, 14)), AckOutcome::Acknowledged);
        let record = s.on_ack().unwrap();
        assert_eq!(record.chunk, b"HELL");
        assert!(s.on_ack().is_none());
        assert_eq!(s.classify(&ack(1, 14)), AckOutcome::Ignored);
        assert_eq!(s.into_records().len(), 1);
    }

    #[test]
    fn late_reply_to_previous_chunk_is_stale() {
        // Chunk 0 (seq 10, ack 1) was sent twice; its second ACK arrives
        // while chunk 1 (ack 2) is in flight, with an ack_num that happens
        // to exceed chunk 1's seq_num.
        let mut s = Sender::new(3, ChannelParams::default());
        s.record_sent(0, Segment::data(10, 1, b"HELL".to_vec()));
        assert_eq!(s.classify(&ack(1, 14)), AckOutcome::Acknowledged);
        s.on_ack();

        s.record_sent(1, Segment::data(14, 2, b"O WO".to_vec()));
        assert_eq!(s.classify(&ack(1, 18)), AckOutcome::Stale);
        assert_eq!(s.classify(&ack(1, 14)), AckOutcome::Stale);
        assert_eq!(s.classify(&ack(2, 18)), AckOutcome::Acknowledged);
    }

    #[test]
    fn non_ack_and_idle_are_ignored() {
        let mut s = Sender::new(3, ChannelParams::default());
        assert_eq!(s.classify(&ack(1, 5)), AckOutcome::Ignored);
        s.record_sent(0, Segment::data(1, 1, b"x".to_vec()));
        assert_eq!(s.classify(&Segment::syn(0, 12).header), AckOutcome::Ignored);
    }

    #[test]
    fn average_latency_over_records() {
        let record = |ms| ChunkAck {
            chunk: Vec::new(),
            time_to_ack: Duration::from_millis(ms),
            channel: ChannelParams::default(),
        };
        assert_eq!(average_time_to_ack(&[]), None);
        assert_eq!(
            average_time_to_ack(&[record(10), record(30)]),
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn timeouts_exhaust_at_ceiling() {
        let mut s = Sender::new(3, ChannelParams::default());
        let seg = Segment::data(7, 1, b"abc".to_vec());
        s.record_sent(4, seg.clone());

        assert_eq!(s.on_timeout().unwrap(), &seg);
        assert_eq!(s.on_timeout().unwrap(), &seg);
        assert_eq!(s.attempts(), 2);
        match s.on_timeout() {
            Err(ConnError::AttemptsExhausted { chunk, attempts }) => {
                assert_eq!((chunk, attempts), (4, 3));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
