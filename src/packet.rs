//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between client, server and channel is a
//! [`Segment`]: a fixed 12-byte [`Header`] followed by zero or more raw body
//! bytes.  This module is responsible for:
//! - Defining the on-wire bit layout of the header.
//! - Serialising a [`Header`] / [`Segment`] into bytes ready for transmission.
//! - Deserialising a raw datagram back into a [`Segment`], failing on input
//!   too short to hold a header.
//!
//! No I/O happens here, only data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |S|A|F|P|  MSS  |                 Reserved (zero)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Body ...                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 12 bytes (96 bits).
//! seq(32) + ack(32) + syn/ack/fin/psh(4) + mss(4) + reserved(24)

use std::fmt;

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

/// Largest datagram any endpoint reads in one receive.
pub const MAX_DATAGRAM: usize = 1024;

/// Largest value the 4-bit MSS option can carry.
pub const MSS_MAX: u8 = 0x0f;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 8;

// Bit positions inside the flags/MSS byte.
const BIT_SYN: u8 = 0b1000_0000;
const BIT_ACK: u8 = 0b0100_0000;
const BIT_FIN: u8 = 0b0010_0000;
const BIT_PSH: u8 = 0b0001_0000;
const MASK_MSS: u8 = 0b0000_1111;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed-size segment header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Sender's sequence number for this segment.
    pub seq_num: u32,
    /// Next sequence number the sender expects to receive.
    pub ack_num: u32,
    /// Connection-establishment flag.
    pub syn: bool,
    /// Acknowledgment-valid flag.
    pub ack: bool,
    /// Connection-termination flag.
    pub fin: bool,
    /// Payload-present flag.
    pub psh: bool,
    /// Maximum-segment-size option.  Only the low 4 bits go on the wire.
    pub mss: u8,
}

impl Header {
    /// Pack this header into its 12-byte wire form.
    ///
    /// The reserved tail is always zero; an `mss` above [`MSS_MAX`] is
    /// truncated to its low 4 bits.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq_num.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack_num.to_be_bytes());

        let mut flags = self.mss & MASK_MSS;
        if self.syn {
            flags |= BIT_SYN;
        }
        if self.ack {
            flags |= BIT_ACK;
        }
        if self.fin {
            flags |= BIT_FIN;
        }
        if self.psh {
            flags |= BIT_PSH;
        }
        buf[OFF_FLAGS] = flags;
        buf
    }

    /// Parse a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Bytes after the flags/MSS byte are never inspected, so garbage in the
    /// reserved field (or a body) does not affect the result.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated { len: buf.len() });
        }

        let seq_num = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let ack_num = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let flags = buf[OFF_FLAGS];

        Ok(Header {
            seq_num,
            ack_num,
            syn: flags & BIT_SYN != 0,
            ack: flags & BIT_ACK != 0,
            fin: flags & BIT_FIN != 0,
            psh: flags & BIT_PSH != 0,
            mss: flags & MASK_MSS,
        })
    }

    /// `true` for a segment carrying none of SYN / ACK / FIN.
    pub fn is_payload(&self) -> bool {
        !self.syn && !self.ack && !self.fin
    }

    /// `true` for a bare acknowledgment (ACK set, SYN and FIN clear).
    pub fn is_pure_ack(&self) -> bool {
        self.ack && !self.syn && !self.fin
    }
}

/// Bit-level dump used in debug logs.
///
/// ```text
/// 00000000000000000000000000000001 : seq_num = 1
/// 00000000000000000000000000000010 : ack_num = 2
///  : syn = 1, ack = 0, fin = 0, psh = 0, mss = 1100
/// ```
impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:032b} : seq_num = {}", self.seq_num, self.seq_num)?;
        writeln!(f, "{:032b} : ack_num = {}", self.ack_num, self.ack_num)?;
        write!(
            f,
            " : syn = {}, ack = {}, fin = {}, psh = {}, mss = {:04b}",
            u8::from(self.syn),
            u8::from(self.ack),
            u8::from(self.fin),
            u8::from(self.psh),
            self.mss & MASK_MSS
        )
    }
}

/// Return the body of a raw datagram: every byte after the header.
///
/// Empty for a header-only (or truncated) datagram.
pub fn body_of(datagram: &[u8]) -> &[u8] {
    datagram.get(HEADER_LEN..).unwrap_or(&[])
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// A complete protocol datagram: header + body bytes.
///
/// The body is non-empty only when `header.psh` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Segment {
    /// Opening segment of the handshake, announcing `mss`.
    pub fn syn(seq_num: u32, mss: u8) -> Self {
        Self::control(Header {
            seq_num,
            syn: true,
            mss,
            ..Header::default()
        })
    }

    pub fn syn_ack(seq_num: u32, ack_num: u32) -> Self {
        Self::control(Header {
            seq_num,
            ack_num,
            syn: true,
            ack: true,
            ..Header::default()
        })
    }

    pub fn ack(seq_num: u32, ack_num: u32) -> Self {
        Self::control(Header {
            seq_num,
            ack_num,
            ack: true,
            ..Header::default()
        })
    }

    pub fn fin(seq_num: u32, ack_num: u32) -> Self {
        Self::control(Header {
            seq_num,
            ack_num,
            fin: true,
            ..Header::default()
        })
    }

    pub fn fin_ack(seq_num: u32, ack_num: u32) -> Self {
        Self::control(Header {
            seq_num,
            ack_num,
            ack: true,
            fin: true,
            ..Header::default()
        })
    }

    /// A PSH segment carrying `body`.
    pub fn data(seq_num: u32, ack_num: u32, body: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq_num,
                ack_num,
                psh: true,
                ..Header::default()
            },
            body,
        }
    }

    /// A header-only segment.
    pub fn control(header: Header) -> Self {
        Self {
            header,
            body: Vec::new(),
        }
    }

    /// Serialise header and body into one datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parse a datagram; the body is everything past the header.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(datagram)?;
        Ok(Self {
            header,
            body: body_of(datagram).to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer than [`HEADER_LEN`] bytes were received.
    #[error("datagram of {len} bytes is too short for a {HEADER_LEN}-byte header")]
    Truncated { len: usize },
}
