//! `rdt-udp`: a TCP-like reliable byte stream over UDP, plus a lossy channel
//! to exercise it.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  datagrams  ┌───────────┐  datagrams  ┌──────────┐
//!  │  Client  │────────────▶│  Channel  │────────────▶│  Server  │
//!  │ (active) │◀────────────│ delay/drop│◀────────────│ (passive)│
//!  └────┬─────┘             └───────────┘             └────┬─────┘
//!       │ Sender                                  Receiver │ PayloadSink
//!  ┌────▼──────────────────────────────────────────────────▼────┐
//!  │      Connection (state, seq_num, ack_num, mss)            │
//!  └────┬──────────────────────────────────────────────────────┘
//!       │ 12-byte header + body
//!  ┌────▼──────┐
//!  │  Socket   │  (time-bounded async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! The channel is optional: a client pointed straight at the server works
//! the same way, minus the faults.
//!
//! Each module has a single responsibility:
//! - [`packet`]      wire format (serialise / deserialise)
//! - [`state`]       finite-state-machine states
//! - [`connection`]  per-endpoint connection state and errors
//! - [`socket`]      async UDP socket abstraction
//! - [`timer`]       receive timeout, MSL and TIME_WAIT
//! - [`sender`]      stop-and-wait in-flight bookkeeping
//! - [`client`]      active opener: handshake, transfer, teardown
//! - [`receiver`]    passive opener transition function
//! - [`server`]      passive opener driver
//! - [`sink`]        where delivered payload ends up
//! - [`channel`]     lossy, delaying relay between the two

pub mod channel;
pub mod client;
pub mod connection;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod sink;
pub mod socket;
pub mod state;
pub mod timer;
