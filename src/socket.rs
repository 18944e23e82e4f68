//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Segment`] instead of raw bytes (the channel, which relays
//! datagrams untouched, uses the `*_bytes` variants).  Every receive is
//! time-bounded: waiting past the deadline yields
//! [`SocketError::ReceiveTimeout`] rather than blocking forever.  All
//! protocol logic lives elsewhere; this module owns only byte I/O.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::packet::{PacketError, Segment, MAX_DATAGRAM};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The received datagram could not be decoded; it has been discarded.
    #[error("discarded datagram: {0}")]
    Decode(#[from] PacketError),
    /// Nothing arrived before the deadline.
    #[error("no datagram before the receive deadline")]
    ReceiveTimeout,
    /// The OS could not accept the datagram right now; sending again may work.
    #[error("send did not complete: {0}")]
    SendTimeout(io::Error),
}

/// Returns true if a send failure is likely transient (retry may succeed).
fn is_transient_send_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// ICMP-driven errors some platforms surface on unconnected UDP sockets
/// when the peer's port is closed.
pub(crate) fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, segment-oriented UDP socket.
///
/// All methods are `&self` so the channel can share one socket between its
/// forwarding tasks behind an `Arc`.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `segment` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, segment: &Segment, dest: SocketAddr) -> Result<(), SocketError> {
        self.send_bytes_to(&segment.encode(), dest).await
    }

    /// Send `bytes` unmodified as a single datagram.
    pub async fn send_bytes_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        match self.inner.send_to(bytes, dest).await {
            Ok(_) => Ok(()),
            Err(e) if is_transient_send_error(&e) => Err(SocketError::SendTimeout(e)),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Send `segment`, retrying immediately while the OS reports a
    /// transient failure.
    ///
    /// `max_tries` bounds the number of sends; `None` retries without limit.
    pub async fn send_retrying(
        &self,
        segment: &Segment,
        dest: SocketAddr,
        max_tries: Option<u32>,
    ) -> Result<(), SocketError> {
        let bytes = segment.encode();
        let mut tries = 0u32;
        loop {
            tries += 1;
            match self.send_bytes_to(&bytes, dest).await {
                Err(SocketError::SendTimeout(e)) if max_tries.map_or(true, |max| tries < max) => {
                    log::info!("timeout while sending segment ({e}), resending");
                }
                other => return other,
            }
        }
    }

    /// Receive the next datagram and decode it, waiting at most `wait`.
    pub async fn recv_from(&self, wait: Duration) -> Result<(Segment, SocketAddr), SocketError> {
        self.recv_until(Instant::now() + wait).await
    }

    /// Receive the next datagram and decode it, giving up at `deadline`.
    ///
    /// A datagram too short to hold a header is returned as
    /// [`SocketError::Decode`]; the caller decides whether to keep waiting.
    pub async fn recv_until(&self, deadline: Instant) -> Result<(Segment, SocketAddr), SocketError> {
        let (bytes, addr) = self.recv_bytes_until(deadline).await?;
        let segment = Segment::decode(&bytes)?;
        Ok((segment, addr))
    }

    /// Receive the next raw datagram, waiting at most `wait`.
    pub async fn recv_bytes_from(&self, wait: Duration) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        self.recv_bytes_until(Instant::now() + wait).await
    }

    async fn recv_bytes_until(&self, deadline: Instant) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match timeout_at(deadline, self.inner.recv_from(&mut buf)).await {
            Ok(Ok((n, addr))) => {
                buf.truncate(n);
                Ok((buf, addr))
            }
            Ok(Err(e)) => Err(SocketError::Io(e)),
            Err(_elapsed) => Err(SocketError::ReceiveTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn segment_travels_between_sockets() {
        let a = loopback().await;
        let b = loopback().await;
        let seg = Segment::data(3, 4, b"abc".to_vec());
        a.send_to(&seg, b.local_addr).await.unwrap();

        let (got, from) = b.recv_from(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got, seg);
        assert_eq!(from, a.local_addr);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let a = loopback().await;
        let res = a.recv_from(Duration::from_millis(20)).await;
        assert!(matches!(res, Err(SocketError::ReceiveTimeout)));
    }

    #[tokio::test]
    async fn short_datagram_is_a_decode_error() {
        let a = loopback().await;
        let b = loopback().await;
        a.send_bytes_to(&[1, 2, 3], b.local_addr).await.unwrap();
        let res = b.recv_from(Duration::from_secs(2)).await;
        assert!(matches!(res, Err(SocketError::Decode(PacketError::Truncated { len: 3 }))));
    }
}
