//! Layered socket stack.
//!
//! Every endpoint a candidate can live on implements [`IceSocket`]. Plain
//! UDP and TCP sit at the bottom; SOCKS5, pseudo-SSL, TCP framing and TURN
//! wrap another socket and own it. Wrapping preserves four rules: the
//! wrapper takes over the inner socket's inbound traffic, exposes the inner
//! transport identity, closes the inner socket when closed, and sends issued
//! before its handshake finishes are queued in order then flushed on success
//! or dropped on failure.

use crate::context::Datagram;
use slotmap::new_key_type;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

mod pseudossl;
mod socks5;
mod tcp;
mod tcp_frame;
mod turn;
mod udp;

pub use pseudossl::PseudoSslSocket;
pub use socks5::Socks5Socket;
pub use tcp::TcpSocket;
pub use tcp_frame::{FrameFlavor, TcpFrameSocket};
pub use turn::{TurnAuth, TurnSocket};
pub use udp::UdpSocket;

new_key_type!(
    pub struct SocketId;
);

/// Capability set of a candidate endpoint.
pub trait IceSocket {
    /// Send one datagram. `to` is the final destination; framing layers may
    /// redirect the actual write to their server or connected peer.
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()>;

    /// Drain everything the underlying transport has buffered, peeled
    /// through every layer, into `out`.
    fn pull(&mut self, out: &mut Vec<Datagram>);

    /// Drive layer-internal timers (handshake retransmits and the like).
    fn poll(&mut self, _now: Instant) {}

    fn timeout(&self, _now: Instant) -> Option<Duration> {
        None
    }

    fn is_reliable(&self) -> bool;

    fn local_addr(&self) -> SocketAddr;

    /// Close this socket and every layer below it. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Access the TURN layer, when this stack ends in one.
    fn as_turn_mut(&mut self) -> Option<&mut TurnSocket> {
        None
    }
}

/// FIFO of sends issued before a wrapper finished its handshake.
#[derive(Default)]
pub(crate) struct SendQueue {
    queued: Vec<(SocketAddr, Vec<u8>)>,
}

impl SendQueue {
    pub(crate) fn push(&mut self, to: SocketAddr, data: &[u8]) {
        self.queued.push((to, data.to_vec()));
    }

    pub(crate) fn flush(
        &mut self,
        mut send: impl FnMut(SocketAddr, &[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        for (to, data) in self.queued.drain(..) {
            send(to, &data)?;
        }
        Ok(())
    }

    pub(crate) fn discard(&mut self) {
        self.queued.clear();
    }
}
