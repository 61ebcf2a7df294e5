use crate::context::{Datagram, Transport};
use crate::socket::IceSocket;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// Unconnected datagram endpoint; each send carries its destination.
pub struct UdpSocket {
    transport: Box<dyn Transport>,
    /// Writes the platform refused with WouldBlock, retried on `poll`.
    backlog: VecDeque<(SocketAddr, Vec<u8>)>,
    closed: bool,
}

impl UdpSocket {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        UdpSocket {
            transport,
            backlog: VecDeque::new(),
            closed: false,
        }
    }
}

impl IceSocket for UdpSocket {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }

        if !self.backlog.is_empty() {
            self.backlog.push_back((to, data.to_vec()));
            return Ok(());
        }

        match self.transport.send_to(to, data) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.backlog.push_back((to, data.to_vec()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn pull(&mut self, out: &mut Vec<Datagram>) {
        if self.closed {
            return;
        }

        loop {
            match self.transport.try_recv() {
                Ok(Some(datagram)) => out.push(datagram),
                Ok(None) => break,
                Err(e) => {
                    // transient receive failure, drop and move on
                    log::trace!("udp recv error ignored: {e}");
                    break;
                }
            }
        }
    }

    fn poll(&mut self, _now: Instant) {
        while let Some((to, data)) = self.backlog.pop_front() {
            match self.transport.send_to(to, &data) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.backlog.push_front((to, data));
                    break;
                }
                Err(e) => {
                    log::trace!("udp backlog send failed: {e}");
                    break;
                }
            }
        }
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.backlog.clear();
            self.transport.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MemoryNet;

    #[test]
    fn send_and_pull() {
        let net = MemoryNet::new();
        let mut a = UdpSocket::new(net.bind_udp("10.0.0.1:5000".parse().unwrap()).unwrap());
        let mut b = UdpSocket::new(net.bind_udp("10.0.0.2:5000".parse().unwrap()).unwrap());

        a.send(b.local_addr(), b"data").unwrap();

        let mut out = Vec::new();
        b.pull(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, b"data");
        assert_eq!(out[0].source, a.local_addr());
        assert!(!b.is_reliable());
    }

    #[test]
    fn close_is_idempotent() {
        let net = MemoryNet::new();
        let mut a = UdpSocket::new(net.bind_udp("10.0.0.1:5000".parse().unwrap()).unwrap());
        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(a.send("10.0.0.2:1".parse().unwrap(), b"x").is_err());
    }
}
