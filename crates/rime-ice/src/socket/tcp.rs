use crate::context::{Datagram, Transport};
use crate::socket::IceSocket;
use std::io;
use std::net::SocketAddr;

/// Connected byte stream. Destinations on send are ignored; inbound bytes
/// surface as raw chunks and are framed into datagrams by the layer above.
pub struct TcpSocket {
    transport: Box<dyn Transport>,
    peer: SocketAddr,
    closed: bool,
}

impl TcpSocket {
    pub fn new(transport: Box<dyn Transport>, peer: SocketAddr) -> Self {
        TcpSocket {
            transport,
            peer,
            closed: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl IceSocket for TcpSocket {
    fn send(&mut self, _to: SocketAddr, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        self.transport.send_to(self.peer, data).map(|_| ())
    }

    fn pull(&mut self, out: &mut Vec<Datagram>) {
        if self.closed {
            return;
        }

        loop {
            match self.transport.try_recv() {
                Ok(Some(mut chunk)) => {
                    chunk.source = self.peer;
                    out.push(chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    log::trace!("tcp recv error ignored: {e}");
                    break;
                }
            }
        }
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
