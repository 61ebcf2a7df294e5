use crate::context::Datagram;
use crate::socket::{IceSocket, SendQueue};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Fixed TLS ClientHello sent on open. The peer (a Google relay) answers
/// with the matching ServerHello and both sides go transparent; no actual
/// cryptography is involved.
const CLIENT_HELLO: [u8; 72] = [
    0x80, 0x46, 0x01, 0x03, 0x01, 0x00, 0x2d, 0x00, //
    0x00, 0x00, 0x10, 0x01, 0x00, 0x80, 0x03, 0x00, //
    0x80, 0x07, 0x00, 0xc0, 0x06, 0x00, 0x40, 0x02, //
    0x00, 0x80, 0x04, 0x00, 0x80, 0x00, 0x00, 0x04, //
    0x00, 0xfe, 0xff, 0x00, 0x00, 0x0a, 0x00, 0xfe, //
    0xfe, 0x00, 0x00, 0x09, 0x00, 0x00, 0x64, 0x00, //
    0x00, 0x62, 0x00, 0x00, 0x03, 0x00, 0x00, 0x06, //
    0x1f, 0x17, 0x0c, 0xa6, 0x2f, 0x00, 0x78, 0xfc, //
    0x46, 0x55, 0x2e, 0xb1, 0x83, 0x39, 0xf1, 0xea,
];

const SERVER_HELLO: [u8; 79] = [
    0x16, 0x03, 0x01, 0x00, 0x4a, 0x02, 0x00, 0x00, //
    0x46, 0x03, 0x01, 0x42, 0x85, 0x45, 0xa7, 0x27, //
    0xa9, 0x5d, 0xa0, 0xb3, 0xc5, 0xe7, 0x53, 0xda, //
    0x48, 0x2b, 0x3f, 0xc6, 0x5a, 0xca, 0x89, 0xc1, //
    0x58, 0x52, 0xa1, 0x78, 0x3c, 0x5b, 0x17, 0x46, //
    0x00, 0x85, 0x3f, 0x20, 0x0e, 0xd3, 0x06, 0x72, //
    0x5b, 0x5b, 0x1b, 0x5f, 0x15, 0xac, 0x13, 0xf9, //
    0x88, 0x53, 0x9d, 0x9b, 0xe8, 0x3d, 0x7b, 0x0c, //
    0x30, 0x32, 0x6e, 0x38, 0x4d, 0xa2, 0x75, 0x57, //
    0x41, 0x6c, 0x34, 0x5c, 0x00, 0x04, 0x00,
];

/// Synthetic-TLS disguise layer, Google dialect only.
pub struct PseudoSslSocket {
    inner: Box<dyn IceSocket>,
    handshaken: bool,
    failed: bool,
    recv_buf: Vec<u8>,
    send_queue: SendQueue,
}

impl PseudoSslSocket {
    pub fn new(mut inner: Box<dyn IceSocket>, peer: SocketAddr) -> Self {
        if let Err(e) = inner.send(peer, &CLIENT_HELLO) {
            log::debug!("pseudossl hello failed: {e}");
        }

        PseudoSslSocket {
            inner,
            handshaken: false,
            failed: false,
            recv_buf: Vec::new(),
            send_queue: SendQueue::default(),
        }
    }

    pub fn server_hello() -> &'static [u8] {
        &SERVER_HELLO
    }

    pub fn client_hello() -> &'static [u8] {
        &CLIENT_HELLO
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken
    }
}

impl IceSocket for PseudoSslSocket {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "pseudossl failed"));
        }
        if self.handshaken {
            self.inner.send(to, data)
        } else {
            self.send_queue.push(to, data);
            Ok(())
        }
    }

    fn pull(&mut self, out: &mut Vec<Datagram>) {
        let mut chunks = Vec::new();
        self.inner.pull(&mut chunks);

        for chunk in chunks {
            if self.handshaken {
                out.push(chunk);
                continue;
            }

            let source = chunk.source;
            self.recv_buf.extend_from_slice(&chunk.data);

            if self.recv_buf.len() < SERVER_HELLO.len() {
                continue;
            }

            if self.recv_buf[..SERVER_HELLO.len()] != SERVER_HELLO {
                log::debug!("pseudossl: unexpected server handshake, closing");
                self.failed = true;
                self.send_queue.discard();
                self.inner.close();
                return;
            }

            self.handshaken = true;
            self.recv_buf.drain(..SERVER_HELLO.len());

            let inner = &mut self.inner;
            if let Err(e) = self.send_queue.flush(|to, data| inner.send(to, data)) {
                log::debug!("pseudossl flush failed: {e}");
            }

            if !self.recv_buf.is_empty() {
                out.push(Datagram {
                    source,
                    data: std::mem::take(&mut self.recv_buf),
                });
            }
        }
    }

    fn poll(&mut self, now: Instant) {
        self.inner.poll(now);
    }

    fn timeout(&self, now: Instant) -> Option<Duration> {
        self.inner.timeout(now)
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn close(&mut self) {
        self.send_queue.discard();
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MemoryNet, Transport};
    use crate::socket::TcpSocket;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn handshake_then_transparent() {
        let net = MemoryNet::new();
        let server_addr = addr("10.0.0.9:443");
        let listener = net.listen_tcp(server_addr);
        let tcp = TcpSocket::new(
            net.connect_tcp("10.0.0.1".parse().unwrap(), server_addr).unwrap(),
            server_addr,
        );

        let mut ssl = PseudoSslSocket::new(Box::new(tcp), server_addr);
        let mut server = listener.accept().unwrap();

        assert_eq!(server.try_recv().unwrap().unwrap().data, CLIENT_HELLO);

        ssl.send(server_addr, b"queued").unwrap();
        assert!(server.try_recv().unwrap().is_none());

        // hello split over two chunks, plus trailing payload
        server.send_to(server_addr, &SERVER_HELLO[..10]).unwrap();
        ssl.pull(&mut Vec::new());
        assert!(!ssl.is_handshaken());

        let mut rest = SERVER_HELLO[10..].to_vec();
        rest.extend_from_slice(b"extra");
        server.send_to(server_addr, &rest).unwrap();

        let mut out = Vec::new();
        ssl.pull(&mut out);
        assert!(ssl.is_handshaken());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, b"extra");
        assert_eq!(server.try_recv().unwrap().unwrap().data, b"queued");
    }

    #[test]
    fn wrong_hello_fails_the_socket() {
        let net = MemoryNet::new();
        let server_addr = addr("10.0.0.9:443");
        let listener = net.listen_tcp(server_addr);
        let tcp = TcpSocket::new(
            net.connect_tcp("10.0.0.1".parse().unwrap(), server_addr).unwrap(),
            server_addr,
        );

        let mut ssl = PseudoSslSocket::new(Box::new(tcp), server_addr);
        let mut server = listener.accept().unwrap();
        let _ = server.try_recv();

        server.send_to(server_addr, &[0u8; 80]).unwrap();
        ssl.pull(&mut Vec::new());
        assert!(ssl.send(server_addr, b"x").is_err());
    }
}
