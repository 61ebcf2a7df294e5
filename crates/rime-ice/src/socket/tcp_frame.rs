use crate::context::Datagram;
use crate::socket::IceSocket;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Reassembly buffer cap; a peer exceeding it gets disconnected.
const MAX_RECV_BUF: usize = 64 * 1024;

/// How messages are delimited on a TURN TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlavor {
    /// 2-byte big-endian length prefix (Google).
    Google,
    /// Frames are self-describing: first two bytes < 0x4000 mean a 20-byte
    /// STUN header carrying its own length, anything else a 4-byte TURN
    /// channel header; frames are padded to 4 bytes (draft-9 / RFC 5766).
    StunChannel,
}

/// Turns a TCP byte stream into whole TURN/STUN messages and back.
pub struct TcpFrameSocket {
    inner: Box<dyn IceSocket>,
    flavor: FrameFlavor,
    recv_buf: Vec<u8>,
}

impl TcpFrameSocket {
    pub fn new(inner: Box<dyn IceSocket>, flavor: FrameFlavor) -> Self {
        TcpFrameSocket {
            inner,
            flavor,
            recv_buf: Vec::new(),
        }
    }

    /// Layout of the frame at the buffer head once its header is complete:
    /// `(total wire size incl. padding, message byte range)`.
    fn frame_size(&self) -> Option<(usize, std::ops::Range<usize>)> {
        let buf = &self.recv_buf;

        match self.flavor {
            FrameFlavor::Google => {
                if buf.len() < 2 {
                    return None;
                }
                let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                Some((2 + len, 2..2 + len))
            }
            FrameFlavor::StunChannel => {
                if buf.len() < 4 {
                    return None;
                }
                let magic = u16::from_be_bytes([buf[0], buf[1]]);
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                let message = if magic < 0x4000 { 20 + len } else { 4 + len };
                let padded = message + (4 - message % 4) % 4;
                Some((padded, 0..message))
            }
        }
    }
}

impl IceSocket for TcpFrameSocket {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        match self.flavor {
            FrameFlavor::Google => {
                let mut framed = Vec::with_capacity(2 + data.len());
                framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
                framed.extend_from_slice(data);
                self.inner.send(to, &framed)
            }
            FrameFlavor::StunChannel => {
                let padding = (4 - data.len() % 4) % 4;
                if padding == 0 {
                    self.inner.send(to, data)
                } else {
                    let mut framed = Vec::with_capacity(data.len() + padding);
                    framed.extend_from_slice(data);
                    framed.resize(data.len() + padding, 0);
                    self.inner.send(to, &framed)
                }
            }
        }
    }

    fn pull(&mut self, out: &mut Vec<Datagram>) {
        let mut chunks = Vec::new();
        self.inner.pull(&mut chunks);

        for chunk in chunks {
            if self.recv_buf.len() + chunk.data.len() > MAX_RECV_BUF {
                log::warn!("tcp frame reassembly buffer overflow, dropping connection");
                self.close();
                return;
            }
            self.recv_buf.extend_from_slice(&chunk.data);

            while let Some((wire, message)) = self.frame_size() {
                if self.recv_buf.len() < wire {
                    break;
                }

                out.push(Datagram {
                    source: chunk.source,
                    data: self.recv_buf[message].to_vec(),
                });
                self.recv_buf.drain(..wire);
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
        self.recv_buf.clear();
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

    fn setup(flavor: FrameFlavor) -> (TcpFrameSocket, Box<dyn Transport>) {
        let net = MemoryNet::new();
        let server_addr = addr("10.0.0.9:3478");
        let listener = net.listen_tcp(server_addr);
        let tcp = TcpSocket::new(
            net.connect_tcp("10.0.0.1".parse().unwrap(), server_addr).unwrap(),
            server_addr,
        );
        let framed = TcpFrameSocket::new(Box::new(tcp), flavor);
        (framed, listener.accept().unwrap())
    }

    #[test]
    fn google_length_prefix() {
        let (mut sock, mut server) = setup(FrameFlavor::Google);

        sock.send(addr("10.0.0.9:3478"), b"hello").unwrap();
        assert_eq!(
            server.try_recv().unwrap().unwrap().data,
            [&[0u8, 5][..], b"hello"].concat()
        );

        // two frames in one chunk, second split
        let mut wire = vec![0, 2, b'h', b'i', 0, 3, b'x'];
        server.send_to(addr("0.0.0.0:0"), &wire.split_off(0)).unwrap();
        server.send_to(addr("0.0.0.0:0"), b"yz").unwrap();

        let mut out = Vec::new();
        sock.pull(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, b"hi");
        assert_eq!(out[1].data, b"xyz");
    }

    #[test]
    fn stun_channel_discriminator_and_padding() {
        let (mut sock, mut server) = setup(FrameFlavor::StunChannel);

        // a 20-byte STUN header with a 5-byte body arrives padded to 28
        let mut stun = vec![0x00, 0x01, 0x00, 0x05];
        stun.extend_from_slice(&[0u8; 16]);
        stun.extend_from_slice(b"abcde");
        let mut wire = stun.clone();
        wire.extend_from_slice(&[0u8; 3]);

        // channel data frame (6 bytes payload, padded to 12 total)
        let chan = vec![0x40, 0x00, 0x00, 0x06, 1, 2, 3, 4, 5, 6, 0, 0];
        wire.extend_from_slice(&chan);

        // dribble the bytes in odd chunks
        for piece in wire.chunks(7) {
            server.send_to(addr("0.0.0.0:0"), piece).unwrap();
        }

        let mut out = Vec::new();
        sock.pull(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, stun);
        assert_eq!(out[1].data, &chan[..10]);

        // outbound channel data gets padded to 4
        sock.send(addr("10.0.0.9:3478"), &chan[..10]).unwrap();
        assert_eq!(server.try_recv().unwrap().unwrap().data, chan);
    }

    #[test]
    fn oversized_reassembly_drops_the_connection() {
        let (mut sock, mut server) = setup(FrameFlavor::StunChannel);

        // claim a huge frame and keep feeding bytes
        server.send_to(addr("0.0.0.0:0"), &[0x7F, 0xFF, 0xFF, 0xFB]).unwrap();
        sock.pull(&mut Vec::new());
        for _ in 0..20 {
            server.send_to(addr("0.0.0.0:0"), &[0u8; 8000]).unwrap();
        }

        let mut out = Vec::new();
        sock.pull(&mut out);
        assert!(out.is_empty());
        assert!(sock.is_closed());
    }
}
