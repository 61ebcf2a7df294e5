use crate::context::Datagram;
use crate::socket::{IceSocket, SendQueue};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Greeting sent, awaiting method selection.
    Init,
    /// Username/password sub-negotiation sent.
    Auth,
    /// CONNECT sent, awaiting reply.
    Connect,
    Connected,
    Error,
}

/// SOCKS5 client layer over a connected TCP socket (RFC 1928/1929).
///
/// Handshakes towards `target` on creation; payload sends are queued until
/// the proxy confirms the connection.
pub struct Socks5Socket {
    inner: Box<dyn IceSocket>,
    target: SocketAddr,
    username: Option<String>,
    password: Option<String>,
    state: State,
    recv_buf: Vec<u8>,
    send_queue: SendQueue,
}

impl Socks5Socket {
    pub fn new(
        mut inner: Box<dyn IceSocket>,
        target: SocketAddr,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let with_auth = username.is_some() || password.is_some();
        let greeting: &[u8] = if with_auth {
            // two supported methods: no-auth and username/password
            &[0x05, 0x02, 0x00, 0x02]
        } else {
            &[0x05, 0x01, 0x00]
        };

        if let Err(e) = inner.send(target, greeting) {
            log::debug!("socks5 greeting failed: {e}");
        }

        Socks5Socket {
            inner,
            target,
            username,
            password,
            state: State::Init,
            recv_buf: Vec::new(),
            send_queue: SendQueue::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    fn fail(&mut self) {
        log::debug!("socks5 handshake with {} failed", self.target);
        self.state = State::Error;
        self.send_queue.discard();
        self.inner.close();
    }

    fn send_auth(&mut self) -> bool {
        let username = self.username.as_deref().unwrap_or("");
        let password = self.password.as_deref().unwrap_or("");
        if username.len() > 255 || password.len() > 255 {
            return false;
        }

        let mut msg = Vec::with_capacity(3 + username.len() + password.len());
        msg.push(0x01);
        msg.push(username.len() as u8);
        msg.extend_from_slice(username.as_bytes());
        msg.push(password.len() as u8);
        msg.extend_from_slice(password.as_bytes());

        self.inner.send(self.target, &msg).is_ok()
    }

    fn send_connect(&mut self) -> bool {
        let mut msg = Vec::with_capacity(22);
        msg.extend_from_slice(&[0x05, 0x01, 0x00]);
        match self.target.ip() {
            IpAddr::V4(ip) => {
                msg.push(0x01);
                msg.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                msg.push(0x04);
                msg.extend_from_slice(&ip.octets());
            }
        }
        msg.extend_from_slice(&self.target.port().to_be_bytes());

        self.inner.send(self.target, &msg).is_ok()
    }

    /// Consume handshake bytes from the reassembly buffer. Returns false
    /// when more input is needed.
    fn advance(&mut self) -> bool {
        match self.state {
            State::Init => {
                if self.recv_buf.len() < 2 {
                    return false;
                }
                let (version, method) = (self.recv_buf[0], self.recv_buf[1]);
                self.recv_buf.drain(..2);

                if version != 0x05 {
                    self.fail();
                    return false;
                }

                match method {
                    0x00 => {
                        if self.send_connect() {
                            self.state = State::Connect;
                        } else {
                            self.fail();
                        }
                    }
                    0x02 if self.username.is_some() || self.password.is_some() => {
                        if self.send_auth() {
                            self.state = State::Auth;
                        } else {
                            self.fail();
                        }
                    }
                    _ => self.fail(),
                }
                true
            }
            State::Auth => {
                if self.recv_buf.len() < 2 {
                    return false;
                }
                let ok = self.recv_buf[0] == 0x01 && self.recv_buf[1] == 0x00;
                self.recv_buf.drain(..2);

                if ok && self.send_connect() {
                    self.state = State::Connect;
                } else {
                    self.fail();
                }
                true
            }
            State::Connect => {
                if self.recv_buf.len() < 4 {
                    return false;
                }
                if self.recv_buf[0] != 0x05 || self.recv_buf[1] != 0x00 || self.recv_buf[2] != 0x00
                {
                    self.fail();
                    return false;
                }

                let reply_len = match self.recv_buf[3] {
                    0x01 => 4 + 4 + 2,
                    0x04 => 4 + 16 + 2,
                    _ => {
                        self.fail();
                        return false;
                    }
                };
                if self.recv_buf.len() < reply_len {
                    return false;
                }
                self.recv_buf.drain(..reply_len);

                self.state = State::Connected;
                let target = self.target;
                let inner = &mut self.inner;
                if let Err(e) = self.send_queue.flush(|_, data| inner.send(target, data)) {
                    log::debug!("socks5 flush failed: {e}");
                }
                true
            }
            State::Connected | State::Error => false,
        }
    }
}

impl IceSocket for Socks5Socket {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        match self.state {
            State::Connected => self.inner.send(self.target, data),
            State::Error => Err(io::Error::new(io::ErrorKind::NotConnected, "socks5 failed")),
            _ => {
                self.send_queue.push(to, data);
                Ok(())
            }
        }
    }

    fn pull(&mut self, out: &mut Vec<Datagram>) {
        let mut chunks = Vec::new();
        self.inner.pull(&mut chunks);

        for chunk in chunks {
            if self.state == State::Connected {
                out.push(Datagram {
                    source: self.target,
                    data: chunk.data,
                });
                continue;
            }

            self.recv_buf.extend_from_slice(&chunk.data);
            while self.advance() {}

            // bytes following the CONNECT reply are payload
            if self.state == State::Connected && !self.recv_buf.is_empty() {
                out.push(Datagram {
                    source: self.target,
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
