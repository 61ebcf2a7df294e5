//! The platform port.
//!
//! The agent never touches operating-system sockets directly; an
//! [`EventContext`] supplies transports and the local interface list, and the
//! embedder's event loop drives the agent with [`poll`](crate::IceAgent::poll)
//! whenever a transport is readable or the [`timeout`](crate::IceAgent::timeout)
//! deadline passes. Any loop (glib, libuv-style reactors, a test harness)
//! can back this trait; [`MemoryNet`] is the built-in in-process backend.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// One received datagram, after any framing layers have been peeled off.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub source: SocketAddr,
    pub data: Vec<u8>,
}

/// A non-blocking platform socket handle.
///
/// For UDP each send carries its destination; connected TCP transports ignore
/// it. Receiving is pull-style: `try_recv` returns whatever the platform has
/// buffered, or `None` when the socket would block.
pub trait Transport {
    fn send_to(&mut self, target: SocketAddr, data: &[u8]) -> io::Result<usize>;
    fn try_recv(&mut self) -> io::Result<Option<Datagram>>;
    fn local_addr(&self) -> SocketAddr;
    fn close(&mut self);
}

/// Factory for transports plus host interface enumeration.
pub trait EventContext {
    fn bind_udp(&mut self, addr: SocketAddr) -> io::Result<Box<dyn Transport>>;
    fn connect_tcp(&mut self, local: IpAddr, remote: SocketAddr) -> io::Result<Box<dyn Transport>>;
    /// Addresses to derive host candidates from when the application did not
    /// add any explicitly.
    fn local_addresses(&self) -> Vec<IpAddr>;
}

/// A restartable interval timer, polled from the agent's `poll` path.
#[derive(Debug)]
pub struct Timer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            deadline: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once per elapsed interval; re-arms itself.
    pub fn fired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }

    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

// ---------------------------------------------------------------------------
// In-memory backend

type ConnId = u64;

#[derive(Default)]
struct NetInner {
    udp: HashMap<SocketAddr, VecDeque<Datagram>>,
    conns: HashMap<ConnId, TcpConn>,
    listeners: HashMap<SocketAddr, VecDeque<ConnId>>,
    blocked: Vec<(IpAddr, IpAddr)>,
    next_conn: ConnId,
    next_port: u16,
}

impl NetInner {
    fn is_blocked(&self, a: IpAddr, b: IpAddr) -> bool {
        self.blocked
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

struct TcpConn {
    addr_a: SocketAddr,
    addr_b: SocketAddr,
    to_a: VecDeque<Vec<u8>>,
    to_b: VecDeque<Vec<u8>>,
    open: bool,
}

/// An in-process packet network shared by every [`MemoryContext`] attached to
/// it. Datagrams to unbound addresses vanish, like packets to an unreachable
/// port would.
#[derive(Clone, Default)]
pub struct MemoryNet {
    inner: Rc<RefCell<NetInner>>,
}

impl MemoryNet {
    pub fn new() -> Self {
        MemoryNet {
            inner: Rc::new(RefCell::new(NetInner {
                next_port: 40_000,
                ..NetInner::default()
            })),
        }
    }

    pub fn bind_udp(&self, mut addr: SocketAddr) -> io::Result<Box<dyn Transport>> {
        let mut inner = self.inner.borrow_mut();

        if addr.port() == 0 {
            addr.set_port(alloc_port(&mut inner, addr.ip()));
        } else if inner.udp.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "port taken"));
        }

        inner.udp.insert(addr, VecDeque::new());

        Ok(Box::new(MemoryUdp {
            net: self.clone(),
            local: addr,
            closed: false,
        }))
    }

    pub fn connect_tcp(&self, local: IpAddr, remote: SocketAddr) -> io::Result<Box<dyn Transport>> {
        let mut inner = self.inner.borrow_mut();

        if !inner.listeners.contains_key(&remote) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no listener",
            ));
        }

        let local = SocketAddr::new(local, alloc_port(&mut inner, local));
        let id = inner.next_conn;
        inner.next_conn += 1;
        inner.conns.insert(
            id,
            TcpConn {
                addr_a: local,
                addr_b: remote,
                to_a: VecDeque::new(),
                to_b: VecDeque::new(),
                open: true,
            },
        );
        inner
            .listeners
            .get_mut(&remote)
            .expect("checked above")
            .push_back(id);

        Ok(Box::new(MemoryTcp {
            net: self.clone(),
            conn: id,
            local,
            peer: remote,
            a_side: true,
        }))
    }

    /// Drop all UDP traffic between two hosts, both directions. Simulates a
    /// broken direct path that only a relay can bridge.
    pub fn block_route(&self, a: IpAddr, b: IpAddr) {
        self.inner.borrow_mut().blocked.push((a, b));
    }

    /// Register a TCP listener, for test fixtures playing server roles.
    pub fn listen_tcp(&self, addr: SocketAddr) -> MemoryTcpListener {
        self.inner
            .borrow_mut()
            .listeners
            .entry(addr)
            .or_default();

        MemoryTcpListener {
            net: self.clone(),
            addr,
        }
    }
}

fn alloc_port(inner: &mut NetInner, ip: IpAddr) -> u16 {
    loop {
        let port = inner.next_port.max(40_000);
        inner.next_port = port.wrapping_add(1).max(40_000);
        if !inner.udp.contains_key(&SocketAddr::new(ip, port)) {
            return port;
        }
    }
}

pub struct MemoryTcpListener {
    net: MemoryNet,
    addr: SocketAddr,
}

impl MemoryTcpListener {
    pub fn accept(&self) -> Option<Box<dyn Transport>> {
        let mut inner = self.net.inner.borrow_mut();
        let id = inner.listeners.get_mut(&self.addr)?.pop_front()?;
        let conn = inner.conns.get(&id)?;
        let peer = conn.addr_a;

        Some(Box::new(MemoryTcp {
            net: self.net.clone(),
            conn: id,
            local: self.addr,
            peer,
            a_side: false,
        }))
    }
}

struct MemoryUdp {
    net: MemoryNet,
    local: SocketAddr,
    closed: bool,
}

impl Transport for MemoryUdp {
    fn send_to(&mut self, target: SocketAddr, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }

        let mut inner = self.net.inner.borrow_mut();
        if inner.is_blocked(self.local.ip(), target.ip()) {
            return Ok(data.len());
        }
        if let Some(queue) = inner.udp.get_mut(&target) {
            queue.push_back(Datagram {
                source: self.local,
                data: data.to_vec(),
            });
        }
        Ok(data.len())
    }

    fn try_recv(&mut self) -> io::Result<Option<Datagram>> {
        if self.closed {
            return Ok(None);
        }
        let mut inner = self.net.inner.borrow_mut();
        Ok(inner.udp.get_mut(&self.local).and_then(|q| q.pop_front()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.net.inner.borrow_mut().udp.remove(&self.local);
        }
    }
}

struct MemoryTcp {
    net: MemoryNet,
    conn: ConnId,
    local: SocketAddr,
    peer: SocketAddr,
    a_side: bool,
}

impl Transport for MemoryTcp {
    fn send_to(&mut self, _target: SocketAddr, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.net.inner.borrow_mut();
        let conn = self
            .net_conn(&mut inner)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection gone"))?;
        if !conn.open {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }

        let queue = if self.a_side { &mut conn.to_b } else { &mut conn.to_a };
        queue.push_back(data.to_vec());
        Ok(data.len())
    }

    fn try_recv(&mut self) -> io::Result<Option<Datagram>> {
        let mut inner = self.net.inner.borrow_mut();
        let peer = self.peer;
        let Some(conn) = self.net_conn(&mut inner) else {
            return Ok(None);
        };

        let queue = if self.a_side { &mut conn.to_a } else { &mut conn.to_b };
        Ok(queue.pop_front().map(|data| Datagram { source: peer, data }))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&mut self) {
        let mut inner = self.net.inner.borrow_mut();
        if let Some(conn) = self.net_conn(&mut inner) {
            conn.open = false;
        }
    }
}

impl MemoryTcp {
    fn net_conn<'a>(&self, inner: &'a mut NetInner) -> Option<&'a mut TcpConn> {
        inner.conns.get_mut(&self.conn)
    }
}

/// [`EventContext`] backed by a [`MemoryNet`], presenting a single host
/// address.
pub struct MemoryContext {
    net: MemoryNet,
    ip: IpAddr,
}

impl MemoryContext {
    pub fn new(net: MemoryNet, ip: IpAddr) -> Self {
        MemoryContext { net, ip }
    }
}

impl EventContext for MemoryContext {
    fn bind_udp(&mut self, addr: SocketAddr) -> io::Result<Box<dyn Transport>> {
        let addr = if addr.ip().is_unspecified() {
            SocketAddr::new(self.ip, addr.port())
        } else {
            addr
        };
        self.net.bind_udp(addr)
    }

    fn connect_tcp(&mut self, local: IpAddr, remote: SocketAddr) -> io::Result<Box<dyn Transport>> {
        let local = if local.is_unspecified() { self.ip } else { local };
        self.net.connect_tcp(local, remote)
    }

    fn local_addresses(&self) -> Vec<IpAddr> {
        vec![self.ip]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn udp_delivery_and_blackhole() {
        let net = MemoryNet::new();
        let mut a = net.bind_udp(addr("10.0.0.1:1000")).unwrap();
        let mut b = net.bind_udp(addr("10.0.0.2:2000")).unwrap();

        a.send_to(b.local_addr(), b"hi").unwrap();
        // nothing listens on port 80
        a.send_to(addr("10.0.0.2:80"), b"void").unwrap();

        let got = b.try_recv().unwrap().unwrap();
        assert_eq!(got.data, b"hi");
        assert_eq!(got.source, a.local_addr());
        assert!(b.try_recv().unwrap().is_none());
    }

    #[test]
    fn udp_bind_conflicts() {
        let net = MemoryNet::new();
        let _a = net.bind_udp(addr("10.0.0.1:1000")).unwrap();
        assert!(net.bind_udp(addr("10.0.0.1:1000")).is_err());

        let b = net.bind_udp(addr("10.0.0.1:0")).unwrap();
        assert_ne!(b.local_addr().port(), 0);
    }

    #[test]
    fn tcp_connect_and_shuttle() {
        let net = MemoryNet::new();
        let listener = net.listen_tcp(addr("10.0.0.9:3478"));

        let mut client = net
            .connect_tcp("10.0.0.1".parse().unwrap(), addr("10.0.0.9:3478"))
            .unwrap();
        let mut server = listener.accept().unwrap();

        client.send_to(addr("0.0.0.0:0"), b"ping").unwrap();
        assert_eq!(server.try_recv().unwrap().unwrap().data, b"ping");
        server.send_to(addr("0.0.0.0:0"), b"pong").unwrap();
        assert_eq!(client.try_recv().unwrap().unwrap().data, b"pong");
    }

    #[test]
    fn connect_to_nothing_is_refused() {
        let net = MemoryNet::new();
        assert!(net
            .connect_tcp("10.0.0.1".parse().unwrap(), addr("10.9.9.9:1"))
            .is_err());
    }

    #[test]
    fn timer_fires_and_rearms() {
        let mut timer = Timer::new(Duration::from_millis(20));
        let start = Instant::now();

        assert!(!timer.fired(start));
        timer.start(start);
        assert!(!timer.fired(start));
        assert!(timer.fired(start + Duration::from_millis(20)));
        assert!(!timer.fired(start + Duration::from_millis(25)));
        assert!(timer.fired(start + Duration::from_millis(45)));

        timer.stop();
        assert!(!timer.fired(start + Duration::from_secs(1)));
    }
}
