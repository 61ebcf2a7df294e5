//! Relayed candidates end to end: TURN over TCP through a SOCKS5 proxy,
//! against an in-process relay server.
//!
//! The direct route between the two hosts is severed, so the relayed pair is
//! the only one that can succeed.

mod common;

use common::{drive_until, exchange, init_logging, new_agent};
use rime_ice::context::{MemoryNet, MemoryTcpListener, Transport};
use rime_ice::{CandidateType, Compatibility, ComponentState, RelayType};
use rime_stun_types::attributes::{
    ChannelNumber, Data, ErrorCode, Lifetime, Nonce, Realm, Username, XorMappedAddress,
    XorPeerAddress, XorRelayedAddress,
};
use rime_stun_types::{is_channel_data, ChannelData, Class, Message, MessageBuilder, Method};
use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Instant;

const PROXY_ADDR: &str = "10.0.0.99:1080";
const TURN_ADDR: &str = "9.9.9.9:3478";

/// A SOCKS5 proxy fused with a minimal TURN server, terminating the agent's
/// TCP stack and relaying between its allocation and the UDP world.
struct RelayFixture {
    net: MemoryNet,
    listener: MemoryTcpListener,
    conn: Option<Box<dyn Transport>>,
    buf: Vec<u8>,
    socks_phase: u8,
    relay_udp: Option<Box<dyn Transport>>,
    relay_ip: IpAddr,
    channels: Vec<(u16, SocketAddr)>,
    authenticated: bool,
}

impl RelayFixture {
    fn new(net: &MemoryNet) -> Self {
        RelayFixture {
            net: net.clone(),
            listener: net.listen_tcp(PROXY_ADDR.parse().unwrap()),
            conn: None,
            buf: Vec::new(),
            socks_phase: 0,
            relay_udp: None,
            relay_ip: "9.9.9.9".parse().unwrap(),
            channels: Vec::new(),
            authenticated: false,
        }
    }

    fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_udp.as_ref().map(|t| t.local_addr())
    }

    fn reply(&mut self, data: &[u8]) {
        // STUN messages are 4-aligned already, channel frames may need pad
        let mut framed = data.to_vec();
        while framed.len() % 4 != 0 {
            framed.push(0);
        }
        if let Some(conn) = &mut self.conn {
            conn.send_to("0.0.0.0:0".parse().unwrap(), &framed).unwrap();
        }
    }

    fn pump(&mut self) {
        if self.conn.is_none() {
            self.conn = self.listener.accept();
        }
        let Some(conn) = &mut self.conn else { return };

        while let Ok(Some(chunk)) = conn.try_recv() {
            self.buf.extend_from_slice(&chunk.data);
        }

        self.pump_socks();
        if self.socks_phase == 2 {
            self.pump_turn();
        }
        self.pump_relay_udp();
    }

    fn pump_socks(&mut self) {
        if self.socks_phase == 0 && self.buf.len() >= 3 {
            assert_eq!(&self.buf[..3], &[0x05, 0x01, 0x00]);
            self.buf.drain(..3);
            self.reply_raw(&[0x05, 0x00]);
            self.socks_phase = 1;
        }
        if self.socks_phase == 1 && self.buf.len() >= 10 {
            assert_eq!(&self.buf[..4], &[0x05, 0x01, 0x00, 0x01]);
            self.buf.drain(..10);
            self.reply_raw(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
            self.socks_phase = 2;
        }
    }

    fn reply_raw(&mut self, data: &[u8]) {
        if let Some(conn) = &mut self.conn {
            conn.send_to("0.0.0.0:0".parse().unwrap(), data).unwrap();
        }
    }

    /// Pull complete frames off the TCP stream (STUN-length or channel
    /// header, 4-byte aligned).
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 4 {
            return None;
        }
        let magic = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        let message = if magic < 0x4000 { 20 + len } else { 4 + len };
        let padded = message + (4 - message % 4) % 4;
        if self.buf.len() < padded {
            return None;
        }
        let frame = self.buf[..message].to_vec();
        self.buf.drain(..padded);
        Some(frame)
    }

    fn pump_turn(&mut self) {
        while let Some(frame) = self.next_frame() {
            if is_channel_data(&frame) {
                let frame = ChannelData::parse(&frame).unwrap();
                let peer = self
                    .channels
                    .iter()
                    .find(|(number, _)| *number == frame.number)
                    .map(|(_, peer)| *peer);
                if let (Some(peer), Some(udp)) = (peer, &mut self.relay_udp) {
                    udp.send_to(peer, &frame.data).unwrap();
                }
                continue;
            }

            let msg = Message::parse(frame).unwrap();
            match (msg.method(), msg.class()) {
                (Method::Allocate, Class::Request) => self.handle_allocate(&msg),
                (Method::CreatePermission, Class::Request) => {
                    let mut b =
                        MessageBuilder::new(Class::Success, Method::CreatePermission, msg.transaction_id());
                    b.add_attr(&Lifetime(300));
                    let bytes = b.finish();
                    self.reply(&bytes);
                }
                (Method::ChannelBind, Class::Request) => {
                    let number = msg.attribute::<ChannelNumber>().unwrap().unwrap().0;
                    let peer = msg.attribute::<XorPeerAddress>().unwrap().unwrap().0;
                    self.channels.push((number, peer));
                    let b = MessageBuilder::new(Class::Success, Method::ChannelBind, msg.transaction_id());
                    let bytes = b.finish();
                    self.reply(&bytes);
                }
                (Method::Refresh, Class::Request) => {
                    let mut b =
                        MessageBuilder::new(Class::Success, Method::Refresh, msg.transaction_id());
                    b.add_attr(&Lifetime(600));
                    let bytes = b.finish();
                    self.reply(&bytes);
                }
                (Method::Send, Class::Indication) => {
                    let peer = msg.attribute::<XorPeerAddress>().unwrap().unwrap().0;
                    let payload = msg.attribute::<Data>().unwrap().unwrap().0;
                    if let Some(udp) = &mut self.relay_udp {
                        udp.send_to(peer, &payload).unwrap();
                    }
                }
                other => panic!("fixture got unexpected message {other:?}"),
            }
        }
    }

    fn handle_allocate(&mut self, msg: &Message) {
        // first pass gets the long-term credential challenge
        if !self.authenticated {
            if msg.attribute::<Username>().is_none() {
                let mut b = MessageBuilder::new(Class::Error, Method::Allocate, msg.transaction_id());
                b.add_attr(&ErrorCode::new(401, "Unauthorized"));
                b.add_attr(&Realm::new("rime.test"));
                b.add_attr(&Nonce::new("nonce-1"));
                let bytes = b.finish();
                self.reply(&bytes);
                return;
            }
            assert!(msg.attribute::<Realm>().is_some());
            assert!(msg.has_integrity());
            self.authenticated = true;
        }

        if self.relay_udp.is_none() {
            self.relay_udp = Some(
                self.net
                    .bind_udp(SocketAddr::new(self.relay_ip, 0))
                    .unwrap(),
            );
        }

        let mut b = MessageBuilder::new(Class::Success, Method::Allocate, msg.transaction_id());
        b.add_attr(&XorRelayedAddress(self.relay_addr().unwrap()));
        b.add_attr(&XorMappedAddress("8.8.8.8:4242".parse().unwrap()));
        b.add_attr(&Lifetime(600));
        let bytes = b.finish();
        self.reply(&bytes);
    }

    /// Traffic arriving at the allocation goes back to the client, as
    /// ChannelData once a channel exists, as a Data indication before.
    fn pump_relay_udp(&mut self) {
        let mut inbound = Vec::new();
        if let Some(udp) = &mut self.relay_udp {
            while let Ok(Some(datagram)) = udp.try_recv() {
                inbound.push(datagram);
            }
        }

        for datagram in inbound {
            let channel = self
                .channels
                .iter()
                .find(|(_, peer)| *peer == datagram.source)
                .map(|(number, _)| *number);

            match channel {
                Some(number) => {
                    let frame = ChannelData::new(number, datagram.data).encode();
                    self.reply(&frame);
                }
                None => {
                    let mut b = MessageBuilder::new(
                        Class::Indication,
                        Method::Data,
                        rime_stun_types::TransactionId::random(),
                    );
                    b.add_attr(&XorPeerAddress(datagram.source));
                    b.add_attr(&Data(datagram.data));
                    let bytes = b.finish();
                    self.reply(&bytes);
                }
            }
        }
    }
}

#[test]
fn turn_tcp_over_socks5_relays_the_component() {
    init_logging();
    let net = MemoryNet::new();

    // the direct route is dead; only the relay bridges the two hosts
    net.block_route("10.0.0.1".parse().unwrap(), "9.9.9.8".parse().unwrap());

    let fixture = Rc::new(RefCell::new(RelayFixture::new(&net)));

    let mut left = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let mut right = new_agent(&net, "9.9.9.8", Compatibility::Rfc5245, false);

    let stream_l = left.add_stream(1).unwrap();
    let stream_r = right.add_stream(1).unwrap();

    left.set_proxy_info(PROXY_ADDR.parse().unwrap(), None, None);
    left.set_relay_info(
        stream_l,
        1,
        TURN_ADDR.parse().unwrap(),
        "relay-user",
        "relay-pass",
        RelayType::Tcp,
    )
    .unwrap();

    left.gather_candidates(stream_l).unwrap();
    right.gather_candidates(stream_r).unwrap();

    // allocation completes through SOCKS5 -> TCP framing -> TURN
    let mut now = Instant::now();
    let pump = fixture.clone();
    drive_until(
        &mut [&mut left, &mut right],
        &mut now,
        move || pump.borrow_mut().pump(),
        |agents| {
            agents[0]
                .get_local_candidates(stream_l, 1)
                .unwrap()
                .iter()
                .any(|c| c.kind == CandidateType::Relayed)
        },
    );

    let relayed = left
        .get_local_candidates(stream_l, 1)
        .unwrap()
        .into_iter()
        .find(|c| c.kind == CandidateType::Relayed)
        .unwrap();
    assert_eq!(relayed.addr, fixture.borrow().relay_addr().unwrap());

    exchange(&mut left, stream_l, &mut right, stream_r, 1);

    let pump = fixture.clone();
    drive_until(
        &mut [&mut left, &mut right],
        &mut now,
        move || pump.borrow_mut().pump(),
        |agents| {
            agents[0].component_state(stream_l, 1) == Ok(ComponentState::Ready)
                && agents[1].component_state(stream_r, 1) == Ok(ComponentState::Ready)
        },
    );

    // the selected path is the relayed candidate, the only one that works
    let (selected_local, _) = left.get_selected_pair(stream_l, 1).unwrap();
    assert_eq!(selected_local.kind, CandidateType::Relayed);

    // payload round-trips through SOCKS5 -> TCP framing -> TURN -> UDP
    let to_right = Rc::new(RefCell::new(Vec::new()));
    let sink = to_right.clone();
    right
        .attach_recv(stream_r, 1, move |data| {
            sink.borrow_mut().extend_from_slice(data)
        })
        .unwrap();
    let to_left = Rc::new(RefCell::new(Vec::new()));
    let sink = to_left.clone();
    left.attach_recv(stream_l, 1, move |data| {
        sink.borrow_mut().extend_from_slice(data)
    })
    .unwrap();

    left.send(stream_l, 1, b"over the relay").unwrap();
    right.send(stream_r, 1, b"and back").unwrap();

    for _ in 0..10 {
        fixture.borrow_mut().pump();
        left.poll(now);
        right.poll(now);
    }

    assert_eq!(to_right.borrow().as_slice(), b"over the relay");
    assert_eq!(to_left.borrow().as_slice(), b"and back");
}
