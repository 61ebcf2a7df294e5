use crate::compat::TurnFlavor;
use crate::context::Datagram;
use crate::socket::IceSocket;
use crate::stun_build::{RetransmitAction, RetransmitTimer, StunConfig};
use rime_stun_types::attributes::{
    ChannelNumber, Data, ErrorCode, Nonce, Realm, Username, XorPeerAddress,
};
use rime_stun_types::{
    is_channel_data, ChannelData, Class, IntegrityKey, Message, MessageBuilder, Method,
    TransactionId,
};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Long-term credentials for the relay, with the realm/nonce state learned
/// from 401 challenges.
#[derive(Debug, Clone)]
pub struct TurnAuth {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub nonce: Option<String>,
}

enum PermState {
    Installing {
        tid: TransactionId,
        request: Vec<u8>,
        timer: RetransmitTimer,
        auth_retried: bool,
    },
    Active,
}

struct Permission {
    peer_ip: IpAddr,
    state: PermState,
    /// Sends issued while the permission was being installed.
    queued: Vec<(SocketAddr, Vec<u8>)>,
}

enum ChanState {
    Binding {
        tid: TransactionId,
        request: Vec<u8>,
        timer: RetransmitTimer,
    },
    Bound,
}

struct ChannelBinding {
    peer: SocketAddr,
    number: u16,
    state: ChanState,
}

/// Client end of a TURN allocation, layered over the socket the allocation
/// was made on. Outbound datagrams leave as ChannelData or Send indications;
/// inbound relay traffic is demultiplexed back to `(peer, payload)`.
///
/// The Allocate exchange itself belongs to the discovery engine; this layer
/// takes over once the relayed address exists. Server messages it does not
/// recognize (Refresh responses in particular) surface unconsumed with the
/// server as their source.
pub struct TurnSocket {
    inner: Box<dyn IceSocket>,
    server: SocketAddr,
    relayed: SocketAddr,
    flavor: TurnFlavor,
    auth: Option<TurnAuth>,
    permissions: Vec<Permission>,
    channels: Vec<ChannelBinding>,
    next_channel: u16,
    config: StunConfig,
    now: Instant,
}

impl TurnSocket {
    pub fn new(
        inner: Box<dyn IceSocket>,
        server: SocketAddr,
        relayed: SocketAddr,
        flavor: TurnFlavor,
        auth: Option<TurnAuth>,
        now: Instant,
    ) -> Self {
        TurnSocket {
            inner,
            server,
            relayed,
            flavor,
            auth,
            permissions: Vec::new(),
            channels: Vec::new(),
            next_channel: rime_stun_types::CHANNEL_NUMBER_MIN,
            config: StunConfig::new(),
            now,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed
    }

    /// Send a raw STUN message to the relay server itself (allocation
    /// refreshes).
    pub fn send_control(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.send(self.server, data)
    }

    pub fn auth(&self) -> Option<&TurnAuth> {
        self.auth.as_ref()
    }

    /// Adopt a fresh realm/nonce from a 401/438 challenge seen by a caller
    /// driving its own transactions over this allocation.
    pub fn set_challenge(&mut self, realm: Option<String>, nonce: Option<String>) {
        if let Some(auth) = &mut self.auth {
            if realm.is_some() {
                auth.realm = realm;
            }
            if nonce.is_some() {
                auth.nonce = nonce;
            }
        }
    }

    fn needs_permission(&self) -> bool {
        matches!(self.flavor, TurnFlavor::Rfc5766 | TurnFlavor::Oc2007)
    }

    fn use_channels(&self) -> bool {
        matches!(self.flavor, TurnFlavor::Rfc5766 | TurnFlavor::Draft9)
    }

    fn add_auth(&self, builder: &mut MessageBuilder) {
        let Some(auth) = &self.auth else { return };

        builder.add_attr(&Username::new(auth.username.clone()));
        if let (Some(realm), Some(nonce)) = (&auth.realm, &auth.nonce) {
            builder.add_attr(&Realm::new(realm.clone()));
            builder.add_attr(&Nonce::new(nonce.clone()));
            builder.add_message_integrity(&IntegrityKey::long_term(
                &auth.username,
                realm,
                &auth.password,
            ));
        }
    }

    fn send_indication(&mut self, peer: SocketAddr, data: &[u8]) -> io::Result<()> {
        let mut builder =
            MessageBuilder::new(Class::Indication, Method::Send, TransactionId::random());
        builder.add_attr(&XorPeerAddress(peer));
        builder.add_attr(&Data(data.to_vec()));
        let bytes = builder.finish();
        self.inner.send(self.server, &bytes)
    }

    fn make_permission_request(&self, peer: SocketAddr) -> (TransactionId, Vec<u8>) {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, Method::CreatePermission, tid);
        builder.add_attr(&XorPeerAddress(peer));
        self.add_auth(&mut builder);
        (tid, builder.finish())
    }

    fn make_channel_bind(&self, peer: SocketAddr, number: u16) -> (TransactionId, Vec<u8>) {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, Method::ChannelBind, tid);
        builder.add_attr(&ChannelNumber(number));
        builder.add_attr(&XorPeerAddress(peer));
        self.add_auth(&mut builder);
        (tid, builder.finish())
    }

    fn install_permission(&mut self, peer: SocketAddr, payload: Option<Vec<u8>>) {
        let (tid, request) = self.make_permission_request(peer);
        if let Err(e) = self.inner.send(self.server, &request) {
            log::debug!("turn create-permission send failed: {e}");
        }

        self.permissions.push(Permission {
            peer_ip: peer.ip(),
            state: PermState::Installing {
                tid,
                request,
                timer: RetransmitTimer::new(self.now, &self.config, self.config.max_check_attempts),
                auth_retried: false,
            },
            queued: payload.into_iter().map(|data| (peer, data)).collect(),
        });
    }

    fn bind_channel(&mut self, peer: SocketAddr) {
        if !self.use_channels() || self.channels.iter().any(|c| c.peer == peer) {
            return;
        }
        if self.next_channel > rime_stun_types::CHANNEL_NUMBER_MAX {
            return;
        }

        let number = self.next_channel;
        self.next_channel += 1;

        let (tid, request) = self.make_channel_bind(peer, number);
        if let Err(e) = self.inner.send(self.server, &request) {
            log::debug!("turn channel-bind send failed: {e}");
        }

        self.channels.push(ChannelBinding {
            peer,
            number,
            state: ChanState::Binding {
                tid,
                request,
                timer: RetransmitTimer::new(self.now, &self.config, self.config.max_check_attempts),
            },
        });
    }

    /// Handle a server STUN message belonging to this layer. Returns false
    /// when the message is not ours and should surface to the caller.
    fn handle_control(&mut self, msg: &Message) -> bool {
        match msg.method() {
            Method::CreatePermission => self.handle_permission_response(msg),
            Method::ChannelBind => self.handle_channel_response(msg),
            _ => false,
        }
    }

    fn handle_permission_response(&mut self, msg: &Message) -> bool {
        let tid = msg.transaction_id();
        let Some(idx) = self.permissions.iter().position(
            |p| matches!(&p.state, PermState::Installing { tid: t, .. } if *t == tid),
        ) else {
            return false;
        };

        match msg.class() {
            Class::Success => {
                let permission = &mut self.permissions[idx];
                permission.state = PermState::Active;
                let queued = std::mem::take(&mut permission.queued);

                for (peer, data) in queued {
                    if let Err(e) = self.send_indication(peer, &data) {
                        log::debug!("turn flush failed: {e}");
                    }
                    self.bind_channel(peer);
                }
                true
            }
            Class::Error => {
                let code = match msg.attribute::<ErrorCode>() {
                    Some(Ok(error)) => error.number,
                    _ => 0,
                };

                let retry = (code == 401 || code == 438) && self.absorb_challenge(msg);
                let PermState::Installing { auth_retried, .. } = &self.permissions[idx].state
                else {
                    return true;
                };
                let auth_retried = *auth_retried;

                if retry && !auth_retried {
                    let peer_ip = self.permissions[idx].peer_ip;
                    let queued = std::mem::take(&mut self.permissions[idx].queued);
                    self.permissions.remove(idx);

                    // re-issue with the fresh nonce
                    let Some(&(peer, _)) = queued.first() else {
                        return true;
                    };
                    debug_assert_eq!(peer.ip(), peer_ip);
                    let (new_tid, request) = self.make_permission_request(peer);
                    if self.inner.send(self.server, &request).is_ok() {
                        self.permissions.push(Permission {
                            peer_ip,
                            state: PermState::Installing {
                                tid: new_tid,
                                request,
                                timer: RetransmitTimer::new(
                                    self.now,
                                    &self.config,
                                    self.config.max_check_attempts,
                                ),
                                auth_retried: true,
                            },
                            queued,
                        });
                    }
                } else {
                    log::debug!("turn permission refused with code {code}");
                    self.permissions.remove(idx);
                }
                true
            }
            _ => false,
        }
    }

    fn handle_channel_response(&mut self, msg: &Message) -> bool {
        let tid = msg.transaction_id();
        let Some(idx) = self.channels.iter().position(
            |c| matches!(&c.state, ChanState::Binding { tid: t, .. } if *t == tid),
        ) else {
            return false;
        };

        match msg.class() {
            Class::Success => {
                self.channels[idx].state = ChanState::Bound;
                true
            }
            Class::Error => {
                // fall back to send indications for this peer
                self.channels.remove(idx);
                true
            }
            _ => false,
        }
    }

    /// Pull realm/nonce out of a 401/438 challenge into our auth state.
    fn absorb_challenge(&mut self, msg: &Message) -> bool {
        let Some(auth) = &mut self.auth else {
            return false;
        };

        if let Some(Ok(realm)) = msg.attribute::<Realm>() {
            auth.realm = Some(realm.0);
        }
        match msg.attribute::<Nonce>() {
            Some(Ok(nonce)) => {
                auth.nonce = Some(nonce.0);
                auth.realm.is_some()
            }
            _ => false,
        }
    }
}

impl IceSocket for TurnSocket {
    fn send(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        if let Some(channel) = self
            .channels
            .iter()
            .find(|c| c.peer == to && matches!(c.state, ChanState::Bound))
        {
            let frame = ChannelData::new(channel.number, data.to_vec()).encode();
            return self.inner.send(self.server, &frame);
        }

        if !self.needs_permission() {
            self.send_indication(to, data)?;
            self.bind_channel(to);
            return Ok(());
        }

        match self.permissions.iter().position(|p| p.peer_ip == to.ip()) {
            Some(idx) => {
                if matches!(self.permissions[idx].state, PermState::Active) {
                    self.send_indication(to, data)?;
                    self.bind_channel(to);
                } else {
                    self.permissions[idx].queued.push((to, data.to_vec()));
                }
                Ok(())
            }
            None => {
                self.install_permission(to, Some(data.to_vec()));
                Ok(())
            }
        }
    }

    fn pull(&mut self, out: &mut Vec<Datagram>) {
        let mut inbound = Vec::new();
        self.inner.pull(&mut inbound);

        for datagram in inbound {
            if is_channel_data(&datagram.data) {
                let Ok(frame) = ChannelData::parse(&datagram.data) else {
                    log::trace!("bad channel data frame, dropped");
                    continue;
                };
                let peer = self
                    .channels
                    .iter()
                    .find(|c| c.number == frame.number)
                    .map(|c| c.peer);
                match peer {
                    Some(peer) => out.push(Datagram {
                        source: peer,
                        data: frame.data,
                    }),
                    None => log::trace!("data on unbound channel {:#06x}", frame.number),
                }
                continue;
            }

            let Ok(msg) = Message::parse(datagram.data.clone()) else {
                log::trace!("undecodable message from turn server, dropped");
                continue;
            };

            // relayed traffic from a peer
            if msg.method() == Method::Data && msg.class() == Class::Indication {
                let (Some(Ok(peer)), Some(Ok(payload))) =
                    (msg.attribute::<XorPeerAddress>(), msg.attribute::<Data>())
                else {
                    continue;
                };
                out.push(Datagram {
                    source: peer.0,
                    data: payload.0,
                });
                continue;
            }

            if !self.handle_control(&msg) {
                // not ours (e.g. a Refresh response), hand it upward
                out.push(datagram);
            }
        }
    }

    fn poll(&mut self, now: Instant) {
        self.now = now;
        self.inner.poll(now);

        let mut resend = Vec::new();
        self.permissions.retain_mut(|permission| {
            let PermState::Installing { request, timer, .. } = &mut permission.state else {
                return true;
            };
            match timer.poll(now, &self.config) {
                RetransmitAction::Wait => true,
                RetransmitAction::Retransmit => {
                    resend.push(request.clone());
                    true
                }
                RetransmitAction::TimedOut => {
                    log::debug!("turn permission for {} timed out", permission.peer_ip);
                    false
                }
            }
        });
        self.channels.retain_mut(|channel| {
            let ChanState::Binding { request, timer, .. } = &mut channel.state else {
                return true;
            };
            match timer.poll(now, &self.config) {
                RetransmitAction::Wait => true,
                RetransmitAction::Retransmit => {
                    resend.push(request.clone());
                    true
                }
                RetransmitAction::TimedOut => false,
            }
        });

        for request in resend {
            if let Err(e) = self.inner.send(self.server, &request) {
                log::trace!("turn retransmit failed: {e}");
            }
        }
    }

    fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = self.inner.timeout(now);

        for permission in &self.permissions {
            if let PermState::Installing { timer, .. } = &permission.state {
                timeout = opt_min(timeout, Some(timer.timeout(now)));
            }
        }
        for channel in &self.channels {
            if let ChanState::Binding { timer, .. } = &channel.state {
                timeout = opt_min(timeout, Some(timer.timeout(now)));
            }
        }
        timeout
    }

    fn is_reliable(&self) -> bool {
        self.inner.is_reliable()
    }

    fn local_addr(&self) -> SocketAddr {
        self.relayed
    }

    fn close(&mut self) {
        self.permissions.clear();
        self.channels.clear();
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn as_turn_mut(&mut self) -> Option<&mut TurnSocket> {
        Some(self)
    }
}

fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}
