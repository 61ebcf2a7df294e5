//! Candidate gathering: host binding, STUN Binding discoveries and TURN
//! Allocate exchanges, all driven off one scheduler tick.

use crate::agent::{AgentError, AgentEvent, IceAgent};
use crate::candidate::{
    candidate_priority, compute_foundation, Candidate, CandidateType, LocalCandidateId,
    TransportType,
};
use crate::compat::TurnFlavor;
use crate::component::{ComponentState, RelayType, TurnServerConfig};
use crate::socket::{
    FrameFlavor, IceSocket, PseudoSslSocket, SocketId, Socks5Socket, TcpFrameSocket, TcpSocket,
    TurnSocket, UdpSocket,
};
use crate::stun_build::{new_transaction_id, RetransmitAction, RetransmitTimer};
use crate::{address, StreamId};
use rime_stun_types::attributes::{
    ErrorCode, Lifetime, Nonce, Realm, RequestedTransport, Username, XorRelayedAddress,
    TRANSPORT_UDP,
};
use rime_stun_types::{Class, IntegrityKey, Message, MessageBuilder, Method, TransactionId};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Allocation lifetime requested from, and defaulted by, TURN servers.
const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscoveryKind {
    /// STUN Binding for a server-reflexive candidate.
    Binding,
    /// TURN Allocate for a relayed candidate.
    Allocate,
}

/// A pending discovery transaction towards one STUN/TURN server.
pub(crate) struct CandidateDiscovery {
    pub(crate) kind: DiscoveryKind,
    pub(crate) stream_id: StreamId,
    pub(crate) component_id: u8,
    pub(crate) socket: SocketId,
    pub(crate) server: SocketAddr,
    pub(crate) turn: Option<TurnServerConfig>,
    realm: Option<String>,
    nonce: Option<String>,
    auth_attempts: u32,
    tx: Option<(TransactionId, Vec<u8>, RetransmitTimer)>,
    pub(crate) done: bool,
}

impl CandidateDiscovery {
    fn max_attempts(&self, agent: &IceAgent) -> u32 {
        match self.kind {
            DiscoveryKind::Binding => agent.stun_config.max_check_attempts,
            DiscoveryKind::Allocate => agent.stun_config.max_allocate_attempts,
        }
    }
}

impl IceAgent {
    /// Begin gathering for a stream. Host candidates bind synchronously (an
    /// exhausted port range fails the call); server discoveries run from the
    /// scheduler and finish with `CandidateGatheringDone`.
    pub(crate) fn start_gathering(&mut self, stream_idx: usize) -> Result<(), AgentError> {
        let addresses: Vec<IpAddr> = if self.local_addresses.is_empty() {
            self.ctx.local_addresses()
        } else {
            self.local_addresses.clone()
        };
        let addresses: Vec<IpAddr> = addresses
            .into_iter()
            .filter(|ip| address::usable_as_host(*ip))
            .collect();

        if addresses.is_empty() {
            return Err(AgentError::InvalidArgument("no usable local addresses"));
        }

        self.streams[stream_idx].gather_requested = true;
        let stream_id = self.streams[stream_idx].id;
        let stun_servers = self.stun_servers.clone();
        let component_ids: Vec<u8> =
            self.streams[stream_idx].components.iter().map(|c| c.id).collect();

        for component_id in component_ids {
            if self.streams[stream_idx]
                .component_mut(component_id)
                .expect("component exists")
                .set_state(ComponentState::Gathering)
            {
                self.events.push_back(AgentEvent::ComponentStateChanged {
                    stream_id,
                    component_id,
                    state: ComponentState::Gathering,
                });
            }

            let mut host_sockets = Vec::new();
            for &ip in &addresses {
                let (socket_id, local_id) =
                    self.add_host_candidate(stream_idx, component_id, ip)?;
                host_sockets.push(socket_id);
                self.conn_check_add_for_local(stream_idx, component_id, local_id);
            }

            for &server in &stun_servers {
                for &socket_id in &host_sockets {
                    self.discoveries.push(CandidateDiscovery {
                        kind: DiscoveryKind::Binding,
                        stream_id,
                        component_id,
                        socket: socket_id,
                        server,
                        turn: None,
                        realm: None,
                        nonce: None,
                        auth_attempts: 0,
                        tx: None,
                        done: false,
                    });
                }
            }

            let turn_servers = self.streams[stream_idx]
                .component(component_id)
                .expect("component exists")
                .turn_servers
                .clone();
            for turn in turn_servers {
                match self.open_relay_base(stream_idx, component_id, addresses[0], &turn) {
                    Ok(socket_id) => {
                        self.discoveries.push(CandidateDiscovery {
                            kind: DiscoveryKind::Allocate,
                            stream_id,
                            component_id,
                            socket: socket_id,
                            server: turn.server,
                            turn: Some(turn),
                            realm: None,
                            nonce: None,
                            auth_attempts: 0,
                            tx: None,
                            done: false,
                        });
                    }
                    Err(e) => {
                        log::warn!("relay base socket towards {} failed: {e}", turn.server);
                    }
                }
            }
        }

        self.check_gathering_done();
        Ok(())
    }

    /// Bind a UDP socket for one host candidate, honoring the component's
    /// port range, and register the candidate.
    fn add_host_candidate(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        ip: IpAddr,
    ) -> Result<(SocketId, LocalCandidateId), AgentError> {
        let profile = self.compat.profile();
        let stream_id = self.streams[stream_idx].id;

        let (min_port, max_port) = {
            let component = self.streams[stream_idx]
                .component(component_id)
                .expect("component exists");
            (component.min_port, component.max_port)
        };

        let mut transport = None;
        if min_port == 0 && max_port == 0 {
            transport = self.ctx.bind_udp(SocketAddr::new(ip, 0)).ok();
        } else {
            for port in min_port..=max_port {
                if let Ok(bound) = self.ctx.bind_udp(SocketAddr::new(ip, port)) {
                    transport = Some(bound);
                    break;
                }
            }
        }

        let Some(transport) = transport else {
            log::warn!("no bindable port for {ip} in [{min_port}, {max_port}]");
            return Err(AgentError::GatherFailed);
        };

        let addr = transport.local_addr();
        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .expect("component exists");
        let socket_id = component
            .sockets
            .insert(Box::new(UdpSocket::new(transport)));

        let local_pref = local_preference(component, CandidateType::Host);
        let candidate = Candidate {
            kind: CandidateType::Host,
            transport: TransportType::Udp,
            addr,
            base: addr,
            foundation: compute_foundation(CandidateType::Host, ip, None, TransportType::Udp),
            priority: candidate_priority(profile, CandidateType::Host, local_pref, component_id),
            component_id,
            stream_id,
            username: None,
            password: None,
            turn_server: None,
            socket: Some(socket_id),
        };

        log::debug!("new host candidate {candidate}");
        let foundation = candidate.foundation.clone();
        let local_id = component.local_candidates.insert(candidate);

        self.events.push_back(AgentEvent::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });

        Ok((socket_id, local_id))
    }

    /// Build the base socket stack an Allocate runs over: plain UDP, or TCP
    /// with the proxy / pseudo-SSL / framing layers the dialect wants.
    fn open_relay_base(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        local_ip: IpAddr,
        turn: &TurnServerConfig,
    ) -> std::io::Result<SocketId> {
        let flavor = self.compat.profile().turn;

        let socket: Box<dyn IceSocket> = match turn.relay_type {
            RelayType::Udp => {
                let transport = self.ctx.bind_udp(SocketAddr::new(local_ip, 0))?;
                Box::new(UdpSocket::new(transport))
            }
            RelayType::Tcp | RelayType::Tls => {
                // with a proxy the TCP connection goes to the proxy and
                // SOCKS5 tunnels it on to the TURN server
                let proxy = self.proxy.clone();
                let connect_to = proxy.as_ref().map(|p| p.server).unwrap_or(turn.server);

                let transport = self.ctx.connect_tcp(local_ip, connect_to)?;
                let mut stack: Box<dyn IceSocket> =
                    Box::new(TcpSocket::new(transport, connect_to));

                if let Some(proxy) = proxy {
                    stack = Box::new(Socks5Socket::new(
                        stack,
                        turn.server,
                        proxy.username,
                        proxy.password,
                    ));
                }

                if turn.relay_type == RelayType::Tls {
                    stack = Box::new(PseudoSslSocket::new(stack, turn.server));
                }

                let framing = match flavor {
                    TurnFlavor::Google => FrameFlavor::Google,
                    _ => FrameFlavor::StunChannel,
                };
                Box::new(TcpFrameSocket::new(stack, framing))
            }
        };

        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .expect("component exists");
        Ok(component.sockets.insert(socket))
    }

    /// One scheduler pass over every pending discovery: first transmission,
    /// retransmissions, expiry.
    pub(crate) fn discovery_tick(&mut self, now: Instant) {
        for idx in 0..self.discoveries.len() {
            if self.discoveries[idx].done {
                continue;
            }

            if self.discoveries[idx].tx.is_none() {
                self.discovery_send(now, idx);
                continue;
            }

            let action = {
                let discovery = &mut self.discoveries[idx];
                let (_, _, timer) = discovery.tx.as_mut().expect("checked above");
                timer.poll(now, &self.stun_config)
            };

            match action {
                RetransmitAction::Wait => {}
                RetransmitAction::Retransmit => {
                    let discovery = &self.discoveries[idx];
                    let request = discovery.tx.as_ref().expect("checked above").1.clone();
                    let (stream_id, component_id, socket, server) = (
                        discovery.stream_id,
                        discovery.component_id,
                        discovery.socket,
                        discovery.server,
                    );
                    if let Some(stream_idx) = self.stream_index(stream_id) {
                        self.send_on_socket(stream_idx, component_id, socket, server, &request);
                    }
                }
                RetransmitAction::TimedOut => {
                    let discovery = &mut self.discoveries[idx];
                    log::debug!(
                        "discovery {:?} towards {} timed out",
                        discovery.kind,
                        discovery.server
                    );
                    discovery.done = true;
                }
            }
        }

        self.check_gathering_done();
    }

    fn discovery_send(&mut self, now: Instant, idx: usize) {
        let profile = self.compat.profile();
        let max_attempts = self.discoveries[idx].max_attempts(self);

        let discovery = &self.discoveries[idx];
        let tid = new_transaction_id(profile);

        let request = match discovery.kind {
            DiscoveryKind::Binding => {
                let mut builder = MessageBuilder::new(Class::Request, Method::Binding, tid);
                if profile.use_fingerprint {
                    builder.add_fingerprint();
                }
                builder.finish()
            }
            DiscoveryKind::Allocate => {
                let turn = discovery.turn.as_ref().expect("allocate has turn config");
                let mut builder = MessageBuilder::new(Class::Request, Method::Allocate, tid);

                if matches!(profile.turn, TurnFlavor::Rfc5766 | TurnFlavor::Oc2007) {
                    builder.add_attr(&RequestedTransport(TRANSPORT_UDP));
                    builder.add_attr(&Lifetime(DEFAULT_ALLOCATION_LIFETIME.as_secs() as u32));
                }

                match (&discovery.realm, &discovery.nonce) {
                    (Some(realm), Some(nonce)) => {
                        builder.add_attr(&Username::new(turn.username.clone()));
                        builder.add_attr(&Realm::new(realm.clone()));
                        builder.add_attr(&Nonce::new(nonce.clone()));
                        builder.add_message_integrity(&IntegrityKey::long_term(
                            &turn.username,
                            realm,
                            &turn.password,
                        ));
                    }
                    _ => {
                        // legacy dialects authenticate with a bare username
                        if matches!(profile.turn, TurnFlavor::Google | TurnFlavor::Msn) {
                            builder.add_attr(&Username::new(turn.username.clone()));
                        }
                    }
                }
                builder.finish()
            }
        };

        let (stream_id, component_id, socket, server) = (
            discovery.stream_id,
            discovery.component_id,
            discovery.socket,
            discovery.server,
        );

        self.discoveries[idx].tx = Some((
            tid,
            request.clone(),
            RetransmitTimer::new(now, &self.stun_config, max_attempts),
        ));

        if let Some(stream_idx) = self.stream_index(stream_id) {
            self.send_on_socket(stream_idx, component_id, socket, server, &request);
        }
    }

    /// Route a STUN message to its discovery, if any. Returns true when the
    /// message was consumed.
    pub(crate) fn handle_discovery_response(
        &mut self,
        now: Instant,
        stream_idx: usize,
        component_id: u8,
        socket_id: SocketId,
        source: SocketAddr,
        msg: &Message,
    ) -> bool {
        let tid = msg.transaction_id();
        let Some(idx) = self.discoveries.iter().position(|d| {
            !d.done
                && d.socket == socket_id
                && d.tx.as_ref().is_some_and(|(id, _, _)| *id == tid)
        }) else {
            return false;
        };

        if source != self.discoveries[idx].server {
            return false;
        }

        match (self.discoveries[idx].kind, msg.class()) {
            (DiscoveryKind::Binding, Class::Success) => {
                self.discoveries[idx].done = true;
                if let Some(mapped) =
                    crate::stun_build::response_mapped_address(self.compat.profile(), msg)
                {
                    self.add_server_reflexive_candidate(
                        stream_idx,
                        component_id,
                        socket_id,
                        self.discoveries[idx].server,
                        mapped,
                    );
                }
            }
            (DiscoveryKind::Binding, Class::Error) => {
                self.discoveries[idx].done = true;
            }
            (DiscoveryKind::Allocate, Class::Success) => {
                self.discoveries[idx].done = true;
                self.finish_allocation(now, stream_idx, component_id, socket_id, idx, msg);
            }
            (DiscoveryKind::Allocate, Class::Error) => {
                let code = match msg.attribute::<ErrorCode>() {
                    Some(Ok(error)) => error.number,
                    _ => 0,
                };

                let discovery = &mut self.discoveries[idx];
                if (code == 401 || code == 438) && discovery.auth_attempts < 2 {
                    if let Some(Ok(realm)) = msg.attribute::<Realm>() {
                        discovery.realm = Some(realm.0);
                    }
                    if let Some(Ok(nonce)) = msg.attribute::<Nonce>() {
                        discovery.nonce = Some(nonce.0);
                    }

                    if discovery.realm.is_some() && discovery.nonce.is_some() {
                        discovery.auth_attempts += 1;
                        discovery.tx = None;
                        self.discovery_send(now, idx);
                        return true;
                    }
                }

                log::debug!("allocate refused with code {code}");
                discovery.done = true;
            }
            _ => {}
        }

        self.check_gathering_done();
        true
    }

    /// Allocation succeeded: wrap the base socket in the TURN layer, emit
    /// the relayed (and mapped server-reflexive) candidates and start the
    /// refresh cycle.
    fn finish_allocation(
        &mut self,
        now: Instant,
        stream_idx: usize,
        component_id: u8,
        socket_id: SocketId,
        discovery_idx: usize,
        msg: &Message,
    ) {
        let profile = self.compat.profile();
        let stream_id = self.streams[stream_idx].id;

        let Some(Ok(XorRelayedAddress(relayed))) = msg.attribute::<XorRelayedAddress>() else {
            log::debug!("allocate success without a relayed address, ignored");
            return;
        };

        let lifetime = msg
            .attribute::<Lifetime>()
            .and_then(Result::ok)
            .map(|l| Duration::from_secs(l.0 as u64))
            .unwrap_or(DEFAULT_ALLOCATION_LIFETIME);

        let (server, turn, realm, nonce) = {
            let discovery = &self.discoveries[discovery_idx];
            (
                discovery.server,
                discovery.turn.clone().expect("allocate has turn config"),
                discovery.realm.clone(),
                discovery.nonce.clone(),
            )
        };

        // a mapped address in the response doubles as a reflexive candidate
        if let Some(mapped) = crate::stun_build::response_mapped_address(profile, msg) {
            self.add_server_reflexive_candidate(stream_idx, component_id, socket_id, server, mapped);
        }

        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .expect("component exists");

        let Some(base) = component.sockets.remove(socket_id) else {
            return;
        };

        let auth = crate::socket::TurnAuth {
            username: turn.username.clone(),
            password: turn.password.clone(),
            realm,
            nonce,
        };
        let turn_socket = TurnSocket::new(base, server, relayed, profile.turn, Some(auth), now);
        let new_socket_id = component.sockets.insert(Box::new(turn_socket));

        // discoveries and reflexive candidates that referenced the base
        // socket follow it into the wrapper
        for discovery in &mut self.discoveries {
            if discovery.socket == socket_id {
                discovery.socket = new_socket_id;
            }
        }
        for (_, candidate) in &mut component.local_candidates {
            if candidate.socket == Some(socket_id) {
                candidate.socket = Some(new_socket_id);
            }
        }

        let local_pref = local_preference(component, CandidateType::Relayed);
        let candidate = Candidate {
            kind: CandidateType::Relayed,
            transport: TransportType::Udp,
            addr: relayed,
            base: relayed,
            foundation: compute_foundation(
                CandidateType::Relayed,
                relayed.ip(),
                Some(server),
                TransportType::Udp,
            ),
            priority: candidate_priority(profile, CandidateType::Relayed, local_pref, component_id),
            component_id,
            stream_id,
            username: None,
            password: None,
            turn_server: Some(server),
            socket: Some(new_socket_id),
        };

        log::debug!("new relayed candidate {candidate}");
        let foundation = candidate.foundation.clone();
        let local_id = component.local_candidates.insert(candidate);

        self.events.push_back(AgentEvent::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });

        self.spawn_refresh(stream_id, component_id, new_socket_id, server, lifetime, now);
        self.conn_check_add_for_local(stream_idx, component_id, local_id);
    }

    fn add_server_reflexive_candidate(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        socket_id: SocketId,
        server: SocketAddr,
        mapped: SocketAddr,
    ) {
        let profile = self.compat.profile();
        let stream_id = self.streams[stream_idx].id;

        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .expect("component exists");

        if component
            .local_candidates
            .values()
            .any(|c| c.addr == mapped && c.kind == CandidateType::ServerReflexive)
        {
            return;
        }

        let Some(base_addr) = component
            .sockets
            .get(socket_id)
            .map(|socket| socket.local_addr())
        else {
            return;
        };

        let local_pref = local_preference(component, CandidateType::ServerReflexive);
        let candidate = Candidate {
            kind: CandidateType::ServerReflexive,
            transport: TransportType::Udp,
            addr: mapped,
            base: base_addr,
            foundation: compute_foundation(
                CandidateType::ServerReflexive,
                base_addr.ip(),
                Some(server),
                TransportType::Udp,
            ),
            priority: candidate_priority(
                profile,
                CandidateType::ServerReflexive,
                local_pref,
                component_id,
            ),
            component_id,
            stream_id,
            username: None,
            password: None,
            turn_server: None,
            socket: Some(socket_id),
        };

        log::debug!("new server-reflexive candidate {candidate}");
        let foundation = candidate.foundation.clone();
        let local_id = component.local_candidates.insert(candidate);

        self.events.push_back(AgentEvent::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });

        self.conn_check_add_for_local(stream_idx, component_id, local_id);
    }

    /// Emit `CandidateGatheringDone` for streams whose discoveries all
    /// completed.
    pub(crate) fn check_gathering_done(&mut self) {
        for stream_idx in 0..self.streams.len() {
            let stream = &self.streams[stream_idx];
            if !stream.gather_requested || stream.gather_done {
                continue;
            }

            let stream_id = stream.id;
            let pending = self
                .discoveries
                .iter()
                .any(|d| d.stream_id == stream_id && !d.done);
            if pending {
                continue;
            }

            self.streams[stream_idx].gather_done = true;
            log::debug!("candidate gathering done for stream {}", stream_id.0);
            self.events
                .push_back(AgentEvent::CandidateGatheringDone { stream_id });
            self.update_component_states(stream_idx);
        }
    }

    pub(crate) fn discovery_timeout(&self, now: Instant) -> Option<Duration> {
        self.discoveries
            .iter()
            .filter(|d| !d.done)
            .map(|d| match &d.tx {
                Some((_, _, timer)) => timer.timeout(now),
                None => Duration::ZERO,
            })
            .min()
    }
}

/// Local preference as a per-kind offset plus the count of same-kind
/// candidates (a trick borrowed from str0m): every candidate gets a distinct
/// priority while host ranks above reflexive above relayed.
fn local_preference(component: &crate::component::Component, kind: CandidateType) -> u32 {
    let offset = match kind {
        CandidateType::Host => (65535 / 4) * 3,
        CandidateType::PeerReflexive => (65535 / 4) * 2,
        CandidateType::ServerReflexive => 65535 / 4,
        CandidateType::Relayed => 0,
    };

    component
        .local_candidates
        .values()
        .filter(|c| c.kind == kind)
        .count() as u32
        + offset
}
