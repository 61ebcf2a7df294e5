//! The agent façade: streams, the public operation set, event delivery and
//! the top-level scheduler.

use crate::candidate::{pair_priority, Candidate};
use crate::compat::Compatibility;
use crate::component::{ComponentState, RelayType, SelectedPair, TurnServerConfig};
use crate::context::{Datagram, EventContext, Timer};
use crate::discovery::CandidateDiscovery;
use crate::sdp::IceCandidate;
use crate::socket::SocketId;
use crate::stream::Stream;
use crate::stun_build::{make_keepalive, StunConfig};
use crate::turn_refresh::CandidateRefresh;
use crate::StreamId;
use rime_stun_types::{Class, Message, Method};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Protection limit against malevolent peers flooding us with candidates.
pub const MAX_REMOTE_CANDIDATES: usize = 25;

/// Pacing interval of the connectivity-check scheduler.
const TA_INTERVAL: Duration = Duration::from_millis(20);

/// How long a restart may take before READY components fall back to
/// CONNECTING.
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("unknown stream")]
    UnknownStream,
    #[error("unknown component")]
    UnknownComponent,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("component has no selected pair")]
    NotReady,
    #[error("could not allocate host candidates")]
    GatherFailed,
    #[error("no such candidate pair")]
    PairNotFound,
}

/// Everything the agent tells the application, drained with
/// [`poll_event`](IceAgent::poll_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    CandidateGatheringDone {
        stream_id: StreamId,
    },
    ComponentStateChanged {
        stream_id: StreamId,
        component_id: u8,
        state: ComponentState,
    },
    NewCandidate {
        stream_id: StreamId,
        component_id: u8,
        foundation: String,
    },
    NewRemoteCandidate {
        stream_id: StreamId,
        component_id: u8,
        foundation: String,
    },
    NewSelectedPair {
        stream_id: StreamId,
        component_id: u8,
        local_foundation: String,
        remote_foundation: String,
    },
    InitialBindingRequestReceived {
        stream_id: StreamId,
    },
    /// Reliable mode only.
    ReliableTransportWritable {
        stream_id: StreamId,
        component_id: u8,
    },
}

/// SOCKS5 proxy settings applied to TCP relay connections.
#[derive(Debug, Clone)]
pub(crate) struct ProxyInfo {
    pub(crate) server: SocketAddr,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
}

/// The ICE agent. Single-threaded and sans blocking: the embedder calls
/// [`poll`](Self::poll) on socket readiness and after
/// [`timeout`](Self::timeout) elapses, and drains events in between.
pub struct IceAgent {
    pub(crate) ctx: Box<dyn EventContext>,
    pub(crate) compat: Compatibility,
    pub(crate) reliable: bool,
    pub(crate) controlling: bool,
    pub(crate) software: Option<String>,
    pub(crate) proxy: Option<ProxyInfo>,
    pub(crate) stun_servers: Vec<SocketAddr>,
    pub(crate) local_addresses: Vec<IpAddr>,
    pub(crate) streams: Vec<Stream>,
    next_stream_id: u32,
    pub(crate) discoveries: Vec<CandidateDiscovery>,
    pub(crate) refreshes: Vec<CandidateRefresh>,
    check_timer: Timer,
    pub(crate) events: VecDeque<AgentEvent>,
    pub(crate) prflx_counter: u64,
    pub(crate) stun_config: StunConfig,
    /// Clock high-water mark from `poll`, used by operations without a
    /// `now` parameter.
    last_now: Instant,
}

impl IceAgent {
    pub fn new(ctx: Box<dyn EventContext>, compat: Compatibility) -> Self {
        IceAgent {
            ctx,
            compat,
            reliable: false,
            controlling: false,
            software: None,
            proxy: None,
            stun_servers: Vec::new(),
            local_addresses: Vec::new(),
            streams: Vec::new(),
            next_stream_id: 1,
            discoveries: Vec::new(),
            refreshes: Vec::new(),
            check_timer: Timer::new(TA_INTERVAL),
            events: VecDeque::new(),
            prflx_counter: 0,
            stun_config: StunConfig::new(),
            last_now: Instant::now(),
        }
    }

    /// As [`new`](Self::new), with the reliable-transport hooks armed (the
    /// reliability protocol itself lives above this crate).
    pub fn new_reliable(ctx: Box<dyn EventContext>, compat: Compatibility) -> Self {
        let mut agent = Self::new(ctx, compat);
        agent.reliable = true;
        agent
    }

    pub fn compatibility(&self) -> Compatibility {
        self.compat
    }

    pub fn is_controlling(&self) -> bool {
        self.controlling
    }

    pub fn set_controlling(&mut self, controlling: bool) {
        self.role_switch(controlling);
    }

    /// SOFTWARE attribute value; emitted only by dialects that allow it.
    pub fn set_software(&mut self, software: impl Into<String>) {
        self.software = Some(software.into());
    }

    /// Override interface discovery. Duplicates are silently dropped.
    pub fn add_local_address(&mut self, addr: IpAddr) -> Result<(), AgentError> {
        if !self.local_addresses.contains(&addr) {
            self.local_addresses.push(addr);
        }
        Ok(())
    }

    pub fn add_stun_server(&mut self, server: SocketAddr) {
        self.stun_servers.push(server);
    }

    /// SOCKS5 proxy for TCP relay connections.
    pub fn set_proxy_info(
        &mut self,
        server: SocketAddr,
        username: Option<String>,
        password: Option<String>,
    ) {
        self.proxy = Some(ProxyInfo {
            server,
            username,
            password,
        });
    }

    // -----------------------------------------------------------------
    // stream management

    pub fn add_stream(&mut self, n_components: u8) -> Result<StreamId, AgentError> {
        if n_components == 0 {
            return Err(AgentError::InvalidArgument("need at least one component"));
        }

        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        self.streams.push(Stream::new(id, n_components));

        log::debug!("stream {} added with {n_components} component(s)", id.0);
        Ok(id)
    }

    /// Cancels all checks, discoveries and refreshes of the stream and
    /// closes its sockets.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Result<(), AgentError> {
        let idx = self.stream_index(stream_id).ok_or(AgentError::UnknownStream)?;

        self.discoveries.retain(|d| d.stream_id != stream_id);
        self.refreshes.retain(|r| r.stream_id != stream_id);

        let mut stream = self.streams.remove(idx);
        for pair in &mut stream.check_list {
            if pair.state == crate::conncheck::CheckState::InProgress {
                pair.state = crate::conncheck::CheckState::Cancelled;
            }
        }
        for component in &mut stream.components {
            component.close_sockets();
        }

        log::debug!("stream {} removed", stream_id.0);
        Ok(())
    }

    pub fn set_stream_name(&mut self, stream_id: StreamId, name: &str) -> Result<(), AgentError> {
        if self
            .streams
            .iter()
            .any(|s| s.id != stream_id && s.name.as_deref() == Some(name))
        {
            return Err(AgentError::InvalidArgument("duplicate stream name"));
        }

        let stream = self.stream_mut(stream_id)?;
        stream.name = Some(name.to_owned());
        Ok(())
    }

    pub fn stream_name(&self, stream_id: StreamId) -> Option<&str> {
        self.stream(stream_id).ok()?.name.as_deref()
    }

    /// Must be called before `gather_candidates`.
    pub fn set_port_range(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        min_port: u16,
        max_port: u16,
    ) -> Result<(), AgentError> {
        if min_port > max_port {
            return Err(AgentError::InvalidArgument("empty port range"));
        }

        let component = self.component_mut(stream_id, component_id)?;
        component.min_port = min_port;
        component.max_port = max_port;
        Ok(())
    }

    /// Register a TURN server for relay discovery.
    pub fn set_relay_info(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        server: SocketAddr,
        username: &str,
        password: &str,
        relay_type: RelayType,
    ) -> Result<(), AgentError> {
        let component = self.component_mut(stream_id, component_id)?;
        component.turn_servers.push(TurnServerConfig {
            server,
            username: username.to_owned(),
            password: password.to_owned(),
            relay_type,
        });
        Ok(())
    }

    /// Start gathering; `CandidateGatheringDone` fires when every discovery
    /// settles.
    pub fn gather_candidates(&mut self, stream_id: StreamId) -> Result<(), AgentError> {
        let idx = self.stream_index(stream_id).ok_or(AgentError::UnknownStream)?;
        if self.streams[idx].gather_requested {
            return Ok(());
        }
        self.start_gathering(idx)
    }

    // -----------------------------------------------------------------
    // credentials & candidates

    pub fn get_local_credentials(
        &self,
        stream_id: StreamId,
    ) -> Result<(String, String), AgentError> {
        let stream = self.stream(stream_id)?;
        Ok((stream.local_ufrag.clone(), stream.local_pwd.clone()))
    }

    pub fn set_remote_credentials(
        &mut self,
        stream_id: StreamId,
        ufrag: &str,
        pwd: &str,
    ) -> Result<(), AgentError> {
        if !(22..=256).contains(&ufrag.len()) {
            return Err(AgentError::InvalidArgument("ufrag length out of range"));
        }
        if !(4..=256).contains(&pwd.len()) {
            return Err(AgentError::InvalidArgument("password length out of range"));
        }

        let idx = self.stream_index(stream_id).ok_or(AgentError::UnknownStream)?;
        self.streams[idx].remote_ufrag = Some(ufrag.to_owned());
        self.streams[idx].remote_pwd = Some(pwd.to_owned());

        let now = self.last_now;
        self.replay_incoming_checks(now, idx);
        Ok(())
    }

    /// Add or update remote candidates. At most [`MAX_REMOTE_CANDIDATES`]
    /// are kept per component; the count actually added is returned.
    pub fn set_remote_candidates(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        candidates: &[IceCandidate],
    ) -> Result<usize, AgentError> {
        let stream_idx = self.stream_index(stream_id).ok_or(AgentError::UnknownStream)?;
        if self.streams[stream_idx].component(component_id).is_none() {
            return Err(AgentError::UnknownComponent);
        }

        let mut added = 0;
        for candidate in candidates {
            let component = self.streams[stream_idx]
                .component_mut(component_id)
                .expect("checked above");

            if component.remote_candidates.len() >= MAX_REMOTE_CANDIDATES {
                log::warn!("remote candidate limit reached, ignoring the rest");
                break;
            }
            if component
                .remote_candidates
                .values()
                .any(|c| c.addr == candidate.addr && c.transport == candidate.transport)
            {
                continue;
            }

            let internal = Candidate {
                kind: candidate.kind,
                transport: candidate.transport,
                addr: candidate.addr,
                base: candidate.base_addr.unwrap_or(candidate.addr),
                foundation: candidate.foundation.clone(),
                priority: candidate.priority,
                component_id,
                stream_id,
                username: candidate.username.clone(),
                password: candidate.password.clone(),
                turn_server: None,
                socket: None,
            };

            log::debug!("new remote candidate {internal}");
            let foundation = internal.foundation.clone();
            let remote_id = component.remote_candidates.insert(internal);
            added += 1;

            self.events.push_back(AgentEvent::NewRemoteCandidate {
                stream_id,
                component_id,
                foundation,
            });
            self.conn_check_add_for_remote(stream_idx, component_id, remote_id);
        }

        Ok(added)
    }

    pub fn get_local_candidates(
        &self,
        stream_id: StreamId,
        component_id: u8,
    ) -> Result<Vec<IceCandidate>, AgentError> {
        let component = self.component(stream_id, component_id)?;
        Ok(component
            .local_candidates
            .values()
            .map(IceCandidate::from_candidate)
            .collect())
    }

    pub fn get_remote_candidates(
        &self,
        stream_id: StreamId,
        component_id: u8,
    ) -> Result<Vec<IceCandidate>, AgentError> {
        let component = self.component(stream_id, component_id)?;
        Ok(component
            .remote_candidates
            .values()
            .map(IceCandidate::from_candidate)
            .collect())
    }

    /// The candidate non-ICE peers should be pointed at: the lowest-priority
    /// one, usually the relayed path that works from anywhere.
    pub fn get_default_local_candidate(
        &self,
        stream_id: StreamId,
        component_id: u8,
    ) -> Result<IceCandidate, AgentError> {
        let component = self.component(stream_id, component_id)?;
        component
            .local_candidates
            .values()
            .min_by_key(|c| c.priority)
            .map(IceCandidate::from_candidate)
            .ok_or(AgentError::NotReady)
    }

    // -----------------------------------------------------------------
    // data path

    /// Send a payload over the component's selected pair. Requires a
    /// concluded component (or one that concluded before a restart).
    pub fn send(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        data: &[u8],
    ) -> Result<usize, AgentError> {
        let stream_idx = self.stream_index(stream_id).ok_or(AgentError::UnknownStream)?;
        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .ok_or(AgentError::UnknownComponent)?;

        let selected = component.selected_pair.ok_or(AgentError::NotReady)?;

        let target = component
            .remote_candidates
            .get(selected.remote)
            .map(|c| c.addr)
            .or_else(|| component.restart_candidate.as_ref().map(|c| c.addr))
            .ok_or(AgentError::NotReady)?;
        let socket_id = component
            .local_candidates
            .get(selected.local)
            .and_then(|c| c.socket)
            .ok_or(AgentError::NotReady)?;
        let socket = component
            .sockets
            .get_mut(socket_id)
            .ok_or(AgentError::NotReady)?;

        match socket.send(target, data) {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                log::debug!("send on selected pair failed: {e}");
                Err(AgentError::NotReady)
            }
        }
    }

    /// Install the delivery callback for inbound payloads on a component.
    pub fn attach_recv(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        callback: impl FnMut(&[u8]) + 'static,
    ) -> Result<(), AgentError> {
        let component = self.component_mut(stream_id, component_id)?;
        component.recv_cb = Some(Box::new(callback));
        Ok(())
    }

    // -----------------------------------------------------------------
    // selection overrides & restart

    /// Force a selected pair by foundations, disabling further processing
    /// for the component (keepalives continue).
    pub fn set_selected_pair(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        local_foundation: &str,
        remote_foundation: &str,
    ) -> Result<(), AgentError> {
        let now = self.last_now;
        let stream_idx = self.stream_index(stream_id).ok_or(AgentError::UnknownStream)?;
        let controlling = self.controlling;

        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .ok_or(AgentError::UnknownComponent)?;

        let local = component
            .local_candidates
            .iter()
            .find(|(_, c)| c.foundation == local_foundation)
            .map(|(id, c)| (id, c.priority));
        let remote = component
            .remote_candidates
            .iter()
            .find(|(_, c)| c.foundation == remote_foundation)
            .map(|(id, c)| (id, c.priority));

        let (Some((local_id, local_prio)), Some((remote_id, remote_prio))) = (local, remote)
        else {
            return Err(AgentError::PairNotFound);
        };

        let priority = if controlling {
            pair_priority(local_prio, remote_prio)
        } else {
            pair_priority(remote_prio, local_prio)
        };

        component.selected_pair = Some(SelectedPair {
            local: local_id,
            remote: remote_id,
            priority,
        });
        component.fallback_mode = true;
        component.keepalive.start(now);
        let became_ready = component.set_state(ComponentState::Ready);

        self.freeze_component_checks(stream_idx, component_id);

        self.events.push_back(AgentEvent::NewSelectedPair {
            stream_id,
            component_id,
            local_foundation: local_foundation.to_owned(),
            remote_foundation: remote_foundation.to_owned(),
        });
        if became_ready {
            self.events.push_back(AgentEvent::ComponentStateChanged {
                stream_id,
                component_id,
                state: ComponentState::Ready,
            });
        }
        Ok(())
    }

    /// Force a remote candidate even though checks never succeeded against
    /// it (non-ICE peers). Disables further processing for the component.
    pub fn set_selected_remote_candidate(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        candidate: &IceCandidate,
    ) -> Result<(), AgentError> {
        let now = self.last_now;
        let stream_idx = self.stream_index(stream_id).ok_or(AgentError::UnknownStream)?;
        let controlling = self.controlling;

        if candidate.component_id != component_id {
            return Err(AgentError::InvalidArgument("component mismatch"));
        }

        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .ok_or(AgentError::UnknownComponent)?;

        let remote_id = match component.find_remote_by_addr(candidate.addr) {
            Some(id) => id,
            None => {
                let internal = Candidate {
                    kind: candidate.kind,
                    transport: candidate.transport,
                    addr: candidate.addr,
                    base: candidate.addr,
                    foundation: candidate.foundation.clone(),
                    priority: candidate.priority,
                    component_id,
                    stream_id,
                    username: candidate.username.clone(),
                    password: candidate.password.clone(),
                    turn_server: None,
                    socket: None,
                };
                component.remote_candidates.insert(internal)
            }
        };

        // best matching local endpoint carries the traffic
        let local = component
            .local_candidates
            .iter()
            .filter(|(_, c)| {
                c.transport.pairable_with(candidate.transport)
                    && crate::address::pairable(c.addr, candidate.addr)
                    && c.socket.is_some()
            })
            .max_by_key(|(_, c)| c.priority)
            .map(|(id, c)| (id, c.priority));

        let Some((local_id, local_prio)) = local else {
            return Err(AgentError::PairNotFound);
        };

        let remote_prio = component.remote_candidates[remote_id].priority;
        let priority = if controlling {
            pair_priority(local_prio, remote_prio)
        } else {
            pair_priority(remote_prio, local_prio)
        };

        component.selected_pair = Some(SelectedPair {
            local: local_id,
            remote: remote_id,
            priority,
        });
        component.fallback_mode = true;
        component.keepalive.start(now);
        let became_ready = component.set_state(ComponentState::Ready);

        let local_foundation = component.local_candidates[local_id].foundation.clone();
        let remote_foundation = component.remote_candidates[remote_id].foundation.clone();

        self.freeze_component_checks(stream_idx, component_id);

        self.events.push_back(AgentEvent::NewSelectedPair {
            stream_id,
            component_id,
            local_foundation,
            remote_foundation,
        });
        if became_ready {
            self.events.push_back(AgentEvent::ComponentStateChanged {
                stream_id,
                component_id,
                state: ComponentState::Ready,
            });
        }
        Ok(())
    }

    pub fn get_selected_pair(
        &self,
        stream_id: StreamId,
        component_id: u8,
    ) -> Result<(IceCandidate, IceCandidate), AgentError> {
        let component = self.component(stream_id, component_id)?;
        let selected = component.selected_pair.ok_or(AgentError::NotReady)?;

        let local = component
            .local_candidates
            .get(selected.local)
            .ok_or(AgentError::NotReady)?;
        let remote = component
            .remote_candidates
            .get(selected.remote)
            .ok_or(AgentError::NotReady)?;

        Ok((
            IceCandidate::from_candidate(local),
            IceCandidate::from_candidate(remote),
        ))
    }

    pub fn component_state(
        &self,
        stream_id: StreamId,
        component_id: u8,
    ) -> Result<ComponentState, AgentError> {
        Ok(self.component(stream_id, component_id)?.state)
    }

    /// ICE restart (§9.1.1.1): fresh credentials, cleared check lists,
    /// components keep flowing on their previous selected pairs.
    pub fn restart(&mut self) -> Result<(), AgentError> {
        let now = self.last_now;

        for stream in &mut self.streams {
            stream.restart(now, RESTART_TIMEOUT);
        }

        log::debug!("ICE restart: credentials regenerated, check lists cleared");
        Ok(())
    }

    // -----------------------------------------------------------------
    // scheduling

    /// Drive the agent: socket I/O, discoveries, refreshes, the check
    /// scheduler, keepalives and deadlines. Call on socket readiness and
    /// whenever [`timeout`](Self::timeout) expires.
    pub fn poll(&mut self, now: Instant) {
        self.last_now = self.last_now.max(now);
        self.drive_io(now);
        self.discovery_tick(now);
        self.refresh_tick(now);

        if !self.check_timer.is_running() {
            self.check_timer.start(now);
        }
        if self.check_timer.fired(now) {
            self.conn_check_tick(now);
            for stream_idx in 0..self.streams.len() {
                self.nomination_tick(stream_idx);
            }
        }

        self.keepalive_tick(now);
        self.restart_deadline_tick(now);
    }

    /// Duration until the next scheduled piece of work, if any.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout: Option<Duration> = None;

        if self.has_check_work() {
            timeout = opt_min(timeout, self.check_timer.timeout(now).or(Some(TA_INTERVAL)));
        }
        timeout = opt_min(timeout, self.discovery_timeout(now));
        timeout = opt_min(timeout, self.refresh_timeout(now));

        for stream in &self.streams {
            for component in &stream.components {
                timeout = opt_min(timeout, component.keepalive.timeout(now));
                if let Some(deadline) = component.restart_deadline {
                    timeout = opt_min(timeout, Some(deadline.saturating_duration_since(now)));
                }
                for (_, socket) in &component.sockets {
                    timeout = opt_min(timeout, socket.timeout(now));
                }
            }
        }

        timeout
    }

    /// Next pending event, if any.
    pub fn poll_event(&mut self) -> Option<AgentEvent> {
        self.events.pop_front()
    }

    fn has_check_work(&self) -> bool {
        use crate::conncheck::CheckState;

        self.streams.iter().any(|stream| {
            !stream.triggered_queue.is_empty()
                || stream.check_list.iter().any(|p| {
                    matches!(
                        p.state,
                        CheckState::Frozen | CheckState::Waiting | CheckState::InProgress
                    )
                })
        })
    }

    fn drive_io(&mut self, now: Instant) {
        let mut inbound = Vec::new();

        for (stream_idx, stream) in self.streams.iter_mut().enumerate() {
            for component in &mut stream.components {
                let component_id = component.id;
                for (socket_id, socket) in &mut component.sockets {
                    socket.poll(now);

                    let mut out = Vec::new();
                    socket.pull(&mut out);
                    for datagram in out {
                        inbound.push((stream_idx, component_id, socket_id, datagram));
                    }
                }
            }
        }

        for (stream_idx, component_id, socket_id, datagram) in inbound {
            self.route_datagram(now, stream_idx, component_id, socket_id, datagram);
        }
    }

    fn route_datagram(
        &mut self,
        now: Instant,
        stream_idx: usize,
        component_id: u8,
        socket_id: SocketId,
        datagram: Datagram,
    ) {
        let profile = self.compat.profile();

        let Ok(msg) = Message::parse(datagram.data.clone()) else {
            // opaque payload for the application
            let Some(component) = self.streams[stream_idx].component_mut(component_id) else {
                return;
            };
            if let Some(callback) = &mut component.recv_cb {
                callback(&datagram.data);
            }
            return;
        };

        if self.handle_discovery_response(
            now,
            stream_idx,
            component_id,
            socket_id,
            datagram.source,
            &msg,
        ) {
            return;
        }
        if self.handle_refresh_response(now, &msg) {
            return;
        }

        if profile.use_fingerprint && !msg.verify_fingerprint() {
            log::trace!(
                "incoming {:?} without a valid fingerprint, discarded",
                msg.class()
            );
            return;
        }

        match msg.class() {
            Class::Request if msg.method() == Method::Binding => {
                self.handle_inbound_request(
                    now,
                    stream_idx,
                    component_id,
                    socket_id,
                    datagram.source,
                    &msg,
                );
            }
            Class::Success | Class::Error => {
                let destination = self.streams[stream_idx]
                    .component(component_id)
                    .and_then(|c| c.sockets.get(socket_id))
                    .map(|s| s.local_addr());
                if let Some(destination) = destination {
                    self.handle_check_response(
                        now,
                        stream_idx,
                        datagram.source,
                        destination,
                        &msg,
                    );
                }
            }
            // keepalives and unknown indications
            _ => {}
        }
    }

    fn keepalive_tick(&mut self, now: Instant) {
        let profile = self.compat.profile();

        for stream_idx in 0..self.streams.len() {
            let component_ids: Vec<u8> = self.streams[stream_idx]
                .components
                .iter()
                .map(|c| c.id)
                .collect();

            for component_id in component_ids {
                let due = {
                    let component = self.streams[stream_idx]
                        .component_mut(component_id)
                        .expect("component exists");
                    component.selected_pair.is_some() && component.keepalive.fired(now)
                };
                if !due {
                    continue;
                }

                let keepalive = make_keepalive(profile);
                let (socket_id, target) = {
                    let component = self.streams[stream_idx]
                        .component(component_id)
                        .expect("component exists");
                    let selected = component.selected_pair.expect("checked above");
                    let socket = component
                        .local_candidates
                        .get(selected.local)
                        .and_then(|c| c.socket);
                    let target = component
                        .remote_candidates
                        .get(selected.remote)
                        .map(|c| c.addr)
                        .or_else(|| component.restart_candidate.as_ref().map(|c| c.addr));
                    (socket, target)
                };

                if let (Some(socket_id), Some(target)) = (socket_id, target) {
                    log::trace!("keepalive towards {target}");
                    self.send_on_socket(stream_idx, component_id, socket_id, target, &keepalive);
                }
            }
        }
    }

    fn restart_deadline_tick(&mut self, now: Instant) {
        for stream_idx in 0..self.streams.len() {
            let stream_id = self.streams[stream_idx].id;
            let component_ids: Vec<u8> = self.streams[stream_idx]
                .components
                .iter()
                .map(|c| c.id)
                .collect();

            for component_id in component_ids {
                let component = self.streams[stream_idx]
                    .component_mut(component_id)
                    .expect("component exists");

                let expired = component
                    .restart_deadline
                    .is_some_and(|deadline| now >= deadline);
                if !expired {
                    continue;
                }

                component.restart_deadline = None;
                if component.set_state(ComponentState::Connecting) {
                    log::debug!(
                        "restart did not conclude in time, component {component_id} back to Connecting"
                    );
                    self.events.push_back(AgentEvent::ComponentStateChanged {
                        stream_id,
                        component_id,
                        state: ComponentState::Connecting,
                    });
                }
            }
        }
    }

    /// Stop all further check scheduling for a component whose selection was
    /// forced by the application.
    fn freeze_component_checks(&mut self, stream_idx: usize, component_id: u8) {
        use crate::conncheck::CheckState;

        let stream = &mut self.streams[stream_idx];
        stream
            .triggered_queue
            .retain(|(comp, _, _)| *comp != component_id);
        for pair in &mut stream.check_list {
            if pair.component_id == component_id && !pair.state.is_valid() {
                if pair.state != CheckState::Failed {
                    pair.state = CheckState::Cancelled;
                }
                pair.tx = None;
            }
        }
    }

    // -----------------------------------------------------------------
    // lookups

    pub(crate) fn stream_index(&self, stream_id: StreamId) -> Option<usize> {
        self.streams.iter().position(|s| s.id == stream_id)
    }

    pub(crate) fn stream(&self, stream_id: StreamId) -> Result<&Stream, AgentError> {
        self.streams
            .iter()
            .find(|s| s.id == stream_id)
            .ok_or(AgentError::UnknownStream)
    }

    pub(crate) fn stream_mut(&mut self, stream_id: StreamId) -> Result<&mut Stream, AgentError> {
        self.streams
            .iter_mut()
            .find(|s| s.id == stream_id)
            .ok_or(AgentError::UnknownStream)
    }

    pub(crate) fn component(
        &self,
        stream_id: StreamId,
        component_id: u8,
    ) -> Result<&crate::component::Component, AgentError> {
        self.stream(stream_id)?
            .component(component_id)
            .ok_or(AgentError::UnknownComponent)
    }

    pub(crate) fn component_mut(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
    ) -> Result<&mut crate::component::Component, AgentError> {
        self.stream_mut(stream_id)?
            .component_mut(component_id)
            .ok_or(AgentError::UnknownComponent)
    }
}

pub(crate) fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}
