//! The connectivity-check state machine: pair formation and pruning, the
//! paced scheduler, triggered checks, role conflicts and nomination
//! (ICE §5.7, §5.8, §7).

use crate::agent::{AgentEvent, IceAgent};
use crate::candidate::{
    candidate_priority, pair_priority, Candidate, CandidateType, LocalCandidateId,
    RemoteCandidateId,
};
use crate::compat::NominationMode;
use crate::component::{ComponentState, IncomingCheck, SelectedPair};
use crate::stun_build::{
    check_username, make_check_request, make_check_response, make_error_response,
    new_transaction_id, response_mapped_address, verify_inbound, CheckRequest, RetransmitAction,
    RetransmitTimer,
};
use crate::{address, StreamId};
use rime_stun_types::attributes::{
    ErrorCode, IceControlled, IceControlling, Priority, UseCandidate, Username,
};
use rime_stun_types::{Class, Message, TransactionId};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

/// Hard cap on a stream's check list; excess lowest-priority pairs are
/// discarded.
pub(crate) const MAX_CHECK_LIST_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckState {
    /// Waiting for its foundation to thaw.
    Frozen,
    /// Eligible for the next scheduler slot.
    Waiting,
    /// A transaction is in flight.
    InProgress,
    Succeeded,
    Failed,
    /// Abandoned by a restart or by conclusion of its component.
    Cancelled,
    /// A valid pair learned from a mapped address, never scheduled itself.
    Discovered,
}

impl CheckState {
    pub(crate) fn is_valid(self) -> bool {
        matches!(self, CheckState::Succeeded | CheckState::Discovered)
    }
}

pub(crate) struct CheckTransaction {
    pub(crate) id: TransactionId,
    pub(crate) request: Vec<u8>,
    pub(crate) timer: RetransmitTimer,
}

/// One entry of the check list.
pub(crate) struct CandidateCheckPair {
    pub(crate) stream_id: StreamId,
    pub(crate) component_id: u8,
    pub(crate) local: LocalCandidateId,
    pub(crate) remote: RemoteCandidateId,
    /// Concatenated local and remote candidate foundations.
    pub(crate) foundation: String,
    pub(crate) state: CheckState,
    pub(crate) nominated: bool,
    /// USE-CANDIDATE goes out with the current transaction.
    pub(crate) nominating: bool,
    /// The peer asked for this pair with USE-CANDIDATE.
    pub(crate) recv_use_candidate: bool,
    /// Our role when the last check was sent.
    pub(crate) controlling: bool,
    /// An inbound triggered check hit the pair mid-transaction; force an
    /// immediate retransmit instead of a new transaction.
    pub(crate) timer_restarted: bool,
    pub(crate) priority: u64,
    pub(crate) tx: Option<CheckTransaction>,
}

fn pair_foundation(local: &Candidate, remote: &Candidate) -> String {
    format!("{}:{}", local.foundation, remote.foundation)
}

fn compute_pair_priority(local: &Candidate, remote: &Candidate, controlling: bool) -> u64 {
    if controlling {
        pair_priority(local.priority, remote.priority)
    } else {
        pair_priority(remote.priority, local.priority)
    }
}

impl IceAgent {
    /// Pair a newly learned remote candidate against the component's local
    /// candidates.
    pub(crate) fn conn_check_add_for_remote(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        remote_id: RemoteCandidateId,
    ) {
        let locals: Vec<LocalCandidateId> = {
            let Some(component) = self.streams[stream_idx].component(component_id) else {
                return;
            };
            component.local_candidates.keys().collect()
        };

        for local_id in locals {
            self.add_check_pair(stream_idx, component_id, local_id, remote_id);
        }
        self.ensure_initial_states(stream_idx);
    }

    /// Pair a newly gathered local candidate against known remotes.
    pub(crate) fn conn_check_add_for_local(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        local_id: LocalCandidateId,
    ) {
        let remotes: Vec<RemoteCandidateId> = {
            let Some(component) = self.streams[stream_idx].component(component_id) else {
                return;
            };
            component
                .remote_candidates
                .iter()
                .filter(|(_, c)| c.kind != CandidateType::PeerReflexive)
                .map(|(id, _)| id)
                .collect()
        };

        for remote_id in remotes {
            self.add_check_pair(stream_idx, component_id, local_id, remote_id);
        }
        self.ensure_initial_states(stream_idx);
    }

    /// Form one pair, applying the pruning rules: reflexive locals collapse
    /// onto their base, mismatched families/transports are skipped,
    /// duplicates keep the existing entry, and the list is capped.
    fn add_check_pair(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        local_id: LocalCandidateId,
        remote_id: RemoteCandidateId,
    ) {
        let controlling = self.controlling;
        let stream = &mut self.streams[stream_idx];
        let stream_id = stream.id;
        let Some(component) = stream.component(component_id) else {
            return;
        };
        let Some(remote) = component.remote_candidates.get(remote_id) else {
            return;
        };

        // remote peer-reflexive candidates only pair through triggered checks
        if remote.kind == CandidateType::PeerReflexive {
            return;
        }

        let Some(local) = component.local_candidates.get(local_id) else {
            return;
        };

        // a server-reflexive local is redundant with its base
        let (local_id, local) = match local.kind {
            CandidateType::ServerReflexive | CandidateType::PeerReflexive => {
                let base_addr = local.base;
                let Some((base_id, base)) = component
                    .local_candidates
                    .iter()
                    .find(|(_, c)| c.kind == CandidateType::Host && c.addr == base_addr)
                else {
                    return;
                };
                (base_id, base)
            }
            CandidateType::Host | CandidateType::Relayed => (local_id, local),
        };

        if !local.transport.pairable_with(remote.transport)
            || !address::pairable(local.addr, remote.addr)
        {
            return;
        }

        if stream
            .check_list
            .iter()
            .any(|p| p.local == local_id && p.remote == remote_id)
        {
            return;
        }

        let pair = CandidateCheckPair {
            stream_id,
            component_id,
            local: local_id,
            remote: remote_id,
            foundation: pair_foundation(local, remote),
            state: CheckState::Frozen,
            nominated: false,
            nominating: false,
            recv_use_candidate: false,
            controlling,
            timer_restarted: false,
            priority: compute_pair_priority(local, remote, controlling),
            tx: None,
        };

        log::debug!(
            "add pair {} <-> {} priority {} component {}",
            local,
            remote,
            pair.priority,
            component_id
        );

        let position = stream
            .check_list
            .partition_point(|p| p.priority >= pair.priority);
        stream.check_list.insert(position, pair);

        while stream.check_list.len() > MAX_CHECK_LIST_SIZE {
            let dropped = stream.check_list.pop().expect("list is over capacity");
            log::debug!("check list full, pruned pair {}", dropped.foundation);
        }
    }

    /// RFC 5245 §5.7.4 initial states: within each foundation group the pair
    /// with the lowest component id thaws; foundations that already carry a
    /// valid pair anywhere thaw entirely.
    pub(crate) fn ensure_initial_states(&mut self, stream_idx: usize) {
        let succeeded: HashSet<String> = self
            .streams
            .iter()
            .flat_map(|s| s.check_list.iter())
            .filter(|p| p.state.is_valid())
            .map(|p| p.foundation.clone())
            .collect();

        let stream = &mut self.streams[stream_idx];

        let foundations: HashSet<String> = stream
            .check_list
            .iter()
            .map(|p| p.foundation.clone())
            .collect();

        for foundation in foundations {
            let group: Vec<usize> = stream
                .check_list
                .iter()
                .enumerate()
                .filter(|(_, p)| p.foundation == foundation)
                .map(|(i, _)| i)
                .collect();

            if succeeded.contains(&foundation) {
                for &i in &group {
                    if stream.check_list[i].state == CheckState::Frozen {
                        stream.check_list[i].state = CheckState::Waiting;
                    }
                }
                continue;
            }

            if group
                .iter()
                .any(|&i| stream.check_list[i].state != CheckState::Frozen)
            {
                continue;
            }

            if let Some(&first) = group.iter().min_by_key(|&&i| {
                let p = &stream.check_list[i];
                (p.component_id, std::cmp::Reverse(p.priority))
            }) {
                stream.check_list[first].state = CheckState::Waiting;
            }
        }
    }

    /// One Ta slot of the scheduler (§5.8): an ordinary check, else a
    /// triggered check, else a retransmission, else an unfreeze.
    pub(crate) fn conn_check_tick(&mut self, now: Instant) {
        if self.schedule_waiting_check(now) {
            return;
        }
        if self.schedule_triggered_check(now) {
            return;
        }
        if self.process_retransmits(now) {
            return;
        }
        self.unfreeze_next();
    }

    /// Highest-priority WAITING pair across all streams.
    fn schedule_waiting_check(&mut self, now: Instant) -> bool {
        let mut best: Option<(usize, usize, u64)> = None;

        for (stream_idx, stream) in self.streams.iter().enumerate() {
            if stream.remote_ufrag.is_none() {
                continue;
            }
            for (pair_idx, pair) in stream.check_list.iter().enumerate() {
                if pair.state == CheckState::Waiting
                    && best.map_or(true, |(_, _, prio)| pair.priority > prio)
                {
                    best = Some((stream_idx, pair_idx, pair.priority));
                }
            }
        }

        match best {
            Some((stream_idx, pair_idx, _)) => {
                self.send_check(now, stream_idx, pair_idx);
                true
            }
            None => false,
        }
    }

    fn schedule_triggered_check(&mut self, now: Instant) -> bool {
        for stream_idx in 0..self.streams.len() {
            if self.streams[stream_idx].remote_ufrag.is_none() {
                continue;
            }

            while let Some((component_id, local, remote)) =
                self.streams[stream_idx].triggered_queue.pop_front()
            {
                let Some(pair_idx) = self.streams[stream_idx].check_list.iter().position(|p| {
                    p.component_id == component_id && p.local == local && p.remote == remote
                }) else {
                    continue;
                };

                let pair = &mut self.streams[stream_idx].check_list[pair_idx];
                match pair.state {
                    // a triggered check on an in-flight pair just hurries the
                    // running transaction along
                    CheckState::InProgress => {
                        pair.timer_restarted = true;
                        continue;
                    }
                    CheckState::Succeeded | CheckState::Discovered if !pair.nominating => continue,
                    CheckState::Cancelled => continue,
                    _ => {}
                }

                self.send_check(now, stream_idx, pair_idx);
                return true;
            }
        }
        false
    }

    /// Drive retransmission timers; resend at most one request per slot but
    /// always collect expirations.
    fn process_retransmits(&mut self, now: Instant) -> bool {
        let mut sent = false;

        for stream_idx in 0..self.streams.len() {
            for pair_idx in 0..self.streams[stream_idx].check_list.len() {
                let stream = &mut self.streams[stream_idx];
                let pair = &mut stream.check_list[pair_idx];
                if pair.state != CheckState::InProgress {
                    continue;
                }
                let Some(tx) = &mut pair.tx else {
                    continue;
                };

                if pair.timer_restarted {
                    tx.timer.restart(now);
                    pair.timer_restarted = false;
                }

                match tx.timer.poll(now, &self.stun_config) {
                    RetransmitAction::Wait => {}
                    RetransmitAction::Retransmit if sent => {
                        // one send per slot; rewind so the next slot picks it up
                        tx.timer.restart(now);
                    }
                    RetransmitAction::Retransmit => {
                        sent = true;
                        let request = tx.request.clone();
                        let local = pair.local;
                        let remote = pair.remote;
                        let component_id = pair.component_id;
                        self.send_on_pair(stream_idx, component_id, local, remote, &request);
                    }
                    RetransmitAction::TimedOut => {
                        log::debug!("pair {} timed out, failed", pair.foundation);
                        pair.state = CheckState::Failed;
                        pair.tx = None;
                        pair.nominating = false;
                        let stream_idx_copy = stream_idx;
                        self.update_component_states(stream_idx_copy);
                    }
                }
            }
        }
        sent
    }

    fn unfreeze_next(&mut self) {
        for stream in &mut self.streams {
            let active: HashSet<String> = stream
                .check_list
                .iter()
                .filter(|p| matches!(p.state, CheckState::Waiting | CheckState::InProgress))
                .map(|p| p.foundation.clone())
                .collect();

            if let Some(pair) = stream
                .check_list
                .iter_mut()
                .find(|p| p.state == CheckState::Frozen && !active.contains(&p.foundation))
            {
                pair.state = CheckState::Waiting;
                return;
            }
        }
    }

    fn send_on_pair(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
        data: &[u8],
    ) {
        let Some(component) = self.streams[stream_idx].component_mut(component_id) else {
            return;
        };
        let Some(target) = component.remote_candidates.get(remote).map(|c| c.addr) else {
            return;
        };
        let Some(socket_id) = component.local_candidates.get(local).and_then(|c| c.socket) else {
            return;
        };
        let Some(socket) = component.sockets.get_mut(socket_id) else {
            return;
        };

        if let Err(e) = socket.send(target, data) {
            log::trace!("check send to {target} failed: {e}");
        }
    }

    fn send_check(&mut self, now: Instant, stream_idx: usize, pair_idx: usize) {
        let profile = self.compat.profile();
        let controlling = self.controlling;
        let aggressive = profile.nomination == NominationMode::Aggressive;
        let software = self.software.clone();

        let stream = &mut self.streams[stream_idx];
        let stream_id = stream.id;
        let tie_breaker = stream.tie_breaker;
        let local_ufrag = stream.local_ufrag.clone();
        let (Some(stream_rufrag), Some(stream_rpwd)) =
            (stream.remote_ufrag.clone(), stream.remote_pwd.clone())
        else {
            return;
        };

        let pair = &stream.check_list[pair_idx];
        let component_id = pair.component_id;
        let (local_id, remote_id) = (pair.local, pair.remote);
        let nominating = pair.nominating;

        let Some(component) = stream.component(component_id) else {
            return;
        };
        let (Some(local), Some(remote)) = (
            component.local_candidates.get(local_id).cloned(),
            component.remote_candidates.get(remote_id).cloned(),
        ) else {
            return;
        };

        let remote_ufrag = remote.username.clone().unwrap_or(stream_rufrag);
        let remote_pwd = remote.password.clone().unwrap_or(stream_rpwd);

        // the priority a peer-reflexive candidate discovered through this
        // check would get (§7.1.2.1)
        let local_pref = (local.priority >> 8) & 0xFFFF;
        let prflx_priority = candidate_priority(
            profile,
            CandidateType::PeerReflexive,
            local_pref,
            component_id,
        );

        let use_candidate = controlling && (aggressive || nominating);

        let tid = new_transaction_id(profile);
        let request = make_check_request(
            tid,
            &CheckRequest {
                profile,
                software: software.as_deref(),
                username: check_username(profile, &remote_ufrag, &local_ufrag),
                remote_pwd: &remote_pwd,
                priority: prflx_priority,
                controlling,
                tie_breaker,
                use_candidate,
            },
        );

        log::debug!(
            "connectivity check {} -> {} (nominating: {use_candidate})",
            local,
            remote
        );

        let pair = &mut stream.check_list[pair_idx];
        pair.state = CheckState::InProgress;
        pair.controlling = controlling;
        pair.timer_restarted = false;
        pair.tx = Some(CheckTransaction {
            id: tid,
            request: request.clone(),
            timer: RetransmitTimer::new(now, &self.stun_config, self.stun_config.max_check_attempts),
        });

        if let Some(component) = stream.component_mut(component_id) {
            // checks starting does not demote a component that stayed READY
            // across a restart
            if component.state < ComponentState::Connecting
                && component.set_state(ComponentState::Connecting)
            {
                self.events.push_back(AgentEvent::ComponentStateChanged {
                    stream_id,
                    component_id,
                    state: ComponentState::Connecting,
                });
            }
        }

        self.send_on_pair(stream_idx, component_id, local_id, remote_id, &request);
    }

    /// Success or error response to one of our checks (§7.1.3).
    pub(crate) fn handle_check_response(
        &mut self,
        now: Instant,
        stream_idx: usize,
        source: SocketAddr,
        destination: SocketAddr,
        msg: &Message,
    ) {
        let profile = self.compat.profile();
        let tid = msg.transaction_id();

        let Some(pair_idx) = self.streams[stream_idx]
            .check_list
            .iter()
            .position(|p| p.tx.as_ref().is_some_and(|tx| tx.id == tid))
        else {
            log::trace!("response with unknown transaction, dropped");
            return;
        };

        let stream = &self.streams[stream_idx];
        let local_pwd = stream.local_pwd.clone();
        let remote_pwd = stream.remote_pwd.clone();
        if !verify_inbound(profile, msg, &local_pwd, remote_pwd.as_deref()) {
            log::debug!("check response failed the integrity check, dropped");
            return;
        }

        match msg.class() {
            Class::Success => self.handle_check_success(now, stream_idx, pair_idx, source, destination, msg),
            Class::Error => self.handle_check_error(stream_idx, pair_idx, msg),
            _ => {}
        }
    }

    fn handle_check_success(
        &mut self,
        now: Instant,
        stream_idx: usize,
        pair_idx: usize,
        source: SocketAddr,
        _destination: SocketAddr,
        msg: &Message,
    ) {
        let profile = self.compat.profile();
        let controlling = self.controlling;
        let aggressive = profile.nomination == NominationMode::Aggressive;

        let (component_id, local_id, remote_id, nominating, recv_use, foundation) = {
            let pair = &self.streams[stream_idx].check_list[pair_idx];
            (
                pair.component_id,
                pair.local,
                pair.remote,
                pair.nominating,
                pair.recv_use_candidate,
                pair.foundation.clone(),
            )
        };

        // §7.1.3.1: the response must come back from the address the request
        // went to
        let remote_addr = self.streams[stream_idx]
            .component(component_id)
            .and_then(|c| c.remote_candidates.get(remote_id))
            .map(|c| c.addr);
        if remote_addr != Some(source) {
            log::debug!("response from asymmetric address {source}, pair failed");
            let pair = &mut self.streams[stream_idx].check_list[pair_idx];
            pair.state = CheckState::Failed;
            pair.tx = None;
            pair.nominating = false;
            self.update_component_states(stream_idx);
            return;
        }

        {
            let pair = &mut self.streams[stream_idx].check_list[pair_idx];
            pair.state = CheckState::Succeeded;
            pair.tx = None;
            pair.nominating = false;
        }

        log::debug!("pair {foundation} succeeded");

        // §7.1.3.2.1: a mapped address we do not know yet is a new local
        // peer-reflexive candidate
        let mut valid_local = local_id;
        if let Some(mapped) = response_mapped_address(profile, msg) {
            let known = self.streams[stream_idx]
                .component(component_id)
                .and_then(|c| c.find_local_by_addr(mapped));

            valid_local = match known {
                Some(id) => id,
                None => self.add_peer_reflexive_local(stream_idx, component_id, local_id, mapped),
            };
        }

        // §7.1.3.2.2: the valid pair may differ from the one that generated
        // the check
        let valid_idx = if valid_local == local_id {
            pair_idx
        } else {
            self.find_or_create_valid_pair(stream_idx, component_id, valid_local, remote_id)
        };

        let nominate = (controlling && (nominating || aggressive))
            || (!controlling && recv_use);
        if nominate {
            self.nominate_pair(now, stream_idx, valid_idx);
        }

        self.unfreeze_foundation(&foundation);
        self.nomination_tick(stream_idx);
        self.update_component_states(stream_idx);
    }

    fn handle_check_error(&mut self, stream_idx: usize, pair_idx: usize, msg: &Message) {
        let code = match msg.attribute::<ErrorCode>() {
            Some(Ok(error)) => error.number,
            _ => 0,
        };

        if code == 487 {
            // §7.1.3.1: role conflict. Switch only if our role still matches
            // what the failed check advertised (an inbound conflict may have
            // flipped us already), then repeat as a triggered check.
            let (component_id, local, remote, sent_controlling) = {
                let pair = &self.streams[stream_idx].check_list[pair_idx];
                (pair.component_id, pair.local, pair.remote, pair.controlling)
            };

            if sent_controlling == self.controlling {
                log::debug!("role conflict reported by peer, switching role");
                self.role_switch(!self.controlling);
            }

            // the role switch re-sorted the list, find the pair again
            let stream = &mut self.streams[stream_idx];
            if let Some(pair) = stream
                .check_list
                .iter_mut()
                .find(|p| p.local == local && p.remote == remote)
            {
                pair.state = CheckState::Waiting;
                pair.tx = None;
            }
            stream.triggered_queue.push_back((component_id, local, remote));
            return;
        }

        log::debug!("check failed with error code {code}");
        let pair = &mut self.streams[stream_idx].check_list[pair_idx];
        pair.state = CheckState::Failed;
        pair.tx = None;
        pair.nominating = false;
        self.update_component_states(stream_idx);
    }

    fn add_peer_reflexive_local(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        base_local: LocalCandidateId,
        mapped: SocketAddr,
    ) -> LocalCandidateId {
        let profile = self.compat.profile();
        let stream_id = self.streams[stream_idx].id;
        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .expect("component exists");
        let base = component.local_candidates[base_local].clone();

        let local_pref = (base.priority >> 8) & 0xFFFF;
        let priority = candidate_priority(
            profile,
            CandidateType::PeerReflexive,
            local_pref,
            component_id,
        );

        let candidate = Candidate {
            kind: CandidateType::PeerReflexive,
            transport: base.transport,
            addr: mapped,
            base: base.base,
            foundation: crate::candidate::compute_foundation(
                CandidateType::PeerReflexive,
                base.base.ip(),
                None,
                base.transport,
            ),
            priority,
            component_id,
            stream_id,
            username: None,
            password: None,
            turn_server: None,
            socket: base.socket,
        };

        log::debug!("discovered local peer-reflexive candidate {candidate}");
        let foundation = candidate.foundation.clone();
        let id = component.local_candidates.insert(candidate);

        self.events.push_back(AgentEvent::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });
        id
    }

    fn find_or_create_valid_pair(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        local_id: LocalCandidateId,
        remote_id: RemoteCandidateId,
    ) -> usize {
        let controlling = self.controlling;
        let stream = &mut self.streams[stream_idx];
        let stream_id = stream.id;

        if let Some(idx) = stream
            .check_list
            .iter()
            .position(|p| p.local == local_id && p.remote == remote_id)
        {
            let pair = &mut stream.check_list[idx];
            if !pair.state.is_valid() {
                pair.state = CheckState::Succeeded;
                pair.tx = None;
            }
            return idx;
        }

        let component = stream.component(component_id).expect("component exists");
        let local = &component.local_candidates[local_id];
        let remote = &component.remote_candidates[remote_id];

        let pair = CandidateCheckPair {
            stream_id,
            component_id,
            local: local_id,
            remote: remote_id,
            foundation: pair_foundation(local, remote),
            state: CheckState::Discovered,
            nominated: false,
            nominating: false,
            recv_use_candidate: false,
            controlling,
            timer_restarted: false,
            priority: compute_pair_priority(local, remote, controlling),
            tx: None,
        };

        log::debug!("discovered valid pair {}", pair.foundation);

        let position = stream
            .check_list
            .partition_point(|p| p.priority >= pair.priority);
        stream.check_list.insert(position, pair);
        position
    }

    /// Inbound Binding request on a component socket (§7.2).
    pub(crate) fn handle_inbound_request(
        &mut self,
        now: Instant,
        stream_idx: usize,
        component_id: u8,
        socket_id: crate::socket::SocketId,
        source: SocketAddr,
        msg: &Message,
    ) {
        let profile = self.compat.profile();
        let controlling = self.controlling;
        let stream_id = self.streams[stream_idx].id;

        let Some(username) = msg.attribute::<Username>().and_then(Result::ok) else {
            self.reply_error(stream_idx, component_id, socket_id, source, msg, 400, "Bad Request");
            return;
        };

        let (local_ufrag, local_pwd, remote_creds, tie_breaker) = {
            let stream = &self.streams[stream_idx];
            (
                stream.local_ufrag.clone(),
                stream.local_pwd.clone(),
                stream.remote_ufrag.clone().zip(stream.remote_pwd.clone()),
                stream.tie_breaker,
            )
        };

        // username sanity: must be addressed to our ufrag
        let expected_prefix = if profile.username_colon {
            format!("{local_ufrag}:")
        } else {
            local_ufrag.clone()
        };
        if !username.0.starts_with(&expected_prefix) {
            self.reply_error(stream_idx, component_id, socket_id, source, msg, 401, "Unauthorized");
            return;
        }
        if let Some((remote_ufrag, _)) = &remote_creds {
            let expected = check_username(profile, &local_ufrag, remote_ufrag);
            if username.0 != expected {
                self.reply_error(stream_idx, component_id, socket_id, source, msg, 401, "Unauthorized");
                return;
            }
        }

        if !verify_inbound(profile, msg, &local_pwd, None) {
            self.reply_error(stream_idx, component_id, socket_id, source, msg, 401, "Unauthorized");
            return;
        }

        if !self.streams[stream_idx].initial_binding_request_received {
            self.streams[stream_idx].initial_binding_request_received = true;
            self.events
                .push_back(AgentEvent::InitialBindingRequestReceived { stream_id });
        }

        // §7.2.1.1 role conflict resolution
        if controlling {
            if let Some(Ok(IceControlling(their_tb))) = msg.attribute::<IceControlling>() {
                if tie_breaker >= their_tb {
                    self.reply_role_conflict(stream_idx, component_id, socket_id, source, msg);
                    return;
                }
                self.role_switch(false);
            }
        } else if let Some(Ok(IceControlled(their_tb))) = msg.attribute::<IceControlled>() {
            if tie_breaker >= their_tb {
                self.reply_role_conflict(stream_idx, component_id, socket_id, source, msg);
                return;
            }
            self.role_switch(true);
        }

        let priority = msg
            .attribute::<Priority>()
            .and_then(Result::ok)
            .map(|p| p.0)
            .unwrap_or(0);
        let use_candidate = msg.attribute::<UseCandidate>().is_some();

        // answer before remote credentials exist; the check replays later
        if remote_creds.is_none() {
            let component = self.streams[stream_idx]
                .component_mut(component_id)
                .expect("component exists");
            component.incoming_checks.push(IncomingCheck {
                from: source,
                socket: socket_id,
                priority,
                use_candidate,
            });
            log::debug!("early binding request from {source} stored");
            self.reply_success(stream_idx, component_id, socket_id, source, msg);
            return;
        }

        self.reply_success(stream_idx, component_id, socket_id, source, msg);
        self.process_inbound_check(now, stream_idx, component_id, socket_id, source, priority, use_candidate);
    }

    /// The body of §7.2.1.3-§7.2.1.5: learn peer-reflexive remotes, enqueue
    /// the triggered check and honor USE-CANDIDATE. Shared with the replay
    /// of stored early checks.
    pub(crate) fn process_inbound_check(
        &mut self,
        now: Instant,
        stream_idx: usize,
        component_id: u8,
        socket_id: crate::socket::SocketId,
        source: SocketAddr,
        priority: u32,
        use_candidate: bool,
    ) {
        let controlling = self.controlling;
        let stream_id = self.streams[stream_idx].id;

        let Some(local_id) = self.streams[stream_idx]
            .component(component_id)
            .and_then(|c| c.find_local_by_socket(socket_id))
        else {
            log::warn!("no local candidate for inbound check on socket {socket_id:?}");
            return;
        };

        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .expect("component exists");

        let remote_id = match component.find_remote_by_addr(source) {
            Some(id) => id,
            None => {
                // §7.2.1.3: learn a peer-reflexive remote candidate
                let foundation = format!("prflx{}", self.prflx_counter);
                self.prflx_counter += 1;

                let candidate = Candidate {
                    kind: CandidateType::PeerReflexive,
                    transport: crate::candidate::TransportType::Udp,
                    addr: source,
                    base: source,
                    foundation: foundation.clone(),
                    priority,
                    component_id,
                    stream_id,
                    username: None,
                    password: None,
                    turn_server: None,
                    socket: None,
                };
                log::debug!("learned remote peer-reflexive candidate {candidate}");
                let id = component.remote_candidates.insert(candidate);

                self.events.push_back(AgentEvent::NewRemoteCandidate {
                    stream_id,
                    component_id,
                    foundation,
                });
                id
            }
        };

        // find or create the pair and arm it (§7.2.1.4)
        let pair_idx = self.streams[stream_idx]
            .check_list
            .iter()
            .position(|p| p.local == local_id && p.remote == remote_id);

        let pair_idx = match pair_idx {
            Some(idx) => {
                let pair = &mut self.streams[stream_idx].check_list[idx];
                match pair.state {
                    CheckState::Frozen | CheckState::Failed | CheckState::Cancelled => {
                        pair.state = CheckState::Waiting;
                    }
                    CheckState::InProgress => {
                        pair.timer_restarted = true;
                    }
                    CheckState::Waiting | CheckState::Succeeded | CheckState::Discovered => {}
                }
                idx
            }
            None => {
                self.add_check_pair(stream_idx, component_id, local_id, remote_id);
                let Some(idx) = self.streams[stream_idx]
                    .check_list
                    .iter()
                    .position(|p| p.local == local_id && p.remote == remote_id)
                else {
                    return;
                };
                self.streams[stream_idx].check_list[idx].state = CheckState::Waiting;
                idx
            }
        };

        {
            let pair = &mut self.streams[stream_idx].check_list[pair_idx];
            pair.recv_use_candidate |= use_candidate;
            if !pair.state.is_valid() {
                self.streams[stream_idx].triggered_queue.push_back((
                    component_id,
                    local_id,
                    remote_id,
                ));
            }
        }

        // §7.2.1.5: nominate on USE-CANDIDATE once the pair is valid
        if use_candidate && !controlling {
            let pair = &self.streams[stream_idx].check_list[pair_idx];
            if pair.state.is_valid() {
                self.nominate_pair(now, stream_idx, pair_idx);
                self.update_component_states(stream_idx);
            }
        }
    }

    fn reply_success(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        socket_id: crate::socket::SocketId,
        source: SocketAddr,
        msg: &Message,
    ) {
        let profile = self.compat.profile();
        let software = self.software.clone();
        let local_pwd = self.streams[stream_idx].local_pwd.clone();

        let response = make_check_response(
            profile,
            msg.transaction_id(),
            software.as_deref(),
            &local_pwd,
            source,
        );

        self.send_on_socket(stream_idx, component_id, socket_id, source, &response);
    }

    fn reply_error(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        socket_id: crate::socket::SocketId,
        source: SocketAddr,
        msg: &Message,
        code: u16,
        reason: &str,
    ) {
        let profile = self.compat.profile();
        let local_pwd = self.streams[stream_idx].local_pwd.clone();

        let response = make_error_response(
            profile,
            msg.transaction_id(),
            code,
            reason,
            Some(&local_pwd),
            None,
        );

        self.send_on_socket(stream_idx, component_id, socket_id, source, &response);
    }

    fn reply_role_conflict(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        socket_id: crate::socket::SocketId,
        source: SocketAddr,
        msg: &Message,
    ) {
        let profile = self.compat.profile();
        let controlling = self.controlling;
        let (local_pwd, tie_breaker) = {
            let stream = &self.streams[stream_idx];
            (stream.local_pwd.clone(), stream.tie_breaker)
        };

        log::warn!("role conflict with {source}, keeping our role (487)");

        let response = make_error_response(
            profile,
            msg.transaction_id(),
            487,
            "Role Conflict",
            Some(&local_pwd),
            Some((controlling, tie_breaker)),
        );

        self.send_on_socket(stream_idx, component_id, socket_id, source, &response);
    }

    pub(crate) fn send_on_socket(
        &mut self,
        stream_idx: usize,
        component_id: u8,
        socket_id: crate::socket::SocketId,
        target: SocketAddr,
        data: &[u8],
    ) {
        let Some(component) = self.streams[stream_idx].component_mut(component_id) else {
            return;
        };
        let Some(socket) = component.sockets.get_mut(socket_id) else {
            return;
        };
        if let Err(e) = socket.send(target, data) {
            log::trace!("send to {target} failed: {e}");
        }
    }

    /// Flip our role, recompute every pair priority and re-sort the lists
    /// (§7.2.1.1: priorities depend on the role).
    pub(crate) fn role_switch(&mut self, controlling: bool) {
        if self.controlling == controlling {
            return;
        }

        log::debug!(
            "role switch: {} -> {}",
            if self.controlling { "controlling" } else { "controlled" },
            if controlling { "controlling" } else { "controlled" },
        );
        self.controlling = controlling;

        for stream in &mut self.streams {
            for pair in &mut stream.check_list {
                let Some(component) = stream
                    .components
                    .iter()
                    .find(|c| c.id == pair.component_id)
                else {
                    continue;
                };
                let (Some(local), Some(remote)) = (
                    component.local_candidates.get(pair.local),
                    component.remote_candidates.get(pair.remote),
                ) else {
                    continue;
                };
                pair.priority = compute_pair_priority(local, remote, controlling);
                pair.controlling = controlling;
            }
            stream
                .check_list
                .sort_by_key(|p| std::cmp::Reverse(p.priority));
        }
    }

    fn unfreeze_foundation(&mut self, foundation: &str) {
        for stream in &mut self.streams {
            for pair in &mut stream.check_list {
                if pair.foundation == foundation && pair.state == CheckState::Frozen {
                    pair.state = CheckState::Waiting;
                }
            }
        }
    }

    /// Regular nomination (§8.1.1.1): once a component has a valid pair,
    /// the controlling agent re-checks the best one with USE-CANDIDATE.
    pub(crate) fn nomination_tick(&mut self, stream_idx: usize) {
        let profile = self.compat.profile();
        if !self.controlling || profile.nomination == NominationMode::Aggressive {
            return;
        }

        let stream = &mut self.streams[stream_idx];
        let component_ids: Vec<u8> = stream.components.iter().map(|c| c.id).collect();

        for component_id in component_ids {
            let concluded = stream.check_list.iter().any(|p| {
                p.component_id == component_id && (p.nominated || p.nominating)
            });
            let fallback = stream
                .component(component_id)
                .is_some_and(|c| c.fallback_mode);
            if concluded || fallback {
                continue;
            }

            let best = stream
                .check_list
                .iter_mut()
                .filter(|p| p.component_id == component_id && p.state.is_valid())
                .max_by_key(|p| p.priority);

            if let Some(pair) = best {
                log::debug!("nominating pair {}", pair.foundation);
                pair.nominating = true;
                stream
                    .triggered_queue
                    .push_front((component_id, pair.local, pair.remote));
            }
        }
    }

    /// Mark a valid pair nominated and make it the component's selected pair
    /// if it beats the current one.
    pub(crate) fn nominate_pair(&mut self, now: Instant, stream_idx: usize, pair_idx: usize) {
        let stream_id = self.streams[stream_idx].id;

        let (component_id, local_id, remote_id, priority, foundations) = {
            let pair = &mut self.streams[stream_idx].check_list[pair_idx];
            pair.nominated = true;
            pair.nominating = false;

            let component_id = pair.component_id;
            let (local, remote) = (pair.local, pair.remote);
            let priority = pair.priority;

            let component = self.streams[stream_idx]
                .component(component_id)
                .expect("component exists");
            let lf = component.local_candidates[local].foundation.clone();
            let rf = component.remote_candidates[remote].foundation.clone();
            (component_id, local, remote, priority, (lf, rf))
        };

        let component = self.streams[stream_idx]
            .component_mut(component_id)
            .expect("component exists");

        // replace when strictly better, or when the old selection points at
        // candidates a restart has since thrown away
        let replaces = match component.selected_pair {
            None => true,
            Some(selected) => {
                priority > selected.priority
                    || component.remote_candidates.get(selected.remote).is_none()
            }
        };
        if !replaces {
            return;
        }

        component.selected_pair = Some(SelectedPair {
            local: local_id,
            remote: remote_id,
            priority,
        });
        component.restart_deadline = None;
        component.keepalive.start(now);
        let became_ready = component.set_state(ComponentState::Ready);

        // checks for this component conclude; anything not in flight is moot
        for pair in &mut self.streams[stream_idx].check_list {
            if pair.component_id != component_id {
                continue;
            }
            if matches!(pair.state, CheckState::Frozen | CheckState::Waiting) {
                pair.state = CheckState::Cancelled;
            }
        }

        self.events.push_back(AgentEvent::NewSelectedPair {
            stream_id,
            component_id,
            local_foundation: foundations.0,
            remote_foundation: foundations.1,
        });
        if became_ready {
            self.events.push_back(AgentEvent::ComponentStateChanged {
                stream_id,
                component_id,
                state: ComponentState::Ready,
            });
            if self.reliable {
                self.events.push_back(AgentEvent::ReliableTransportWritable {
                    stream_id,
                    component_id,
                });
            }
        }
    }

    /// Re-derive component states from the check list (§7.1.3.3).
    pub(crate) fn update_component_states(&mut self, stream_idx: usize) {
        let stream_id = self.streams[stream_idx].id;
        let gather_done = self.streams[stream_idx].gather_done;
        let has_remote_creds = self.streams[stream_idx].remote_ufrag.is_some();

        let component_ids: Vec<u8> =
            self.streams[stream_idx].components.iter().map(|c| c.id).collect();

        for component_id in component_ids {
            let (any_valid, any_nominated, any_live, any_pair) = {
                let stream = &self.streams[stream_idx];
                let pairs = stream
                    .check_list
                    .iter()
                    .filter(|p| p.component_id == component_id);

                let mut any_valid = false;
                let mut any_nominated = false;
                let mut any_live = false;
                let mut any_pair = false;
                for pair in pairs {
                    any_pair = true;
                    any_valid |= pair.state.is_valid();
                    any_nominated |= pair.nominated && pair.state.is_valid();
                    any_live |= matches!(
                        pair.state,
                        CheckState::Frozen | CheckState::Waiting | CheckState::InProgress
                    );
                }
                (any_valid, any_nominated, any_live, any_pair)
            };

            let next = if any_nominated {
                Some(ComponentState::Ready)
            } else if any_valid {
                Some(ComponentState::Connected)
            } else if any_pair && !any_live && gather_done && has_remote_creds {
                Some(ComponentState::Failed)
            } else {
                None
            };

            if let Some(state) = next {
                let component = self.streams[stream_idx]
                    .component_mut(component_id)
                    .expect("component exists");
                if !component.fallback_mode && component.set_state(state) {
                    self.events.push_back(AgentEvent::ComponentStateChanged {
                        stream_id,
                        component_id,
                        state,
                    });
                }
            }
        }
    }

    /// Replay binding requests that arrived before the remote credentials.
    pub(crate) fn replay_incoming_checks(&mut self, now: Instant, stream_idx: usize) {
        let component_ids: Vec<u8> =
            self.streams[stream_idx].components.iter().map(|c| c.id).collect();

        for component_id in component_ids {
            let stored = {
                let component = self.streams[stream_idx]
                    .component_mut(component_id)
                    .expect("component exists");
                std::mem::take(&mut component.incoming_checks)
            };

            for check in stored {
                self.process_inbound_check(
                    now,
                    stream_idx,
                    component_id,
                    check.socket,
                    check.from,
                    check.priority,
                    check.use_candidate,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_states() {
        assert!(CheckState::Succeeded.is_valid());
        assert!(CheckState::Discovered.is_valid());
        assert!(!CheckState::Waiting.is_valid());
        assert!(!CheckState::Cancelled.is_valid());
    }
}
