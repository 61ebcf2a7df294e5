//! Keeping TURN allocations alive: one refresh record per allocation, firing
//! ahead of the lifetime and retrying through credential challenges.

use crate::agent::IceAgent;
use crate::candidate::CandidateType;
use crate::socket::SocketId;
use crate::stun_build::{RetransmitAction, RetransmitTimer};
use crate::StreamId;
use rime_stun_types::attributes::{ErrorCode, Lifetime, Nonce, Realm, Username};
use rime_stun_types::{Class, IntegrityKey, Message, MessageBuilder, Method, TransactionId};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A long-lived refresher for one allocation.
pub(crate) struct CandidateRefresh {
    pub(crate) stream_id: StreamId,
    pub(crate) component_id: u8,
    pub(crate) socket: SocketId,
    pub(crate) server: SocketAddr,
    lifetime: Duration,
    next_refresh: Instant,
    tx: Option<(TransactionId, Vec<u8>, RetransmitTimer)>,
    auth_retried: bool,
}

/// Refresh comfortably before expiry, but never more than halfway through
/// short lifetimes.
fn refresh_delay(lifetime: Duration) -> Duration {
    lifetime.saturating_sub(Duration::from_secs(60)).max(lifetime / 2)
}

impl IceAgent {
    pub(crate) fn spawn_refresh(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        socket: SocketId,
        server: SocketAddr,
        lifetime: Duration,
        now: Instant,
    ) {
        self.refreshes.push(CandidateRefresh {
            stream_id,
            component_id,
            socket,
            server,
            lifetime,
            next_refresh: now + refresh_delay(lifetime),
            tx: None,
            auth_retried: false,
        });
    }

    pub(crate) fn refresh_tick(&mut self, now: Instant) {
        let mut expired = Vec::new();

        for idx in 0..self.refreshes.len() {
            let refresh = &mut self.refreshes[idx];

            match &mut refresh.tx {
                None if now >= refresh.next_refresh => {
                    self.refresh_send(now, idx);
                }
                None => {}
                Some((_, request, timer)) => match timer.poll(now, &self.stun_config) {
                    RetransmitAction::Wait => {}
                    RetransmitAction::Retransmit => {
                        let request = request.clone();
                        let (stream_id, component_id, socket) =
                            (refresh.stream_id, refresh.component_id, refresh.socket);
                        self.send_refresh_request(stream_id, component_id, socket, &request);
                    }
                    RetransmitAction::TimedOut => {
                        log::debug!("allocation refresh towards {} expired", refresh.server);
                        expired.push(idx);
                    }
                },
            }
        }

        for idx in expired.into_iter().rev() {
            let refresh = self.refreshes.remove(idx);
            self.invalidate_relay(refresh.stream_id, refresh.component_id, refresh.socket);
        }
    }

    fn refresh_send(&mut self, now: Instant, idx: usize) {
        let refresh = &self.refreshes[idx];
        let (stream_id, component_id, socket) =
            (refresh.stream_id, refresh.component_id, refresh.socket);
        let lifetime = refresh.lifetime;

        let auth = self
            .stream_index(stream_id)
            .and_then(|stream_idx| self.streams[stream_idx].component_mut(component_id))
            .and_then(|component| component.sockets.get_mut(socket))
            .and_then(|sock| sock.as_turn_mut())
            .and_then(|turn| turn.auth().cloned());

        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, Method::Refresh, tid);
        builder.add_attr(&Lifetime(lifetime.as_secs() as u32));

        if let Some(auth) = &auth {
            if let (Some(realm), Some(nonce)) = (&auth.realm, &auth.nonce) {
                builder.add_attr(&Username::new(auth.username.clone()));
                builder.add_attr(&Realm::new(realm.clone()));
                builder.add_attr(&Nonce::new(nonce.clone()));
                builder.add_message_integrity(&IntegrityKey::long_term(
                    &auth.username,
                    realm,
                    &auth.password,
                ));
            }
        }

        let request = builder.finish();
        let max_attempts = self.stun_config.max_allocate_attempts;
        self.refreshes[idx].tx = Some((
            tid,
            request.clone(),
            RetransmitTimer::new(now, &self.stun_config, max_attempts),
        ));

        self.send_refresh_request(stream_id, component_id, socket, &request);
    }

    fn send_refresh_request(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        socket: SocketId,
        request: &[u8],
    ) {
        let turn = self
            .stream_index(stream_id)
            .and_then(|stream_idx| self.streams[stream_idx].component_mut(component_id))
            .and_then(|component| component.sockets.get_mut(socket))
            .and_then(|sock| sock.as_turn_mut());

        if let Some(turn) = turn {
            if let Err(e) = turn.send_control(request) {
                log::trace!("refresh send failed: {e}");
            }
        }
    }

    /// Route a server STUN message to its refresh record. Returns true when
    /// consumed.
    pub(crate) fn handle_refresh_response(&mut self, now: Instant, msg: &Message) -> bool {
        if msg.method() != Method::Refresh {
            return false;
        }

        let tid = msg.transaction_id();
        let Some(idx) = self
            .refreshes
            .iter()
            .position(|r| r.tx.as_ref().is_some_and(|(id, _, _)| *id == tid))
        else {
            return false;
        };

        match msg.class() {
            Class::Success => {
                let refresh = &mut self.refreshes[idx];
                refresh.tx = None;
                refresh.auth_retried = false;
                if let Some(Ok(Lifetime(seconds))) = msg.attribute::<Lifetime>() {
                    refresh.lifetime = Duration::from_secs(seconds as u64);
                }
                refresh.next_refresh = now + refresh_delay(refresh.lifetime);
                log::trace!("allocation on {} refreshed", refresh.server);
                true
            }
            Class::Error => {
                let code = match msg.attribute::<ErrorCode>() {
                    Some(Ok(error)) => error.number,
                    _ => 0,
                };

                let realm = msg.attribute::<Realm>().and_then(Result::ok).map(|r| r.0);
                let nonce = msg.attribute::<Nonce>().and_then(Result::ok).map(|n| n.0);

                let refresh = &mut self.refreshes[idx];
                if (code == 401 || code == 438) && !refresh.auth_retried {
                    refresh.auth_retried = true;
                    refresh.tx = None;
                    let (stream_id, component_id, socket) =
                        (refresh.stream_id, refresh.component_id, refresh.socket);

                    // push the fresh nonce down to the allocation layer
                    if let Some(turn) = self
                        .stream_index(stream_id)
                        .and_then(|i| self.streams[i].component_mut(component_id))
                        .and_then(|c| c.sockets.get_mut(socket))
                        .and_then(|s| s.as_turn_mut())
                    {
                        turn.set_challenge(realm, nonce);
                    }

                    self.refresh_send(now, idx);
                } else {
                    log::debug!("refresh refused with code {code}, dropping allocation");
                    let refresh = self.refreshes.remove(idx);
                    self.invalidate_relay(refresh.stream_id, refresh.component_id, refresh.socket);
                }
                true
            }
            _ => false,
        }
    }

    /// The allocation is gone: retire its candidates, fail their pairs and
    /// close the socket.
    pub(crate) fn invalidate_relay(
        &mut self,
        stream_id: StreamId,
        component_id: u8,
        socket: SocketId,
    ) {
        use crate::conncheck::CheckState;

        let Some(stream_idx) = self.stream_index(stream_id) else {
            return;
        };

        let removed: Vec<crate::candidate::LocalCandidateId> = {
            let Some(component) = self.streams[stream_idx].component_mut(component_id) else {
                return;
            };

            let ids: Vec<_> = component
                .local_candidates
                .iter()
                .filter(|(_, c)| c.kind == CandidateType::Relayed && c.socket == Some(socket))
                .map(|(id, _)| id)
                .collect();
            for &id in &ids {
                let candidate = component.local_candidates.remove(id);
                if let Some(candidate) = candidate {
                    log::debug!("relay candidate {candidate} invalidated");
                }
            }

            if let Some(sock) = component.sockets.get_mut(socket) {
                sock.close();
            }
            component.sockets.remove(socket);
            ids
        };

        let stream = &mut self.streams[stream_idx];
        for pair in &mut stream.check_list {
            if pair.component_id == component_id && removed.contains(&pair.local) {
                if !matches!(pair.state, CheckState::Failed | CheckState::Cancelled) {
                    pair.state = CheckState::Failed;
                    pair.tx = None;
                }
            }
        }

        self.update_component_states(stream_idx);
    }

    pub(crate) fn refresh_timeout(&self, now: Instant) -> Option<Duration> {
        self.refreshes
            .iter()
            .map(|refresh| match &refresh.tx {
                Some((_, _, timer)) => timer.timeout(now),
                None => refresh.next_refresh.saturating_duration_since(now),
            })
            .min()
    }
}
