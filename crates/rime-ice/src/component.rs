use crate::candidate::{Candidate, LocalCandidateId, RemoteCandidateId};
use crate::context::Timer;
use crate::socket::{IceSocket, SocketId};
use rand::Rng;
use slotmap::SlotMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Keepalive cadence on the selected pair; jittered per component so a
/// multi-component agent does not burst.
const KEEPALIVE_BASE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayType {
    Udp,
    Tcp,
    Tls,
}

/// One TURN server registered for a component.
#[derive(Debug, Clone)]
pub(crate) struct TurnServerConfig {
    pub(crate) server: SocketAddr,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) relay_type: RelayType,
}

/// A valid binding request that arrived before the remote credentials; it is
/// replayed once they are known.
#[derive(Debug, Clone)]
pub(crate) struct IncomingCheck {
    pub(crate) from: SocketAddr,
    pub(crate) socket: SocketId,
    pub(crate) priority: u32,
    pub(crate) use_candidate: bool,
}

/// The pair data currently flows over, independent of the check list
/// (ICE §11.1).
#[derive(Debug, Clone, Copy)]
pub(crate) struct SelectedPair {
    pub(crate) local: LocalCandidateId,
    pub(crate) remote: RemoteCandidateId,
    pub(crate) priority: u64,
}

pub(crate) struct Component {
    pub(crate) id: u8,
    pub(crate) state: ComponentState,
    pub(crate) local_candidates: SlotMap<LocalCandidateId, Candidate>,
    pub(crate) remote_candidates: SlotMap<RemoteCandidateId, Candidate>,
    pub(crate) sockets: SlotMap<SocketId, Box<dyn IceSocket>>,
    pub(crate) incoming_checks: Vec<IncomingCheck>,
    pub(crate) turn_servers: Vec<TurnServerConfig>,
    pub(crate) selected_pair: Option<SelectedPair>,
    /// Active remote candidate preserved across an ICE restart.
    pub(crate) restart_candidate: Option<Candidate>,
    pub(crate) min_port: u16,
    pub(crate) max_port: u16,
    pub(crate) keepalive: Timer,
    /// Set while a restart is underway; expiry demotes READY to CONNECTING.
    pub(crate) restart_deadline: Option<Instant>,
    /// Selected pair was forced by the application; no further checks.
    pub(crate) fallback_mode: bool,
    pub(crate) recv_cb: Option<Box<dyn FnMut(&[u8])>>,
}

impl Component {
    pub(crate) fn new(id: u8) -> Self {
        let jitter = rand::thread_rng().gen_range(0..3_000);

        Component {
            id,
            state: ComponentState::Disconnected,
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            sockets: SlotMap::with_key(),
            incoming_checks: Vec::new(),
            turn_servers: Vec::new(),
            selected_pair: None,
            restart_candidate: None,
            min_port: 0,
            max_port: 0,
            keepalive: Timer::new(KEEPALIVE_BASE + Duration::from_millis(jitter)),
            restart_deadline: None,
            fallback_mode: false,
            recv_cb: None,
        }
    }

    /// State changes are monotonic forward; the two sanctioned exceptions are
    /// any state to FAILED and READY back to CONNECTING (restart expiry).
    /// Returns whether the state actually changed.
    pub(crate) fn set_state(&mut self, state: ComponentState) -> bool {
        let allowed = state > self.state
            || state == ComponentState::Failed
            || (self.state == ComponentState::Ready && state == ComponentState::Connecting);

        if !allowed || state == self.state {
            return false;
        }

        log::debug!("component {} state {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        true
    }

    pub(crate) fn find_local_by_addr(&self, addr: SocketAddr) -> Option<LocalCandidateId> {
        self.local_candidates
            .iter()
            .find(|(_, c)| c.addr == addr)
            .map(|(id, _)| id)
    }

    pub(crate) fn find_remote_by_addr(&self, addr: SocketAddr) -> Option<RemoteCandidateId> {
        self.remote_candidates
            .iter()
            .find(|(_, c)| c.addr == addr)
            .map(|(id, _)| id)
    }

    /// The candidate owning `socket`, preferring the host/relayed owner over
    /// reflexive candidates that merely borrow it.
    pub(crate) fn find_local_by_socket(&self, socket: SocketId) -> Option<LocalCandidateId> {
        use crate::candidate::CandidateType;

        self.local_candidates
            .iter()
            .filter(|(_, c)| c.socket == Some(socket))
            .max_by_key(|(_, c)| {
                matches!(c.kind, CandidateType::Host | CandidateType::Relayed)
            })
            .map(|(id, _)| id)
    }

    pub(crate) fn close_sockets(&mut self) {
        for (_, socket) in &mut self.sockets {
            socket.close();
        }
    }

    /// Reset for an ICE restart: forget candidates and pending checks but
    /// keep sockets and the selected remote as a fallback send target.
    pub(crate) fn restart(&mut self, now: Instant, restart_timeout: Duration) {
        if let Some(selected) = self.selected_pair {
            self.restart_candidate = self.remote_candidates.get(selected.remote).cloned();
        }

        self.remote_candidates.clear();
        self.incoming_checks.clear();
        self.restart_deadline = Some(now + restart_timeout);

        // a failed component gets another shot with the new credentials
        if self.state == ComponentState::Failed {
            log::debug!("component {} state Failed -> Connecting (restart)", self.id);
            self.state = ComponentState::Connecting;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        let mut component = Component::new(1);
        assert!(component.set_state(ComponentState::Gathering));
        assert!(component.set_state(ComponentState::Connecting));
        assert!(component.set_state(ComponentState::Connected));
        assert!(!component.set_state(ComponentState::Gathering));
        assert_eq!(component.state, ComponentState::Connected);

        assert!(component.set_state(ComponentState::Ready));
        // restart demotion is the one backwards edge
        assert!(component.set_state(ComponentState::Connecting));
        assert!(component.set_state(ComponentState::Failed));
    }

    #[test]
    fn set_state_reports_no_change() {
        let mut component = Component::new(1);
        assert!(component.set_state(ComponentState::Connecting));
        assert!(!component.set_state(ComponentState::Connecting));
    }
}
