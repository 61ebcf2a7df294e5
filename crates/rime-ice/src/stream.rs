use crate::component::Component;
use crate::conncheck::CandidateCheckPair;
use crate::StreamId;
use rand::distributions::{Alphanumeric, DistString};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Generated credential sizes. The ufrag must satisfy the remote-credential
/// validator of a peer running this same engine, which is why it is longer
/// than the RFC minimum.
const UFRAG_LEN: usize = 22;
const PWD_LEN: usize = 32;

pub(crate) type TriggeredEntry = (
    u8,
    crate::candidate::LocalCandidateId,
    crate::candidate::RemoteCandidateId,
);

/// A media/data stream: an ordered set of components sharing credentials and
/// one check list.
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) name: Option<String>,
    pub(crate) components: Vec<Component>,
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: Option<String>,
    pub(crate) remote_pwd: Option<String>,
    pub(crate) initial_binding_request_received: bool,
    pub(crate) tie_breaker: u64,
    pub(crate) check_list: Vec<CandidateCheckPair>,
    pub(crate) triggered_queue: VecDeque<TriggeredEntry>,
    pub(crate) gather_requested: bool,
    pub(crate) gather_done: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, n_components: u8) -> Self {
        let mut stream = Stream {
            id,
            name: None,
            components: (1..=n_components).map(Component::new).collect(),
            local_ufrag: String::new(),
            local_pwd: String::new(),
            remote_ufrag: None,
            remote_pwd: None,
            initial_binding_request_received: false,
            tie_breaker: rand::random(),
            check_list: Vec::new(),
            triggered_queue: VecDeque::new(),
            gather_requested: false,
            gather_done: false,
        };
        stream.initialize_credentials();
        stream
    }

    pub(crate) fn initialize_credentials(&mut self) {
        let mut rng = rand::thread_rng();
        self.local_ufrag = Alphanumeric.sample_string(&mut rng, UFRAG_LEN);
        self.local_pwd = Alphanumeric.sample_string(&mut rng, PWD_LEN);
    }

    pub(crate) fn component(&self, component_id: u8) -> Option<&Component> {
        self.components
            .iter()
            .find(|component| component.id == component_id)
    }

    pub(crate) fn component_mut(&mut self, component_id: u8) -> Option<&mut Component> {
        self.components
            .iter_mut()
            .find(|component| component.id == component_id)
    }

    /// Reset to a fresh ICE session: new credentials, empty check list,
    /// forgotten remote candidates. Sockets and local candidates survive.
    pub(crate) fn restart(&mut self, now: Instant, restart_timeout: Duration) {
        use crate::conncheck::CheckState;

        self.initial_binding_request_received = false;
        self.remote_ufrag = None;
        self.remote_pwd = None;
        self.initialize_credentials();

        for pair in &mut self.check_list {
            if pair.state == CheckState::InProgress {
                pair.state = CheckState::Cancelled;
                log::debug!("pair {} cancelled by restart", pair.foundation);
            }
        }
        self.check_list.clear();
        self.triggered_queue.clear();

        for component in &mut self.components {
            component.restart(now, restart_timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_streams_have_exchangeable_credentials() {
        let stream = Stream::new(StreamId(1), 2);
        assert_eq!(stream.components.len(), 2);
        assert_eq!(stream.components[0].id, 1);
        assert_eq!(stream.components[1].id, 2);

        // long enough to pass the remote-credential validator on the peer
        assert_eq!(stream.local_ufrag.len(), 22);
        assert_eq!(stream.local_pwd.len(), 32);
    }

    #[test]
    fn restart_regenerates_credentials() {
        let mut stream = Stream::new(StreamId(1), 1);
        stream.remote_ufrag = Some("x".repeat(22));
        stream.remote_pwd = Some("y".repeat(22));
        let (ufrag, pwd) = (stream.local_ufrag.clone(), stream.local_pwd.clone());

        stream.restart(Instant::now(), Duration::from_secs(30));

        assert_ne!(stream.local_ufrag, ufrag);
        assert_ne!(stream.local_pwd, pwd);
        assert!(stream.remote_ufrag.is_none());
        assert!(!stream.initial_binding_request_received);
    }
}
