use crate::compat::{CompatProfile, PriorityScheme};
use crate::socket::SocketId;
use crate::StreamId;
use core::fmt;
use slotmap::new_key_type;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

new_key_type!(
    pub(crate) struct LocalCandidateId;
    pub(crate) struct RemoteCandidateId;
);

pub(crate) const MAX_FOUNDATION_LEN: usize = 32;

/// RFC 5245 §4.1.2.2 type preferences.
pub(crate) const TYPE_PREF_HOST: u32 = 126;
pub(crate) const TYPE_PREF_PEER_REFLEXIVE: u32 = 110;
pub(crate) const TYPE_PREF_SERVER_REFLEXIVE: u32 = 100;
pub(crate) const TYPE_PREF_RELAYED: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateType {
    pub(crate) fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => TYPE_PREF_HOST,
            CandidateType::PeerReflexive => TYPE_PREF_PEER_REFLEXIVE,
            CandidateType::ServerReflexive => TYPE_PREF_SERVER_REFLEXIVE,
            CandidateType::Relayed => TYPE_PREF_RELAYED,
        }
    }

    /// Google Talk assigns flat per-type priorities instead of the formula.
    pub(crate) fn jingle_priority(self) -> u32 {
        match self {
            CandidateType::Host => 1000,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive => 900,
            CandidateType::Relayed => 500,
        }
    }

    /// MSN flat per-type priorities.
    pub(crate) fn msn_priority(self) -> u32 {
        match self {
            CandidateType::Host => 830,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive => 550,
            CandidateType::Relayed => 450,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Udp,
    TcpActive,
    TcpPassive,
    TcpSo,
}

impl TransportType {
    /// Whether a local and remote transport can form a pair.
    pub(crate) fn pairable_with(self, remote: TransportType) -> bool {
        matches!(
            (self, remote),
            (TransportType::Udp, TransportType::Udp)
                | (TransportType::TcpActive, TransportType::TcpPassive)
                | (TransportType::TcpPassive, TransportType::TcpActive)
                | (TransportType::TcpSo, TransportType::TcpSo)
        )
    }
}

/// A potential transport address of a component (ICE §4.1.1).
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) kind: CandidateType,
    pub(crate) transport: TransportType,
    pub(crate) addr: SocketAddr,
    /// The address checks are sent from. Same as `addr` for host and relayed
    /// candidates, the underlying host address for reflexive ones.
    pub(crate) base: SocketAddr,
    pub(crate) foundation: String,
    pub(crate) priority: u32,
    pub(crate) component_id: u8,
    pub(crate) stream_id: StreamId,
    /// Per-candidate short-term credentials (legacy dialects).
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    /// The TURN server this candidate was allocated from.
    pub(crate) turn_server: Option<SocketAddr>,
    /// Owning socket for host/relayed candidates, the base candidate's socket
    /// for reflexive ones.
    pub(crate) socket: Option<SocketId>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CandidateType::Host => write!(f, "host({})", self.addr),
            CandidateType::PeerReflexive => {
                write!(f, "peer-reflexive(base:{}, peer:{})", self.base, self.addr)
            }
            CandidateType::ServerReflexive => {
                write!(f, "server-reflexive(base:{}, server:{})", self.base, self.addr)
            }
            CandidateType::Relayed => write!(f, "relayed(relay:{})", self.addr),
        }
    }
}

/// ICE §4.1.2.1 recommended formula, yields a value in 1..=0x7effffff.
pub(crate) fn ice_priority_full(type_preference: u32, local_preference: u32, component_id: u8) -> u32 {
    0x0100_0000 * type_preference + 0x100 * local_preference + (0x100 - component_id as u32)
}

/// Candidate priority under the agent's dialect.
pub(crate) fn candidate_priority(
    profile: &CompatProfile,
    kind: CandidateType,
    local_preference: u32,
    component_id: u8,
) -> u32 {
    match profile.priority {
        PriorityScheme::Rfc => {
            ice_priority_full(kind.type_preference(), local_preference, component_id)
        }
        PriorityScheme::Jingle => kind.jingle_priority(),
        PriorityScheme::MsnScalar => kind.msn_priority(),
    }
}

/// ICE §5.7.2: `2^32*MIN(G,D) + 2*MAX(G,D) + (G>D ? 1 : 0)` where G is the
/// controlling and D the controlled candidate priority.
pub(crate) fn pair_priority(controlling_prio: u32, controlled_prio: u32) -> u64 {
    let g = controlling_prio as u64;
    let d = controlled_prio as u64;

    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// Candidates derived from the same source share a foundation: same type,
/// base address, discovery server and transport.
pub(crate) fn compute_foundation(
    kind: CandidateType,
    base: IpAddr,
    server: Option<SocketAddr>,
    transport: TransportType,
) -> String {
    let mut hasher = DefaultHasher::new();
    (kind, base, server, transport).hash(&mut hasher);
    let foundation = format!("{:016x}", hasher.finish());

    debug_assert!(foundation.len() <= MAX_FOUNDATION_LEN);
    foundation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::Compatibility;

    #[test]
    fn rfc_priority_formula() {
        assert_eq!(
            ice_priority_full(TYPE_PREF_HOST, 1, 1),
            0x0100_0000 * 126 + 0x100 + 255
        );
        // higher components get lower priorities
        assert!(ice_priority_full(126, 1, 1) > ice_priority_full(126, 1, 2));
    }

    #[test]
    fn compat_priority_scales() {
        let google = Compatibility::Google.profile();
        let msn = Compatibility::Msn.profile();
        assert_eq!(candidate_priority(google, CandidateType::Host, 1, 1), 1000);
        assert_eq!(candidate_priority(google, CandidateType::Relayed, 1, 1), 500);
        assert_eq!(candidate_priority(msn, CandidateType::Host, 1, 1), 830);
        assert_eq!(
            candidate_priority(msn, CandidateType::ServerReflexive, 1, 1),
            550
        );
    }

    #[test]
    fn pair_priority_formula() {
        let g = 100u32;
        let d = 42u32;
        assert_eq!(pair_priority(g, d), (1u64 << 32) * 42 + 2 * 100 + 1);
        assert_eq!(pair_priority(d, g), (1u64 << 32) * 42 + 2 * 100);
        // no tie-break bit when G == D
        assert_eq!(pair_priority(g, g), (1u64 << 32) * 100 + 2 * 100);
    }

    #[test]
    fn foundations_distinguish_sources() {
        let base: IpAddr = "10.0.0.1".parse().unwrap();
        let stun: SocketAddr = "198.51.100.4:3478".parse().unwrap();

        let host = compute_foundation(CandidateType::Host, base, None, TransportType::Udp);
        let srflx = compute_foundation(
            CandidateType::ServerReflexive,
            base,
            Some(stun),
            TransportType::Udp,
        );

        assert_ne!(host, srflx);
        assert_eq!(
            host,
            compute_foundation(CandidateType::Host, base, None, TransportType::Udp)
        );
    }

    #[test]
    fn transport_pairing() {
        assert!(TransportType::Udp.pairable_with(TransportType::Udp));
        assert!(TransportType::TcpActive.pairable_with(TransportType::TcpPassive));
        assert!(!TransportType::TcpActive.pairable_with(TransportType::TcpActive));
        assert!(!TransportType::Udp.pairable_with(TransportType::TcpSo));
    }
}
