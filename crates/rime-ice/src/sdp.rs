//! SDP rendering and parsing of the ICE exchange surface: `m=` blocks with
//! `a=ice-ufrag` / `a=ice-pwd` and `a=candidate:` lines.

use crate::agent::{AgentError, IceAgent};
use crate::candidate::{Candidate, CandidateType, TransportType};
use crate::StreamId;
use std::net::{IpAddr, SocketAddr};

/// The candidate tuple as exchanged with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component_id: u8,
    pub transport: TransportType,
    pub priority: u32,
    pub addr: SocketAddr,
    pub kind: CandidateType,
    /// Related address (`raddr`/`rport`), present on reflexive and relayed
    /// candidates.
    pub base_addr: Option<SocketAddr>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl IceCandidate {
    pub(crate) fn from_candidate(candidate: &Candidate) -> Self {
        let base_addr = match candidate.kind {
            CandidateType::Host => None,
            _ => Some(candidate.base),
        };

        IceCandidate {
            foundation: candidate.foundation.clone(),
            component_id: candidate.component_id,
            transport: candidate.transport,
            priority: candidate.priority,
            addr: candidate.addr,
            kind: candidate.kind,
            base_addr,
            username: candidate.username.clone(),
            password: candidate.password.clone(),
        }
    }
}

fn transport_token(transport: TransportType) -> &'static str {
    match transport {
        TransportType::Udp => "UDP",
        TransportType::TcpActive => "TCP-ACT",
        TransportType::TcpPassive => "TCP-PASS",
        TransportType::TcpSo => "TCP-SO",
    }
}

fn parse_transport(token: &str) -> Option<TransportType> {
    match token.to_ascii_uppercase().as_str() {
        "UDP" => Some(TransportType::Udp),
        "TCP-ACT" | "TCP" => Some(TransportType::TcpActive),
        "TCP-PASS" => Some(TransportType::TcpPassive),
        "TCP-SO" => Some(TransportType::TcpSo),
        _ => None,
    }
}

fn type_token(kind: CandidateType) -> &'static str {
    match kind {
        CandidateType::Host => "host",
        CandidateType::ServerReflexive => "srflx",
        CandidateType::PeerReflexive => "prflx",
        CandidateType::Relayed => "relay",
    }
}

fn parse_type(token: &str) -> Option<CandidateType> {
    match token {
        "host" => Some(CandidateType::Host),
        "srflx" => Some(CandidateType::ServerReflexive),
        "prflx" => Some(CandidateType::PeerReflexive),
        "relay" => Some(CandidateType::Relayed),
        _ => None,
    }
}

/// `candidate:<foundation> <component> <transport> <priority> <ip> <port>
/// typ <type> [raddr <ip> rport <port>]`
pub(crate) fn candidate_to_sdp(candidate: &IceCandidate) -> String {
    let mut line = format!(
        "a=candidate:{} {} {} {} {} {} typ {}",
        candidate.foundation,
        candidate.component_id,
        transport_token(candidate.transport),
        candidate.priority,
        candidate.addr.ip(),
        candidate.addr.port(),
        type_token(candidate.kind),
    );

    if let Some(base) = candidate.base_addr {
        line.push_str(&format!(" raddr {} rport {}", base.ip(), base.port()));
    }

    line
}

pub(crate) fn candidate_from_sdp(line: &str) -> Option<IceCandidate> {
    let line = line.trim();
    let rest = line
        .strip_prefix("a=candidate:")
        .or_else(|| line.strip_prefix("candidate:"))?;

    let mut tokens = rest.split_whitespace();
    let foundation = tokens.next()?.to_owned();
    let component_id: u8 = tokens.next()?.parse().ok()?;
    let transport = parse_transport(tokens.next()?)?;
    let priority: u32 = tokens.next()?.parse().ok()?;
    let ip: IpAddr = tokens.next()?.parse().ok()?;
    let port: u16 = tokens.next()?.parse().ok()?;

    if tokens.next()? != "typ" {
        return None;
    }
    let kind = parse_type(tokens.next()?)?;

    let mut base_addr = None;
    let extra: Vec<&str> = tokens.collect();
    let mut i = 0;
    let mut raddr: Option<IpAddr> = None;
    let mut rport: Option<u16> = None;
    while i + 1 < extra.len() {
        match extra[i] {
            "raddr" => raddr = extra[i + 1].parse().ok(),
            "rport" => rport = extra[i + 1].parse().ok(),
            _ => {}
        }
        i += 2;
    }
    if let (Some(ip), Some(port)) = (raddr, rport) {
        base_addr = Some(SocketAddr::new(ip, port));
    }

    Some(IceCandidate {
        foundation,
        component_id,
        transport,
        priority,
        addr: SocketAddr::new(ip, port),
        kind,
        base_addr,
        username: None,
        password: None,
    })
}

impl IceAgent {
    /// Render one local candidate as an SDP attribute line.
    pub fn generate_local_candidate_sdp(&self, candidate: &IceCandidate) -> String {
        candidate_to_sdp(candidate)
    }

    /// Parse a single `a=candidate:` line for a stream.
    pub fn parse_remote_candidate_sdp(
        &self,
        stream_id: StreamId,
        sdp: &str,
    ) -> Result<IceCandidate, AgentError> {
        self.stream(stream_id)?;
        candidate_from_sdp(sdp).ok_or(AgentError::InvalidArgument("unparsable candidate line"))
    }

    /// SDP block for one stream. Unnamed streams render a `-` placeholder
    /// (and cannot be matched back by the parser).
    pub fn generate_local_stream_sdp(
        &self,
        stream_id: StreamId,
        include_non_ice: bool,
    ) -> Result<String, AgentError> {
        let stream = self.stream(stream_id)?;
        let name = stream.name.as_deref().unwrap_or("-");

        let mut sdp = String::new();

        if include_non_ice {
            let default = stream
                .components
                .first()
                .and_then(|c| c.local_candidates.values().min_by_key(|c| c.priority));
            let (default_ip, default_port) = match default {
                Some(c) => (c.addr.ip().to_string(), c.addr.port()),
                None => ("0.0.0.0".to_owned(), 9),
            };
            sdp.push_str(&format!("m={name} {default_port} ICE/SDP\n"));
            sdp.push_str(&format!("c=IN IP4 {default_ip}\n"));
        }

        sdp.push_str(&format!("a=ice-ufrag:{}\n", stream.local_ufrag));
        sdp.push_str(&format!("a=ice-pwd:{}\n", stream.local_pwd));

        for component in &stream.components {
            for candidate in component.local_candidates.values() {
                if candidate.kind == CandidateType::PeerReflexive {
                    continue;
                }
                sdp.push_str(&candidate_to_sdp(&IceCandidate::from_candidate(candidate)));
                sdp.push('\n');
            }
        }

        Ok(sdp)
    }

    /// SDP for every stream of the agent.
    pub fn generate_local_sdp(&self) -> String {
        let mut sdp = String::new();
        for stream in &self.streams {
            if let Ok(block) = self.generate_local_stream_sdp(stream.id, true) {
                sdp.push_str(&block);
            }
        }
        sdp
    }

    /// Parse a peer's SDP and apply credentials and candidates to the
    /// matching (named) streams. Returns the number of candidates added.
    pub fn parse_remote_sdp(&mut self, sdp: &str) -> Result<usize, AgentError> {
        struct PendingStream {
            stream_id: StreamId,
            ufrag: Option<String>,
            pwd: Option<String>,
            candidates: Vec<IceCandidate>,
        }

        let mut pending: Vec<PendingStream> = Vec::new();
        let mut current: Option<usize> = None;

        for line in sdp.lines() {
            let line = line.trim();

            if let Some(rest) = line.strip_prefix("m=") {
                let name = rest.split_whitespace().next().unwrap_or("");
                let stream_id = self
                    .streams
                    .iter()
                    .find(|s| s.name.as_deref() == Some(name))
                    .map(|s| s.id)
                    .ok_or(AgentError::InvalidArgument("unnamed or unknown stream"))?;

                pending.push(PendingStream {
                    stream_id,
                    ufrag: None,
                    pwd: None,
                    candidates: Vec::new(),
                });
                current = Some(pending.len() - 1);
            } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
                if let Some(i) = current {
                    pending[i].ufrag = Some(ufrag.to_owned());
                }
            } else if let Some(pwd) = line.strip_prefix("a=ice-pwd:") {
                if let Some(i) = current {
                    pending[i].pwd = Some(pwd.to_owned());
                }
            } else if line.starts_with("a=candidate:") {
                if let (Some(i), Some(candidate)) = (current, candidate_from_sdp(line)) {
                    pending[i].candidates.push(candidate);
                }
            }
        }

        if pending.is_empty() {
            return Err(AgentError::InvalidArgument("no media blocks"));
        }

        let mut added = 0;
        for entry in pending {
            if let (Some(ufrag), Some(pwd)) = (&entry.ufrag, &entry.pwd) {
                self.set_remote_credentials(entry.stream_id, ufrag, pwd)?;
            }

            let component_ids: Vec<u8> = entry
                .candidates
                .iter()
                .map(|c| c.component_id)
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();

            for component_id in component_ids {
                let batch: Vec<IceCandidate> = entry
                    .candidates
                    .iter()
                    .filter(|c| c.component_id == component_id)
                    .cloned()
                    .collect();
                added += self.set_remote_candidates(entry.stream_id, component_id, &batch)?;
            }
        }

        Ok(added)
    }

    /// Parse one stream's SDP block without applying it; returns the
    /// candidates plus any credentials found.
    pub fn parse_remote_stream_sdp(
        &self,
        stream_id: StreamId,
        sdp: &str,
    ) -> Result<(Vec<IceCandidate>, Option<String>, Option<String>), AgentError> {
        self.stream(stream_id)?;

        let mut ufrag = None;
        let mut pwd = None;
        let mut candidates = Vec::new();

        for line in sdp.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
                ufrag = Some(value.to_owned());
            } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
                pwd = Some(value.to_owned());
            } else if line.starts_with("a=candidate:") {
                if let Some(candidate) = candidate_from_sdp(line) {
                    candidates.push(candidate);
                }
            }
        }

        Ok((candidates, ufrag, pwd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IceCandidate {
        IceCandidate {
            foundation: "abcdef".to_owned(),
            component_id: 1,
            transport: TransportType::Udp,
            priority: 2_113_937_151,
            addr: "192.168.1.4:5000".parse().unwrap(),
            kind: CandidateType::Host,
            base_addr: None,
            username: None,
            password: None,
        }
    }

    #[test]
    fn candidate_line_roundtrip() {
        let candidate = sample();
        let line = candidate_to_sdp(&candidate);
        assert_eq!(
            line,
            "a=candidate:abcdef 1 UDP 2113937151 192.168.1.4 5000 typ host"
        );
        assert_eq!(candidate_from_sdp(&line).unwrap(), candidate);
    }

    #[test]
    fn reflexive_candidates_carry_related_address() {
        let mut candidate = sample();
        candidate.kind = CandidateType::ServerReflexive;
        candidate.base_addr = Some("10.0.0.4:5000".parse().unwrap());

        let line = candidate_to_sdp(&candidate);
        assert!(line.ends_with("typ srflx raddr 10.0.0.4 rport 5000"));
        assert_eq!(candidate_from_sdp(&line).unwrap(), candidate);
    }

    #[test]
    fn garbage_lines_do_not_parse() {
        assert!(candidate_from_sdp("a=candidate:x").is_none());
        assert!(candidate_from_sdp("a=candidate:f 1 UDP 1 not-an-ip 1 typ host").is_none());
        assert!(candidate_from_sdp("a=candidate:f 1 UDP 1 1.2.3.4 1 typ wat").is_none());
        assert!(candidate_from_sdp("v=0").is_none());
    }
}
