//! Synchronous API contracts: argument validation, hard limits, port
//! ranges, stream lifecycle and the SDP surface.

mod common;

use common::{init_logging, new_agent};
use rime_ice::context::MemoryNet;
use rime_ice::{
    AgentError, CandidateType, Compatibility, IceCandidate, TransportType, MAX_REMOTE_CANDIDATES,
};

fn remote(i: usize) -> IceCandidate {
    IceCandidate {
        foundation: format!("f{i}"),
        component_id: 1,
        transport: TransportType::Udp,
        priority: 1000 + i as u32,
        addr: format!("10.1.0.{}:5000", i + 1).parse().unwrap(),
        kind: CandidateType::Host,
        base_addr: None,
        username: None,
        password: None,
    }
}

#[test]
fn remote_credential_length_bounds() {
    init_logging();
    let net = MemoryNet::new();
    let mut agent = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let stream = agent.add_stream(1).unwrap();

    let ok = |n: usize| "u".repeat(n);

    assert!(agent.set_remote_credentials(stream, &ok(22), &ok(22)).is_ok());
    assert!(agent.set_remote_credentials(stream, &ok(256), &ok(4)).is_ok());
    assert_eq!(
        agent.set_remote_credentials(stream, &ok(21), &ok(22)),
        Err(AgentError::InvalidArgument("ufrag length out of range"))
    );
    assert_eq!(
        agent.set_remote_credentials(stream, &ok(257), &ok(22)),
        Err(AgentError::InvalidArgument("ufrag length out of range"))
    );
    assert_eq!(
        agent.set_remote_credentials(stream, &ok(22), &ok(3)),
        Err(AgentError::InvalidArgument("password length out of range"))
    );
    assert_eq!(
        agent.set_remote_credentials(stream, &ok(22), &ok(257)),
        Err(AgentError::InvalidArgument("password length out of range"))
    );
}

#[test]
fn remote_candidate_hard_limit() {
    init_logging();
    let net = MemoryNet::new();
    let mut agent = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let stream = agent.add_stream(1).unwrap();

    let first: Vec<IceCandidate> = (0..MAX_REMOTE_CANDIDATES).map(remote).collect();
    assert_eq!(
        agent.set_remote_candidates(stream, 1, &first).unwrap(),
        MAX_REMOTE_CANDIDATES
    );

    // the 26th is rejected
    assert_eq!(
        agent
            .set_remote_candidates(stream, 1, &[remote(MAX_REMOTE_CANDIDATES)])
            .unwrap(),
        0
    );

    assert_eq!(
        agent.set_remote_candidates(rime_ice::StreamId(99), 1, &[remote(0)]),
        Err(AgentError::UnknownStream)
    );
    assert_eq!(
        agent.set_remote_candidates(stream, 9, &[remote(0)]),
        Err(AgentError::UnknownComponent)
    );
}

#[test]
fn port_range_of_size_one() {
    init_logging();
    let net = MemoryNet::new();

    let mut first = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let stream = first.add_stream(1).unwrap();
    first.set_port_range(stream, 1, 5000, 5000).unwrap();
    first.gather_candidates(stream).unwrap();

    let candidates = first.get_local_candidates(stream, 1).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].addr.port(), 5000);

    // the port is taken now, a second agent on the same range cannot gather
    let mut second = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let stream2 = second.add_stream(1).unwrap();
    second.set_port_range(stream2, 1, 5000, 5000).unwrap();
    assert_eq!(
        second.gather_candidates(stream2),
        Err(AgentError::GatherFailed)
    );

    assert!(first
        .set_port_range(stream, 1, 6000, 5000)
        .is_err());
}

#[test]
fn removed_streams_leave_no_residue() {
    init_logging();
    let net = MemoryNet::new();
    let mut agent = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);

    let stream = agent.add_stream(1).unwrap();
    agent.set_port_range(stream, 1, 7000, 7000).unwrap();
    agent.gather_candidates(stream).unwrap();
    let creds = agent.get_local_credentials(stream).unwrap();

    agent.remove_stream(stream).unwrap();
    assert_eq!(agent.get_local_credentials(stream), Err(AgentError::UnknownStream));

    // ids are never reused, state is fresh, the port is free again
    let fresh = agent.add_stream(1).unwrap();
    assert_ne!(fresh, stream);
    assert!(agent.get_local_candidates(fresh, 1).unwrap().is_empty());
    assert_ne!(agent.get_local_credentials(fresh).unwrap(), creds);

    agent.set_port_range(fresh, 1, 7000, 7000).unwrap();
    agent.gather_candidates(fresh).unwrap();
    assert_eq!(
        agent.get_local_candidates(fresh, 1).unwrap()[0].addr.port(),
        7000
    );
}

#[test]
fn sdp_roundtrip_reconstructs_the_candidate_set() {
    init_logging();
    let net = MemoryNet::new();
    let mut publisher = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let mut consumer = new_agent(&net, "10.0.0.2", Compatibility::Rfc5245, false);

    let stream_p = publisher.add_stream(2).unwrap();
    publisher.set_stream_name(stream_p, "audio").unwrap();
    publisher.gather_candidates(stream_p).unwrap();

    let stream_c = consumer.add_stream(2).unwrap();
    consumer.set_stream_name(stream_c, "audio").unwrap();

    let sdp = publisher.generate_local_sdp();
    assert!(sdp.contains("m=audio"));
    assert!(sdp.contains("a=ice-ufrag:"));

    let added = consumer.parse_remote_sdp(&sdp).unwrap();
    assert_eq!(added, 2);

    for component in 1..=2u8 {
        let published: Vec<_> = publisher
            .get_local_candidates(stream_p, component)
            .unwrap()
            .into_iter()
            .map(|c| (c.foundation, c.addr, c.priority))
            .collect();
        let mut parsed: Vec<_> = consumer
            .get_remote_candidates(stream_c, component)
            .unwrap()
            .into_iter()
            .map(|c| (c.foundation, c.addr, c.priority))
            .collect();
        parsed.sort();
        let mut published = published;
        published.sort();
        assert_eq!(published, parsed);
    }

    // unnamed streams render a placeholder and refuse to parse back
    let mut unnamed = new_agent(&net, "10.0.0.3", Compatibility::Rfc5245, true);
    let stream_u = unnamed.add_stream(1).unwrap();
    unnamed.gather_candidates(stream_u).unwrap();
    let sdp = unnamed.generate_local_sdp();
    assert!(sdp.contains("m=- "));
    assert!(consumer.parse_remote_sdp(&sdp).is_err());
}

#[test]
fn duplicate_local_addresses_are_deduplicated() {
    init_logging();
    let net = MemoryNet::new();
    let mut agent = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);

    agent.add_local_address("10.0.0.1".parse().unwrap()).unwrap();
    agent.add_local_address("10.0.0.1".parse().unwrap()).unwrap();

    let stream = agent.add_stream(1).unwrap();
    agent.gather_candidates(stream).unwrap();
    assert_eq!(agent.get_local_candidates(stream, 1).unwrap().len(), 1);
}
