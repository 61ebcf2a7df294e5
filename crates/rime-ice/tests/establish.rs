//! Two agents finding each other over the in-memory network, across the
//! dialects.

mod common;

use common::{drain_events, drive_until, exchange, init_logging, new_agent};
use rime_ice::context::MemoryNet;
use rime_ice::{AgentEvent, Compatibility, ComponentState, IceAgent, StreamId};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

fn ready(agent: &IceAgent, stream: StreamId, component: u8) -> bool {
    agent.component_state(stream, component) == Ok(ComponentState::Ready)
}

#[test]
fn rfc5245_udp_loopback() {
    init_logging();
    let net = MemoryNet::new();
    let mut left = new_agent(&net, "127.0.0.1", Compatibility::Rfc5245, true);
    let mut right = new_agent(&net, "127.0.0.1", Compatibility::Rfc5245, false);

    let stream_l = left.add_stream(1).unwrap();
    let stream_r = right.add_stream(1).unwrap();
    left.gather_candidates(stream_l).unwrap();
    right.gather_candidates(stream_r).unwrap();

    assert!(drain_events(&mut left)
        .iter()
        .any(|e| matches!(e, AgentEvent::CandidateGatheringDone { stream_id } if *stream_id == stream_l)));

    exchange(&mut left, stream_l, &mut right, stream_r, 1);

    let mut now = Instant::now();
    drive_until(&mut [&mut left, &mut right], &mut now, || {}, |agents| {
        ready(agents[0], stream_l, 1) && ready(agents[1], stream_r, 1)
    });

    let left_events = drain_events(&mut left);
    assert!(left_events.iter().any(|e| matches!(
        e,
        AgentEvent::ComponentStateChanged { state: ComponentState::Ready, .. }
    )));
    assert!(left_events
        .iter()
        .any(|e| matches!(e, AgentEvent::NewSelectedPair { .. })));
    assert!(drain_events(&mut right).iter().any(|e| matches!(
        e,
        AgentEvent::InitialBindingRequestReceived { .. }
    )));

    // payload delivery, byte exact
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    right
        .attach_recv(stream_r, 1, move |data| {
            sink.borrow_mut().extend_from_slice(data)
        })
        .unwrap();

    assert_eq!(left.send(stream_l, 1, b"hello").unwrap(), 5);
    right.poll(now);
    assert_eq!(received.borrow().as_slice(), b"hello");
}

#[test]
fn msn_two_component_stream() {
    init_logging();
    let net = MemoryNet::new();
    let mut left = new_agent(&net, "10.0.0.1", Compatibility::Msn, true);
    let mut right = new_agent(&net, "10.0.0.2", Compatibility::Msn, false);

    let stream_l = left.add_stream(2).unwrap();
    let stream_r = right.add_stream(2).unwrap();
    left.gather_candidates(stream_l).unwrap();
    right.gather_candidates(stream_r).unwrap();

    exchange(&mut left, stream_l, &mut right, stream_r, 2);

    let mut now = Instant::now();
    drive_until(&mut [&mut left, &mut right], &mut now, || {}, |agents| {
        ready(agents[0], stream_l, 1)
            && ready(agents[0], stream_l, 2)
            && ready(agents[1], stream_r, 1)
            && ready(agents[1], stream_r, 2)
    });

    // both components picked pairs on the same interface, different ports
    let (rtp_local, _) = left.get_selected_pair(stream_l, 1).unwrap();
    let (rtcp_local, _) = left.get_selected_pair(stream_l, 2).unwrap();
    assert_eq!(rtp_local.component_id, 1);
    assert_eq!(rtcp_local.component_id, 2);
    assert_eq!(rtp_local.addr.ip(), rtcp_local.addr.ip());
    assert_ne!(rtp_local.addr.port(), rtcp_local.addr.port());
}

#[test]
fn google_dialect_connects() {
    init_logging();
    let net = MemoryNet::new();
    let mut left = new_agent(&net, "10.0.0.1", Compatibility::Google, true);
    let mut right = new_agent(&net, "10.0.0.2", Compatibility::Google, false);

    let stream_l = left.add_stream(1).unwrap();
    let stream_r = right.add_stream(1).unwrap();
    left.gather_candidates(stream_l).unwrap();
    right.gather_candidates(stream_r).unwrap();

    exchange(&mut left, stream_l, &mut right, stream_r, 1);

    let mut now = Instant::now();
    drive_until(&mut [&mut left, &mut right], &mut now, || {}, |agents| {
        ready(agents[0], stream_l, 1) && ready(agents[1], stream_r, 1)
    });

    // google priorities are the flat jingle scale
    let candidates = left.get_local_candidates(stream_l, 1).unwrap();
    assert!(candidates.iter().all(|c| c.priority == 1000));
}

#[test]
fn role_conflict_resolves_with_one_winner() {
    init_logging();
    let net = MemoryNet::new();
    // both sides believe they are controlling
    let mut left = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let mut right = new_agent(&net, "10.0.0.2", Compatibility::Rfc5245, true);

    let stream_l = left.add_stream(1).unwrap();
    let stream_r = right.add_stream(1).unwrap();
    left.gather_candidates(stream_l).unwrap();
    right.gather_candidates(stream_r).unwrap();

    exchange(&mut left, stream_l, &mut right, stream_r, 1);

    let mut now = Instant::now();
    drive_until(&mut [&mut left, &mut right], &mut now, || {}, |agents| {
        ready(agents[0], stream_l, 1) && ready(agents[1], stream_r, 1)
    });

    // exactly one side backed down
    assert_ne!(left.is_controlling(), right.is_controlling());
}
