//! Late ("dribbled") remote candidates: the working path is discovered via
//! peer-reflexive learning while the signalled candidate is unreachable, and
//! later additions never regress an established selection.

mod common;

use common::{drive_until, init_logging, new_agent};
use rime_ice::context::MemoryNet;
use rime_ice::{Compatibility, ComponentState, IceCandidate};
use std::time::{Duration, Instant};

#[test]
fn unreachable_signalled_candidate_is_bypassed() {
    init_logging();
    let net = MemoryNet::new();
    let mut left = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let mut right = new_agent(&net, "10.0.0.2", Compatibility::Rfc5245, false);

    let stream_l = left.add_stream(1).unwrap();
    let stream_r = right.add_stream(1).unwrap();
    left.gather_candidates(stream_l).unwrap();
    right.gather_candidates(stream_r).unwrap();

    // credentials go both ways, candidates only right <- left; what left
    // knows about right points at a dead port
    let (ufrag, pwd) = left.get_local_credentials(stream_l).unwrap();
    right.set_remote_credentials(stream_r, &ufrag, &pwd).unwrap();
    let (ufrag, pwd) = right.get_local_credentials(stream_r).unwrap();
    left.set_remote_credentials(stream_l, &ufrag, &pwd).unwrap();

    let left_candidates = left.get_local_candidates(stream_l, 1).unwrap();
    right
        .set_remote_candidates(stream_r, 1, &left_candidates)
        .unwrap();

    let mut dead = right.get_local_candidates(stream_r, 1).unwrap()[0].clone();
    dead.addr.set_port(80);
    assert_eq!(left.set_remote_candidates(stream_l, 1, &[dead]).unwrap(), 1);

    let mut now = Instant::now();
    drive_until(&mut [&mut left, &mut right], &mut now, || {}, |agents| {
        agents[0].component_state(stream_l, 1) == Ok(ComponentState::Ready)
            && agents[1].component_state(stream_r, 1) == Ok(ComponentState::Ready)
    });

    // the pair left settled on is right's real address, learned reflexively
    let (_, selected_remote) = left.get_selected_pair(stream_l, 1).unwrap();
    let right_real = right.get_local_candidates(stream_r, 1).unwrap()[0].addr;
    assert_eq!(selected_remote.addr, right_real);

    // let the dead-pair retransmissions run dry; nothing may regress
    for _ in 0..120 {
        left.poll(now);
        right.poll(now);
        now += Duration::from_millis(500);
    }

    assert_eq!(
        left.component_state(stream_l, 1),
        Ok(ComponentState::Ready)
    );

    // a late, lower-priority remote does not displace the selection
    let late = IceCandidate {
        priority: 1,
        addr: "10.0.0.2:9999".parse().unwrap(),
        foundation: "late".to_owned(),
        ..right.get_local_candidates(stream_r, 1).unwrap()[0].clone()
    };
    assert_eq!(left.set_remote_candidates(stream_l, 1, &[late]).unwrap(), 1);

    for _ in 0..200 {
        left.poll(now);
        right.poll(now);
        now += Duration::from_millis(20);
    }

    assert_eq!(left.component_state(stream_l, 1), Ok(ComponentState::Ready));
    let (_, still_selected) = left.get_selected_pair(stream_l, 1).unwrap();
    assert_eq!(still_selected.addr, right_real);
}
