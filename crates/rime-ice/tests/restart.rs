//! ICE restart: fresh credentials and check lists while data keeps flowing
//! on the previously selected pair.

mod common;

use common::{drain_events, drive_until, exchange, init_logging, new_agent};
use rime_ice::context::MemoryNet;
use rime_ice::{AgentEvent, Compatibility, ComponentState};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

#[test]
fn restart_reattains_ready_and_keeps_data_flowing() {
    init_logging();
    let net = MemoryNet::new();
    let mut left = new_agent(&net, "10.0.0.1", Compatibility::Rfc5245, true);
    let mut right = new_agent(&net, "10.0.0.2", Compatibility::Rfc5245, false);

    let stream_l = left.add_stream(1).unwrap();
    let stream_r = right.add_stream(1).unwrap();
    left.gather_candidates(stream_l).unwrap();
    right.gather_candidates(stream_r).unwrap();
    exchange(&mut left, stream_l, &mut right, stream_r, 1);

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    right
        .attach_recv(stream_r, 1, move |data| {
            sink.borrow_mut().extend_from_slice(data)
        })
        .unwrap();

    let mut now = Instant::now();
    drive_until(&mut [&mut left, &mut right], &mut now, || {}, |agents| {
        agents[0].component_state(stream_l, 1) == Ok(ComponentState::Ready)
            && agents[1].component_state(stream_r, 1) == Ok(ComponentState::Ready)
    });

    let old_creds = left.get_local_credentials(stream_l).unwrap();
    drain_events(&mut left);

    // restart both ends
    left.restart().unwrap();
    right.restart().unwrap();

    let new_creds = left.get_local_credentials(stream_l).unwrap();
    assert_ne!(old_creds, new_creds);

    // components stay READY and the old selected pair still carries data
    assert_eq!(left.component_state(stream_l, 1), Ok(ComponentState::Ready));
    assert_eq!(left.send(stream_l, 1, b"mid-restart").unwrap(), 11);
    right.poll(now);
    assert_eq!(received.borrow().as_slice(), b"mid-restart");
    received.borrow_mut().clear();

    // new session: swap the fresh credentials and candidates
    exchange(&mut left, stream_l, &mut right, stream_r, 1);

    // drive until the new session nominates (a fresh selected-pair event)
    drive_until(&mut [&mut left, &mut right], &mut now, || {}, |agents| {
        while let Some(event) = agents[0].poll_event() {
            if matches!(event, AgentEvent::NewSelectedPair { .. }) {
                return true;
            }
        }
        false
    });

    assert_eq!(left.component_state(stream_l, 1), Ok(ComponentState::Ready));
    assert_eq!(right.component_state(stream_r, 1), Ok(ComponentState::Ready));

    assert_eq!(left.send(stream_l, 1, b"post-restart").unwrap(), 12);
    right.poll(now);
    assert_eq!(received.borrow().as_slice(), b"post-restart");
}
