//! Shared harness: agents on one in-memory network, driven with a manual
//! clock until a condition holds.
#![allow(dead_code)]

use rime_ice::context::{MemoryContext, MemoryNet};
use rime_ice::{AgentEvent, Compatibility, IceAgent, StreamId};
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn new_agent(net: &MemoryNet, ip: &str, compat: Compatibility, controlling: bool) -> IceAgent {
    let ctx = MemoryContext::new(net.clone(), ip.parse().unwrap());
    let mut agent = IceAgent::new(Box::new(ctx), compat);
    agent.set_controlling(controlling);
    agent
}

/// Swap credentials and candidates both ways for one stream pair.
pub fn exchange(
    a: &mut IceAgent,
    stream_a: StreamId,
    b: &mut IceAgent,
    stream_b: StreamId,
    components: u8,
) {
    let (ufrag, pwd) = a.get_local_credentials(stream_a).unwrap();
    b.set_remote_credentials(stream_b, &ufrag, &pwd).unwrap();
    let (ufrag, pwd) = b.get_local_credentials(stream_b).unwrap();
    a.set_remote_credentials(stream_a, &ufrag, &pwd).unwrap();

    for component in 1..=components {
        let candidates = a.get_local_candidates(stream_a, component).unwrap();
        b.set_remote_candidates(stream_b, component, &candidates).unwrap();
        let candidates = b.get_local_candidates(stream_b, component).unwrap();
        a.set_remote_candidates(stream_a, component, &candidates).unwrap();
    }
}

/// Poll every agent, advancing a virtual clock by each round's shortest
/// timeout, until `cond` holds. Panics when it never does.
pub fn drive_until(
    agents: &mut [&mut IceAgent],
    now: &mut Instant,
    mut extra: impl FnMut(),
    mut cond: impl FnMut(&mut [&mut IceAgent]) -> bool,
) {
    for _ in 0..4_000 {
        for _ in 0..3 {
            for agent in agents.iter_mut() {
                agent.poll(*now);
            }
            extra();
        }

        if cond(agents) {
            return;
        }

        let step = agents
            .iter()
            .filter_map(|agent| agent.timeout(*now))
            .min()
            .unwrap_or(Duration::from_millis(20));
        *now += step.clamp(Duration::from_millis(1), Duration::from_secs(5));
    }

    panic!("condition not reached");
}

/// Drain all pending events of an agent.
pub fn drain_events(agent: &mut IceAgent) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = agent.poll_event() {
        events.push(event);
    }
    events
}
