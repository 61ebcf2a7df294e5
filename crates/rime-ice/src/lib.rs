#![deny(unreachable_pub, unsafe_code)]

//! ICE agent (RFC 5245) with the compatibility dialects of its era: Google
//! Talk, MSN Messenger, Windows Live Messenger 2009 and Office Communicator
//! 2007/R2.
//!
//! The engine gathers host, server-reflexive and relayed candidates, runs
//! the connectivity-check state machine against a peer's candidates, and
//! settles on one pair per component for data exchange. It is single
//! threaded and never blocks: all I/O goes through the
//! [`EventContext`](context::EventContext) port, and the embedder drives the
//! agent with [`poll`](IceAgent::poll) / [`timeout`](IceAgent::timeout)
//! while draining [`poll_event`](IceAgent::poll_event).
//!
//! ```no_run
//! use rime_ice::{Compatibility, IceAgent};
//! use rime_ice::context::{MemoryContext, MemoryNet};
//! use std::time::Instant;
//!
//! let net = MemoryNet::new();
//! let ctx = MemoryContext::new(net, "192.168.1.10".parse().unwrap());
//! let mut agent = IceAgent::new(Box::new(ctx), Compatibility::Rfc5245);
//!
//! let stream = agent.add_stream(1).unwrap();
//! agent.gather_candidates(stream).unwrap();
//! agent.poll(Instant::now());
//! while let Some(event) = agent.poll_event() {
//!     println!("{event:?}");
//! }
//! ```

pub mod address;
mod agent;
mod candidate;
pub mod compat;
mod component;
mod conncheck;
pub mod context;
mod discovery;
mod sdp;
pub mod socket;
mod stream;
mod stun_build;
mod turn_refresh;

pub use agent::{AgentError, AgentEvent, IceAgent, MAX_REMOTE_CANDIDATES};
pub use candidate::{CandidateType, TransportType};
pub use compat::{Compatibility, NominationMode};
pub use component::{ComponentState, RelayType};
pub use sdp::IceCandidate;

/// Agent-local stream handle; monotonically assigned, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);
