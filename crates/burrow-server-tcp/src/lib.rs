//! TCP data plane
//!
//! Each tunnel owns a public listener on its dedicated port. Every accepted
//! client triggers a rendezvous: a one-shot listener on a fresh port, a
//! `CreateTunnelRequest` to the agent, and once the agent dials in, a pair
//! of byte pumps splicing the two sockets together.

mod legs;
mod pump;
mod rendezvous;
mod server;

pub use legs::LegSet;
pub use pump::{run_leg_pair, BytePump, LegPair, PairSummary, PumpOutcome};
pub use rendezvous::{RendezvousError, RendezvousListener};
pub use server::{PublicListener, PublicListenerConfig, PublicListenerError};
