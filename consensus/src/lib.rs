//! Palisade Consensus Engine
//!
//! Round-based two-stage BFT block consensus for a DPoS chain:
//! - a deterministic producer order per round, derived from the staked set
//! - stage-one and stage-two voting on one candidate per slot
//! - sub-vote-round escalation and empty slots when a producer is silent
//! - quorum certificates gossiped alongside single votes

pub mod error;
pub mod vote;
pub mod round;
pub mod state;
pub mod ledger;
pub mod packer;
pub mod round_controller;
pub mod controller;
pub mod relay;
pub mod processor;
pub mod engine;
pub mod tasks;
pub mod service;

#[cfg(test)]
mod fixtures;

pub use error::*;
pub use vote::*;
pub use round::*;
pub use state::*;
pub use ledger::*;
pub use packer::*;
pub use round_controller::*;
pub use controller::*;
pub use relay::*;
pub use processor::*;
pub use engine::*;
pub use tasks::*;
pub use service::*;
