//! Palisade Node Implementation
//!
//! Combines all components into one process:
//! - P2P networking
//! - Block store, validator registry and transaction pool
//! - Consensus service, started and stopped with validator membership

mod node;
mod runtime;

pub use node::*;
pub use runtime::*;
