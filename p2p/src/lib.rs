//! Palisade P2P Networking
//!
//! Carries consensus commands between nodes:
//! - libp2p gossipsub (one topic per command, one direct topic per peer)
//! - mDNS for local peer discovery
//! - an in-memory hub with the same `Network` contract for tests and
//!   single-process devnets

pub mod network;
pub mod behaviour;
pub mod message;
pub mod peer;
pub mod local;

pub use network::*;
pub use behaviour::*;
pub use message::*;
pub use peer::*;
pub use local::*;
