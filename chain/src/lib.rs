//! Palisade Chain
//!
//! Collaborators of the consensus engine: block persistence (in memory and
//! sled-backed), the transaction pool, the staked validator registry, genesis
//! configuration and the synchronization flag.

pub mod store;
pub mod persistent;
pub mod txpool;
pub mod registry;
pub mod genesis;
pub mod sync;

pub use store::*;
pub use persistent::*;
pub use txpool::*;
pub use registry::*;
pub use genesis::*;
pub use sync::*;
