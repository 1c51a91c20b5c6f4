//! Palisade Core Library
//!
//! Core types, collaborator traits, and configuration shared by every
//! Palisade crate.

pub mod types;
pub mod block;
pub mod validator;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use block::*;
pub use validator::*;
pub use traits::*;
pub use error::*;
pub use config::*;
