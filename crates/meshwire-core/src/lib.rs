//! meshwire-core — identities, wire layouts, cryptographic primitives and
//! configuration. Every other meshwire crate depends on this one.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod wire;

pub use identity::{Endpoint, Node, NodeId};
