//! UDP node discovery: Ping/Pong endpoint proofs and FindNode/Neighbours
//! introductions.

pub mod packet;
pub mod service;
pub mod table;

pub use service::{DiscoveryCommand, DiscoveryHandle, DiscoveryService};
pub use table::{DiscoveryConfig, DiscoveryEvent, NodeTable, Outgoing};
