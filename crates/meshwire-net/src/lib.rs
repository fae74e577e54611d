//! meshwire-net — encrypted peer sessions, capability multiplexing, node
//! discovery and the `Host` that ties them together.

pub mod capability;
pub mod discovery;
pub mod endpoint;
pub mod frame;
pub mod handshake;
pub mod host;
pub mod peer;
pub mod persist;
pub mod session;

pub use capability::{CapDesc, Capability, CapabilityError, CapabilityHost};
pub use host::{Host, HostConfig, HostError, PeerSessionInfo};
pub use frame::MAX_PAYLOAD_SIZE;
pub use session::{DisconnectReason, QueueError};
