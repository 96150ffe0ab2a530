//! Live connection registry.
//!
//! Holds every WebSocket connection in this process along with its
//! identity, channel and room indices. Delivery to a connection goes
//! through its writer channel; a closed writer is treated as an implicit
//! disconnect.

#[allow(clippy::module_inception)]
mod registry;
mod stats;
mod types;

pub use registry::ConnectionRegistry;
pub use stats::{ChannelInfo, ConnectionInfo, ConnectionStats, RoomInfo};
pub use types::{ConnectionHandle, ConnectionLimits, ConnectionStatus};
