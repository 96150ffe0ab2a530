//! WebSocket transport: upgrade, auth, read loop and per-socket writer.

mod handler;

pub use handler::ws_handler;
