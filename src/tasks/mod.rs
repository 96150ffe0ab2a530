//! Background tasks. Each task owns a shutdown receiver and exits on the
//! first signal; none of them sit on a request path.

mod collector;
mod heartbeat;

pub use collector::StatsCollectorTask;
pub use heartbeat::HeartbeatTask;
