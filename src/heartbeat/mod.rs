//! Heartbeat Module
//!
//! The timer task that runs periodic jobs between turns.

pub mod daemon;
pub mod tasks;

pub use daemon::{create_heartbeat_daemon, HeartbeatDaemon, HeartbeatDaemonOptions};
pub use tasks::{discovery_endpoints, HeartbeatContext, DEFAULT_KEEP_LAST_DEAD};
