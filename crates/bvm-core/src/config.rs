//! Centralized configuration for connections and sessions.
//!
//! Constants live on const-holder structs; `ConnectionConfig` is the runtime
//! form handed to each `Connection` so tests can shrink the timers.

use std::time::Duration;

/// Transport timing and queue sizing defaults.
pub struct TransportConfig;

impl TransportConfig {
    /// How long the read side waits for a keepalive acknowledgment.
    pub const PONG_TIMEOUT: Duration = Duration::from_secs(6);
    /// Pings go out slightly faster than the peer is expected to answer.
    pub const PING_INTERVAL: Duration = Duration::from_millis(5400);
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const WRITE_QUEUE_SIZE: usize = 16;
    pub const READ_QUEUE_SIZE: usize = 16;
    /// Close code sent with the final close frame.
    pub const NORMAL_CLOSURE: u16 = 1000;
}

/// Session-level constants shared by the master and the slave.
pub struct SessionConfig;

impl SessionConfig {
    pub const WS_PATH: &'static str = "/ws";
    pub const AUTH_OK: &'static str = "auth_ok";
    pub const AUTH_WRONG: &'static str = "auth_wrong";
    pub const USERNAME_KEY: &'static str = "username";
    pub const STORAGE_SERVER_KEY: &'static str = "storage_server";
    pub const STORAGE_SERVER_ID_KEY: &'static str = "storage_server_id";
}

/// Runtime configuration for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Read deadline, refreshed on every ping or pong from the peer.
    pub pong_timeout: Duration,
    /// Interval between keepalive pings sent by the write task.
    pub ping_interval: Duration,
    /// Deadline applied to every single frame write.
    pub write_timeout: Duration,
    /// Capacity of the outbound queue; a full queue blocks senders.
    pub write_queue_size: usize,
    /// Capacity of the decoded inbound queue feeding the dispatch task.
    pub read_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pong_timeout: TransportConfig::PONG_TIMEOUT,
            ping_interval: TransportConfig::PING_INTERVAL,
            write_timeout: TransportConfig::WRITE_TIMEOUT,
            write_queue_size: TransportConfig::WRITE_QUEUE_SIZE,
            read_queue_size: TransportConfig::READ_QUEUE_SIZE,
        }
    }
}
