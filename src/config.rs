use std::time::Duration;

/// Tunables for a download run. The binary fills this from its command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port reported to the tracker.
    pub port: u16,
    /// Upper bound on simultaneous peer connections.
    pub max_peers: usize,
    /// Block requests kept in flight per connection.
    pub pipeline_depth: usize,
    pub block_size: u32,
    pub connect_timeout: Duration,
    /// Deadline for each individual read from a peer.
    pub message_timeout: Duration,
    /// Longest a connection may go without delivering a block while a piece is in progress.
    pub idle_timeout: Duration,
    pub tracker_timeout: Duration,
    /// Hash mismatches tolerated from one peer before dropping it.
    pub max_verification_failures: usize,
    pub max_connection_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 6881,
            max_peers: 30,
            pipeline_depth: 5,
            block_size: 16 * 1024,
            connect_timeout: Duration::from_secs(3),
            message_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            tracker_timeout: Duration::from_secs(15),
            max_verification_failures: 3,
            max_connection_attempts: 2,
        }
    }
}
