use std::time::Duration;

use trellis_link::BackoffSettings;

/// Configuration for a [`MeshNode`](crate::MeshNode).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use trellis_mesh::MeshConfig;
///
/// let config = MeshConfig::new()
///     .chunk_size(32 * 1024)
///     .handshake_timeout(std::time::Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Transfer chunk size in bytes.
    pub(crate) chunk_size: usize,
    /// How long a fresh link may sit without a handshake before teardown.
    pub(crate) handshake_timeout: Duration,
    /// Bounded wait for routed-connection confirmations.
    pub(crate) establishment_timeout: Duration,
    /// Delay before the first reconnect attempt.
    pub(crate) reconnect_short_delay: Duration,
    /// Delay between subsequent reconnect attempts.
    pub(crate) reconnect_regular_delay: Duration,
    /// Reconnect attempts before giving up.
    pub(crate) max_reconnect_attempts: u32,
    /// Backoff schedule for module start/stop retry executors.
    pub(crate) executor_backoff: BackoffSettings,
    /// Buffer size for the node's command and event channels.
    pub(crate) channel_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            chunk_size: 16 * 1024,
            handshake_timeout: Duration::from_secs(10),
            establishment_timeout: Duration::from_secs(15),
            reconnect_short_delay: Duration::from_millis(500),
            reconnect_regular_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            executor_backoff: BackoffSettings::new(
                Duration::from_millis(200),
                2.0,
                Duration::from_secs(10),
            ),
            channel_buffer: 64,
        }
    }

    /// Set the transfer chunk size (default: 16 KiB).
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "chunk size must be positive");
        self.chunk_size = bytes;
        self
    }

    /// Set the handshake timeout for fresh links (default: 10 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the bounded wait for routed-connection confirmations
    /// (default: 15 s).
    pub fn establishment_timeout(mut self, timeout: Duration) -> Self {
        self.establishment_timeout = timeout;
        self
    }

    /// Set the reconnect delays: short before the first attempt, regular
    /// between the rest (default: 500 ms / 5 s).
    pub fn reconnect_delays(mut self, short: Duration, regular: Duration) -> Self {
        self.reconnect_short_delay = short;
        self.reconnect_regular_delay = regular;
        self
    }

    /// Set the number of reconnect attempts before giving up (default: 5).
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the backoff schedule for module start/stop executors.
    pub fn executor_backoff(mut self, settings: BackoffSettings) -> Self {
        self.executor_backoff = settings;
        self
    }

    /// Set the channel buffer size for node command/event channels
    /// (default: 64).
    pub fn channel_buffer(mut self, capacity: usize) -> Self {
        self.channel_buffer = capacity;
        self
    }
}
