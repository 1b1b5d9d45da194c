use std::time::Duration;

use crate::TransportError;

/// Default period of the heartbeat timer.
pub const HEARTBEAT_INTERVAL_MS: u64 = 2_000;

/// Ticks without inbound traffic before a peer is forcibly disconnected.
pub const MAX_KEEPALIVES: u32 = 5;

/// Size of the multiplexer tag space (tags are one byte on the wire).
pub const MAX_TAG: usize = 256;

/// Configuration shared by a node and the protocols stacked on it.
///
/// Use the builder methods:
///
/// ```rust
/// use std::time::Duration;
/// use mesh_transport::MeshConfig;
///
/// let config = MeshConfig::new()
///     .heartbeat_interval(Duration::from_millis(500))
///     .max_keepalives(3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MeshConfig {
    heartbeat_interval: Duration,
    max_keepalives: u32,
    max_tag: usize,
    inbox_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshConfig {
    /// Defaults, overridden by `MESH_HEARTBEAT_INTERVAL_MS` and
    /// `MESH_MAX_KEEPALIVES` when those are set and parse.
    pub fn new() -> Self {
        Self::builtin().with_env(|key| std::env::var(key).ok())
    }

    /// Defaults only, ignoring the environment.
    pub fn builtin() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            max_keepalives: MAX_KEEPALIVES,
            max_tag: MAX_TAG,
            inbox_buffer: 1024,
        }
    }

    /// Apply overrides from a key lookup (the process environment in `new`).
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = lookup("MESH_HEARTBEAT_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(n) = lookup("MESH_MAX_KEEPALIVES").and_then(|s| s.parse::<u32>().ok()) {
            self.max_keepalives = n;
        }
        self
    }

    /// Set the heartbeat timer period (default: 2 s).
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set how many silent ticks are tolerated before a forced disconnect (default: 5).
    pub fn max_keepalives(mut self, n: u32) -> Self {
        self.max_keepalives = n;
        self
    }

    /// Set the multiplexer tag space (default: 256, the most one byte can address).
    pub fn max_tag(mut self, n: usize) -> Self {
        self.max_tag = n;
        self
    }

    /// Set the per-node inbound queue capacity (default: 1024).
    pub fn inbox_buffer(mut self, capacity: usize) -> Self {
        self.inbox_buffer = capacity;
        self
    }

    /// Heartbeat timer period.
    pub fn get_heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Silent ticks tolerated before a forced disconnect.
    pub fn get_max_keepalives(&self) -> u32 {
        self.max_keepalives
    }

    /// Multiplexer tag space size.
    pub fn get_max_tag(&self) -> usize {
        self.max_tag
    }

    /// Per-node inbound queue capacity.
    pub fn get_inbox_buffer(&self) -> usize {
        self.inbox_buffer
    }

    /// Check every field is usable; [`TransportError::Config`] names the first that is not.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.heartbeat_interval.is_zero() {
            return Err(TransportError::Config("heartbeat interval must be non-zero".into()));
        }
        if self.max_keepalives == 0 {
            return Err(TransportError::Config("max keepalives must be at least 1".into()));
        }
        if self.max_tag == 0 || self.max_tag > MAX_TAG {
            return Err(TransportError::Config(format!(
                "max tag must be in 1..={MAX_TAG}, got {}",
                self.max_tag
            )));
        }
        if self.inbox_buffer == 0 {
            return Err(TransportError::Config("inbox buffer must be non-zero".into()));
        }
        Ok(())
    }
}
