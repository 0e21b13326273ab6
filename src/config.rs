use crate::blocks::BlockType;
use crate::discovery::BlockMapSnapshot;
use std::path::PathBuf;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_RETRIES: u32 = 3;

/// Commands sent after every (re)connection before the session is ready
const HANDSHAKE: [&str; 2] = ["SESSION set verbose true", "SESSION set detailedResponse false"];

/// Exponential backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Reconnect automatically after a transport failure. Default: true.
    pub enabled: bool,

    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Attempts before giving up and marking the session failed. Default: 10.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

impl ReconnectConfig {
    /// Never reconnect; a transport failure ends the session
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the given (0-based) attempt: `min(initial * 2^attempt, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Session-level settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `send` waits for a reply. Default: 3s.
    pub request_timeout: Duration,

    /// Extra attempts made by `connect` before failing. Default: 3.
    pub connect_retries: u32,

    /// Probe commands that must succeed before the session is ready
    pub handshake: Vec<String>,

    /// Minimum interval between publishes requested when subscribing.
    /// `None` leaves the device default.
    pub publish_interval: Option<Duration>,

    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            connect_retries: CONNECT_RETRIES,
            handshake: HANDSHAKE.iter().map(|s| s.to_string()).collect(),
            publish_interval: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_handshake(mut self, commands: Vec<String>) -> Self {
        self.handshake = commands;
        self
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = Some(interval);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Where to take a previously exported block map from
#[derive(Debug, Clone)]
pub enum BlockMapSource {
    /// Block map file written by `TesiraDsp::save_block_map`
    File(PathBuf),
    /// Snapshot already in memory
    Snapshot(BlockMapSnapshot),
}

/// Settings for `TesiraDsp`
#[derive(Debug, Clone, Default)]
pub struct DspConfig {
    pub session: SessionConfig,

    /// Cached block map used to skip discovery when it matches the device
    pub block_map: Option<BlockMapSource>,

    /// Block types that are discovered and exported but never instantiated
    pub skip_block_types: Vec<BlockType>,

    /// Periodically re-issue all subscriptions, so they survive a device
    /// configuration change. `None` disables it.
    pub subscription_refresh_interval: Option<Duration>,
}

impl DspConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_block_map_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.block_map = Some(BlockMapSource::File(path.into()));
        self
    }

    pub fn with_snapshot(mut self, snapshot: BlockMapSnapshot) -> Self {
        self.block_map = Some(BlockMapSource::Snapshot(snapshot));
        self
    }

    pub fn skip_block_type(mut self, block_type: BlockType) -> Self {
        self.skip_block_types.push(block_type);
        self
    }

    pub fn with_subscription_refresh(mut self, interval: Duration) -> Self {
        self.subscription_refresh_interval = Some(interval);
        self
    }
}
