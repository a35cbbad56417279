//! Public types for the action-cable crate.

use std::collections::HashMap;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Timing knobs for the connection and its health monitor.
///
/// The defaults assume a Rails server pinging every 3 seconds.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Upper bound on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long a closing session may take to drain before it is aborted.
    pub close_timeout: Duration,
    /// Interval between health checks.
    pub poll_interval: Duration,
    /// A connection with no ping for longer than this is considered dead.
    pub stale_threshold: Duration,
    /// Delay before the second reconnect attempt; doubled on each later one.
    pub reconnect_delay: Duration,
    /// Cap on the reconnect delay.
    pub reconnect_delay_max: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(3),
            stale_threshold: Duration::from_secs(6),
            reconnect_delay: Duration::from_secs(3),
            reconnect_delay_max: Duration::from_secs(30),
        }
    }
}

/// Configuration for [`Consumer::new`](crate::Consumer::new).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Cable endpoint, e.g. `"wss://example.com/cable"`.
    pub url: String,
    /// Extra query parameters appended to the endpoint URL.
    pub query: HashMap<String, String>,
    /// Extra headers sent with the upgrade request (e.g. `Origin`, `Cookie`).
    pub headers: HashMap<String, String>,
    /// Whether the monitor reopens stale or dropped connections.
    pub reconnect: bool,
    /// Give up after this many consecutive reconnect attempts. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub timing: Option<TimingConfig>,
}

impl ConsumerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            reconnect: true,
            max_reconnect_attempts: None,
            timing: None,
        }
    }

    pub(crate) fn timing(&self) -> TimingConfig {
        self.timing.clone().unwrap_or_default()
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed frame: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unsupported URL scheme {0:?}, expected ws or wss")]
    UnsupportedScheme(String),

    #[error("Invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("No Tokio runtime available to drive the connection")]
    NoRuntime,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
