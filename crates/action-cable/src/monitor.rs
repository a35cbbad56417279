//! Connection health tracking and reconnection: [`ConnectionMonitor`].
//!
//! Events (connect, ping, disconnect) only update timestamps. A background
//! health check decides when to reopen, so a synchronous transport failure
//! cannot turn into a tight retry loop and a half-open socket is still caught
//! by missing pings.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::types::{ConsumerConfig, TimingConfig};

/// Something the monitor can ask to start a fresh session.
pub trait Reopen: Send + Sync {
    fn reopen(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Started,
    Connected,
    Disconnected,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub stale_threshold: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    pub reconnect: bool,
    pub max_reconnect_attempts: Option<u32>,
}

impl MonitorConfig {
    fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            poll_interval: timing.poll_interval,
            stale_threshold: timing.stale_threshold,
            reconnect_delay: timing.reconnect_delay,
            reconnect_delay_max: timing.reconnect_delay_max,
            reconnect: true,
            max_reconnect_attempts: None,
        }
    }

    /// Minimum spacing between reconnect attempt `attempt` (1-based) and the
    /// one before it: 3s, 6s, 12s, 24s, 30s, 30s, ... with the defaults.
    pub fn reconnect_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        self.reconnect_delay
            .saturating_mul(1u32 << exp)
            .min(self.reconnect_delay_max)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_timing(&TimingConfig::default())
    }
}

impl From<&ConsumerConfig> for MonitorConfig {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            reconnect: config.reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
            ..Self::from_timing(&config.timing())
        }
    }
}

// ---------------------------------------------------------------------------
// Tracking state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Tracking {
    state: MonitorState,
    started_at: Option<Instant>,
    connected_at: Option<Instant>,
    pinged_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    last_attempt_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl Tracking {
    fn new() -> Self {
        Self {
            state: MonitorState::Idle,
            started_at: None,
            connected_at: None,
            pinged_at: None,
            disconnected_at: None,
            last_attempt_at: None,
            reconnect_attempts: 0,
        }
    }

    fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.pinged_at
            .or(self.started_at)
            .is_some_and(|since| now.saturating_duration_since(since) > threshold)
    }

    fn needs_reconnect(&self, now: Instant, threshold: Duration) -> bool {
        match self.state {
            MonitorState::Disconnected => true,
            MonitorState::Started | MonitorState::Connected => self.is_stale(now, threshold),
            MonitorState::Idle | MonitorState::Stopped => false,
        }
    }
}

enum Decision {
    Healthy,
    Reconnect {
        attempt: u32,
        wait: Duration,
        reason: &'static str,
    },
    GiveUp {
        attempts: u32,
    },
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    target: Weak<dyn Reopen>,
    config: MonitorConfig,
    tracking: Mutex<Tracking>,
    ticker: Mutex<Option<Ticker>>,
}

impl Inner {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticker(&self) -> MutexGuard<'_, Option<Ticker>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evaluate(&self, now: Instant) -> Decision {
        let t = self.tracking();
        if !self.config.reconnect || !t.needs_reconnect(now, self.config.stale_threshold) {
            return Decision::Healthy;
        }
        if let Some(max) = self.config.max_reconnect_attempts
            && t.reconnect_attempts >= max
        {
            return Decision::GiveUp {
                attempts: t.reconnect_attempts,
            };
        }

        let reason = if t.state == MonitorState::Disconnected {
            "disconnected"
        } else {
            "stale"
        };
        let attempt = t.reconnect_attempts + 1;
        let delay = self.config.reconnect_delay_for(attempt);
        let wait = t.last_attempt_at.map_or(Duration::ZERO, |at| {
            delay.saturating_sub(now.saturating_duration_since(at))
        });
        Decision::Reconnect {
            attempt,
            wait,
            reason,
        }
    }

    /// Count and stamp the attempt if the connection still needs one.
    /// Returns the attempt number.
    fn begin_attempt(&self, now: Instant) -> Option<u32> {
        let mut t = self.tracking();
        if !t.needs_reconnect(now, self.config.stale_threshold) {
            return None;
        }
        t.reconnect_attempts += 1;
        t.last_attempt_at = Some(now);
        Some(t.reconnect_attempts)
    }
}

// ---------------------------------------------------------------------------
// ConnectionMonitor
// ---------------------------------------------------------------------------

/// Watches connection health and reopens the connection when it goes quiet.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<Inner>,
}

impl ConnectionMonitor {
    pub fn new<R: Reopen + 'static>(target: &Arc<R>, config: MonitorConfig) -> Self {
        let target: Weak<R> = Arc::downgrade(target);
        Self {
            inner: Arc::new(Inner {
                target,
                config,
                tracking: Mutex::new(Tracking::new()),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Begin periodic health checks. No-op if already running or if called
    /// outside a Tokio runtime.
    pub fn start(&self) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("No Tokio runtime, connection monitor not started");
            return;
        };
        let mut ticker = self.inner.ticker();
        if ticker.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::debug!("Connection monitor already running");
            return;
        }

        {
            let mut t = self.inner.tracking();
            t.started_at = Some(Instant::now());
            t.reconnect_attempts = 0;
            t.last_attempt_at = None;
            if t.state != MonitorState::Connected {
                t.state = MonitorState::Started;
                t.pinged_at = None;
            }
        }

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_health_checks(
            Arc::clone(&self.inner),
            cancel.clone(),
        ));
        *ticker = Some(Ticker { cancel, handle });
        tracing::info!(
            poll_interval = ?self.inner.config.poll_interval,
            stale_threshold = ?self.inner.config.stale_threshold,
            "Connection monitor started"
        );
    }

    /// Stop health checks and wait for the background task to exit. No reopen
    /// happens after this returns.
    pub async fn stop(&self) {
        if let Some(ticker) = self.halt()
            && let Err(e) = ticker.handle.await
            && !e.is_cancelled()
        {
            tracing::warn!("Connection monitor task failed: {e}");
        }
    }

    /// Stop health checks without waiting for the task to exit.
    pub fn cancel(&self) {
        let _ = self.halt();
    }

    pub fn record_connect(&self) {
        let mut t = self.inner.tracking();
        let now = Instant::now();
        let downtime = t.disconnected_at.map(|at| now.saturating_duration_since(at));
        t.reconnect_attempts = 0;
        t.connected_at = Some(now);
        t.pinged_at = Some(now);
        t.disconnected_at = None;
        if t.state != MonitorState::Stopped {
            t.state = MonitorState::Connected;
        }
        tracing::debug!(?downtime, "Connection recorded as connected");
    }

    pub fn record_ping(&self) {
        self.inner.tracking().pinged_at = Some(Instant::now());
        tracing::trace!("Ping received");
    }

    /// Mark the connection as down. Reconnection is left to the next health check.
    pub fn record_disconnect(&self) {
        let mut t = self.inner.tracking();
        let now = Instant::now();
        let uptime = t.connected_at.map(|at| now.saturating_duration_since(at));
        t.disconnected_at = Some(now);
        if matches!(t.state, MonitorState::Started | MonitorState::Connected) {
            t.state = MonitorState::Disconnected;
        }
        tracing::debug!(?uptime, "Connection recorded as disconnected");
    }

    pub fn state(&self) -> MonitorState {
        self.inner.tracking().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.tracking().reconnect_attempts
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .ticker()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    fn halt(&self) -> Option<Ticker> {
        let ticker = self.inner.ticker().take();
        if let Some(t) = &ticker {
            t.cancel.cancel();
            tracing::info!("Connection monitor stopped");
        }
        self.inner.tracking().state = MonitorState::Stopped;
        ticker
    }
}

async fn run_health_checks(inner: Arc<Inner>, cancel: CancellationToken) {
    let period = inner.config.poll_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        match inner.evaluate(Instant::now()) {
            Decision::Healthy => {}
            Decision::GiveUp { attempts } => {
                tracing::error!(attempts, "Reconnect attempts exhausted, giving up");
                inner.tracking().state = MonitorState::Stopped;
                return;
            }
            Decision::Reconnect {
                attempt,
                wait,
                reason,
            } => {
                tracing::warn!(attempt, reason, delay = ?wait, "Connection lost, scheduling reconnect");
                if !wait.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
                let Some(attempt) = inner.begin_attempt(Instant::now()) else {
                    tracing::debug!("Connection recovered before reconnect attempt");
                    continue;
                };
                let Some(target) = inner.target.upgrade() else {
                    tracing::debug!("Connection dropped, monitor exiting");
                    return;
                };
                tracing::info!(attempt, "Reopening connection");
                target.reopen();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
