//! Heartbeat Monitor
//!
//! Liveness tracking for a WebSocket connection, shared by the upstream
//! feed connector and the downstream client sessions.
//!
//! The monitor is driven by its owner's select loop: every inbound frame
//! calls [`Heartbeat::record_activity`], and a periodic tick calls
//! [`Heartbeat::poll`]. A ping is requested only after the connection has
//! been idle for `ping_interval`; if nothing arrives within `pong_timeout`
//! of that ping the connection is declared dead.

use std::time::{Duration, Instant};

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Idle time before a ping is sent.
    pub ping_interval: Duration,
    /// Time allowed after a ping for any inbound traffic.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// How often the owner should call [`Heartbeat::poll`].
    #[must_use]
    pub fn poll_period(&self) -> Duration {
        (self.ping_interval.min(self.pong_timeout) / 4).max(Duration::from_millis(10))
    }
}

/// What the owner of the connection should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame.
    SendPing,
    /// No traffic since the last ping; close the connection.
    Timeout,
}

/// Liveness state of one connection.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
}

impl Heartbeat {
    /// Start monitoring a freshly opened connection.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self::started_at(config, Instant::now())
    }

    fn started_at(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_activity: now,
            ping_sent_at: None,
        }
    }

    /// Record inbound traffic of any kind.
    pub fn record_activity(&mut self) {
        self.record_activity_at(Instant::now());
    }

    fn record_activity_at(&mut self, now: Instant) {
        self.last_activity = now;
        self.ping_sent_at = None;
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub const fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Check the connection; returns the action to take, if any.
    ///
    /// Returning [`HeartbeatEvent::SendPing`] marks the ping as sent.
    pub fn poll(&mut self) -> Option<HeartbeatEvent> {
        self.poll_at(Instant::now())
    }

    fn poll_at(&mut self, now: Instant) -> Option<HeartbeatEvent> {
        if let Some(sent) = self.ping_sent_at {
            if now.saturating_duration_since(sent) >= self.config.pong_timeout {
                tracing::debug!(
                    idle_secs = now.saturating_duration_since(self.last_activity).as_secs(),
                    timeout_secs = self.config.pong_timeout.as_secs(),
                    "Heartbeat timeout"
                );
                return Some(HeartbeatEvent::Timeout);
            }
            return None;
        }

        if now.saturating_duration_since(self.last_activity) >= self.config.ping_interval {
            self.ping_sent_at = Some(now);
            return Some(HeartbeatEvent::SendPing);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: HeartbeatConfig =
        HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(30));

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.pong_timeout, Duration::from_secs(30));
    }

    #[test]
    fn poll_period_is_fraction_of_shortest_window() {
        assert_eq!(CONFIG.poll_period(), Duration::from_millis(2_500));
        assert_eq!(
            HeartbeatConfig::new(Duration::from_millis(1), Duration::from_millis(1)).poll_period(),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn busy_connection_is_never_pinged() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::started_at(CONFIG, start);

        for secs in 1..100 {
            let now = start + Duration::from_secs(secs);
            heartbeat.record_activity_at(now);
            assert_eq!(heartbeat.poll_at(now), None);
        }
    }

    #[test]
    fn idle_connection_gets_one_ping() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::started_at(CONFIG, start);

        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(9)), None);
        assert_eq!(
            heartbeat.poll_at(start + Duration::from_secs(10)),
            Some(HeartbeatEvent::SendPing)
        );
        assert!(heartbeat.is_waiting_for_pong());
        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(20)), None);
    }

    #[test]
    fn activity_after_ping_clears_wait() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::started_at(CONFIG, start);

        let _ = heartbeat.poll_at(start + Duration::from_secs(10));
        heartbeat.record_activity_at(start + Duration::from_secs(11));

        assert!(!heartbeat.is_waiting_for_pong());
        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(45)), Some(HeartbeatEvent::SendPing));
    }

    #[test]
    fn silence_after_ping_times_out() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::started_at(CONFIG, start);

        let _ = heartbeat.poll_at(start + Duration::from_secs(10));

        assert_eq!(
            heartbeat.poll_at(start + Duration::from_secs(40)),
            Some(HeartbeatEvent::Timeout)
        );
    }
}
