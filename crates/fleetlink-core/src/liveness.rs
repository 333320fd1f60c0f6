//! Full-duplex liveness and exchange mode selection.
//!
//! In full-duplex mode the server pings the endpoint periodically over the
//! persistent channel. Missing a ping by more than 10% of the ping interval
//! means the channel is dead (half-open TCP, silently dropped NAT mapping)
//! and the driver must reconnect.
//!
//! [`ModeSelector`] decides between full-duplex and request/response. An
//! endpoint whose duplex channel keeps failing falls back to plain
//! request/response polling for a while before trying duplex again.
//!
//! Both types are pure: time is passed in, decisions are returned.

use std::time::Duration;

/// Default interval between server pings.
pub const DEFAULT_PING_WAIT: Duration = Duration::from_secs(60);

/// Liveness tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Expected interval between server pings
    pub ping_wait: Duration,
}

impl LivenessConfig {
    /// Time without a ping after which the channel is declared dead.
    pub fn deadline(&self) -> Duration {
        self.ping_wait * 11 / 10
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { ping_wait: DEFAULT_PING_WAIT }
    }
}

/// Ping deadline tracker for one duplex channel.
#[derive(Debug, Clone)]
pub struct Liveness<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    config: LivenessConfig,
    last_seen: I,
}

impl<I> Liveness<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Start tracking a channel opened at `now`.
    pub fn new(now: I, config: LivenessConfig) -> Self {
        Self { config, last_seen: now }
    }

    /// Record a ping (or any inbound traffic).
    pub fn on_ping(&mut self, now: I) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// True once the deadline has passed without a ping.
    pub fn is_dead(&self, now: I) -> bool {
        self.silence(now) > self.config.deadline()
    }

    /// Time since the last ping.
    pub fn silence(&self, now: I) -> Duration {
        if now > self.last_seen { now - self.last_seen } else { Duration::ZERO }
    }

    /// Time left before the channel is declared dead.
    pub fn remaining(&self, now: I) -> Duration {
        self.config.deadline().saturating_sub(self.silence(now))
    }
}

/// How messages are exchanged with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// One POST per batch; server data is collected by polling
    RequestResponse,
    /// Persistent bidirectional channel with server pings
    Duplex,
}

/// Chooses the exchange mode, falling back from duplex on repeated failure.
#[derive(Debug, Clone)]
pub struct ModeSelector<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    preferred: ExchangeMode,
    failures: u32,
    fallback_after: u32,
    retry_duplex_after: Duration,
    fallback_since: Option<I>,
}

impl<I> ModeSelector<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Prefer `preferred`; after `fallback_after` consecutive duplex failures
    /// use request/response for `retry_duplex_after`.
    pub fn new(preferred: ExchangeMode, fallback_after: u32, retry_duplex_after: Duration) -> Self {
        Self {
            preferred,
            failures: 0,
            fallback_after: fallback_after.max(1),
            retry_duplex_after,
            fallback_since: None,
        }
    }

    /// Mode to use for the next exchange.
    pub fn mode(&mut self, now: I) -> ExchangeMode {
        if self.preferred == ExchangeMode::RequestResponse {
            return ExchangeMode::RequestResponse;
        }
        match self.fallback_since {
            Some(since) if now - since < self.retry_duplex_after => ExchangeMode::RequestResponse,
            Some(_) => {
                tracing::info!("retrying full-duplex exchange");
                self.fallback_since = None;
                self.failures = 0;
                ExchangeMode::Duplex
            },
            None => ExchangeMode::Duplex,
        }
    }

    /// Record that a duplex channel failed (connect error or liveness loss).
    pub fn duplex_failed(&mut self, now: I) {
        self.failures += 1;
        if self.failures >= self.fallback_after && self.fallback_since.is_none() {
            tracing::warn!(
                failures = self.failures,
                "full-duplex exchange failing, falling back to request/response"
            );
            self.fallback_since = Some(now);
        }
    }

    /// Record a healthy duplex exchange.
    pub fn duplex_succeeded(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn deadline_is_ten_percent_past_ping_wait() {
        let config = LivenessConfig { ping_wait: Duration::from_secs(60) };
        assert_eq!(config.deadline(), Duration::from_secs(66));
    }

    #[test]
    fn channel_dies_after_missed_ping() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0, LivenessConfig::default());

        assert!(!liveness.is_dead(t0 + Duration::from_secs(65)));
        liveness.on_ping(t0 + Duration::from_secs(60));
        assert!(!liveness.is_dead(t0 + Duration::from_secs(120)));
        assert_eq!(liveness.remaining(t0 + Duration::from_secs(120)), Duration::from_secs(6));
        assert!(liveness.is_dead(t0 + Duration::from_secs(127)));
    }

    #[test]
    fn stale_ping_does_not_rewind() {
        let t0 = Instant::now();
        let mut liveness = Liveness::new(t0 + Duration::from_secs(10), LivenessConfig::default());
        liveness.on_ping(t0);
        assert_eq!(liveness.silence(t0 + Duration::from_secs(10)), Duration::ZERO);
    }

    #[test]
    fn request_response_preference_is_fixed() {
        let t0 = Instant::now();
        let mut selector = ModeSelector::new(ExchangeMode::RequestResponse, 1, Duration::ZERO);
        selector.duplex_failed(t0);
        assert_eq!(selector.mode(t0), ExchangeMode::RequestResponse);
    }

    #[test]
    fn duplex_falls_back_and_recovers() {
        let t0 = Instant::now();
        let mut selector = ModeSelector::new(ExchangeMode::Duplex, 2, Duration::from_secs(300));

        selector.duplex_failed(t0);
        assert_eq!(selector.mode(t0), ExchangeMode::Duplex);

        selector.duplex_failed(t0);
        assert_eq!(selector.mode(t0 + Duration::from_secs(299)), ExchangeMode::RequestResponse);
        assert_eq!(selector.mode(t0 + Duration::from_secs(300)), ExchangeMode::Duplex);

        // One more failure after recovery does not immediately fall back.
        selector.duplex_failed(t0 + Duration::from_secs(301));
        assert_eq!(selector.mode(t0 + Duration::from_secs(301)), ExchangeMode::Duplex);
    }

    #[test]
    fn success_resets_failure_count() {
        let t0 = Instant::now();
        let mut selector = ModeSelector::new(ExchangeMode::Duplex, 2, Duration::from_secs(300));
        selector.duplex_failed(t0);
        selector.duplex_succeeded();
        selector.duplex_failed(t0);
        assert_eq!(selector.mode(t0), ExchangeMode::Duplex);
    }
}
