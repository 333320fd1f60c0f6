//! Server URL rotation with exponential backoff.
//!
//! Endpoints are configured with several server URLs. Failures against the
//! current URL are retried with exponentially growing delays until a per-URL
//! retry ceiling, then the next URL is tried immediately. Once every URL has
//! failed in turn (the rotation wraps back to the last URL that worked) the
//! endpoint waits a long, jittered interval so a fleet of endpoints does not
//! hammer a recovering server in lockstep.
//!
//! ```text
//!   failure (attempt < ceiling)  -> Retry    after min(initial * 2^n, max)
//!   failure (attempt = ceiling)  -> Advance  immediately
//!   advance wraps to last good   -> Advance  after cycle_wait + jitter
//!   success                      -> reset attempts, remember URL
//!   redirect                     -> switch (learning new URLs) immediately
//! ```

use std::time::Duration;

use crate::error::TransportError;

/// Rotation and backoff tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    /// Delay before the first retry against the same URL
    pub initial_backoff: Duration,
    /// Upper bound on a single exponential backoff delay
    pub max_backoff: Duration,
    /// Consecutive failures tolerated on one URL before advancing
    pub retries_per_url: u32,
    /// Base wait once every URL has failed
    pub cycle_wait: Duration,
    /// Maximum random addition to `cycle_wait`
    pub cycle_jitter: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            retries_per_url: 3,
            cycle_wait: Duration::from_secs(60),
            cycle_jitter: Duration::from_secs(30),
        }
    }
}

/// What the driver should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry the same URL after `delay`
    Retry {
        /// Wait before the next attempt
        delay: Duration,
    },
    /// Move on to another URL after `delay`
    Advance {
        /// Wait before the next attempt
        delay: Duration,
        /// True if every URL has now failed since the last success
        exhausted: bool,
    },
}

impl Backoff {
    /// Wait before the next attempt.
    pub fn delay(self) -> Duration {
        match self {
            Self::Retry { delay } | Self::Advance { delay, .. } => delay,
        }
    }
}

/// Rotation state over a fixed list of server URLs.
///
/// # Invariants
///
/// - `urls` is never empty
/// - `index` and `last_success` are always valid indices into `urls`
#[derive(Debug, Clone)]
pub struct ServerRotation {
    urls: Vec<String>,
    config: RotationConfig,
    index: usize,
    last_success: usize,
    attempts: u32,
}

impl ServerRotation {
    /// Start at a caller-chosen URL (typically random, to spread load).
    ///
    /// # Errors
    ///
    /// - `TransportError::NoServers` if `urls` is empty
    pub fn new(urls: Vec<String>, config: RotationConfig, start: usize) -> Result<Self, TransportError> {
        if urls.is_empty() {
            return Err(TransportError::NoServers);
        }
        let start = start % urls.len();
        Ok(Self { urls, config, index: start, last_success: start, attempts: 0 })
    }

    /// URL the next attempt should use.
    pub fn current(&self) -> &str {
        &self.urls[self.index]
    }

    /// Index of the configured URL currently selected.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Configured URLs, plus any learned from redirects.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Consecutive failures against the current URL.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Switch to `url` after a server redirect.
    ///
    /// A URL not configured yet is appended, so a frontend learned this way
    /// stays in the rotation when others fail later. The attempt count
    /// starts over for the new URL.
    pub fn redirect(&mut self, url: String) {
        tracing::info!(from = %self.urls[self.index], to = %url, "following server redirect");
        self.index = match self.urls.iter().position(|known| *known == url) {
            Some(index) => index,
            None => {
                self.urls.push(url);
                self.urls.len() - 1
            },
        };
        self.attempts = 0;
    }

    /// Record a successful exchange with the current URL.
    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.last_success = self.index;
    }

    /// Record a failure and decide how long to wait.
    ///
    /// `jitter` is only applied when every URL has failed.
    pub fn record_failure(&mut self, jitter: Duration) -> Backoff {
        self.attempts += 1;
        if self.attempts < self.config.retries_per_url {
            let exponent = (self.attempts - 1).min(31);
            let delay = self
                .config
                .initial_backoff
                .saturating_mul(1u32 << exponent)
                .min(self.config.max_backoff);
            return Backoff::Retry { delay };
        }

        self.attempts = 0;
        self.index = (self.index + 1) % self.urls.len();
        if self.index == self.last_success {
            let delay = self.config.cycle_wait + jitter.min(self.config.cycle_jitter);
            tracing::warn!(?delay, "waiting for a reachable server");
            Backoff::Advance { delay, exhausted: true }
        } else {
            tracing::info!(url = %self.urls[self.index], "advancing to next server");
            Backoff::Advance { delay: Duration::ZERO, exhausted: false }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://s{i}.example/")).collect()
    }

    fn config() -> RotationConfig {
        RotationConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            retries_per_url: 4,
            cycle_wait: Duration::from_secs(60),
            cycle_jitter: Duration::from_secs(30),
        }
    }

    #[test]
    fn empty_url_list_is_rejected() {
        assert!(matches!(
            ServerRotation::new(vec![], config(), 0),
            Err(TransportError::NoServers)
        ));
    }

    #[test]
    fn backoff_grows_exponentially_then_advances() {
        let mut rotation = ServerRotation::new(urls(2), config(), 0).unwrap();
        let delays: Vec<_> =
            (0..3).map(|_| rotation.record_failure(Duration::ZERO).delay()).collect();
        assert_eq!(delays, [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(rotation.index(), 0);

        let advance = rotation.record_failure(Duration::ZERO);
        assert_eq!(advance, Backoff::Advance { delay: Duration::ZERO, exhausted: false });
        assert_eq!(rotation.current(), "https://s1.example/");
    }

    #[test]
    fn backoff_is_capped() {
        let mut rotation = ServerRotation::new(
            urls(1),
            RotationConfig { retries_per_url: 10, ..config() },
            0,
        )
        .unwrap();
        let max = (0..9).map(|_| rotation.record_failure(Duration::ZERO).delay()).max().unwrap();
        assert_eq!(max, Duration::from_secs(5));
    }

    #[test]
    fn full_cycle_waits_with_bounded_jitter() {
        let mut rotation = ServerRotation::new(urls(2), config(), 1).unwrap();
        let mut last = None;
        for _ in 0..8 {
            last = Some(rotation.record_failure(Duration::from_secs(1000)));
        }
        assert_eq!(
            last,
            Some(Backoff::Advance { delay: Duration::from_secs(90), exhausted: true })
        );
        assert_eq!(rotation.index(), 1);
    }

    #[test]
    fn success_moves_the_cycle_anchor() {
        let mut rotation = ServerRotation::new(urls(3), config(), 0).unwrap();
        for _ in 0..4 {
            rotation.record_failure(Duration::ZERO);
        }
        rotation.record_success();
        assert_eq!(rotation.index(), 1);
        assert_eq!(rotation.attempts(), 0);

        // Cycle now ends when rotation returns to URL 1.
        let mut exhausted_at = None;
        for i in 0..12 {
            if let Backoff::Advance { exhausted: true, .. } = rotation.record_failure(Duration::ZERO) {
                exhausted_at = Some((i, rotation.index()));
                break;
            }
        }
        assert_eq!(exhausted_at, Some((11, 1)));
    }

    #[test]
    fn redirect_learns_new_url() {
        let mut rotation = ServerRotation::new(urls(2), config(), 0).unwrap();
        rotation.record_failure(Duration::ZERO);
        rotation.redirect("https://elsewhere.example/".to_string());
        assert_eq!(rotation.current(), "https://elsewhere.example/");
        assert_eq!(rotation.urls().len(), 3);
        assert_eq!(rotation.attempts(), 0);

        rotation.record_success();
        assert_eq!(rotation.current(), "https://elsewhere.example/");
    }

    #[test]
    fn redirect_to_known_url_selects_it() {
        let mut rotation = ServerRotation::new(urls(3), config(), 0).unwrap();
        rotation.redirect("https://s2.example/".to_string());
        assert_eq!(rotation.index(), 2);
        assert_eq!(rotation.urls().len(), 3);
    }
}
