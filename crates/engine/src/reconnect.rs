//! Exponential-backoff reconnection policy for the event stream.
//!
//! When the stream cannot be opened or drops, the engine asks
//! [`Backoff::next_delay`] how long to wait before the next attempt.
//! Delays grow geometrically up to [`ReconnectConfig::max_delay`], are
//! spread by a random jitter so that many clients do not reconnect in
//! lock-step after a backend restart, and reset after every successful
//! open.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts (before jitter).
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Spread `delay` by up to `±fraction` of itself.
pub fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor)
}

/// Per-connection backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_delay.min(config.max_delay),
            config,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = apply_jitter(self.current, self.config.jitter);
        self.current = next_delay(self.current, &self.config);
        self.attempt += 1;
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over from the initial delay (after a successful open).
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay.min(self.config.max_delay);
        self.attempt = 0;
    }
}
