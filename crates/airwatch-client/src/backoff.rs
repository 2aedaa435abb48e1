//! Bounded exponential backoff for push reconnects.

use std::time::Duration;

use airwatch_core::config::ReconnectSettings;

/// Delay schedule `initial * multiplier^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            attempts: 0,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            settings.initial_delay(),
            settings.max_delay(),
            settings.multiplier,
        )
    }

    /// Delay before the next retry; counts the retry.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        self.attempts = self.attempts.saturating_add(1);

        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }

    /// Retries scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
