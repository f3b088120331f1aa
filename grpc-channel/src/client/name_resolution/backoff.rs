/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Exponential backoff shared by subchannel reconnects, resolvers and route
//! lookups.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a
    /// failed retry. Should ideally be greater than 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,
}

/// This is a backoff configuration with the default values specified
/// at https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
pub const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.base_delay > self.max_delay {
            Err("base_delay must not be greater than max_delay")?;
        }
        if self.multiplier < 1.0 {
            Err("multiplier must be at least 1.0")?;
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            Err("jitter must be between 0 and 1")?;
        }
        Ok(())
    }

    /// Returns the delay before retry number `retries` (zero based), without
    /// keeping any state between calls.
    pub fn backoff(&self, retries: u32) -> Duration {
        if retries == 0 {
            return self.jittered(self.base_delay.as_secs_f64());
        }
        let max = self.max_delay.as_secs_f64();
        let mut delay = self.base_delay.as_secs_f64();
        for _ in 0..retries {
            if delay >= max {
                break;
            }
            delay *= self.multiplier;
        }
        self.jittered(delay.min(max))
    }

    fn jittered(&self, delay_secs: f64) -> Duration {
        if self.jitter == 0.0 {
            return Duration::from_secs_f64(delay_secs);
        }
        let factor = 1.0 + self.jitter * rand::rng().random_range(-1.0..1.0);
        Duration::from_secs_f64((delay_secs * factor).max(0.0))
    }
}

/// A stateful exponential backoff: every call to `backoff_duration` grows the
/// next delay until `reset` is called.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,

    /// The delay for the next retry, without the random jitter. Store as f64
    /// to avoid rounding errors.
    next_delay_secs: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs,
        })
    }

    pub fn reset(&mut self) {
        self.next_delay_secs = self.config.base_delay.as_secs_f64();
    }

    pub fn backoff_duration(&mut self) -> Duration {
        let next_delay = self.next_delay_secs;
        self.next_delay_secs = self
            .config
            .max_delay
            .as_secs_f64()
            .min(next_delay * self.config.multiplier);
        self.config.jittered(next_delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        let config = DEFAULT_EXPONENTIAL_CONFIG;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Self {
            config,
            next_delay_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn no_jitter(base: u64, multiplier: f64, max: u64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_secs(base),
            multiplier,
            jitter: 0.0,
            max_delay: Duration::from_secs(max),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG).is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(ExponentialBackoff::new(no_jitter(100, 2.0, 10)).is_err());
        assert!(ExponentialBackoff::new(no_jitter(1, -2.0, 10)).is_err());
        let mut config = no_jitter(1, 2.0, 10);
        config.jitter = -0.5;
        assert!(ExponentialBackoff::new(config.clone()).is_err());
        config.jitter = 2.0;
        assert!(ExponentialBackoff::new(config).is_err());
    }

    #[test]
    fn backoff_grows_caps_and_resets() {
        let mut backoff = ExponentialBackoff::new(no_jitter(1, 2.0, 15)).unwrap();
        for expected in [1, 2, 4, 8, 15, 15] {
            assert_eq!(backoff.backoff_duration(), Duration::from_secs(expected));
        }
        backoff.reset();
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
    }

    #[test]
    fn stateless_backoff_matches_attempt_number() {
        let config = no_jitter(1, 2.0, 15);
        let delays: Vec<_> = (0..6).map(|retries| config.backoff(retries)).collect();
        let expected: Vec<_> = [1, 2, 4, 8, 15, 15]
            .into_iter()
            .map(Duration::from_secs)
            .collect();
        assert_eq!(delays, expected);
        assert_eq!(config.backoff(1000), Duration::from_secs(15));
    }

    #[test]
    fn backoff_with_jitter_stays_in_range() {
        let config = BackoffConfig {
            jitter: 0.2,
            ..no_jitter(1, 2.0, 15)
        };
        let mut backoff = ExponentialBackoff::new(config).unwrap();
        for (low, high) in [(0.8, 1.2), (1.6, 2.4), (3.2, 4.8)] {
            let duration = backoff.backoff_duration().as_secs_f64();
            assert!(duration > low - EPSILON && duration < high + EPSILON);
        }
    }
}
