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

//! Client side throttling of route lookups.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decides whether a route lookup should be sent.
pub trait Throttler: Send + Sync {
    /// Returns true if the lookup should be skipped.  Every call counts as a
    /// request.
    fn should_throttle(&self) -> bool;

    /// Records the outcome of a lookup that was sent.
    fn register_backend_response(&self, throttled: bool);
}

const DEFAULT_LOOKBACK: Duration = Duration::from_secs(30);
const DEFAULT_BINS: u32 = 100;
const DEFAULT_RATIO_FOR_ACCEPTS: f64 = 2.0;

/// An adaptive throttler.  Lookups are skipped with probability
/// `max(0, (requests - K * accepts) / (requests + 1))` where the counts cover
/// the lookback window.
pub struct AdaptiveThrottler {
    ratio_for_accepts: f64,
    window: Mutex<Window>,
    rng: Box<dyn Fn() -> f64 + Send + Sync>,
}

impl AdaptiveThrottler {
    pub fn new(lookback: Duration, bins: u32, ratio_for_accepts: f64) -> Self {
        Self {
            ratio_for_accepts,
            window: Mutex::new(Window::new(lookback, bins)),
            rng: Box::new(fastrand::f64),
        }
    }

    #[cfg(test)]
    fn with_rng(mut self, rng: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }
}

impl Default for AdaptiveThrottler {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK, DEFAULT_BINS, DEFAULT_RATIO_FOR_ACCEPTS)
    }
}

impl Throttler for AdaptiveThrottler {
    fn should_throttle(&self) -> bool {
        let random = (self.rng)();
        let now = Instant::now();
        let mut window = self.window.lock();
        let (requests, accepts) = window.sums(now);
        let (requests, accepts) = (requests as f64, accepts as f64);
        let probability = ((requests - self.ratio_for_accepts * accepts) / (requests + 1.0)).max(0.0);
        window.add(now, true);
        let throttled = random < probability;
        if throttled {
            tracing::trace!(probability, "route lookup throttled");
        }
        throttled
    }

    fn register_backend_response(&self, throttled: bool) {
        if !throttled {
            self.window.lock().add(Instant::now(), false);
        }
    }
}

#[derive(Debug)]
struct Bin {
    start: Instant,
    requests: u64,
    accepts: u64,
}

// Counts bucketed by time; bins older than the lookback are dropped.
struct Window {
    lookback: Duration,
    bin_width: Duration,
    bins: VecDeque<Bin>,
}

impl Window {
    fn new(lookback: Duration, bins: u32) -> Self {
        Self {
            lookback,
            bin_width: lookback / bins.max(1),
            bins: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        while self
            .bins
            .front()
            .is_some_and(|bin| now.duration_since(bin.start) >= self.lookback)
        {
            self.bins.pop_front();
        }
    }

    fn add(&mut self, now: Instant, request: bool) {
        self.expire(now);
        let fresh = self
            .bins
            .back()
            .is_some_and(|bin| now.duration_since(bin.start) < self.bin_width);
        if !fresh {
            self.bins.push_back(Bin {
                start: now,
                requests: 0,
                accepts: 0,
            });
        }
        if let Some(bin) = self.bins.back_mut() {
            if request {
                bin.requests += 1;
            } else {
                bin.accepts += 1;
            }
        }
    }

    fn sums(&mut self, now: Instant) -> (u64, u64) {
        self.expire(now);
        self.bins
            .iter()
            .fold((0, 0), |(r, a), bin| (r + bin.requests, a + bin.accepts))
    }
}
