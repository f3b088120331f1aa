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

//! Channel idleness: tearing down resolution and connections after a period
//! without RPCs, and bringing them back for the next RPC.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::rt::{BoxedTaskHandle, Runtime};
use crate::status::Status;

/// Performs the transitions decided by an [`IdlenessManager`].
pub trait IdleEnforcer: Send + Sync {
    /// Releases the resolver, LB policies and connections.
    fn enter_idle(&self);

    /// Recreates what `enter_idle` released.
    fn exit_idle(&self) -> Result<(), Status>;
}

// Stored in the call counter while entering idle, so that calls starting
// concurrently see a non-positive count and take the slow path.
const IDLE_SENTINEL: i32 = -(i32::MAX / 2);

/// Decides when a channel enters and exits idle.
///
/// The manager starts idle.  Call accounting is lock free; entering and
/// exiting idle are serialised by one lock.
pub struct IdlenessManager {
    inner: Arc<Inner>,
}

struct Inner {
    enforcer: Arc<dyn IdleEnforcer>,
    timeout: Option<Duration>,
    runtime: Arc<dyn Runtime>,
    created: Instant,

    active_calls: AtomicI32,
    active_since_last_tick: AtomicBool,
    // Nanoseconds after `created`.
    last_call_end: AtomicU64,
    closed: AtomicBool,

    idle: RwLock<IdleState>,
}

struct IdleState {
    actually_idle: bool,
    timer: Option<BoxedTaskHandle>,
}

impl IdlenessManager {
    /// Creates an idle manager.  With no `timeout` the channel never
    /// re-enters idle after its first call.
    pub fn new(
        enforcer: Arc<dyn IdleEnforcer>,
        timeout: Option<Duration>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                enforcer,
                timeout: timeout.filter(|t| !t.is_zero()),
                runtime,
                created: Instant::now(),
                active_calls: AtomicI32::new(IDLE_SENTINEL),
                active_since_last_tick: AtomicBool::new(false),
                last_call_end: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                idle: RwLock::new(IdleState {
                    actually_idle: true,
                    timer: None,
                }),
            }),
        }
    }

    /// Records the start of a call, exiting idle first if needed.
    pub fn on_call_begin(&self) -> Result<(), Status> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if inner.active_calls.fetch_add(1, Ordering::AcqRel) + 1 > 0 {
            inner.active_since_last_tick.store(true, Ordering::Release);
            return Ok(());
        }
        // The channel is idle or entering idle.
        if let Err(status) = Inner::exit_idle(inner) {
            inner.active_calls.fetch_sub(1, Ordering::AcqRel);
            return Err(status);
        }
        inner.active_since_last_tick.store(true, Ordering::Release);
        Ok(())
    }

    /// Records the end of a call.
    pub fn on_call_end(&self) {
        let inner = &self.inner;
        let now = inner.created.elapsed().as_nanos();
        inner
            .last_call_end
            .store(u64::try_from(now).unwrap_or(u64::MAX), Ordering::Release);
        inner.active_calls.fetch_sub(1, Ordering::AcqRel);
    }

    /// Exits idle without starting a call.
    pub fn exit_idle(&self) -> Result<(), Status> {
        Inner::exit_idle(&self.inner)
    }

    pub fn is_idle(&self) -> bool {
        self.inner.idle.read().actually_idle
    }

    /// Stops the manager.  Later calls are not tracked.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(timer) = self.inner.idle.write().timer.take() {
            timer.abort();
        }
    }

    #[cfg(test)]
    fn active_calls(&self) -> i32 {
        self.inner.active_calls.load(Ordering::Acquire)
    }
}

impl Drop for IdlenessManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn exit_idle(self: &Arc<Self>) -> Result<(), Status> {
        let mut idle = self.idle.write();
        if self.closed.load(Ordering::Acquire) || !idle.actually_idle {
            return Ok(());
        }
        self.enforcer.exit_idle()?;
        // Undo the sentinel, keeping the calls counted since.
        self.active_calls.fetch_add(-IDLE_SENTINEL, Ordering::AcqRel);
        idle.actually_idle = false;
        tracing::debug!("channel exited idle");
        self.reset_timer(&mut idle, self.timeout);
        Ok(())
    }

    fn reset_timer(self: &Arc<Self>, idle: &mut IdleState, after: Option<Duration>) {
        if let Some(timer) = idle.timer.take() {
            timer.abort();
        }
        let Some(after) = after else {
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let sleep = self.runtime.sleep(after);
        let weak: Weak<Inner> = Arc::downgrade(self);
        idle.timer = Some(self.runtime.spawn(Box::pin(async move {
            sleep.await;
            if let Some(inner) = weak.upgrade() {
                inner.handle_idle_timeout();
            }
        })));
    }

    fn handle_idle_timeout(self: &Arc<Self>) {
        let Some(timeout) = self.timeout else {
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.active_calls.load(Ordering::Acquire) > 0 {
            self.reset_timer(&mut self.idle.write(), Some(timeout));
            return;
        }

        // There were calls since the last tick, all finished: check again
        // one timeout after the last one ended.
        if self.active_since_last_tick.swap(false, Ordering::AcqRel) {
            let last_end = Duration::from_nanos(self.last_call_end.load(Ordering::Acquire));
            let since_end = self.created.elapsed().saturating_sub(last_end);
            let after = timeout.saturating_sub(since_end);
            self.reset_timer(&mut self.idle.write(), Some(after));
            return;
        }

        if self
            .active_calls
            .compare_exchange(0, IDLE_SENTINEL, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.reset_timer(&mut self.idle.write(), Some(timeout));
            return;
        }
        if !self.try_enter_idle() {
            self.reset_timer(&mut self.idle.write(), Some(timeout));
        }
    }

    // Called with the sentinel installed.  Enters idle unless a call started
    // since the sentinel was installed.
    fn try_enter_idle(&self) -> bool {
        let mut idle = self.idle.write();
        if self.active_calls.load(Ordering::Acquire) != IDLE_SENTINEL
            || self.active_since_last_tick.load(Ordering::Acquire)
        {
            self.active_calls.fetch_add(-IDLE_SENTINEL, Ordering::AcqRel);
            return false;
        }
        self.enforcer.enter_idle();
        idle.actually_idle = true;
        idle.timer = None;
        tracing::debug!("channel entered idle");
        true
    }
}
