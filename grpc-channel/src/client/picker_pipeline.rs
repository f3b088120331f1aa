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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::client::RequestHeaders;
use crate::client::load_balancing::{DroppingPicker, Pick, PickResult, Picker, QueuingPicker};
use crate::status::{Status, StatusCode};

struct Snapshot {
    generation: u64,
    picker: Arc<dyn Picker>,
}

/// Holds the picker RPCs consult and parks RPCs whose pick was queued until a
/// newer picker is installed.
///
/// Picks load the current picker without locking.
pub(crate) struct PickerPipeline {
    current: ArcSwap<Snapshot>,
    generation: AtomicU64,
    updated: Notify,
    closed: AtomicBool,
}

impl PickerPipeline {
    pub(crate) fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot {
                generation: 0,
                picker: Arc::new(QueuingPicker {}),
            }),
            generation: AtomicU64::new(0),
            updated: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Installs `picker` and wakes queued picks.  Ignored once closed.
    pub(crate) fn update(&self, picker: Arc<dyn Picker>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.install(picker);
    }

    fn install(&self, picker: Arc<dyn Picker>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.current.store(Arc::new(Snapshot { generation, picker }));
        self.updated.notify_waiters();
    }

    /// Picks a subchannel for `request`.
    ///
    /// A queued pick is retried against the next installed picker, as is a
    /// pick of a subchannel that has no connection.  A pick failing with
    /// Unavailable is treated like a queued one when `wait_for_ready` is set;
    /// any other failure, and every dropped pick, fails the call.
    pub(crate) async fn pick(
        &self,
        request: &RequestHeaders,
        wait_for_ready: bool,
        cancel: &CancellationToken,
    ) -> Result<Pick, Status> {
        let mut last_generation = None;
        loop {
            // Registered before loading so an install between the load and
            // the wait is not missed.
            let updated = self.updated.notified();
            tokio::pin!(updated);
            updated.as_mut().enable();

            let snapshot = self.current.load_full();
            if last_generation != Some(snapshot.generation) {
                last_generation = Some(snapshot.generation);
                match snapshot.picker.pick(request) {
                    PickResult::Pick(pick) if pick.subchannel.connection().is_some() => {
                        return Ok(pick);
                    }
                    PickResult::Pick(pick) => {
                        tracing::trace!(subchannel = %pick.subchannel, "picked subchannel is not connected, waiting for a new picker");
                    }
                    PickResult::Queue => {
                        tracing::trace!(method = request.method_name(), "pick queued");
                    }
                    PickResult::Fail(status)
                        if wait_for_ready && status.code() == StatusCode::Unavailable =>
                    {
                        tracing::trace!(method = request.method_name(), %status, "wait-for-ready pick queued after failure");
                    }
                    PickResult::Fail(status) | PickResult::Drop(status) => return Err(status),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Status::cancelled("call cancelled while waiting for a pick"));
                }
                _ = &mut updated => {}
            }
        }
    }

    /// Fails every queued and future pick with Cancelled.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.install(Arc::new(DroppingPicker::new(Status::cancelled(
            "channel is closed",
        ))));
    }
}
