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

//! Sends route lookups to the lookup service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::keys::CacheKey;
use super::throttler::Throttler;
use crate::client::load_balancing::WorkScheduler;
use crate::rt::{BoxFuture, Runtime};
use crate::status::Status;

/// Why a lookup is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupReason {
    Unknown,
    /// No usable entry is cached.
    Miss,
    /// The cached entry is stale and is being refreshed.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLookupRequest {
    /// Always "grpc".
    pub target_type: String,
    pub key_map: BTreeMap<String, String>,
    pub reason: LookupReason,
    /// The header data of the stale entry being refreshed.
    pub stale_header_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteLookupResponse {
    /// Targets in preference order.
    pub targets: Vec<String>,
    /// Attached to every RPC routed using this response.
    pub header_data: String,
}

/// The client of the route lookup service.  Implementations own the
/// connection to `lookup_service` and perform one RouteLookup RPC per call.
pub trait RouteLookupService: Send + Sync {
    fn route_lookup(
        &self,
        lookup_service: &str,
        request: RouteLookupRequest,
    ) -> BoxFuture<Result<RouteLookupResponse, Status>>;
}

/// A finished lookup, waiting to be applied by the policy.
#[derive(Debug)]
pub(super) struct LookupCompletion {
    pub key: CacheKey,
    pub result: Result<RouteLookupResponse, Status>,
}

/// Lookups completed but not yet applied.
pub(super) type CompletionQueue = Arc<Mutex<Vec<LookupCompletion>>>;

pub(super) struct ControlChannel {
    service: Arc<dyn RouteLookupService>,
    lookup_service: String,
    timeout: Duration,
    throttler: Arc<dyn Throttler>,
    runtime: Arc<dyn Runtime>,
    completions: CompletionQueue,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl ControlChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: Arc<dyn RouteLookupService>,
        lookup_service: String,
        timeout: Duration,
        throttler: Arc<dyn Throttler>,
        runtime: Arc<dyn Runtime>,
        completions: CompletionQueue,
        work_scheduler: Arc<dyn WorkScheduler>,
    ) -> Self {
        Self {
            service,
            lookup_service,
            timeout,
            throttler,
            runtime,
            completions,
            work_scheduler,
        }
    }

    pub fn lookup_service(&self) -> &str {
        &self.lookup_service
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn should_throttle(&self) -> bool {
        self.throttler.should_throttle()
    }

    /// Starts a lookup for `key`.  Its result is queued for the policy, whose
    /// work is then scheduled.
    pub fn lookup(&self, key: CacheKey, request: RouteLookupRequest) {
        tracing::debug!(path = %key.path, keys = %key.keys, reason = ?request.reason, "starting route lookup");
        let call = self.service.route_lookup(&self.lookup_service, request);
        let deadline = self.runtime.sleep(self.timeout);
        let throttler = self.throttler.clone();
        let completions = self.completions.clone();
        let work_scheduler = self.work_scheduler.clone();
        self.runtime.spawn(Box::pin(async move {
            let result = tokio::select! {
                result = call => result,
                _ = deadline => Err(Status::deadline_exceeded("route lookup timed out")),
            };
            let result = result.and_then(|response| {
                if response.targets.is_empty() {
                    Err(Status::unavailable("route lookup returned no targets"))
                } else {
                    Ok(response)
                }
            });
            throttler.register_backend_response(result.is_err());
            match &result {
                Ok(response) => {
                    tracing::debug!(path = %key.path, targets = ?response.targets, "route lookup succeeded")
                }
                Err(status) => {
                    tracing::debug!(path = %key.path, %status, "route lookup failed")
                }
            }
            completions.lock().push(LookupCompletion { key, result });
            work_scheduler.schedule_work();
        }));
    }
}
