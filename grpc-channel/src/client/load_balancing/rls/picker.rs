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

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tonic::metadata::MetadataValue;

use super::cache::{CacheEntry, DataCache};
use super::config::{RequestProcessingStrategy, RlsConfig};
use super::control_channel::{ControlChannel, LookupReason, RouteLookupRequest};
use super::keys::CacheKey;
use super::RLS_DATA_HEADER;
use crate::client::load_balancing::{LbState, PickResult, Picker};
use crate::client::{ConnectivityState, RequestHeaders};
use crate::status::Status;

/// State shared by the policy and its pickers.
pub(super) struct RlsState {
    pub cache: DataCache,
    /// Keys with a lookup in flight.
    pub pending: HashSet<CacheKey>,
}

/// Routes picks using the route lookup cache, starting lookups for keys
/// that are missing or stale.
pub(super) struct RlsPicker {
    pub config: Arc<RlsConfig>,
    pub state: Arc<Mutex<RlsState>>,
    pub control_channel: Arc<ControlChannel>,
    /// The latest state of every child, keyed by target.
    pub children: HashMap<String, LbState>,
}

enum Decision {
    UseEntry,
    Throttled,
}

impl Picker for RlsPicker {
    fn pick(&self, request: &RequestHeaders) -> PickResult {
        let key = self.config.key_builders.build(
            request.method_name(),
            request.metadata(),
            request.authority(),
        );
        let now = Instant::now();

        let mut lookup = None;
        let (entry, decision) = {
            let mut state = self.state.lock();
            let pending = state.pending.contains(&key.cache_key);
            let entry = state.cache.get(&key.cache_key).cloned();
            let wants_lookup = match &entry {
                None => true,
                Some(entry) => now > entry.stale_time && !entry.in_backoff(now),
            };
            let mut decision = Decision::UseEntry;
            if wants_lookup && !pending {
                if self.control_channel.should_throttle() {
                    if entry.as_ref().is_none_or(|e| now > e.expiry_time) {
                        decision = Decision::Throttled;
                    }
                } else {
                    state.pending.insert(key.cache_key.clone());
                    lookup = Some(lookup_request(key.key_map.clone(), entry.as_ref()));
                }
            }
            (entry, decision)
        };
        if let Some(request) = lookup {
            self.control_channel.lookup(key.cache_key.clone(), request);
        }

        if let Decision::Throttled = decision {
            tracing::trace!(path = %key.cache_key.path, "route lookup throttled");
            return self.on_error(Status::unavailable("throttled"), request);
        }
        match entry {
            Some(entry) if now <= entry.expiry_time && !entry.targets.is_empty() => {
                self.pick_target(&entry, request)
            }
            Some(entry) if entry.in_backoff(now) => {
                let status = entry
                    .status
                    .map(|s| s.sanitized_for_control_plane())
                    .unwrap_or_else(|| Status::unavailable("route lookup failed"));
                self.on_error(status, request)
            }
            _ => match self.config.strategy {
                RequestProcessingStrategy::AsyncDefaultOnMiss => self
                    .pick_default(request)
                    .unwrap_or(PickResult::Queue),
                _ => PickResult::Queue,
            },
        }
    }
}

impl RlsPicker {
    // Used when no lookup result can be used: failed, in backoff or
    // throttled.
    fn on_error(&self, status: Status, request: &RequestHeaders) -> PickResult {
        match self.config.strategy {
            RequestProcessingStrategy::SyncClientSeesError => PickResult::Fail(status),
            RequestProcessingStrategy::SyncDefaultOnError
            | RequestProcessingStrategy::AsyncDefaultOnMiss => self
                .pick_default(request)
                .unwrap_or(PickResult::Fail(status)),
        }
    }

    fn pick_default(&self, request: &RequestHeaders) -> Option<PickResult> {
        let target = self.config.default_target.as_ref()?;
        let child = self.children.get(target)?;
        tracing::trace!(default_target = %target, "picking with default target");
        Some(child.picker.pick(request))
    }

    // Uses the first target whose child is not failing, or the first target
    // if all are.
    fn pick_target(&self, entry: &CacheEntry, request: &RequestHeaders) -> PickResult {
        let candidates: Vec<&LbState> = entry
            .targets
            .iter()
            .filter_map(|target| self.children.get(target))
            .collect();
        let Some(child) = candidates
            .iter()
            .find(|c| c.connectivity_state != ConnectivityState::TransientFailure)
            .or(candidates.first())
        else {
            return PickResult::Queue;
        };
        let mut result = child.picker.pick(request);
        if let PickResult::Pick(pick) = &mut result {
            if !entry.header_data.is_empty() {
                match MetadataValue::try_from(entry.header_data.as_str()) {
                    Ok(value) => {
                        pick.metadata.insert(RLS_DATA_HEADER, value);
                    }
                    Err(_) => {
                        tracing::warn!(header_data = %entry.header_data, "dropping invalid route lookup header data")
                    }
                }
            }
        }
        result
    }
}

fn lookup_request(
    key_map: std::collections::BTreeMap<String, String>,
    entry: Option<&CacheEntry>,
) -> RouteLookupRequest {
    let stale = entry.filter(|e| !e.targets.is_empty());
    RouteLookupRequest {
        target_type: "grpc".to_string(),
        key_map,
        reason: if stale.is_some() {
            LookupReason::Stale
        } else {
            LookupReason::Miss
        },
        stale_header_data: stale.map(|e| e.header_data.clone()).unwrap_or_default(),
    }
}
