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

//! The route lookup (RLS) LB policy.
//!
//! For every RPC the policy builds a key from the request, and asks a route
//! lookup service which target should serve it.  Results are cached; each
//! target returned is served by its own child policy, built from the
//! configured child policy with the target filled into its config.
//!
//! Lookups run outside the policy.  Their results are queued and applied the
//! next time the policy's work runs, after which a new picker is published so
//! that queued RPCs are retried.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::client::ConnectivityState;
use crate::client::load_balancing::child_manager::{ChildManager, aggregate};
use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    ParsedJsonLbConfig, Subchannel, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::name_resolution::backoff::DEFAULT_EXPONENTIAL_CONFIG;
use crate::client::service_config::LbConfig;
use crate::rt::{BoxedTaskHandle, Runtime};

mod cache;
pub mod config;
mod control_channel;
pub mod keys;
mod picker;
pub mod throttler;

use cache::{CacheEntry, DataCache};
pub use config::{RequestProcessingStrategy, RlsConfig, RlsConfigError};
use control_channel::{CompletionQueue, ControlChannel, LookupCompletion};
pub use control_channel::{LookupReason, RouteLookupRequest, RouteLookupResponse, RouteLookupService};
use keys::CacheKey;
use picker::{RlsPicker, RlsState};
use throttler::{AdaptiveThrottler, Throttler};

pub static POLICY_NAME: &str = "rls_experimental";

/// The header carrying the header data of a lookup response on RPCs routed
/// with it.
pub const RLS_DATA_HEADER: &str = "x-google-rls-data";

/// How often expired cache entries are removed.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Registers the RLS policy in the global registry, sending lookups through
/// `service`.
pub fn reg(service: Arc<dyn RouteLookupService>) {
    GLOBAL_LB_REGISTRY.add_builder(Builder::new(service));
}

pub struct Builder {
    service: Arc<dyn RouteLookupService>,
    throttler: Option<Arc<dyn Throttler>>,
}

impl Builder {
    pub fn new(service: Arc<dyn RouteLookupService>) -> Self {
        Self {
            service,
            throttler: None,
        }
    }

    /// Makes every policy built share `throttler` instead of using its own
    /// adaptive throttler.
    pub fn with_throttler(mut self, throttler: Arc<dyn Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }
}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        let throttler = self
            .throttler
            .clone()
            .unwrap_or_else(|| Arc::new(AdaptiveThrottler::default()));
        Box::new(RlsPolicy::new(options, self.service.clone(), throttler))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(Some(LbConfig::new(RlsConfig::parse(config.value.clone())?)))
    }
}

#[derive(Debug)]
enum TimerEvent {
    Purge,
    BackoffExpired(CacheKey),
}

struct RlsPolicy {
    child_manager: ChildManager<String>,
    runtime: Arc<dyn Runtime>,
    work_scheduler: Arc<dyn WorkScheduler>,
    service: Arc<dyn RouteLookupService>,
    throttler: Arc<dyn Throttler>,
    config: Option<Arc<RlsConfig>>,
    control_channel: Option<Arc<ControlChannel>>,
    state: Arc<Mutex<RlsState>>,
    completions: CompletionQueue,
    timer_events: Arc<Mutex<Vec<TimerEvent>>>,
    purge_timer: Option<BoxedTaskHandle>,
    backoff_timers: HashMap<CacheKey, BoxedTaskHandle>,
    last_update: Option<ResolverUpdate>,
}

impl RlsPolicy {
    fn new(
        options: LbPolicyOptions,
        service: Arc<dyn RouteLookupService>,
        throttler: Arc<dyn Throttler>,
    ) -> Self {
        Self {
            child_manager: ChildManager::new(
                options.runtime.clone(),
                options.work_scheduler.clone(),
            ),
            runtime: options.runtime,
            work_scheduler: options.work_scheduler,
            service,
            throttler,
            config: None,
            control_channel: None,
            state: Arc::new(Mutex::new(RlsState {
                cache: DataCache::new(0),
                pending: HashSet::new(),
            })),
            completions: CompletionQueue::default(),
            timer_events: Default::default(),
            purge_timer: None,
            backoff_timers: HashMap::new(),
            last_update: None,
        }
    }
}

impl LbPolicy for RlsPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config = config
            .and_then(|c| c.convert_to::<RlsConfig>())
            .ok_or("rls: missing config")?;
        let old = self.config.replace(config.clone());

        let new_channel = self.control_channel.as_ref().is_none_or(|cc| {
            cc.lookup_service() != config.lookup_service
                || cc.timeout() != config.lookup_service_timeout
        });
        if new_channel {
            tracing::debug!(lookup_service = %config.lookup_service, "rls using new control channel");
            self.control_channel = Some(Arc::new(ControlChannel::new(
                self.service.clone(),
                config.lookup_service.clone(),
                config.lookup_service_timeout,
                self.throttler.clone(),
                self.runtime.clone(),
                self.completions.clone(),
                self.work_scheduler.clone(),
            )));
        }
        {
            let mut state = self.state.lock();
            if old
                .as_ref()
                .is_some_and(|old| old.key_builders != config.key_builders)
            {
                tracing::debug!("rls key builders changed, clearing cache");
                state.cache.clear();
            }
            state.cache.resize(config.cache_size_bytes);
        }
        if self.purge_timer.is_none() {
            self.purge_timer = Some(self.start_purge_timer());
        }

        // Every child receives the update; a changed child policy config is
        // delivered with it.
        self.last_update = Some(update);
        let result = self.sync_children(true, channel_controller);
        self.send_picker(channel_controller);
        result
    }

    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController) {
        self.child_manager.resolver_error(&error, channel_controller);
        if self.child_manager.has_updated() {
            self.send_picker(channel_controller);
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.child_manager
            .subchannel_update(subchannel, state, channel_controller);
        if self.child_manager.has_updated() {
            self.send_picker(channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.child_manager.work(channel_controller);
        let completions = mem::take(&mut *self.completions.lock());
        let timer_events = mem::take(&mut *self.timer_events.lock());
        let changed = !completions.is_empty() || !timer_events.is_empty();

        let now = Instant::now();
        for completion in completions {
            self.apply_completion(completion, now);
        }
        for event in timer_events {
            match event {
                TimerEvent::Purge => {
                    let purged = self.state.lock().cache.purge_expired(now);
                    if !purged.is_empty() {
                        tracing::debug!(count = purged.len(), "purged expired route lookup entries");
                    }
                }
                TimerEvent::BackoffExpired(key) => {
                    self.backoff_timers.remove(&key);
                }
            }
        }
        if changed {
            if let Err(err) = self.sync_children(false, channel_controller) {
                tracing::warn!(error = %err, "rls child policy rejected update");
            }
        }
        if changed || self.child_manager.has_updated() {
            self.send_picker(channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.child_manager.exit_idle(channel_controller);
        if self.child_manager.has_updated() {
            self.send_picker(channel_controller);
        }
    }
}

impl RlsPolicy {
    fn apply_completion(&mut self, completion: LookupCompletion, now: Instant) {
        let Some(config) = self.config.clone() else {
            return;
        };
        let LookupCompletion { key, result } = completion;
        let mut state = self.state.lock();
        state.pending.remove(&key);
        let entry = match result {
            Ok(response) => CacheEntry {
                targets: response.targets,
                header_data: response.header_data,
                expiry_time: now + config.max_age,
                stale_time: now + config.stale_age,
                backoff_time: None,
                status: None,
                retries: 0,
            },
            Err(status) => {
                let mut entry = state.cache.peek(&key).cloned().unwrap_or(CacheEntry {
                    targets: Vec::new(),
                    header_data: String::new(),
                    expiry_time: now,
                    stale_time: now,
                    backoff_time: None,
                    status: None,
                    retries: 0,
                });
                let backoff = DEFAULT_EXPONENTIAL_CONFIG.backoff(entry.retries);
                entry.backoff_time = Some(now + backoff);
                entry.status = Some(status);
                entry.retries += 1;
                let timer = self.start_backoff_timer(key.clone(), backoff);
                if let Some(old) = self.backoff_timers.insert(key.clone(), timer) {
                    old.abort();
                }
                entry
            }
        };
        state.cache.insert(key, entry);
    }

    // Makes the set of children match the targets referenced by the cache
    // plus the default target.  With `resend`, existing children also get the
    // latest update and config.
    fn sync_children(
        &mut self,
        resend: bool,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let (Some(config), Some(update)) = (self.config.clone(), self.last_update.clone()) else {
            return Ok(());
        };
        let mut wanted: Vec<String> = self
            .state
            .lock()
            .cache
            .targets()
            .into_iter()
            .map(str::to_string)
            .collect();
        wanted.extend(config.default_target.clone());
        let wanted_set: HashSet<&String> = wanted.iter().collect();

        let unreferenced: Vec<String> = self
            .child_manager
            .child_states()
            .map(|(target, _)| target.clone())
            .filter(|target| !wanted_set.contains(target))
            .collect();
        for target in unreferenced {
            tracing::debug!(rls_target = %target, "rls closing unreferenced child");
            self.child_manager.remove_child(&target);
        }

        let mut first_error: Option<Box<dyn Error + Send + Sync>> = None;
        for target in wanted_set {
            if !resend && self.child_manager.contains(target) {
                continue;
            }
            let child_config = match config.child_config(target) {
                Ok(child_config) => child_config,
                Err(err) => {
                    tracing::warn!(rls_target = %target, error = %err, "rls child config rejected");
                    first_error.get_or_insert(err.into());
                    continue;
                }
            };
            if let Err(err) = self.child_manager.ensure_child(
                target.clone(),
                config.child_policy.clone(),
                update.clone(),
                child_config.as_ref(),
                channel_controller,
            ) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn send_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let (Some(config), Some(control_channel)) =
            (self.config.clone(), self.control_channel.clone())
        else {
            return;
        };
        let children: HashMap<String, LbState> = self
            .child_manager
            .child_states()
            .map(|(target, state)| (target.clone(), state.clone()))
            .collect();
        let connectivity_state = if children.is_empty() {
            if self.state.lock().cache.has_failed_lookups() {
                ConnectivityState::TransientFailure
            } else {
                ConnectivityState::Idle
            }
        } else {
            aggregate(children.values().map(|s| s.connectivity_state))
        };
        tracing::debug!(state = %connectivity_state, children = children.len(), "rls updating picker");
        channel_controller.update_picker(LbState {
            connectivity_state,
            picker: Arc::new(RlsPicker {
                config,
                state: self.state.clone(),
                control_channel,
                children,
            }),
        });
    }

    fn start_purge_timer(&self) -> BoxedTaskHandle {
        let runtime = self.runtime.clone();
        let events = self.timer_events.clone();
        let work_scheduler = self.work_scheduler.clone();
        self.runtime.spawn(Box::pin(async move {
            loop {
                runtime.sleep(PURGE_INTERVAL).await;
                events.lock().push(TimerEvent::Purge);
                work_scheduler.schedule_work();
            }
        }))
    }

    // Publishes a new picker when the backoff for `key` ends, so RPCs that
    // failed during it are retried.
    fn start_backoff_timer(&self, key: CacheKey, backoff: Duration) -> BoxedTaskHandle {
        let sleep = self.runtime.sleep(backoff);
        let events = self.timer_events.clone();
        let work_scheduler = self.work_scheduler.clone();
        self.runtime.spawn(Box::pin(async move {
            sleep.await;
            events.lock().push(TimerEvent::BackoffExpired(key));
            work_scheduler.schedule_work();
        }))
    }
}

impl Drop for RlsPolicy {
    fn drop(&mut self) {
        if let Some(timer) = self.purge_timer.take() {
            timer.abort();
        }
        for (_, timer) in self.backoff_timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::client::RequestHeaders;
    use crate::client::load_balancing::test_utils::{
        BACKEND_STUB_POLICY, TestChannelController, TestEvent, drain, last_picker,
        new_subchannels, pick_address, reg_backend_stub, set_state, test_options,
        update_with_addresses,
    };
    use crate::client::load_balancing::{PickResult, Picker};
    use crate::rt::BoxFuture;
    use crate::status::{Status, StatusCode};

    type LookupCall = (
        RouteLookupRequest,
        oneshot::Sender<Result<RouteLookupResponse, Status>>,
    );

    struct FakeLookupService {
        tx: mpsc::UnboundedSender<LookupCall>,
    }

    impl RouteLookupService for FakeLookupService {
        fn route_lookup(
            &self,
            _lookup_service: &str,
            request: RouteLookupRequest,
        ) -> BoxFuture<Result<RouteLookupResponse, Status>> {
            let (tx, rx) = oneshot::channel();
            let _ = self.tx.send((request, tx));
            Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(Status::cancelled("lookup dropped")))
            })
        }
    }

    struct FixedThrottler(bool);

    impl Throttler for FixedThrottler {
        fn should_throttle(&self) -> bool {
            self.0
        }

        fn register_backend_response(&self, _throttled: bool) {}
    }

    struct Fixture {
        policy: RlsPolicy,
        controller: TestChannelController,
        events: mpsc::UnboundedReceiver<TestEvent>,
        lookups: mpsc::UnboundedReceiver<LookupCall>,
    }

    fn config(strategy: &str, default_target: &str, cache_size: u32) -> LbConfig {
        reg_backend_stub();
        Builder::new(Arc::new(FakeLookupService {
            tx: mpsc::unbounded_channel().0,
        }))
        .parse_config(&ParsedJsonLbConfig::new(json!({
            "routeLookupConfig": {
                "grpcKeybuilders": [{"names": [{"service": "S"}], "extraKeys": {"method": "m"}}],
                "lookupService": "rls.example.com:443",
                "maxAge": "60s",
                "staleAge": "30s",
                "cacheSizeBytes": cache_size,
                "defaultTarget": default_target,
                "requestProcessingStrategy": strategy,
            },
            "childPolicy": [{BACKEND_STUB_POLICY: {}}],
            "childPolicyConfigTargetFieldName": "backend",
        })))
        .unwrap()
        .unwrap()
    }

    fn setup(throttled: bool, config: &LbConfig) -> Fixture {
        let (mut controller, mut events) = TestChannelController::new();
        let (tx, lookups) = mpsc::unbounded_channel();
        let mut policy = RlsPolicy::new(
            test_options(&controller.tx_events),
            Arc::new(FakeLookupService { tx }),
            Arc::new(FixedThrottler(throttled)),
        );
        policy
            .resolver_update(update_with_addresses(&["ignored:1"]), Some(config), &mut controller)
            .unwrap();
        drain(&mut events);
        Fixture {
            policy,
            controller,
            events,
            lookups,
        }
    }

    fn rpc(method: &str) -> RequestHeaders {
        RequestHeaders::new().with_method_name(method)
    }

    fn cache_key(method: &str) -> CacheKey {
        CacheKey {
            path: format!("/S/{method}"),
            keys: format!("m={method}"),
        }
    }

    impl Fixture {
        // A picker over the current state, built without recording an
        // update.
        fn picker(&self) -> LbState {
            let children = self
                .policy
                .child_manager
                .child_states()
                .map(|(t, s)| (t.clone(), s.clone()))
                .collect();
            LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RlsPicker {
                    config: self.policy.config.clone().unwrap(),
                    state: self.policy.state.clone(),
                    control_channel: self.policy.control_channel.clone().unwrap(),
                    children,
                }),
            }
        }

        // Waits for a lookup result to be queued, then applies it.
        async fn run_work(&mut self) {
            loop {
                match self.events.recv().await {
                    Some(TestEvent::ScheduleWork) => break,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
            self.policy.work(&mut self.controller);
        }

        // Marks the subchannel created for `target` READY.
        fn make_ready(&mut self, events: &[TestEvent], target: &str) {
            let subchannel = new_subchannels(events)
                .into_iter()
                .find(|sc| sc.address().address == target)
                .unwrap();
            set_state(&mut self.policy, &subchannel, ConnectivityState::Ready, &mut self.controller);
        }

        fn preload(&mut self, key: CacheKey, entry: CacheEntry) -> Vec<TestEvent> {
            self.policy.state.lock().cache.insert(key, entry);
            self.policy
                .sync_children(false, &mut self.controller)
                .unwrap();
            drain(&mut self.events)
        }
    }

    fn entry(target: &str, expiry: Duration, stale: Duration) -> CacheEntry {
        let now = Instant::now();
        CacheEntry {
            targets: vec![target.to_string()],
            header_data: String::new(),
            expiry_time: now + expiry,
            stale_time: now + stale,
            backoff_time: None,
            status: None,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn cache_hit_uses_cached_target() {
        let config = config("SYNC_DEFAULT_ON_ERROR", "", 1000);
        let mut f = setup(false, &config);
        let events = f.preload(
            cache_key("M"),
            entry("T1", Duration::from_secs(60), Duration::from_secs(30)),
        );
        f.make_ready(&events, "T1");

        let state = last_picker(&drain(&mut f.events)).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);
        assert_eq!(pick_address(&state, &rpc("/S/M")), "T1");
        assert!(f.lookups.try_recv().is_err());
    }

    #[tokio::test]
    async fn cache_miss_queues_until_lookup_completes() {
        let config = config("SYNC_DEFAULT_ON_ERROR", "", 1000);
        let mut f = setup(false, &config);
        let state = f.picker();

        assert_eq!(pick_address(&state, &rpc("/S/M")), "queue");
        let (request, respond) = f.lookups.try_recv().unwrap();
        assert_eq!(request.reason, LookupReason::Miss);
        assert_eq!(request.key_map["m"], "M");
        assert!(f.policy.state.lock().pending.contains(&cache_key("M")));

        // A second pick does not start another lookup.
        assert_eq!(pick_address(&state, &rpc("/S/M")), "queue");
        assert!(f.lookups.try_recv().is_err());

        respond
            .send(Ok(RouteLookupResponse {
                targets: vec!["T2".to_string()],
                header_data: "rls-data".to_string(),
            }))
            .unwrap();
        f.run_work().await;
        let events = drain(&mut f.events);
        assert!(last_picker(&events).is_some());
        assert!(!f.policy.state.lock().pending.contains(&cache_key("M")));
        f.make_ready(&events, "T2");

        let state = last_picker(&drain(&mut f.events)).unwrap();
        match state.picker.pick(&rpc("/S/M")) {
            PickResult::Pick(pick) => {
                assert_eq!(pick.subchannel.address().address, "T2");
                assert_eq!(pick.metadata.get(RLS_DATA_HEADER).unwrap(), "rls-data");
            }
            other => panic!("unexpected pick result {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttled_lookup_fails_when_client_sees_errors() {
        let config = config("SYNC_CLIENT_SEES_ERROR", "", 1000);
        let f = setup(true, &config);
        let state = f.picker();
        match state.picker.pick(&rpc("/S/M")) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), StatusCode::Unavailable);
                assert_eq!(status.message(), "throttled");
            }
            other => panic!("unexpected pick result {other:?}"),
        }
        let mut lookups = f.lookups;
        assert!(lookups.try_recv().is_err());
        assert!(f.policy.state.lock().pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_uses_default_target() {
        let config = config("SYNC_DEFAULT_ON_ERROR", "D", 1000);
        let (mut controller, mut events) = TestChannelController::new();
        let (tx, mut lookups) = mpsc::unbounded_channel();
        let mut policy = RlsPolicy::new(
            test_options(&controller.tx_events),
            Arc::new(FakeLookupService { tx }),
            Arc::new(FixedThrottler(false)),
        );
        policy
            .resolver_update(update_with_addresses(&["ignored:1"]), Some(&config), &mut controller)
            .unwrap();
        let default_child = new_subchannels(&drain(&mut events));
        assert_eq!(default_child.len(), 1);
        assert_eq!(default_child[0].address().address, "D");
        set_state(&mut policy, &default_child[0], ConnectivityState::Ready, &mut controller);
        drain(&mut events);

        let now = Instant::now();
        policy.state.lock().cache.insert(
            cache_key("M"),
            CacheEntry {
                targets: vec!["T1".to_string()],
                header_data: String::new(),
                expiry_time: now,
                stale_time: now,
                backoff_time: Some(now + Duration::from_secs(30)),
                status: Some(Status::unavailable("rls down")),
                retries: 1,
            },
        );
        tokio::time::advance(Duration::from_secs(1)).await;

        policy.send_picker(&mut controller);
        let state = last_picker(&drain(&mut events)).unwrap();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "D");
        assert!(lookups.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_enters_backoff() {
        let config = config("SYNC_CLIENT_SEES_ERROR", "", 1000);
        let mut f = setup(false, &config);
        let state = f.picker();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "queue");
        let (_, respond) = f.lookups.try_recv().unwrap();
        respond.send(Err(Status::unavailable("rls down"))).unwrap();
        f.run_work().await;

        let state = last_picker(&drain(&mut f.events)).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        assert_eq!(pick_address(&state, &rpc("/S/M")), "fail: rls down");
        assert!(f.lookups.try_recv().is_err());

        // Once the backoff ends a new picker is published and picks start a
        // new lookup.
        f.run_work().await;
        let state = last_picker(&drain(&mut f.events)).unwrap();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "queue");
        assert!(f.lookups.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_refreshed() {
        let config = config("SYNC_DEFAULT_ON_ERROR", "", 1000);
        let mut f = setup(false, &config);
        let mut stale = entry("T1", Duration::from_secs(60), Duration::from_secs(30));
        stale.header_data = "old".to_string();
        let events = f.preload(cache_key("M"), stale);
        f.make_ready(&events, "T1");
        tokio::time::advance(Duration::from_secs(31)).await;

        let state = last_picker(&drain(&mut f.events)).unwrap();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "T1");
        let (request, _respond) = f.lookups.try_recv().unwrap();
        assert_eq!(request.reason, LookupReason::Stale);
        assert_eq!(request.stale_header_data, "old");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_expiry() {
        let config = config("SYNC_DEFAULT_ON_ERROR", "", 1000);
        let mut f = setup(false, &config);
        let events = f.preload(
            cache_key("M"),
            entry("T1", Duration::from_secs(60), Duration::from_secs(30)),
        );
        f.make_ready(&events, "T1");
        let old_expiry = f.policy.state.lock().cache.peek(&cache_key("M")).unwrap().expiry_time;
        tokio::time::advance(Duration::from_secs(31)).await;

        let state = last_picker(&drain(&mut f.events)).unwrap();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "T1");
        let (_, respond) = f.lookups.try_recv().unwrap();
        respond
            .send(Ok(RouteLookupResponse {
                targets: vec!["T1".to_string()],
                header_data: String::new(),
            }))
            .unwrap();
        f.run_work().await;

        let state = f.policy.state.lock();
        let refreshed = state.cache.peek(&cache_key("M")).unwrap();
        assert!(refreshed.expiry_time > old_expiry);
        assert!(refreshed.stale_time > Instant::now());
        assert!(!state.pending.contains(&cache_key("M")));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_to_same_target_uses_current_child_picker() {
        let config = config("SYNC_DEFAULT_ON_ERROR", "", 1000);
        let mut f = setup(false, &config);
        let mut stale = entry("T1", Duration::from_secs(60), Duration::from_secs(30));
        stale.header_data = "old".to_string();
        let events = f.preload(cache_key("M"), stale);
        let t1 = new_subchannels(&events).remove(0);
        f.make_ready(&events, "T1");
        tokio::time::advance(Duration::from_secs(31)).await;

        let state = last_picker(&drain(&mut f.events)).unwrap();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "T1");
        let (_, respond) = f.lookups.try_recv().unwrap();

        // The child fails while the refresh is in flight.
        set_state(&mut f.policy, &t1, ConnectivityState::TransientFailure, &mut f.controller);
        drain(&mut f.events);

        respond
            .send(Ok(RouteLookupResponse {
                targets: vec!["T1".to_string()],
                header_data: "new".to_string(),
            }))
            .unwrap();
        f.run_work().await;
        let events = drain(&mut f.events);
        assert!(new_subchannels(&events).is_empty());
        let state = last_picker(&events).unwrap();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "fail: T1 is down");

        set_state(&mut f.policy, &t1, ConnectivityState::Ready, &mut f.controller);
        let state = last_picker(&drain(&mut f.events)).unwrap();
        match state.picker.pick(&rpc("/S/M")) {
            PickResult::Pick(pick) => {
                assert_eq!(pick.subchannel.address().address, "T1");
                assert_eq!(pick.metadata.get(RLS_DATA_HEADER).unwrap(), "new");
            }
            other => panic!("unexpected pick result {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_stale_entry_is_still_used() {
        let config = config("SYNC_CLIENT_SEES_ERROR", "", 1000);
        let mut f = setup(true, &config);
        let events = f.preload(
            cache_key("M"),
            entry("T1", Duration::from_secs(60), Duration::from_secs(30)),
        );
        f.make_ready(&events, "T1");
        let state = last_picker(&drain(&mut f.events)).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pick_address(&state, &rpc("/S/M")), "T1");
        assert!(f.lookups.try_recv().is_err());
        assert!(f.policy.state.lock().pending.is_empty());

        // Once the entry expires, the throttled lookup is an error.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pick_address(&state, &rpc("/S/M")), "fail: throttled");
        assert!(f.lookups.try_recv().is_err());
    }

    #[tokio::test]
    async fn async_strategy_uses_default_target_on_miss() {
        let config = config("ASYNC_LOOKUP_DEFAULT_TARGET_ON_MISS", "D", 1000);
        let (mut controller, mut events) = TestChannelController::new();
        let (tx, mut lookups) = mpsc::unbounded_channel();
        let mut policy = RlsPolicy::new(
            test_options(&controller.tx_events),
            Arc::new(FakeLookupService { tx }),
            Arc::new(FixedThrottler(false)),
        );
        policy
            .resolver_update(update_with_addresses(&["ignored:1"]), Some(&config), &mut controller)
            .unwrap();
        let default_child = new_subchannels(&drain(&mut events));
        set_state(&mut policy, &default_child[0], ConnectivityState::Ready, &mut controller);
        let state = last_picker(&drain(&mut events)).unwrap();
        assert_eq!(pick_address(&state, &rpc("/S/M")), "D");
        assert!(lookups.try_recv().is_ok());
    }

    #[tokio::test]
    async fn evicted_entries_release_children() {
        // Each entry is larger than the cache, so every insert evicts the
        // previous one.
        let config = config("SYNC_DEFAULT_ON_ERROR", "", 1);
        let mut f = setup(false, &config);
        let state = f.picker();

        assert_eq!(pick_address(&state, &rpc("/S/A")), "queue");
        let (_, respond) = f.lookups.try_recv().unwrap();
        respond
            .send(Ok(RouteLookupResponse {
                targets: vec!["T1".to_string()],
                header_data: String::new(),
            }))
            .unwrap();
        f.run_work().await;
        assert!(f.policy.child_manager.contains(&"T1".to_string()));

        assert_eq!(pick_address(&state, &rpc("/S/B")), "queue");
        let (_, respond) = f.lookups.try_recv().unwrap();
        respond
            .send(Ok(RouteLookupResponse {
                targets: vec!["T2".to_string()],
                header_data: String::new(),
            }))
            .unwrap();
        f.run_work().await;
        assert!(!f.policy.child_manager.contains(&"T1".to_string()));
        assert!(f.policy.child_manager.contains(&"T2".to_string()));
    }

    #[test]
    fn registers_with_service() {
        reg(Arc::new(FakeLookupService {
            tx: mpsc::unbounded_channel().0,
        }));
        assert!(GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).is_some());
    }
}
