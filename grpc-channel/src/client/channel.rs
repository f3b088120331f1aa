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

//! The client channel: a virtual, persistent connection to a named service.
//!
//! A [`Channel`] is idle when created.  The first call activates it: the
//! resolver for the target is built, its results feed the LB policy selected
//! by the service config, and the policy's pickers route calls onto pooled
//! subchannels.  After the idle timeout passes without calls the channel
//! releases all of that again, until the next call.
//!
//! Everything that changes the resolver or the LB policy tree runs on one
//! [`CallbackSerializer`] per activation.  Calls only touch the picker
//! pipeline.

use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataMap, MetadataValue};

use crate::client::idle::{IdleEnforcer, IdlenessManager};
use crate::client::load_balancing::{
    self, CompletionCallback, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyOptions, LbState,
    QueuingPicker, Subchannel, SubchannelState, pick_first,
};
use crate::client::name_resolution::{
    self, Address, DEFAULT_SCHEME, GLOBAL_RESOLVER_REGISTRY, Resolver, ResolverBuilder,
    ResolverOptions, ResolverUpdate, Target,
};
use crate::client::picker_pipeline::PickerPipeline;
use crate::client::service_config::ServiceConfig;
use crate::client::subchannel::{ExternalSubchannel, SubchannelPool};
use crate::client::transport::{GLOBAL_TRANSPORT_REGISTRY, TransportOptions, TransportRegistry};
use crate::client::{CallOptions, ConnectivityState, RequestHeaders};
use crate::metadata::{GRPC_TIMEOUT_HEADER, encode_timeout};
use crate::rt::{Runtime, default_runtime};
use crate::status::Status;
use crate::util::distributor::{Distributor, DistributorError};
use crate::util::serializer::{CallbackSerializer, SerializerHandle};

/// The idle timeout used unless [`ChannelOptions::with_idle_timeout`] says
/// otherwise.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const USER_AGENT_HEADER: &str = "user-agent";
const DEFAULT_USER_AGENT: &str = concat!("grpc-channel/", env!("CARGO_PKG_VERSION"));

/// Settings for a [`Channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    idle_timeout: Option<Duration>,
    default_authority: Option<String>,
    user_agent: Option<String>,
    runtime: Option<Arc<dyn Runtime>>,
    disable_service_config_lookup: bool,
    default_service_config: Option<ServiceConfig>,
    resolver_builder: Option<Arc<dyn ResolverBuilder>>,
    transport_registry: Option<TransportRegistry>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            default_authority: None,
            user_agent: None,
            runtime: None,
            disable_service_config_lookup: false,
            default_service_config: None,
            resolver_builder: None,
            transport_registry: None,
        }
    }
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long the channel stays connected without calls.  `None`
    /// keeps it connected until it is closed.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Overrides the authority calls are made to.  By default the resolver
    /// derives it from the target.
    pub fn with_default_authority(mut self, authority: impl Into<String>) -> Self {
        self.default_authority = Some(authority.into());
        self
    }

    /// Prepends `user_agent` to the channel's user-agent header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Ignores service configs returned by the resolver.  The default service
    /// config is used instead.
    pub fn with_service_config_lookup_disabled(mut self, disabled: bool) -> Self {
        self.disable_service_config_lookup = disabled;
        self
    }

    /// Sets the service config used when the resolver provides none.
    pub fn with_default_service_config(mut self, config: ServiceConfig) -> Self {
        self.default_service_config = Some(config);
        self
    }

    /// Resolves targets with `builder`'s scheme using `builder` instead of
    /// the global resolver registry.
    pub fn with_resolver_builder(mut self, builder: Arc<dyn ResolverBuilder>) -> Self {
        self.resolver_builder = Some(builder);
        self
    }

    /// Connects using `registry` instead of the global transport registry.
    pub fn with_transport_registry(mut self, registry: TransportRegistry) -> Self {
        self.transport_registry = Some(registry);
        self
    }
}

impl Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("idle_timeout", &self.idle_timeout)
            .field("default_authority", &self.default_authority)
            .field("user_agent", &self.user_agent)
            .field(
                "disable_service_config_lookup",
                &self.disable_service_config_lookup,
            )
            .field("default_service_config", &self.default_service_config)
            .field(
                "resolver_scheme",
                &self.resolver_builder.as_ref().map(|b| b.scheme().to_string()),
            )
            .finish()
    }
}

/// A virtual, persistent connection to a service.  Clones share the same
/// channel, which is closed when the last clone is dropped.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<PersistentChannel>,
}

impl Channel {
    /// Constructs a new gRPC channel.  Channel creation cannot fail, but if no
    /// resolver can handle the target, the returned channel will never
    /// connect, and will fail all RPCs.
    ///
    /// Targets whose scheme has no registered resolver are resolved by the
    /// passthrough resolver, with the whole target as the address.
    pub fn new(target: &str, options: ChannelOptions) -> Self {
        let runtime = options.runtime.clone().unwrap_or_else(default_runtime);
        let (target, resolver_builder) =
            select_resolver(target, options.resolver_builder.as_ref());
        let authority = match (&options.default_authority, &resolver_builder) {
            (Some(authority), _) => authority.clone(),
            (None, Ok(builder)) => builder.default_authority(&target),
            (None, Err(_)) => target.endpoint().to_string(),
        };
        let user_agent = match &options.user_agent {
            Some(user_agent) => format!("{user_agent} {DEFAULT_USER_AGENT}"),
            None => DEFAULT_USER_AGENT.to_string(),
        };
        tracing::debug!(uri = %target, %authority, "creating channel");

        let (state, _) = watch::channel(ConnectivityState::Idle);
        let core = Arc::new(ChannelCore {
            transport_options: TransportOptions {
                connect_deadline: None,
                authority: authority.clone(),
            },
            target,
            authority,
            resolver_builder,
            runtime: runtime.clone(),
            user_agent,
            disable_service_config_lookup: options.disable_service_config_lookup,
            default_service_config: options.default_service_config.map(Arc::new),
            transports: options
                .transport_registry
                .unwrap_or_else(|| GLOBAL_TRANSPORT_REGISTRY.clone()),
            pool: SubchannelPool::new(),
            pipeline: PickerPipeline::new(),
            state,
            service_config: Distributor::new(),
            closed: CancellationToken::new(),
            active: Mutex::new(None),
            activation: AtomicU64::new(0),
        });
        let enforcer = Arc::new(ChannelEnforcer {
            core: Arc::downgrade(&core),
        });
        let idle = IdlenessManager::new(enforcer, options.idle_timeout, runtime);
        Self {
            inner: Arc::new(PersistentChannel { core, idle }),
        }
    }

    /// The authority calls on this channel are made to.
    pub fn authority(&self) -> &str {
        &self.inner.core.authority
    }

    /// Returns the current state of the channel.  If `connect` is set and the
    /// channel is idle, it starts connecting.
    ///
    /// Connecting spawns tasks on the channel's runtime.
    pub fn state(&self, connect: bool) -> ConnectivityState {
        let state = *self.inner.core.state.borrow();
        if connect && state == ConnectivityState::Idle {
            self.connect();
        }
        state
    }

    /// Waits until the channel's state differs from `source` and returns the
    /// new state.  Returns immediately once the channel is shut down.
    pub async fn wait_for_state_change(&self, source: ConnectivityState) -> ConnectivityState {
        let mut rx = self.inner.core.state.subscribe();
        match rx
            .wait_for(|state| *state != source || *state == ConnectivityState::Shutdown)
            .await
        {
            Ok(state) => *state,
            Err(_) => ConnectivityState::Shutdown,
        }
    }

    /// Leaves idle, if the channel is idle, and asks the LB policy to connect.
    pub fn connect(&self) {
        let core = &self.inner.core;
        if core.closed.is_cancelled() {
            return;
        }
        if let Err(status) = self.inner.idle.exit_idle() {
            tracing::warn!(%status, "channel failed to exit idle");
            return;
        }
        core.schedule(|channel| channel.exit_idle());
    }

    /// Starts a call to `method` ("/service/method") and waits until a
    /// subchannel is picked for it.
    ///
    /// The first call waits for the resolver's first result, so that the
    /// method's service config settings are known.  Those settings apply when
    /// `options` leaves them unset; a service config timeout only ever
    /// shortens the call's deadline.
    pub async fn start_call(&self, method: &str, options: CallOptions) -> Result<CallHandle, Status> {
        let core = &self.inner.core;
        if core.closed.is_cancelled() {
            return Err(Status::cancelled("channel is closed"));
        }
        let started = Instant::now();
        self.inner.idle.on_call_begin()?;
        let guard = CallGuard {
            channel: self.inner.clone(),
        };

        let config = with_deadline(&core.runtime, options.deadline(), async {
            core.service_config
                .wait(options.cancellation())
                .await
                .map_err(|err| match err {
                    DistributorError::AlreadyClosed => Status::cancelled("channel is closed"),
                    DistributorError::Cancelled => {
                        Status::cancelled("call cancelled while waiting for name resolution")
                    }
                })
        })
        .await?;

        let method_config = config.method_config(method);
        let wait_for_ready = options
            .wait_for_ready()
            .or(method_config.and_then(|m| m.wait_for_ready))
            .unwrap_or(false);
        // A timeout too large to represent as an instant imposes no deadline.
        let config_deadline = method_config
            .and_then(|m| m.timeout)
            .and_then(|timeout| started.checked_add(timeout));
        let deadline = match (options.deadline(), config_deadline) {
            (Some(deadline), Some(config_deadline)) => Some(deadline.min(config_deadline)),
            (deadline, config_deadline) => deadline.or(config_deadline),
        };

        let request = RequestHeaders::new()
            .with_method_name(method)
            .with_authority(core.authority.clone())
            .with_metadata(options.metadata().clone());
        let pick = with_deadline(
            &core.runtime,
            deadline,
            core.pipeline
                .pick(&request, wait_for_ready, options.cancellation()),
        )
        .await?;

        let mut metadata = request.metadata().clone();
        for entry in pick.metadata.iter() {
            match entry {
                KeyAndValueRef::Ascii(key, value) => {
                    metadata.append(key, value.clone());
                }
                KeyAndValueRef::Binary(key, value) => {
                    metadata.append_bin(key, value.clone());
                }
            }
        }
        if let Some(deadline) = deadline {
            let timeout = encode_timeout(deadline.saturating_duration_since(Instant::now()));
            if let Ok(value) = MetadataValue::<Ascii>::try_from(timeout) {
                metadata.insert(GRPC_TIMEOUT_HEADER, value);
            }
        }
        if let Ok(value) = MetadataValue::<Ascii>::try_from(core.user_agent.as_str()) {
            metadata.insert(USER_AGENT_HEADER, value);
        }

        tracing::trace!(method, subchannel = %pick.subchannel, "call started");
        Ok(CallHandle {
            connection: pick.subchannel.connection(),
            subchannel: pick.subchannel,
            metadata,
            deadline,
            on_complete: pick.on_complete,
            _guard: guard,
        })
    }

    /// Closes the channel.  Calls waiting for a pick complete with Cancelled,
    /// later calls fail with Cancelled, and the state becomes Shutdown for
    /// good.  Calls already started keep their connections until they finish.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.core.target.to_string())
            .field("state", &*self.inner.core.state.borrow())
            .finish()
    }
}

/// A call that was routed to a subchannel.
///
/// Finish it with the call's final status.  Dropping it unfinished reports
/// Cancelled to the LB policy that picked it.
pub struct CallHandle {
    connection: Option<Arc<dyn Any + Send + Sync>>,
    subchannel: Arc<dyn Subchannel>,
    metadata: MetadataMap,
    deadline: Option<Instant>,
    on_complete: Option<CompletionCallback>,
    _guard: CallGuard,
}

impl CallHandle {
    /// The address of the picked subchannel.
    pub fn address(&self) -> Address {
        self.subchannel.address()
    }

    /// The connection established by the transport of the picked subchannel.
    pub fn connection(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.connection.as_ref()
    }

    /// The metadata to send: the call's own, what the LB policy added, the
    /// encoded timeout and the user agent.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn finish(mut self, status: Status) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&status);
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&Status::cancelled("call dropped before it finished"));
        }
    }
}

impl Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("subchannel", &self.subchannel)
            .field("deadline", &self.deadline)
            .finish()
    }
}

// Counts the call as active until dropped.
struct CallGuard {
    channel: Arc<PersistentChannel>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.channel.idle.on_call_end();
    }
}

async fn with_deadline<T>(
    runtime: &Arc<dyn Runtime>,
    deadline: Option<Instant>,
    future: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    let Some(deadline) = deadline else {
        return future.await;
    };
    let expired = runtime.sleep(deadline.saturating_duration_since(Instant::now()));
    tokio::select! {
        result = future => result,
        _ = expired => Err(Status::deadline_exceeded(
            "deadline exceeded while waiting for a connection",
        )),
    }
}

// Picks the resolver for `target`: the channel's own builder or a registered
// one for its scheme, else passthrough on the whole target string.
fn select_resolver(
    target: &str,
    local: Option<&Arc<dyn ResolverBuilder>>,
) -> (Target, Result<Arc<dyn ResolverBuilder>, String>) {
    let lookup = |scheme: &str| {
        local
            .filter(|builder| builder.scheme().eq_ignore_ascii_case(scheme))
            .cloned()
            .or_else(|| GLOBAL_RESOLVER_REGISTRY.get(scheme))
    };
    let parsed = Target::parse(target);
    if !parsed.scheme().is_empty() {
        if let Some(builder) = lookup(parsed.scheme()) {
            return (parsed, Ok(builder));
        }
    }
    let fallback = Target::with_default_scheme(target, DEFAULT_SCHEME);
    let builder =
        lookup(DEFAULT_SCHEME).ok_or_else(|| format!("no resolver registered for {target}"));
    (fallback, builder)
}

// The static configuration of a channel plus the active channel, if any.  A
// channel is active whenever it is not idle.
struct PersistentChannel {
    core: Arc<ChannelCore>,
    idle: IdlenessManager,
}

impl PersistentChannel {
    fn close(&self) {
        if self.core.closed.is_cancelled() {
            return;
        }
        tracing::debug!(uri = %self.core.target, "closing channel");
        self.core.closed.cancel();
        self.idle.close();
        self.core.shutdown();
    }
}

impl Drop for PersistentChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct ChannelEnforcer {
    core: Weak<ChannelCore>,
}

impl IdleEnforcer for ChannelEnforcer {
    fn enter_idle(&self) {
        if let Some(core) = self.core.upgrade() {
            core.deactivate();
        }
    }

    fn exit_idle(&self) -> Result<(), Status> {
        match self.core.upgrade() {
            Some(core) => core.activate(),
            None => Err(Status::cancelled("channel is closed")),
        }
    }
}

struct ChannelCore {
    target: Target,
    authority: String,
    resolver_builder: Result<Arc<dyn ResolverBuilder>, String>,
    runtime: Arc<dyn Runtime>,
    user_agent: String,
    disable_service_config_lookup: bool,
    default_service_config: Option<Arc<ServiceConfig>>,
    transports: TransportRegistry,
    transport_options: TransportOptions,
    pool: Arc<SubchannelPool>,
    pipeline: PickerPipeline,
    state: watch::Sender<ConnectivityState>,
    service_config: Distributor<Arc<ServiceConfig>>,
    closed: CancellationToken,
    active: Mutex<Option<CallbackSerializer<ActiveChannel>>>,
    // Bumped whenever the channel goes idle.  Pickers from older activations
    // are discarded.
    activation: AtomicU64,
}

impl ChannelCore {
    fn activate(self: &Arc<Self>) -> Result<(), Status> {
        if self.closed.is_cancelled() {
            return Err(Status::cancelled("channel is closed"));
        }
        let mut active = self.active.lock();
        if active.is_some() {
            return Ok(());
        }
        tracing::debug!(uri = %self.target, "channel exiting idle");
        self.set_state(ConnectivityState::Connecting);
        let activation = self.activation.load(Ordering::Acquire);
        let serializer = CallbackSerializer::new(ActiveChannel::default(), &self.runtime);
        let handle = serializer.handle();
        let core = self.clone();
        serializer.schedule(move |channel| channel.start(core, activation, handle));
        *active = Some(serializer);
        Ok(())
    }

    fn deactivate(&self) {
        let serializer = {
            let mut active = self.active.lock();
            self.activation.fetch_add(1, Ordering::AcqRel);
            active.take()
        };
        let Some(serializer) = serializer else {
            return;
        };
        serializer.close();
        drop(serializer);
        if !self.closed.is_cancelled() {
            tracing::debug!(uri = %self.target, "channel entering idle");
            self.pipeline.update(Arc::new(QueuingPicker {}));
            self.set_state(ConnectivityState::Idle);
        }
    }

    fn shutdown(&self) {
        self.set_state(ConnectivityState::Shutdown);
        self.pipeline.close();
        self.service_config.close();
        self.deactivate();
    }

    fn schedule(&self, callback: impl FnOnce(&mut ActiveChannel) + Send + 'static) {
        if let Some(serializer) = self.active.lock().as_ref() {
            serializer.schedule(callback);
        }
    }

    // Shutdown is never left.
    fn set_state(&self, state: ConnectivityState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == ConnectivityState::Shutdown {
                return false;
            }
            *current = state;
            true
        });
    }

    fn update_picker(&self, activation: u64, update: LbState) {
        let _active = self.active.lock();
        if self.closed.is_cancelled() || self.activation.load(Ordering::Acquire) != activation {
            return;
        }
        tracing::debug!(state = %update.connectivity_state, "channel picker updated");
        self.set_state(update.connectivity_state);
        self.pipeline.update(update.picker);
    }

    fn default_config(&self) -> Arc<ServiceConfig> {
        self.default_service_config.clone().unwrap_or_default()
    }
}

// The resolver and LB policy of one activation.  Only touched from the
// activation's serializer.
#[derive(Default)]
struct ActiveChannel {
    resolver: Option<Box<dyn Resolver>>,
    lb: Option<LbRoot>,
}

impl ActiveChannel {
    fn start(
        &mut self,
        core: Arc<ChannelCore>,
        activation: u64,
        handle: SerializerHandle<ActiveChannel>,
    ) {
        let builder = match &core.resolver_builder {
            Ok(builder) => builder.clone(),
            Err(err) => {
                tracing::warn!(%err, "channel cannot resolve its target");
                core.service_config.set(core.default_config());
                core.update_picker(
                    activation,
                    LbState::failing(Status::unavailable(err.clone())),
                );
                return;
            }
        };
        let options = ResolverOptions::new(
            core.authority.clone(),
            core.runtime.clone(),
            Arc::new(ResolverWorkScheduler {
                handle: handle.clone(),
            }),
        );
        self.resolver = Some(builder.build(&core.target, options));
        self.lb = Some(LbRoot {
            core,
            handle,
            activation,
            policy: None,
            next_generation: 0,
            service_config: None,
            resolution_requested: false,
        });
    }

    fn resolver_work(&mut self) {
        let (Some(resolver), Some(lb)) = (self.resolver.as_mut(), self.lb.as_mut()) else {
            return;
        };
        resolver.work(lb);
        self.flush_resolution_request();
    }

    fn lb_work(&mut self, generation: u64) {
        if let Some(lb) = self.lb.as_mut() {
            lb.with_policy(Some(generation), |policy, cc| policy.work(cc));
        }
        self.flush_resolution_request();
    }

    fn subchannel_update(
        &mut self,
        generation: u64,
        subchannel: Arc<ExternalSubchannel>,
        state: SubchannelState,
    ) {
        if let Some(lb) = self.lb.as_mut() {
            let subchannel: Arc<dyn Subchannel> = subchannel;
            lb.with_policy(Some(generation), |policy, cc| {
                policy.subchannel_update(subchannel, &state, cc)
            });
        }
        self.flush_resolution_request();
    }

    fn exit_idle(&mut self) {
        if let Some(lb) = self.lb.as_mut() {
            lb.with_policy(None, |policy, cc| policy.exit_idle(cc));
        }
        self.flush_resolution_request();
    }

    fn flush_resolution_request(&mut self) {
        let (Some(resolver), Some(lb)) = (self.resolver.as_mut(), self.lb.as_mut()) else {
            return;
        };
        if std::mem::take(&mut lb.resolution_requested) {
            tracing::debug!("LB policy requested re-resolution");
            resolver.resolve_now();
        }
    }
}

struct RootPolicy {
    name: &'static str,
    generation: u64,
    policy: Box<dyn LbPolicy>,
}

// Receives resolver results and owns the top of the LB policy tree.
struct LbRoot {
    core: Arc<ChannelCore>,
    handle: SerializerHandle<ActiveChannel>,
    activation: u64,
    policy: Option<RootPolicy>,
    next_generation: u64,
    // The config currently applied.
    service_config: Option<Arc<ServiceConfig>>,
    resolution_requested: bool,
}

impl LbRoot {
    // Runs `f` against the current policy, or the policy of `generation` if
    // given.  Subchannel updates and work requests from replaced policies are
    // dropped.
    fn with_policy<R>(
        &mut self,
        generation: Option<u64>,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn load_balancing::ChannelController) -> R,
    ) -> Option<R> {
        let root = self.policy.as_mut()?;
        if generation.is_some_and(|g| g != root.generation) {
            return None;
        }
        let mut controller = LbController {
            core: &self.core,
            handle: &self.handle,
            activation: self.activation,
            generation: root.generation,
            resolution_requested: &mut self.resolution_requested,
        };
        Some(f(root.policy.as_mut(), &mut controller))
    }

    fn select_service_config(
        &self,
        from_resolver: &Result<Option<ServiceConfig>, String>,
    ) -> Result<Arc<ServiceConfig>, String> {
        if self.core.disable_service_config_lookup {
            return Ok(self.core.default_config());
        }
        match from_resolver {
            Ok(Some(config)) => Ok(Arc::new(config.clone())),
            Ok(None) => Ok(self.core.default_config()),
            Err(err) => {
                tracing::warn!(%err, "resolver returned an invalid service config");
                if let Some(previous) = &self.service_config {
                    return Ok(previous.clone());
                }
                self.core
                    .default_service_config
                    .clone()
                    .ok_or_else(|| err.clone())
            }
        }
    }

    fn apply_service_config(&mut self, config: Arc<ServiceConfig>) {
        self.service_config = Some(config.clone());
        self.core.service_config.set(config);
    }

    fn fail(&self, status: Status) {
        self.core
            .update_picker(self.activation, LbState::failing(status));
    }
}

impl name_resolution::ChannelController for LbRoot {
    fn update(&mut self, update: ResolverUpdate) -> Result<(), String> {
        if let Err(err) = &update.endpoints {
            let err = err.clone();
            tracing::debug!(%err, "resolver reported an error");
            if self.service_config.is_none() {
                self.apply_service_config(self.core.default_config());
            }
            if self.policy.is_some() {
                self.with_policy(None, |policy, cc| policy.resolver_error(err.clone(), cc));
            } else {
                self.fail(Status::unavailable(format!(
                    "name resolution failed: {err}"
                )));
            }
            return Err(err);
        }

        let config = match self.select_service_config(&update.service_config) {
            Ok(config) => config,
            Err(err) => {
                self.fail(Status::unavailable(format!("invalid service config: {err}")));
                return Err(err);
            }
        };
        self.apply_service_config(config.clone());

        let Some(builder) = config
            .lb_policy()
            .cloned()
            .or_else(|| GLOBAL_LB_REGISTRY.get_policy(pick_first::POLICY_NAME))
        else {
            let err = "no LB policy available".to_string();
            self.fail(Status::internal(err.clone()));
            return Err(err);
        };
        if self
            .policy
            .as_ref()
            .is_none_or(|root| root.name != builder.name())
        {
            self.next_generation += 1;
            tracing::debug!(policy = builder.name(), "channel building LB policy");
            let policy = builder.build(LbPolicyOptions {
                work_scheduler: Arc::new(LbWorkScheduler {
                    handle: self.handle.clone(),
                    generation: self.next_generation,
                }),
                runtime: self.core.runtime.clone(),
            });
            self.policy = Some(RootPolicy {
                name: builder.name(),
                generation: self.next_generation,
                policy,
            });
        }

        let result = self.with_policy(None, |policy, cc| {
            policy.resolver_update(update, config.lb_config(), cc)
        });
        match result {
            Some(Err(err)) => {
                tracing::warn!(%err, "LB policy rejected resolver update");
                self.resolution_requested = true;
                Err(err.to_string())
            }
            _ => Ok(()),
        }
    }

    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String> {
        ServiceConfig::parse(config).map_err(|err| err.to_string())
    }
}

// The channel as seen by one LB policy.
struct LbController<'a> {
    core: &'a Arc<ChannelCore>,
    handle: &'a SerializerHandle<ActiveChannel>,
    activation: u64,
    generation: u64,
    resolution_requested: &'a mut bool,
}

impl load_balancing::ChannelController for LbController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let core = self.core;
        let isc = core.pool.get_or_create(
            address,
            || core.transports.get_transport(address.network_type),
            &core.transport_options,
            &core.runtime,
        );
        let subchannel = ExternalSubchannel::new(isc);
        let handle = self.handle.clone();
        let generation = self.generation;
        subchannel.watch(move |subchannel, state| {
            handle.schedule(move |channel| {
                channel.subchannel_update(generation, subchannel, state)
            });
        });
        tracing::debug!(%address, "created subchannel");
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.core.update_picker(self.activation, update);
    }

    fn request_resolution(&mut self) {
        *self.resolution_requested = true;
    }
}

struct ResolverWorkScheduler {
    handle: SerializerHandle<ActiveChannel>,
}

impl name_resolution::WorkScheduler for ResolverWorkScheduler {
    fn schedule_work(&self) {
        self.handle.schedule(|channel| channel.resolver_work());
    }
}

struct LbWorkScheduler {
    handle: SerializerHandle<ActiveChannel>,
    generation: u64,
}

impl load_balancing::WorkScheduler for LbWorkScheduler {
    fn schedule_work(&self) {
        let generation = self.generation;
        self.handle
            .schedule(move |channel| channel.lb_work(generation));
    }
}
