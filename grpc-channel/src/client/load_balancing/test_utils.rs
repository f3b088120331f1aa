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

use std::any::Any;
use std::error::Error;
use std::fmt::Debug;
use std::sync::{Arc, Once};

use tokio::sync::mpsc;

use crate::client::load_balancing::{
    ChannelController, FailingPicker, GLOBAL_LB_REGISTRY, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, Pick, PickResult, Picker, QueuingPicker,
    Subchannel, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::{ConnectivityState, RequestHeaders};
use crate::rt::default_runtime;
use crate::status::Status;

// A test subchannel that forwards connect calls to a channel.
// This allows tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_connect: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    pub(crate) fn new(address: Address, tx_connect: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            address,
            tx_connect,
        }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self
            .tx_connect
            .send(TestEvent::Connect(self.address.clone()));
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({:?})", addr.address),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestChannelController {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<TestEvent>) {
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        (Self { tx_events }, rx_events)
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        let _ = self
            .tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        let _ = self.tx_events.send(TestEvent::UpdatePicker(update));
    }

    fn request_resolution(&mut self) {
        let _ = self.tx_events.send(TestEvent::RequestResolution);
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

/// Returns policy options whose work scheduler reports to `tx_events`.
pub(crate) fn test_options(tx_events: &mpsc::UnboundedSender<TestEvent>) -> LbPolicyOptions {
    LbPolicyOptions {
        work_scheduler: Arc::new(TestWorkScheduler {
            tx_events: tx_events.clone(),
        }),
        runtime: default_runtime(),
    }
}

/// Builds an update with one single-address endpoint per address.
pub(crate) fn update_with_addresses(addresses: &[&str]) -> ResolverUpdate {
    ResolverUpdate::from_endpoints(
        addresses
            .iter()
            .map(|a| Endpoint::new(vec![Address::tcp(*a)]))
            .collect(),
    )
}

/// Drains every pending event.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Vec<TestEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Returns the subchannels created, in order, among `events`.
pub(crate) fn new_subchannels(events: &[TestEvent]) -> Vec<Arc<dyn Subchannel>> {
    events
        .iter()
        .filter_map(|e| match e {
            TestEvent::NewSubchannel(sc) => Some(sc.clone()),
            _ => None,
        })
        .collect()
}

/// Returns the last picker update among `events`.
pub(crate) fn last_picker(events: &[TestEvent]) -> Option<LbState> {
    events.iter().rev().find_map(|e| match e {
        TestEvent::UpdatePicker(state) => Some(state.clone()),
        _ => None,
    })
}

pub(crate) fn request(method: &str) -> RequestHeaders {
    RequestHeaders::new().with_method_name(method)
}

/// Picks with `state`'s picker and returns the address picked, or a short
/// description of the non-pick result.
pub(crate) fn pick_address(state: &LbState, request: &RequestHeaders) -> String {
    match state.picker.pick(request) {
        PickResult::Pick(pick) => pick.subchannel.address().address,
        PickResult::Queue => "queue".to_string(),
        PickResult::Fail(status) => format!("fail: {}", status.message()),
        PickResult::Drop(status) => format!("drop: {}", status.message()),
    }
}

/// Reports `state` for `subchannel` to `policy`.
pub(crate) fn set_state(
    policy: &mut dyn LbPolicy,
    subchannel: &Arc<dyn Subchannel>,
    state: ConnectivityState,
    controller: &mut dyn ChannelController,
) {
    policy.subchannel_update(subchannel.clone(), &SubchannelState::new(state), controller);
}

type ResolverUpdateFn = dyn Fn(
        &mut Data,
        ResolverUpdate,
        Option<&LbConfig>,
        &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    + Send
    + Sync;

type SubchannelUpdateFn =
    dyn Fn(&mut Data, Arc<dyn Subchannel>, &SubchannelState, &mut dyn ChannelController)
        + Send
        + Sync;

/// This struct holds `LbPolicy` trait stub functions that tests are expected to implement.
#[derive(Clone, Default)]
pub(crate) struct PolicyFuncs {
    pub(crate) resolver_update: Option<Arc<ResolverUpdateFn>>,
    pub(crate) subchannel_update: Option<Arc<SubchannelUpdateFn>>,
    pub(crate) work: Option<Arc<dyn Fn(&mut Data, &mut dyn ChannelController) + Send + Sync>>,
    pub(crate) exit_idle: Option<Arc<dyn Fn(&mut Data, &mut dyn ChannelController) + Send + Sync>>,
}

impl PolicyFuncs {
    pub(crate) fn on_resolver_update(
        mut self,
        f: impl Fn(
            &mut Data,
            ResolverUpdate,
            Option<&LbConfig>,
            &mut dyn ChannelController,
        ) -> Result<(), Box<dyn Error + Send + Sync>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.resolver_update = Some(Arc::new(f));
        self
    }

    pub(crate) fn on_subchannel_update(
        mut self,
        f: impl Fn(&mut Data, Arc<dyn Subchannel>, &SubchannelState, &mut dyn ChannelController)
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.subchannel_update = Some(Arc::new(f));
        self
    }

    pub(crate) fn on_work(
        mut self,
        f: impl Fn(&mut Data, &mut dyn ChannelController) + Send + Sync + 'static,
    ) -> Self {
        self.work = Some(Arc::new(f));
        self
    }

    pub(crate) fn on_exit_idle(
        mut self,
        f: impl Fn(&mut Data, &mut dyn ChannelController) + Send + Sync + 'static,
    ) -> Self {
        self.exit_idle = Some(Arc::new(f));
        self
    }
}

/// Data holds test data that will be passed all to functions in PolicyFuncs
pub(crate) struct Data {
    pub(crate) options: LbPolicyOptions,
    pub(crate) test_data: Option<Box<dyn Any + Send + Sync>>,
}

/// The stub `LbPolicy` that calls the provided functions.
pub(crate) struct StubPolicy {
    funcs: PolicyFuncs,
    data: Data,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(f) = &self.funcs.resolver_update {
            return f(&mut self.data, update, config, channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(f) = &self.funcs.subchannel_update {
            f(&mut self.data, subchannel, state, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.work {
            f(&mut self.data, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.exit_idle {
            f(&mut self.data, channel_controller);
        }
    }
}

/// This StubPolicyBuilder builds a StubPolicy.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    funcs: PolicyFuncs,
}

impl StubPolicyBuilder {
    pub(crate) fn new(name: &'static str, funcs: PolicyFuncs) -> Self {
        Self { name, funcs }
    }
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(StubPolicy {
            funcs: self.funcs.clone(),
            data: Data {
                options,
                test_data: None,
            },
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(Some(LbConfig::new(config.value.clone())))
    }
}

/// A picker that always picks the same subchannel.
pub(crate) struct FixedPicker(pub(crate) Arc<dyn Subchannel>);

impl Picker for FixedPicker {
    fn pick(&self, _request: &RequestHeaders) -> PickResult {
        PickResult::Pick(Pick::new(self.0.clone()))
    }
}

/// The name of a child policy that creates one subchannel for the "backend"
/// field of its JSON config and mirrors that subchannel's state.
pub(crate) const BACKEND_STUB_POLICY: &str = "backend_stub";

/// Registers the [`BACKEND_STUB_POLICY`] policy in the global registry.
pub(crate) fn reg_backend_stub() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(StubPolicyBuilder::new(
            BACKEND_STUB_POLICY,
            backend_stub_funcs(),
        ))
    });
}

fn backend_stub_funcs() -> PolicyFuncs {
    PolicyFuncs::default()
        .on_resolver_update(|data, _update, config, controller| {
            if data.test_data.is_some() {
                return Ok(());
            }
            let backend = config
                .and_then(|c| c.convert_to::<serde_json::Value>())
                .and_then(|v| v["backend"].as_str().map(str::to_string))
                .ok_or("backend_stub: missing backend")?;
            let subchannel = controller.new_subchannel(&Address::tcp(backend));
            data.test_data = Some(Box::new(subchannel));
            Ok(())
        })
        .on_subchannel_update(|_, subchannel, state, controller| {
            let picker: Arc<dyn Picker> = match state.connectivity_state {
                ConnectivityState::Ready => Arc::new(FixedPicker(subchannel)),
                ConnectivityState::TransientFailure => Arc::new(FailingPicker::new(
                    Status::unavailable(format!("{} is down", subchannel.address().address)),
                )),
                _ => Arc::new(QueuingPicker {}),
            };
            controller.update_picker(LbState {
                connectivity_state: state.connectivity_state,
                picker,
            });
        })
        .on_exit_idle(|data, _| {
            if let Some(subchannel) = data
                .test_data
                .as_ref()
                .and_then(|d| d.downcast_ref::<Arc<dyn Subchannel>>())
            {
                subchannel.connect();
            }
        })
}
