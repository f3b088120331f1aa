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

//! The round_robin LB policy: keeps a connection to every resolved address and
//! spreads RPCs evenly across the ready ones.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::client::load_balancing::{
    ChannelController, FailingPicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Pick,
    PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
};
use crate::client::name_resolution::delta::{self, AddressChange};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::{ConnectivityState, RequestHeaders};
use crate::status::Status;

pub static POLICY_NAME: &str = "round_robin";

pub(crate) struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            addresses: Vec::new(),
            subchannels: HashMap::new(),
            connectivity_state: ConnectivityState::Connecting,
            last_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct TrackedSubchannel {
    subchannel: Arc<dyn Subchannel>,
    state: ConnectivityState,
}

struct RoundRobinPolicy {
    // The address list the subchannels were last reconciled against.
    addresses: Vec<Address>,
    subchannels: HashMap<Address, TrackedSubchannel>,
    connectivity_state: ConnectivityState,
    last_error: Option<String>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Err(error) = &update.endpoints {
            self.resolver_error(error.clone(), channel_controller);
            return Err(error.clone().into());
        }
        let mut new_addresses = update.addresses();
        let mut seen = std::collections::HashSet::new();
        new_addresses.retain(|address| seen.insert(address.clone()));

        let changes = delta::diff(&self.addresses, &new_addresses);
        for change in changes {
            match change {
                AddressChange::Delete(address) => {
                    self.subchannels.remove(&address);
                }
                AddressChange::Add(address) => {
                    let subchannel = channel_controller.new_subchannel(&address);
                    subchannel.connect();
                    self.subchannels.insert(
                        address,
                        TrackedSubchannel {
                            subchannel,
                            state: ConnectivityState::Idle,
                        },
                    );
                }
            }
        }
        self.addresses = new_addresses;

        if self.addresses.is_empty() {
            self.last_error = Some("received empty address list from the name resolver".into());
            self.connectivity_state = ConnectivityState::TransientFailure;
            self.send_picker(channel_controller);
            channel_controller.request_resolution();
            return Err("received empty address list from the name resolver".into());
        }
        self.update_state(channel_controller);
        Ok(())
    }

    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController) {
        self.last_error = Some(error);
        if self.subchannels.is_empty()
            || self.connectivity_state == ConnectivityState::TransientFailure
        {
            self.connectivity_state = ConnectivityState::TransientFailure;
            self.send_picker(channel_controller);
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(tracked) = self
            .subchannels
            .get_mut(&subchannel.address())
            .filter(|tracked| tracked.subchannel == subchannel.clone())
        else {
            return;
        };
        tracked.state = state.connectivity_state;
        match state.connectivity_state {
            ConnectivityState::Idle => tracked.subchannel.connect(),
            ConnectivityState::TransientFailure => {
                if let Some(error) = &state.last_connection_error {
                    self.last_error = Some(error.to_string());
                }
                channel_controller.request_resolution();
            }
            _ => {}
        }
        self.update_state(channel_controller);
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for tracked in self.subchannels.values() {
            if tracked.state == ConnectivityState::Idle {
                tracked.subchannel.connect();
            }
        }
    }
}

impl RoundRobinPolicy {
    // Recomputes the aggregate state.  Once in TRANSIENT_FAILURE the policy
    // stays there until a subchannel becomes READY.
    fn update_state(&mut self, channel_controller: &mut dyn ChannelController) {
        let states = || self.subchannels.values().map(|t| t.state);
        let new_state = if states().any(|s| s == ConnectivityState::Ready) {
            ConnectivityState::Ready
        } else if states().all(|s| s == ConnectivityState::TransientFailure)
            || self.connectivity_state == ConnectivityState::TransientFailure
        {
            ConnectivityState::TransientFailure
        } else {
            ConnectivityState::Connecting
        };
        self.connectivity_state = new_state;
        self.send_picker(channel_controller);
    }

    fn send_picker(&self, channel_controller: &mut dyn ChannelController) {
        let picker: Arc<dyn Picker> = match self.connectivity_state {
            ConnectivityState::Ready => {
                // Keep the address order so consecutive pickers rotate the
                // same way.
                let ready: Vec<_> = self
                    .addresses
                    .iter()
                    .filter_map(|address| self.subchannels.get(address))
                    .filter(|t| t.state == ConnectivityState::Ready)
                    .map(|t| t.subchannel.clone())
                    .collect();
                Arc::new(RoundRobinPicker::new(ready))
            }
            ConnectivityState::TransientFailure => {
                let error = self.last_error.as_deref().unwrap_or("all addresses failed");
                Arc::new(FailingPicker::new(Status::unavailable(format!(
                    "round_robin: {error}"
                ))))
            }
            _ => Arc::new(QueuingPicker {}),
        };
        tracing::trace!(state = %self.connectivity_state, "round_robin updating picker");
        channel_controller.update_picker(LbState {
            connectivity_state: self.connectivity_state,
            picker,
        });
    }
}

struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        let start = if subchannels.is_empty() {
            0
        } else {
            fastrand::usize(..subchannels.len())
        };
        Self {
            subchannels,
            next: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &RequestHeaders) -> PickResult {
        if self.subchannels.is_empty() {
            return PickResult::Queue;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick::new(self.subchannels[idx].clone()))
    }
}
