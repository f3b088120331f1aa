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

//! The pick_first LB policy: connects to the resolved addresses in order and
//! sends every RPC to the first one that becomes ready.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::client::ConnectivityState;
use crate::client::RequestHeaders;
use crate::client::load_balancing::{
    ChannelController, FailingPicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    ParsedJsonLbConfig, Pick, PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
    WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::status::Status;

pub static POLICY_NAME: &str = "pick_first";

pub(crate) struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            subchannel_list: None,
            selected_subchannel: None,
            addresses: vec![],
            last_resolver_error: None,
            last_connection_error: None,
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = config
            .convert_to()
            .map_err(|e| format!("failed to parse JSON config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PickFirstConfig {
    #[serde(default)]
    shuffle_address_list: bool,
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    subchannel_list: Option<SubchannelList>, // Subchannels we are currently connecting to.
    selected_subchannel: Option<Arc<dyn Subchannel>>,
    addresses: Vec<Address>, // Most recent addresses from the name resolver.
    last_resolver_error: Option<String>,
    last_connection_error: Option<String>,
    connectivity_state: ConnectivityState,
    sent_connecting_state: bool,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut endpoints = match update.endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                self.resolver_error(error.clone(), channel_controller);
                return Err(error.into());
            }
        };
        if config
            .and_then(|c| c.convert_to::<PickFirstConfig>())
            .is_some_and(|c| c.shuffle_address_list)
        {
            endpoints.shuffle(&mut rand::rng());
        }

        let new_addresses = address_list_from_endpoints(&endpoints);
        if new_addresses.is_empty() {
            self.subchannel_list = None;
            self.selected_subchannel = None;
            self.addresses = vec![];
            self.last_resolver_error =
                Some("received empty address list from the name resolver".to_string());
            self.move_to_transient_failure(channel_controller);
            return Err("received empty address list from the name resolver".into());
        }
        tracing::debug!(addresses = new_addresses.len(), "pick_first received addresses");

        // Keep using the selected subchannel if it is still present.
        let keep_selected = self
            .selected_subchannel
            .as_ref()
            .is_some_and(|sc| new_addresses.contains(&sc.address()));
        if !keep_selected {
            self.selected_subchannel = None;
        }
        self.addresses = new_addresses;
        if keep_selected || self.connectivity_state == ConnectivityState::Idle {
            return Ok(());
        }
        self.start_connecting(channel_controller);
        Ok(())
    }

    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController) {
        tracing::debug!(%error, "pick_first received resolver error");
        self.last_resolver_error = Some(error);
        // Keep using a previous good update, if one exists.
        if self.addresses.is_empty()
            || self.connectivity_state == ConnectivityState::TransientFailure
        {
            self.move_to_transient_failure(channel_controller);
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Any state change for the connected subchannel means that we are no
        // longer connected.
        if self
            .selected_subchannel
            .as_ref()
            .is_some_and(|selected| *selected == subchannel.clone())
        {
            if state.connectivity_state != ConnectivityState::Ready {
                self.move_to_idle(channel_controller);
            }
            return;
        }

        let Some(list) = self.subchannel_list.as_mut() else {
            return;
        };
        if !list.contains(&subchannel) {
            tracing::trace!(%subchannel, "pick_first ignoring update for unknown subchannel");
            return;
        }
        list.states
            .insert(subchannel.clone(), state.connectivity_state);

        match state.connectivity_state {
            ConnectivityState::Ready => self.move_to_ready(subchannel, channel_controller),
            ConnectivityState::Idle => {
                // Reconnect subchannels coming out of backoff once every
                // address has been tried.
                if list.first_pass_complete {
                    subchannel.connect();
                }
            }
            ConnectivityState::Connecting => {
                if self.connectivity_state != ConnectivityState::TransientFailure
                    && !self.sent_connecting_state
                {
                    self.move_to_connecting(channel_controller);
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state
                    .last_connection_error
                    .as_ref()
                    .map(|err| err.to_string());
                if list.first_pass_complete {
                    if list.all_failed() {
                        self.move_to_transient_failure(channel_controller);
                    }
                    return;
                }
                if list.is_current(&subchannel) && !list.connect_to_next() {
                    list.first_pass_complete = true;
                    list.connect_to_all_idle();
                    self.move_to_transient_failure(channel_controller);
                }
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.exit_idle(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state == ConnectivityState::Idle && !self.addresses.is_empty() {
            self.start_connecting(channel_controller);
        }
    }
}

impl PickFirstPolicy {
    // Builds a new subchannel list with the most recent addresses received
    // from the name resolver, and starts connecting from the first address.
    fn start_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut list = SubchannelList::new(&self.addresses, channel_controller);
        list.connect_to_next();
        self.subchannel_list = Some(list);
        if self.connectivity_state != ConnectivityState::TransientFailure {
            self.move_to_connecting(channel_controller);
        }
    }

    fn move_to_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        tracing::debug!("pick_first lost its connection, going idle");
        self.connectivity_state = ConnectivityState::Idle;
        self.subchannel_list = None;
        self.selected_subchannel = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
        self.sent_connecting_state = true;
    }

    fn move_to_ready(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        channel_controller: &mut dyn ChannelController,
    ) {
        tracing::debug!(%subchannel, "pick_first selected subchannel");
        self.connectivity_state = ConnectivityState::Ready;
        self.selected_subchannel = Some(subchannel.clone());
        self.subchannel_list = None;
        self.last_connection_error = None;
        self.last_resolver_error = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { subchannel }),
        });
        self.sent_connecting_state = false;
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let error = format!(
            "last seen resolver error: {:?}, last seen connection error: {:?}",
            self.last_resolver_error, self.last_connection_error,
        );
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker::new(Status::unavailable(error))),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }
}

// Flattens the endpoints list by concatenating the ordered list of addresses
// for each of the endpoints, dropping duplicates.
fn address_list_from_endpoints(endpoints: &[Endpoint]) -> Vec<Address> {
    let mut uniques = HashSet::new();
    endpoints
        .iter()
        .flat_map(|ep| ep.addresses.iter())
        .filter(|address| uniques.insert((*address).clone()))
        .cloned()
        .collect()
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    subchannel: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &RequestHeaders) -> PickResult {
        PickResult::Pick(Pick::new(self.subchannel.clone()))
    }
}

// A picker that always queues picks and schedules work. This triggers the LB
// policy to start connecting from the first address.
pub(crate) struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _request: &RequestHeaders) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}

// The subchannels created from the most recent address list, and the progress
// of the current pass over them.
struct SubchannelList {
    ordered: Vec<Arc<dyn Subchannel>>,
    states: HashMap<Arc<dyn Subchannel>, ConnectivityState>,
    // Index of the subchannel currently being attempted during the first pass.
    current: Option<usize>,
    first_pass_complete: bool,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let ordered: Vec<_> = addresses
            .iter()
            .map(|address| channel_controller.new_subchannel(address))
            .collect();
        let states = ordered
            .iter()
            .map(|sc| (sc.clone(), ConnectivityState::Idle))
            .collect();
        SubchannelList {
            ordered,
            states,
            current: None,
            first_pass_complete: false,
        }
    }

    fn contains(&self, subchannel: &Arc<dyn Subchannel>) -> bool {
        self.states.contains_key(subchannel)
    }

    fn is_current(&self, subchannel: &Arc<dyn Subchannel>) -> bool {
        self.current
            .is_some_and(|idx| self.ordered[idx] == subchannel.clone())
    }

    // Initiates a connection attempt to the next subchannel in the list that
    // is not in TRANSIENT_FAILURE.  Returns false at the end of the list.
    fn connect_to_next(&mut self) -> bool {
        let start = self.current.map_or(0, |idx| idx + 1);
        for idx in start..self.ordered.len() {
            let subchannel = &self.ordered[idx];
            if self.states.get(subchannel) == Some(&ConnectivityState::TransientFailure) {
                continue;
            }
            self.current = Some(idx);
            subchannel.connect();
            return true;
        }
        self.current = None;
        false
    }

    fn connect_to_all_idle(&self) {
        for subchannel in &self.ordered {
            if self.states.get(subchannel) == Some(&ConnectivityState::Idle) {
                subchannel.connect();
            }
        }
    }

    fn all_failed(&self) -> bool {
        self.states
            .values()
            .all(|state| *state == ConnectivityState::TransientFailure)
    }
}
