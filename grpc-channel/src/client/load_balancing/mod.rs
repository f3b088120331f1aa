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

//! The load balancing policy API and the built-in policies.
//!
//! A channel owns a tree of [`LbPolicy`] instances.  Control flows down the
//! tree (resolver updates, subchannel state changes, requests to exit idle) and
//! state flows up it as [`LbState`] values: a connectivity state paired with a
//! [`Picker`] that the channel consults for every RPC.

use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use tonic::metadata::MetadataMap;

use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::{ConnectivityState, RequestHeaders};
use crate::rt::Runtime;
use crate::status::Status;

pub mod child_manager;
pub mod pick_first;
pub mod priority;
mod registry;
pub mod rls;
pub mod round_robin;
pub mod routing;

#[cfg(test)]
pub(crate) mod test_utils;

pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,

    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
///
/// All methods are called serially by the channel.  Dropping a policy closes
/// it: every subchannel and child policy it owns is released.  Pickers it
/// already produced remain usable until their holders release them.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when the name resolver fails.  Policies that have
    /// working connections typically keep using them.  The default
    /// implementation ignores the error.
    fn resolver_error(&mut self, _error: String, _channel_controller: &mut dyn ChannelController) {
    }

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Instructs the policy to start connecting any Idle subchannels.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);
}

/// Controls channel behaviors.
pub trait ChannelController: Send {
    /// Creates a new subchannel in IDLE state.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a Subchannel.
#[derive(Clone, Debug)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl Default for SubchannelState {
    fn default() -> Self {
        Self {
            connectivity_state: ConnectivityState::Idle,
            last_connection_error: None,
        }
    }
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }
}

/// A JSON LB policy configuration, as found in a service config.
#[derive(Debug, Clone, Default)]
pub struct ParsedJsonLbConfig {
    pub value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Deserializes the configuration into `T`.
    pub fn convert_to<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

/// Selects the first registered policy from a JSON list of
/// `{"policy_name": config}` objects and parses its configuration.
///
/// Unregistered policies are skipped.  A registered policy whose configuration
/// fails to parse is an error; later entries are not considered.
pub fn parse_lb_policy_list(
    list: &serde_json::Value,
) -> Result<(Arc<dyn LbPolicyBuilder>, Option<LbConfig>), String> {
    let entries = list
        .as_array()
        .ok_or_else(|| format!("LB policy list must be a JSON array, got {list}"))?;
    for entry in entries {
        let object = entry
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| {
                format!("each LB policy entry must be an object with one field, got {entry}")
            })?;
        let Some((name, config)) = object.iter().next() else {
            continue;
        };
        let Some(builder) = GLOBAL_LB_REGISTRY.get_policy(name) else {
            continue;
        };
        let config = builder
            .parse_config(&ParsedJsonLbConfig::new(config.clone()))
            .map_err(|err| format!("invalid config for LB policy {name}: {err}"))?;
        return Ok((builder, config));
    }
    Err(format!("no supported LB policy found in {list}"))
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return an
/// Err with an error that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, request: &RequestHeaders) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status.
    /// If the RPC is wait-for-ready, then it will not be terminated, but
    /// instead attempted on a new picker if one is produced before it is
    /// cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.
    Drop(Status),
}

impl Debug for PickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            Self::Queue => write!(f, "Queue"),
            Self::Fail(status) => write!(f, "Fail({status})"),
            Self::Drop(status) => write!(f, "Drop({status})"),
        }
    }
}

/// Invoked exactly once when an RPC that used a pick completes.
pub type CompletionCallback = Box<dyn FnOnce(&Status) + Send + Sync>;

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    // Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
    /// Called with the final status of the RPC.
    pub on_complete: Option<CompletionCallback>,
}

impl Pick {
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Self {
            subchannel,
            metadata: MetadataMap::new(),
            on_complete: None,
        }
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }

    /// Returns a TransientFailure state whose picker fails every pick with
    /// `status`.
    pub fn failing(status: Status) -> Self {
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker::new(status)),
        }
    }
}

impl Debug for LbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LbState({})", self.connectivity_state)
    }
}

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when connect() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to IDLE when the reconnect backoff timer has
///   expired.  This timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// When the last handle to a Subchannel is dropped, it is disconnected, and no
/// subsequent state updates will be provided for it to the LB policy.
///
/// Subchannels are compared and hashed by identity.
pub trait Subchannel: Send + Sync {
    /// The address this subchannel connects to.
    fn address(&self) -> Address;

    /// Requests a connection attempt if the subchannel is Idle.
    fn connect(&self);

    /// The established connection, if the subchannel is Ready.  Subchannels
    /// that do not carry a transport (for example in tests) return None.
    fn connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

impl Display for dyn Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subchannel({})", self.address())
    }
}

impl Debug for dyn Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subchannel({})", self.address())
    }
}

impl PartialEq for dyn Subchannel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(self, other)
    }
}

impl Eq for dyn Subchannel {}

impl Hash for dyn Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as *const dyn Subchannel as *const ()).hash(state);
    }
}

/// A weak reference to a Subchannel, usable as a map key.
#[derive(Clone)]
pub struct WeakSubchannel(Weak<dyn Subchannel>);

impl WeakSubchannel {
    pub fn new(subchannel: &Arc<dyn Subchannel>) -> Self {
        WeakSubchannel(Arc::downgrade(subchannel))
    }

    pub fn upgrade(&self) -> Option<Arc<dyn Subchannel>> {
        self.0.upgrade()
    }
}

impl From<Arc<dyn Subchannel>> for WeakSubchannel {
    fn from(subchannel: Arc<dyn Subchannel>) -> Self {
        WeakSubchannel::new(&subchannel)
    }
}

impl Hash for WeakSubchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as *const ()).hash(state);
    }
}

impl PartialEq for WeakSubchannel {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for WeakSubchannel {}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &RequestHeaders) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with the same status.
pub struct FailingPicker {
    status: Status,
}

impl FailingPicker {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

impl Picker for FailingPicker {
    fn pick(&self, _request: &RequestHeaders) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}

/// Drops every pick with the same status, regardless of wait-for-ready.
pub struct DroppingPicker {
    status: Status,
}

impl DroppingPicker {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

impl Picker for DroppingPicker {
    fn pick(&self, _request: &RequestHeaders) -> PickResult {
        PickResult::Drop(self.status.clone())
    }
}
