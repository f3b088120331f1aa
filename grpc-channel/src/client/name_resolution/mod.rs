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

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted into
//! network addresses (typically IP addresses) used by the channel to connect to
//! a service.

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::service_config::ServiceConfig;
use crate::attributes::Attributes;
use crate::rt::Runtime;

pub mod backoff;
pub mod delta;
pub mod manual;
mod passthrough;
mod registry;
mod target;
#[cfg(test)]
pub(crate) mod test_utils;
mod unix;

pub use registry::{GLOBAL_RESOLVER_REGISTRY, ResolverRegistry};
pub use target::{Target, UNIX_NETWORK, parse_dial_target};

/// The scheme applied to targets that carry no scheme, or whose scheme has no
/// registered resolver.
pub const DEFAULT_SCHEME: &str = "passthrough";

/// A name resolver factory that produces Resolver instances used by the channel
/// to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver instance.
    ///
    /// Note that build must not fail.  Instead, an erroring Resolver may be
    /// returned that calls ChannelController.update() with an Err value.
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &str;

    /// Returns the default authority for a channel using this name resolver
    /// and target.  This refers to the *dataplane authority*, the value used in
    /// the `:authority` header of requests, and not to the authority portion of
    /// the target URI.
    ///
    /// By default this is the endpoint of the target with any leading slash
    /// removed.
    fn default_authority(&self, target: &Target) -> String {
        let endpoint = target.endpoint();
        endpoint.strip_prefix('/').unwrap_or(endpoint).to_string()
    }
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// The authority that will be used for the channel by default.
    pub authority: String,

    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,

    /// A hook into the channel's work scheduler that allows the Resolver to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

impl ResolverOptions {
    pub fn new(
        authority: String,
        runtime: Arc<dyn Runtime>,
        work_scheduler: Arc<dyn WorkScheduler>,
    ) -> Self {
        Self {
            authority,
            runtime,
            work_scheduler,
        }
    }
}

/// Used to asynchronously request a call into the Resolver's work method.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the Resolver's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// Resolver watches for the updates on the specified target.
/// Updates include address updates and service config updates.
pub trait Resolver: Send {
    /// Asks the resolver to obtain an updated resolver result, if applicable.
    ///
    /// The implementation is not required to re-resolve immediately; it may
    /// delay based on a minimum time between queries.  For watch based
    /// resolvers, this may be a no-op.
    fn resolve_now(&mut self);

    /// Called serially by the channel to provide access to the
    /// `ChannelController`.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);
}

/// The `ChannelController` trait provides the resolver with functionality
/// to interact with the channel.
pub trait ChannelController: Send {
    /// Notifies the channel about the current state of the name resolver.  If
    /// an error value is returned, the name resolver should attempt to
    /// re-resolve, if possible.
    fn update(&mut self, update: ResolverUpdate) -> Result<(), String>;

    /// Parses the provided JSON service config.
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String>;
}

#[derive(Clone, Debug)]
#[non_exhaustive]
/// ResolverUpdate contains the current Resolver state relevant to the
/// channel.
pub struct ResolverUpdate {
    /// Attributes contains arbitrary data about the resolver intended for
    /// consumption by the load balancing policy.
    pub attributes: Attributes,

    /// A list of endpoints which each identify a logical host serving the
    /// service indicated by the target URI.  An Err value reports a resolver
    /// error.
    pub endpoints: Result<Vec<Endpoint>, String>,

    /// The service config which the client should use for communicating with
    /// the service.  None indicates no service config is present or the
    /// resolver does not provide service configs.
    pub service_config: Result<Option<ServiceConfig>, String>,

    /// An optional human-readable note describing context about the
    /// resolution, for inclusion in RPC failure messages.
    pub resolution_note: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            service_config: Ok(Default::default()),
            attributes: Default::default(),
            endpoints: Ok(Default::default()),
            resolution_note: Default::default(),
        }
    }
}

impl ResolverUpdate {
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: Ok(endpoints),
            ..Default::default()
        }
    }

    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            endpoints: Err(error.into()),
            ..Default::default()
        }
    }

    pub fn with_service_config(mut self, service_config: Option<ServiceConfig>) -> Self {
        self.service_config = Ok(service_config);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Returns every address of every endpoint, in order.
    pub fn addresses(&self) -> Vec<Address> {
        match &self.endpoints {
            Ok(endpoints) => endpoints
                .iter()
                .flat_map(|e| e.addresses.iter().cloned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// An Endpoint is an address or a collection of addresses which reference one
/// logical server.  Multiple addresses may be used if there are multiple ways
/// which the server can be reached, e.g. via IPv4 and IPv6 addresses.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Endpoint {
    /// Addresses contains a list of addresses used to access this endpoint.
    pub addresses: Vec<Address>,

    /// Attributes contains arbitrary data about this endpoint intended for
    /// consumption by the LB policy.
    pub attributes: Attributes,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            ..Default::default()
        }
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
    }
}

/// Distinguishes ordinary backends from addresses of remote load balancers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AddressKind {
    #[default]
    Backend,
    /// The remote is itself a load balancer; `Address::server_name` names it
    /// for authentication.
    LoadBalancer,
}

/// An Address is an identifier that indicates how to connect to a server.
///
/// Two addresses are equal when their network type and address string match;
/// the remaining fields are metadata and are compared with
/// [`Address::same_metadata`].
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,

    pub kind: AddressKind,

    /// The name used to authenticate a load balancer address.
    pub server_name: Option<String>,

    /// Attributes contains arbitrary data about this address intended for
    /// consumption by the subchannel and transport.
    pub attributes: Attributes,

    /// Data about this address intended for consumption by LB policies.
    pub balancer_attributes: Attributes,
}

impl Address {
    pub fn new(network_type: &'static str, address: impl Into<String>) -> Self {
        Self {
            network_type,
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(TCP_IP_NETWORK_TYPE, address)
    }

    /// Reports whether everything besides the address identity matches.
    pub fn same_metadata(&self, other: &Address) -> bool {
        self.kind == other.kind
            && self.server_name == other.server_name
            && self.attributes == other.attributes
            && self.balancer_attributes == other.balancer_attributes
    }
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

// A resolver that reports one fixed result.  Used for targets whose result
// never changes, and to report an error to the channel when a resolver cannot
// be built.  Re-resolving cannot produce anything new, so resolve_now does
// nothing.
pub(crate) struct StaticResolver {
    update: ResolverUpdate,
}

impl StaticResolver {
    pub(crate) fn new(update: ResolverUpdate, options: &ResolverOptions) -> Self {
        options.work_scheduler.schedule_work();
        Self { update }
    }
}

impl Resolver for StaticResolver {
    fn resolve_now(&mut self) {}

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let _ = channel_controller.update(self.update.clone());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_identity_ignores_metadata() {
        let a = Address::tcp("10.0.0.1:443");
        let mut b = Address::tcp("10.0.0.1:443");
        b.server_name = Some("lb.example.com".to_string());
        b.kind = AddressKind::LoadBalancer;
        assert_eq!(a, b);
        assert!(!a.same_metadata(&b));
        assert_ne!(a, Address::new(UNIX_NETWORK, "10.0.0.1:443"));
        assert_eq!(a.to_string(), "tcp:10.0.0.1:443");
    }

    #[test]
    fn resolver_update_flattens_addresses() {
        let update = ResolverUpdate::from_endpoints(vec![
            Endpoint::new(vec![Address::tcp("a:1"), Address::tcp("a:2")]),
            Endpoint::new(vec![Address::tcp("b:1")]),
        ]);
        let addresses: Vec<String> = update.addresses().into_iter().map(|a| a.address).collect();
        assert_eq!(addresses, vec!["a:1", "a:2", "b:1"]);
        assert!(ResolverUpdate::from_error("boom").addresses().is_empty());
    }
}
