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

//! A routing LB policy: sends each RPC to the child policy named by the first
//! route whose matcher accepts the request.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::Arc;

use serde::Deserialize;

use crate::client::load_balancing::child_manager::{
    ChildManager, ChildUpdate, DEFAULT_CHILD_RETENTION,
};
use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, ParsedJsonLbConfig,
    PickResult, Picker, Subchannel, SubchannelState, parse_lb_policy_list,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::LbConfig;
use crate::client::{ConnectivityState, RequestHeaders};
use crate::status::Status;

pub mod matcher;

use matcher::{
    CompositeMatcher, FRACTION_DENOMINATOR, HeaderMatcher, PathMatcher, RawHeaderMatcher,
    full_match_regex,
};

pub static POLICY_NAME: &str = "routing_experimental";

/// Errors produced while parsing a routing config.
#[derive(Debug, thiserror::Error)]
pub enum RoutingConfigError {
    #[error("invalid routing config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid regex {0:?}: {1}")]
    InvalidRegex(String, String),
    #[error("header matcher {0:?} must set exactly one match kind")]
    HeaderMatcher(String),
    #[error("route {0} must set exactly one of path, prefix and safeRegex")]
    PathMatcher(usize),
    #[error("route {0} has matchFraction {1} above 1000000")]
    Fraction(usize, u32),
    #[error("route {0} names unknown action {1:?}")]
    UnknownAction(usize, String),
    #[error("action {action:?} has an invalid child policy: {reason}")]
    ChildPolicy { action: String, reason: String },
}

/// A route: requests accepted by `matcher` go to the child named `action`.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub matcher: CompositeMatcher,
    pub action: String,
}

#[derive(Clone)]
struct Action {
    builder: Arc<dyn LbPolicyBuilder>,
    config: Option<LbConfig>,
}

/// The parsed config of a routing policy.
#[derive(Clone)]
pub struct RoutingConfig {
    routes: Vec<Route>,
    actions: HashMap<String, Action>,
}

impl RoutingConfig {
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRoutingConfig {
    #[serde(default)]
    routes: Vec<RawRoute>,
    #[serde(default)]
    actions: HashMap<String, RawAction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRoute {
    path: Option<String>,
    prefix: Option<String>,
    safe_regex: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
    #[serde(default)]
    headers: Vec<RawHeaderMatcher>,
    match_fraction: Option<u32>,
    action: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    child_policy: serde_json::Value,
}

impl RoutingConfig {
    fn parse(value: serde_json::Value) -> Result<Self, RoutingConfigError> {
        let raw: RawRoutingConfig = serde_json::from_value(value)?;
        let mut actions = HashMap::with_capacity(raw.actions.len());
        for (name, action) in raw.actions {
            let (builder, config) = parse_lb_policy_list(&action.child_policy).map_err(|reason| {
                RoutingConfigError::ChildPolicy {
                    action: name.clone(),
                    reason,
                }
            })?;
            actions.insert(name, Action { builder, config });
        }

        let mut routes = Vec::with_capacity(raw.routes.len());
        for (i, route) in raw.routes.into_iter().enumerate() {
            let path = match (route.path, route.prefix, route.safe_regex) {
                (Some(path), None, None) => PathMatcher::Exact {
                    path,
                    case_insensitive: route.case_insensitive,
                },
                (None, Some(prefix), None) => PathMatcher::Prefix {
                    prefix,
                    case_insensitive: route.case_insensitive,
                },
                (None, None, Some(regex)) => {
                    PathMatcher::Regex(full_match_regex(&regex, route.case_insensitive)?)
                }
                _ => return Err(RoutingConfigError::PathMatcher(i)),
            };
            if let Some(fraction) = route.match_fraction.filter(|f| *f > FRACTION_DENOMINATOR) {
                return Err(RoutingConfigError::Fraction(i, fraction));
            }
            if !actions.contains_key(&route.action) {
                return Err(RoutingConfigError::UnknownAction(i, route.action));
            }
            let headers = route
                .headers
                .into_iter()
                .map(HeaderMatcher::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            routes.push(Route {
                matcher: CompositeMatcher {
                    path,
                    headers,
                    fraction: route.match_fraction,
                },
                action: route.action,
            });
        }
        Ok(RoutingConfig { routes, actions })
    }
}

pub(crate) struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoutingPolicy {
            child_manager: ChildManager::new(options.runtime, options.work_scheduler)
                .with_retention(DEFAULT_CHILD_RETENTION),
            routes: Arc::new(Vec::new()),
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let config = RoutingConfig::parse(config.value.clone())?;
        Ok(Some(LbConfig::new(config)))
    }
}

struct RoutingPolicy {
    child_manager: ChildManager<String>,
    routes: Arc<Vec<Route>>,
}

impl LbPolicy for RoutingPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config = config
            .and_then(|c| c.convert_to::<RoutingConfig>())
            .ok_or("routing: missing config")?;

        // Every child referenced by a route gets the whole update.
        let mut seen = HashSet::new();
        let mut updates = Vec::new();
        for route in &config.routes {
            if !seen.insert(route.action.as_str()) {
                continue;
            }
            let Some(action) = config.actions.get(&route.action) else {
                continue;
            };
            updates.push(ChildUpdate {
                child_identifier: route.action.clone(),
                child_policy_builder: action.builder.clone(),
                child_update: update.clone(),
                child_config: action.config.clone(),
            });
        }
        let result = self.child_manager.update(updates, channel_controller);

        let routes_changed = *self.routes != config.routes;
        if routes_changed {
            self.routes = Arc::new(config.routes.clone());
        }
        if self.child_manager.has_updated() || routes_changed {
            self.send_picker(channel_controller);
        }
        result
    }

    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController) {
        self.child_manager.resolver_error(&error, channel_controller);
        self.resolve_child_updates(channel_controller);
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.child_manager
            .subchannel_update(subchannel, state, channel_controller);
        self.resolve_child_updates(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.child_manager.work(channel_controller);
        self.resolve_child_updates(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.child_manager.exit_idle(channel_controller);
        self.resolve_child_updates(channel_controller);
    }
}

impl RoutingPolicy {
    fn resolve_child_updates(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.child_manager.has_updated() {
            self.send_picker(channel_controller);
        }
    }

    fn send_picker(&self, channel_controller: &mut dyn ChannelController) {
        let connectivity_state = if self.routes.is_empty() {
            ConnectivityState::TransientFailure
        } else {
            self.child_manager.aggregate_states()
        };
        let pickers = self
            .child_manager
            .child_states()
            .map(|(name, state)| (name.clone(), state.picker.clone()))
            .collect();
        tracing::debug!(state = %connectivity_state, routes = self.routes.len(), "routing updating picker");
        channel_controller.update_picker(LbState {
            connectivity_state,
            picker: Arc::new(RoutingPicker {
                routes: self.routes.clone(),
                pickers,
            }),
        });
    }
}

struct RoutingPicker {
    routes: Arc<Vec<Route>>,
    pickers: HashMap<String, Arc<dyn Picker>>,
}

impl Picker for RoutingPicker {
    fn pick(&self, request: &RequestHeaders) -> PickResult {
        for route in self.routes.iter() {
            if !route.matcher.matches(request) {
                continue;
            }
            tracing::trace!(method = request.method_name(), action = %route.action, "routing matched route");
            return match self.pickers.get(&route.action) {
                Some(picker) => picker.pick(request),
                None => PickResult::Fail(Status::unavailable(format!(
                    "routing: no child for action {}",
                    route.action
                ))),
            };
        }
        PickResult::Fail(Status::unavailable("no matching route"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::load_balancing::test_utils::{
        BACKEND_STUB_POLICY, TestChannelController, TestEvent, drain, last_picker,
        new_subchannels, pick_address, reg_backend_stub, set_state, test_options,
        update_with_addresses,
    };
    use crate::client::load_balancing::GLOBAL_LB_REGISTRY;
    use tonic::metadata::MetadataValue;

    fn action(backend: &str) -> serde_json::Value {
        json!({"childPolicy": [{BACKEND_STUB_POLICY: {"backend": backend}}]})
    }

    fn parse(value: serde_json::Value) -> Result<LbConfig, Box<dyn Error + Send + Sync>> {
        reg_backend_stub();
        Builder {}
            .parse_config(&ParsedJsonLbConfig::new(value))
            .map(|c| c.unwrap())
    }

    fn two_route_config() -> LbConfig {
        parse(json!({
            "routes": [
                {"prefix": "/pkg.Users/", "headers": [{"name": "x-canary", "presentMatch": true}], "action": "canary"},
                {"prefix": "/pkg.Users/", "action": "users"},
            ],
            "actions": {"canary": action("canary:1"), "users": action("users:1")},
        }))
        .unwrap()
    }

    #[test]
    fn registered_globally() {
        assert!(GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).is_some());
    }

    #[test]
    fn config_validation() {
        reg_backend_stub();
        assert!(parse(json!({"routes": [{"path": "/a/b", "prefix": "/a/", "action": "x"}], "actions": {"x": action("x:1")}})).is_err());
        assert!(parse(json!({"routes": [{"path": "/a/b", "action": "missing"}], "actions": {}})).is_err());
        assert!(parse(json!({"routes": [{"safeRegex": "(", "action": "x"}], "actions": {"x": action("x:1")}})).is_err());
        assert!(parse(json!({"routes": [{"prefix": "/", "matchFraction": 1_000_001, "action": "x"}], "actions": {"x": action("x:1")}})).is_err());
        assert!(parse(json!({"routes": [], "actions": {"x": {"childPolicy": [{"no_such_policy": {}}]}}})).is_err());
        assert!(parse(json!({"routes": [{"path": "/a/b", "action": "x"}], "actions": {"x": action("x:1")}})).is_ok());
    }

    #[test]
    fn picks_first_matching_route() {
        let (mut controller, mut rx) = TestChannelController::new();
        let mut policy = Builder {}.build(test_options(&controller.tx_events));
        let config = two_route_config();
        policy
            .resolver_update(update_with_addresses(&["ignored:1"]), Some(&config), &mut controller)
            .unwrap();
        let subchannels = new_subchannels(&drain(&mut rx));
        assert_eq!(subchannels.len(), 2);
        for sc in &subchannels {
            set_state(policy.as_mut(), sc, ConnectivityState::Ready, &mut controller);
        }
        let state = last_picker(&drain(&mut rx)).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);

        let plain = RequestHeaders::new().with_method_name("/pkg.Users/Get");
        assert_eq!(pick_address(&state, &plain), "users:1");
        let mut canary = RequestHeaders::new().with_method_name("/pkg.Users/Get");
        canary
            .metadata_mut()
            .insert("x-canary", MetadataValue::from_static("1"));
        assert_eq!(pick_address(&state, &canary), "canary:1");
        let other = RequestHeaders::new().with_method_name("/pkg.Orders/Get");
        assert_eq!(pick_address(&state, &other), "fail: no matching route");
    }

    #[tokio::test]
    async fn unreferenced_children_are_removed() {
        let (mut controller, mut rx) = TestChannelController::new();
        let mut policy = Builder {}.build(test_options(&controller.tx_events));
        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&two_route_config()), &mut controller)
            .unwrap();
        let subchannels = new_subchannels(&drain(&mut rx));
        let canary = subchannels
            .iter()
            .find(|sc| sc.address().address == "canary:1")
            .unwrap()
            .clone();

        let config = parse(json!({
            "routes": [{"prefix": "/", "action": "users"}],
            "actions": {"users": action("users:1")},
        }))
        .unwrap();
        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&config), &mut controller)
            .unwrap();
        let events = drain(&mut rx);
        assert!(new_subchannels(&events).is_empty());
        assert!(events.iter().any(|e| matches!(e, TestEvent::UpdatePicker(_))));

        // The removed child's subchannel no longer influences the picker.
        set_state(policy.as_mut(), &canary, ConnectivityState::Ready, &mut controller);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn restored_child_reuses_its_subchannels() {
        let (mut controller, mut rx) = TestChannelController::new();
        let mut policy = Builder {}.build(test_options(&controller.tx_events));
        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&two_route_config()), &mut controller)
            .unwrap();
        let subchannels = new_subchannels(&drain(&mut rx));
        assert_eq!(subchannels.len(), 2);
        let canary = subchannels
            .iter()
            .find(|sc| sc.address().address == "canary:1")
            .unwrap()
            .clone();

        let users_only = parse(json!({
            "routes": [{"prefix": "/", "action": "users"}],
            "actions": {"users": action("users:1")},
        }))
        .unwrap();
        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&users_only), &mut controller)
            .unwrap();
        drain(&mut rx);

        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&two_route_config()), &mut controller)
            .unwrap();
        assert!(new_subchannels(&drain(&mut rx)).is_empty());

        set_state(policy.as_mut(), &canary, ConnectivityState::Ready, &mut controller);
        let state = last_picker(&drain(&mut rx)).unwrap();
        let mut request = RequestHeaders::new().with_method_name("/pkg.Users/Get");
        request
            .metadata_mut()
            .insert("x-canary", MetadataValue::from_static("1"));
        assert_eq!(pick_address(&state, &request), "canary:1");
    }

    #[test]
    fn unchanged_config_does_not_rebuild_picker() {
        let (mut controller, mut rx) = TestChannelController::new();
        let mut policy = Builder {}.build(test_options(&controller.tx_events));
        let config = two_route_config();
        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&config), &mut controller)
            .unwrap();
        assert!(last_picker(&drain(&mut rx)).is_some());
        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&config), &mut controller)
            .unwrap();
        assert!(last_picker(&drain(&mut rx)).is_none());
    }

    #[test]
    fn aggregates_child_failures() {
        let (mut controller, mut rx) = TestChannelController::new();
        let mut policy = Builder {}.build(test_options(&controller.tx_events));
        policy
            .resolver_update(update_with_addresses(&["a:1"]), Some(&two_route_config()), &mut controller)
            .unwrap();
        let subchannels = new_subchannels(&drain(&mut rx));
        for sc in &subchannels {
            set_state(policy.as_mut(), sc, ConnectivityState::TransientFailure, &mut controller);
        }
        let state = last_picker(&drain(&mut rx)).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        let request = RequestHeaders::new().with_method_name("/pkg.Users/Get");
        assert_eq!(pick_address(&state, &request), "fail: users:1 is down");
    }

    #[test]
    fn missing_config_is_an_error() {
        let (mut controller, _rx) = TestChannelController::new();
        let mut policy = Builder {}.build(test_options(&controller.tx_events));
        assert!(
            policy
                .resolver_update(update_with_addresses(&["a:1"]), None, &mut controller)
                .is_err()
        );
    }
}
