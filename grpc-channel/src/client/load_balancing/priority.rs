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

//! The priority LB policy: routes every RPC to the highest priority child
//! that can serve it, failing over to lower priorities when a child cannot
//! connect in time.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::client::ConnectivityState;
use crate::client::load_balancing::child_manager::{ChildManager, DEFAULT_CHILD_RETENTION};
use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    ParsedJsonLbConfig, Subchannel, SubchannelState, WorkScheduler, parse_lb_policy_list,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::LbConfig;
use crate::rt::{BoxedTaskHandle, Runtime};
use crate::status::Status;

pub static POLICY_NAME: &str = "priority_experimental";

/// How long a newly started child may stay CONNECTING before the next
/// priority is tried.
pub const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PriorityConfigError {
    #[error("invalid priority config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("priority {0:?} has no child config")]
    MissingChild(String),
    #[error("priority {0:?} is listed twice")]
    Duplicate(String),
    #[error("child {name:?} has an invalid policy: {reason}")]
    ChildPolicy { name: String, reason: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPriorityConfig {
    priorities: Vec<String>,
    #[serde(default)]
    children: HashMap<String, RawChild>,
}

#[derive(Deserialize)]
struct RawChild {
    config: serde_json::Value,
}

#[derive(Clone)]
struct ChildConfig {
    builder: Arc<dyn LbPolicyBuilder>,
    config: Option<LbConfig>,
}

/// The parsed config of a priority policy.
#[derive(Clone)]
pub struct PriorityConfig {
    priorities: Vec<String>,
    children: HashMap<String, ChildConfig>,
}

impl PriorityConfig {
    fn parse(value: serde_json::Value) -> Result<Self, PriorityConfigError> {
        let mut raw: RawPriorityConfig = serde_json::from_value(value)?;
        let mut seen = HashSet::new();
        let mut children = HashMap::new();
        for name in &raw.priorities {
            if !seen.insert(name.as_str()) {
                return Err(PriorityConfigError::Duplicate(name.clone()));
            }
            let child = raw
                .children
                .remove(name)
                .ok_or_else(|| PriorityConfigError::MissingChild(name.clone()))?;
            let (builder, config) = parse_lb_policy_list(&child.config).map_err(|reason| {
                PriorityConfigError::ChildPolicy {
                    name: name.clone(),
                    reason,
                }
            })?;
            children.insert(name.clone(), ChildConfig { builder, config });
        }
        Ok(PriorityConfig {
            priorities: raw.priorities,
            children,
        })
    }

    pub fn priorities(&self) -> &[String] {
        &self.priorities
    }
}

pub(crate) struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PriorityPolicy {
            child_manager: ChildManager::new(
                options.runtime.clone(),
                options.work_scheduler.clone(),
            )
            .with_retention(DEFAULT_CHILD_RETENTION),
            runtime: options.runtime,
            work_scheduler: options.work_scheduler,
            config: None,
            last_update: None,
            failover: HashMap::new(),
            expired_timers: Default::default(),
            current: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(Some(LbConfig::new(PriorityConfig::parse(
            config.value.clone(),
        )?)))
    }
}

// Failover bookkeeping for one child.
#[derive(Default)]
struct Failover {
    timer: Option<BoxedTaskHandle>,
    // The child failed or its timer fired since it was last usable.
    failed: bool,
}

impl Failover {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct PriorityPolicy {
    child_manager: ChildManager<String>,
    runtime: Arc<dyn Runtime>,
    work_scheduler: Arc<dyn WorkScheduler>,
    config: Option<Arc<PriorityConfig>>,
    last_update: Option<ResolverUpdate>,
    failover: HashMap<String, Failover>,
    expired_timers: Arc<Mutex<Vec<String>>>,
    // The child whose picker is in use.
    current: Option<String>,
}

impl LbPolicy for PriorityPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config = config
            .and_then(|c| c.convert_to::<PriorityConfig>())
            .ok_or("priority: missing config")?;

        let stale: Vec<String> = self
            .child_manager
            .child_states()
            .map(|(name, _)| name.clone())
            .filter(|name| !config.children.contains_key(name))
            .collect();
        for name in stale {
            self.remove_child(&name);
        }

        // Started children keep receiving updates; the rest are created when
        // failover reaches them.
        let mut first_error = None;
        for name in &config.priorities {
            if !self.child_manager.contains(name) {
                continue;
            }
            let Some(child) = config.children.get(name) else {
                continue;
            };
            if let Err(err) = self.child_manager.ensure_child(
                name.clone(),
                child.builder.clone(),
                update.clone(),
                child.config.as_ref(),
                channel_controller,
            ) {
                first_error.get_or_insert(err);
            }
        }
        self.config = Some(config);
        self.last_update = Some(update);
        self.choose_priority(channel_controller);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController) {
        self.child_manager.resolver_error(&error, channel_controller);
        self.choose_priority(channel_controller);
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.child_manager
            .subchannel_update(subchannel, state, channel_controller);
        self.choose_priority(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.child_manager.work(channel_controller);
        let expired = mem::take(&mut *self.expired_timers.lock());
        for name in expired {
            if let Some(failover) = self.failover.get_mut(&name) {
                if failover.timer.take().is_some() {
                    tracing::debug!(child = %name, "priority failover timer fired");
                    failover.failed = true;
                }
            }
        }
        self.choose_priority(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(current) = self.current.clone() {
            self.child_manager
                .exit_idle_child(&current, channel_controller);
            self.choose_priority(channel_controller);
        }
    }
}

impl PriorityPolicy {
    // Picks the highest priority child that is usable: READY or IDLE, or
    // CONNECTING without having failed over.  Children are started lazily as
    // the search reaches them.
    fn choose_priority(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(config) = self.config.clone() else {
            return;
        };
        self.refresh_failover();

        let mut chosen = None;
        for name in &config.priorities {
            if !self.child_manager.contains(name) {
                self.start_child(&config, name, channel_controller);
                self.refresh_failover();
            }
            let Some(state) = self.child_manager.child_state(name) else {
                continue;
            };
            let failed = self.failover.get(name).is_some_and(|f| f.failed);
            match state.connectivity_state {
                ConnectivityState::Ready | ConnectivityState::Idle => {
                    chosen = Some(name.clone());
                    break;
                }
                ConnectivityState::Connecting if !failed => {
                    chosen = Some(name.clone());
                    break;
                }
                _ => {}
            }
        }
        // With every priority failed, the lowest one reports for the policy.
        let chosen = chosen.or_else(|| config.priorities.last().cloned());

        // Children below the chosen priority are no longer needed.
        if let Some(pos) = chosen
            .as_ref()
            .and_then(|c| config.priorities.iter().position(|p| p == c))
        {
            for name in &config.priorities[pos + 1..] {
                if self.child_manager.contains(name) {
                    self.remove_child(name);
                }
            }
        }

        let changed = chosen != self.current;
        if changed {
            tracing::debug!(from = ?self.current, to = ?chosen, "priority switching child");
            self.current = chosen;
        }
        if self.child_manager.has_updated() || changed {
            self.send_picker(channel_controller);
        }
    }

    fn refresh_failover(&mut self) {
        for (name, state) in self.child_manager.child_states() {
            let Some(failover) = self.failover.get_mut(name) else {
                continue;
            };
            match state.connectivity_state {
                ConnectivityState::Ready | ConnectivityState::Idle => {
                    failover.stop_timer();
                    failover.failed = false;
                }
                ConnectivityState::TransientFailure => {
                    failover.stop_timer();
                    failover.failed = true;
                }
                _ => {}
            }
        }
    }

    fn start_child(
        &mut self,
        config: &PriorityConfig,
        name: &str,
        channel_controller: &mut dyn ChannelController,
    ) {
        let (Some(child), Some(update)) = (config.children.get(name), self.last_update.clone())
        else {
            return;
        };
        tracing::debug!(child = %name, "priority starting child");
        self.failover.insert(
            name.to_string(),
            Failover {
                timer: Some(self.start_failover_timer(name)),
                failed: false,
            },
        );
        if let Err(err) = self.child_manager.ensure_child(
            name.to_string(),
            child.builder.clone(),
            update,
            child.config.as_ref(),
            channel_controller,
        ) {
            tracing::warn!(child = %name, error = %err, "priority child rejected update");
        }
    }

    fn start_failover_timer(&self, name: &str) -> BoxedTaskHandle {
        let sleep = self.runtime.sleep(DEFAULT_FAILOVER_TIMEOUT);
        let expired = self.expired_timers.clone();
        let work_scheduler = self.work_scheduler.clone();
        let name = name.to_string();
        self.runtime.spawn(Box::pin(async move {
            sleep.await;
            expired.lock().push(name);
            work_scheduler.schedule_work();
        }))
    }

    // The child stays warm for the retention period in case it is chosen
    // again.
    fn remove_child(&mut self, name: &str) {
        self.child_manager.retire_child(&name.to_string());
        if let Some(mut failover) = self.failover.remove(name) {
            failover.stop_timer();
        }
    }

    fn send_picker(&self, channel_controller: &mut dyn ChannelController) {
        let state = self
            .current
            .as_ref()
            .and_then(|name| self.child_manager.child_state(name))
            .cloned()
            .unwrap_or_else(|| {
                LbState::failing(Status::unavailable("priority: no priorities configured"))
            });
        channel_controller.update_picker(state);
    }
}

impl Drop for PriorityPolicy {
    fn drop(&mut self) {
        for failover in self.failover.values_mut() {
            failover.stop_timer();
        }
    }
}
