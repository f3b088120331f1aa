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

//! A utility which helps parent LB policies manage multiple children for the
//! purposes of forwarding channel updates.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::hash::Hash;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Subchannel,
    SubchannelState, WeakSubchannel, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::rt::Runtime;
use crate::util::TimeoutCache;

/// How long a removed child is kept alive by default when retention is
/// enabled, in case a later update names it again.
pub const DEFAULT_CHILD_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Manages a keyed set of child policies on behalf of a parent policy.
///
/// The manager routes subchannel updates and scheduled work to the child that
/// owns them, and records the latest state each child reported.  Parents call
/// [`ChildManager::has_updated`] after forwarding an operation to learn
/// whether they need to produce a new picker.
pub struct ChildManager<T> {
    children: IndexMap<T, Child<T>>,
    subchannel_child_map: HashMap<WeakSubchannel, T>,
    pending_work: Arc<Mutex<HashSet<T>>>,
    runtime: Arc<dyn Runtime>,
    work_scheduler: Arc<dyn WorkScheduler>,
    retention: Option<Retention<T>>,
    updated: bool,
}

struct Child<T> {
    builder: Arc<dyn LbPolicyBuilder>,
    policy: Box<dyn LbPolicy>,
    state: LbState,
    work_scheduler: Arc<ChildWorkScheduler<T>>,
    // Removed by the parent but kept alive until its retention timer fires.
    retained: bool,
}

struct Retention<T> {
    timers: TimeoutCache<T, ()>,
    expired: Arc<Mutex<Vec<T>>>,
}

/// A collection of data sent to a child of the ChildManager.
pub struct ChildUpdate<T> {
    /// The identifier the ChildManager should use for this child.
    pub child_identifier: T,
    /// The builder the ChildManager should use to create this child if it does
    /// not exist.  A child built by a different policy is replaced.
    pub child_policy_builder: Arc<dyn LbPolicyBuilder>,
    /// The relevant ResolverUpdate to send to this child.
    pub child_update: ResolverUpdate,
    /// The configuration to send along with the update.
    pub child_config: Option<LbConfig>,
}

impl<T> ChildManager<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Creates a new ChildManager.  `work_scheduler` is the parent's own
    /// scheduler; it is invoked whenever a child asks for work.
    pub fn new(runtime: Arc<dyn Runtime>, work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            children: IndexMap::new(),
            subchannel_child_map: HashMap::new(),
            pending_work: Default::default(),
            runtime,
            work_scheduler,
            retention: None,
            updated: false,
        }
    }

    /// Keeps children removed by [`ChildManager::update`] alive for `period`.
    /// A retained child that is named again is reused with its connections.
    pub fn with_retention(mut self, period: Duration) -> Self {
        self.retention = Some(Retention {
            timers: TimeoutCache::new(period, self.runtime.clone()),
            expired: Default::default(),
        });
        self
    }

    /// Replaces the set of children with the ones named by `updates`, and
    /// sends each its update.
    ///
    /// Children not named are removed (or retained, see
    /// [`ChildManager::with_retention`]).  Errors reported by children are
    /// logged; the first one is returned after every child was updated.
    pub fn update(
        &mut self,
        updates: impl IntoIterator<Item = ChildUpdate<T>>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let updates: Vec<ChildUpdate<T>> = updates.into_iter().collect();
        let named: HashSet<&T> = updates.iter().map(|u| &u.child_identifier).collect();
        let removed: Vec<T> = self
            .children
            .iter()
            .filter(|(id, child)| !child.retained && !named.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in removed {
            self.retire_child(&id);
        }

        let mut first_error = None;
        for update in updates {
            if let Err(err) = self.ensure_child(
                update.child_identifier,
                update.child_policy_builder,
                update.child_update,
                update.child_config.as_ref(),
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

    /// Creates the child `id` if it does not exist (reviving it if it is
    /// retained) and sends it `update`.
    pub fn ensure_child(
        &mut self,
        id: T,
        builder: Arc<dyn LbPolicyBuilder>,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let replace = self
            .children
            .get(&id)
            .is_some_and(|child| child.builder.name() != builder.name());
        if replace {
            self.remove_child(&id);
        }
        if let Some(child) = self.children.get_mut(&id) {
            if child.retained {
                if let Some(retention) = &self.retention {
                    retention.timers.remove(&id);
                }
                child.retained = false;
                self.updated = true;
                tracing::debug!(child = ?id, "reusing retained child policy");
            }
        } else {
            let work_scheduler = Arc::new(ChildWorkScheduler {
                pending_work: self.pending_work.clone(),
                id: id.clone(),
                parent: self.work_scheduler.clone(),
                active: AtomicBool::new(true),
            });
            let policy = builder.build(LbPolicyOptions {
                work_scheduler: work_scheduler.clone(),
                runtime: self.runtime.clone(),
            });
            tracing::debug!(child = ?id, policy = builder.name(), "created child policy");
            self.children.insert(
                id.clone(),
                Child {
                    builder,
                    policy,
                    state: LbState::initial(),
                    work_scheduler,
                    retained: false,
                },
            );
            self.updated = true;
        }

        self.call_child(&id, channel_controller, |policy, cc| {
            policy.resolver_update(update, config, cc)
        })
        .unwrap_or(Ok(()))
        .inspect_err(|err| tracing::warn!(child = ?id, error = %err, "child policy rejected update"))
    }

    /// Removes the child `id` immediately, closing it.
    pub fn remove_child(&mut self, id: &T) -> bool {
        let Some(child) = self.children.shift_remove(id) else {
            return false;
        };
        child.work_scheduler.active.store(false, Ordering::Release);
        self.pending_work.lock().remove(id);
        self.subchannel_child_map.retain(|_, owner| owner != id);
        if let Some(retention) = &self.retention {
            retention.timers.remove(id);
        }
        if !child.retained {
            self.updated = true;
        }
        tracing::debug!(child = ?id, "removed child policy");
        true
    }

    /// Removes the child `id`.  With retention enabled the child is kept
    /// alive, hidden from the active children, until its period elapses.
    pub fn retire_child(&mut self, id: &T) {
        if self.retention.is_none() {
            self.remove_child(id);
            return;
        }
        let Some(child) = self.children.get_mut(id) else {
            return;
        };
        child.retained = true;
        self.updated = true;
        let Some(retention) = &self.retention else {
            return;
        };
        let expired = retention.expired.clone();
        let work_scheduler = self.work_scheduler.clone();
        let key = id.clone();
        retention.timers.insert(id.clone(), (), move || {
            expired.lock().push(key);
            work_scheduler.schedule_work();
        });
        tracing::debug!(child = ?id, "retaining removed child policy");
    }

    /// Forwards a resolver error to every active child.
    pub fn resolver_error(&mut self, error: &str, channel_controller: &mut dyn ChannelController) {
        for id in self.active_ids() {
            self.call_child(&id, channel_controller, |policy, cc| {
                policy.resolver_error(error.to_string(), cc)
            });
        }
    }

    /// Routes a subchannel update to the child that created the subchannel.
    /// Updates for subchannels of removed children are dropped.
    pub fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(id) = self
            .subchannel_child_map
            .get(&WeakSubchannel::new(&subchannel))
            .cloned()
        else {
            tracing::trace!(%subchannel, "dropping update for subchannel of a removed child");
            return;
        };
        self.call_child(&id, channel_controller, |policy, cc| {
            policy.subchannel_update(subchannel, state, cc)
        });
    }

    /// Runs pending work for every child that requested it, and closes
    /// retained children whose retention period elapsed.
    pub fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(retention) = &self.retention {
            let expired = mem::take(&mut *retention.expired.lock());
            for id in expired {
                if self.children.get(&id).is_some_and(|c| c.retained) {
                    self.remove_child(&id);
                }
            }
        }
        let ids = mem::take(&mut *self.pending_work.lock());
        for id in ids {
            self.call_child(&id, channel_controller, |policy, cc| policy.work(cc));
        }
    }

    /// Asks every active child to exit idle.
    pub fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        for id in self.active_ids() {
            self.call_child(&id, channel_controller, |policy, cc| policy.exit_idle(cc));
        }
    }

    /// Asks the child `id` to exit idle.
    pub fn exit_idle_child(&mut self, id: &T, channel_controller: &mut dyn ChannelController) {
        self.call_child(id, channel_controller, |policy, cc| policy.exit_idle(cc));
    }

    /// Returns the last state reported by every active child, in creation
    /// order.
    pub fn child_states(&self) -> impl Iterator<Item = (&T, &LbState)> {
        self.children
            .iter()
            .filter(|(_, child)| !child.retained)
            .map(|(id, child)| (id, &child.state))
    }

    /// Returns the last state reported by the active child `id`.
    pub fn child_state(&self, id: &T) -> Option<&LbState> {
        self.children
            .get(id)
            .filter(|child| !child.retained)
            .map(|child| &child.state)
    }

    pub fn contains(&self, id: &T) -> bool {
        self.child_state(id).is_some()
    }

    /// Returns the number of active children.
    pub fn len(&self) -> usize {
        self.child_states().count()
    }

    /// Returns true if ChildManager has no active children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregates states from child policies.
    ///
    /// If any child is READY then we consider the aggregate state to be READY.
    /// Otherwise, if any child is CONNECTING, then report CONNECTING.
    /// Otherwise, if any child is IDLE, then report IDLE.
    /// Report TRANSIENT FAILURE if no conditions above apply.
    pub fn aggregate_states(&self) -> ConnectivityState {
        aggregate(self.child_states().map(|(_, state)| state.connectivity_state))
    }

    /// Checks whether a child has produced an update, or the set of children
    /// changed, since the last call.
    pub fn has_updated(&mut self) -> bool {
        mem::take(&mut self.updated)
    }

    fn active_ids(&self) -> Vec<T> {
        self.child_states().map(|(id, _)| id.clone()).collect()
    }

    // Calls into the child `id` with a controller that records the
    // subchannels it creates and the picker it reports.  Returns None if
    // there is no such child.
    fn call_child<R>(
        &mut self,
        id: &T,
        channel_controller: &mut dyn ChannelController,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn ChannelController) -> R,
    ) -> Option<R> {
        let child = self.children.get_mut(id)?;
        let mut wrapped = WrappedController::new(channel_controller);
        let result = f(child.policy.as_mut(), &mut wrapped);
        for subchannel in wrapped.created_subchannels {
            self.subchannel_child_map
                .insert(WeakSubchannel::new(&subchannel), id.clone());
        }
        if let Some(state) = wrapped.picker_update {
            child.state = state;
            if !child.retained {
                self.updated = true;
            }
        }
        Some(result)
    }
}

/// Combines connectivity states the way [`ChildManager::aggregate_states`]
/// does.
pub fn aggregate(states: impl IntoIterator<Item = ConnectivityState>) -> ConnectivityState {
    let mut is_connecting = false;
    let mut is_idle = false;
    for state in states {
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => is_connecting = true,
            ConnectivityState::Idle => is_idle = true,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {}
        }
    }
    if is_connecting {
        ConnectivityState::Connecting
    } else if is_idle {
        ConnectivityState::Idle
    } else {
        ConnectivityState::TransientFailure
    }
}

struct WrappedController<'a> {
    channel_controller: &'a mut dyn ChannelController,
    created_subchannels: Vec<Arc<dyn Subchannel>>,
    picker_update: Option<LbState>,
}

impl<'a> WrappedController<'a> {
    fn new(channel_controller: &'a mut dyn ChannelController) -> Self {
        Self {
            channel_controller,
            created_subchannels: vec![],
            picker_update: None,
        }
    }
}

impl ChannelController for WrappedController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = self.channel_controller.new_subchannel(address);
        self.created_subchannels.push(subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.channel_controller.request_resolution();
    }
}

struct ChildWorkScheduler<T> {
    pending_work: Arc<Mutex<HashSet<T>>>,
    id: T,
    parent: Arc<dyn WorkScheduler>,
    active: AtomicBool, // false once the child is removed.
}

impl<T: Clone + Eq + Hash + Send + Sync> WorkScheduler for ChildWorkScheduler<T> {
    fn schedule_work(&self) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        self.pending_work.lock().insert(self.id.clone());
        self.parent.schedule_work();
    }
}
