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

//! A resolver whose results are pushed by the application.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    ChannelController, Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate, Target,
    WorkScheduler,
};

#[derive(Default)]
struct ManualState {
    update: Option<ResolverUpdate>,
    work_scheduler: Option<Arc<dyn WorkScheduler>>,
    resolve_now_calls: usize,
}

/// A resolver builder whose resolvers report whatever was last passed to
/// [`ManualResolverBuilder::update_state`].
///
/// Register it (or hand it to a channel directly) and push updates from the
/// application or a test.  Updates pushed before the resolver is built are
/// delivered when it is.
#[derive(Clone)]
pub struct ManualResolverBuilder {
    scheme: String,
    state: Arc<Mutex<ManualState>>,
}

impl ManualResolverBuilder {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            state: Default::default(),
        }
    }

    /// Publishes `update` to the channel using this resolver.
    pub fn update_state(&self, update: ResolverUpdate) {
        let work_scheduler = {
            let mut state = self.state.lock();
            state.update = Some(update);
            state.work_scheduler.clone()
        };
        if let Some(work_scheduler) = work_scheduler {
            work_scheduler.schedule_work();
        }
    }

    /// Reports a resolver error to the channel.
    pub fn report_error(&self, error: impl Into<String>) {
        self.update_state(ResolverUpdate::from_error(error));
    }

    /// Returns how many times the channel asked for re-resolution.
    pub fn resolve_now_calls(&self) -> usize {
        self.state.lock().resolve_now_calls
    }
}

impl ResolverBuilder for ManualResolverBuilder {
    fn build(&self, _target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let has_update = {
            let mut state = self.state.lock();
            state.work_scheduler = Some(options.work_scheduler.clone());
            state.update.is_some()
        };
        if has_update {
            options.work_scheduler.schedule_work();
        }
        Box::new(ManualResolver {
            state: self.state.clone(),
        })
    }

    fn scheme(&self) -> &str {
        &self.scheme
    }
}

struct ManualResolver {
    state: Arc<Mutex<ManualState>>,
}

impl Resolver for ManualResolver {
    fn resolve_now(&mut self) {
        self.state.lock().resolve_now_calls += 1;
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let update = self.state.lock().update.clone();
        if let Some(update) = update {
            let _ = channel_controller.update(update);
        }
    }
}

impl Drop for ManualResolver {
    fn drop(&mut self) {
        self.state.lock().work_scheduler = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::name_resolution::test_utils::{FakeResolverChannel, build_resolver};
    use crate::client::name_resolution::{Address, Endpoint};

    #[test]
    fn update_before_build_is_delivered() {
        let builder = ManualResolverBuilder::new("manual");
        builder.update_state(ResolverUpdate::from_endpoints(vec![Endpoint::new(vec![
            Address::tcp("a:1"),
        ])]));
        let (mut resolver, scheduled) = build_resolver(&builder, "manual:///svc");
        assert_eq!(scheduled.count(), 1);

        let mut channel = FakeResolverChannel::default();
        resolver.work(&mut channel);
        assert_eq!(channel.last_addresses().unwrap(), vec![Address::tcp("a:1")]);
    }

    #[test]
    fn update_after_build_schedules_work() {
        let builder = ManualResolverBuilder::new("manual");
        let (mut resolver, scheduled) = build_resolver(&builder, "manual:///svc");
        assert_eq!(scheduled.count(), 0);

        builder.report_error("no such host");
        assert_eq!(scheduled.count(), 1);

        let mut channel = FakeResolverChannel::default();
        resolver.work(&mut channel);
        assert_eq!(channel.last_addresses().unwrap_err(), "no such host");

        resolver.resolve_now();
        resolver.resolve_now();
        assert_eq!(builder.resolve_now_calls(), 2);
    }
}
