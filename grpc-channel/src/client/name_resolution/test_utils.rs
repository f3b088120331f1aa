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

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    Address, ChannelController, Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate,
    Target, WorkScheduler,
};
use crate::client::service_config::ServiceConfig;
use crate::rt::default_runtime;

/// Counts calls to schedule_work.
#[derive(Default)]
pub(crate) struct CountingWorkScheduler {
    count: AtomicUsize,
}

impl CountingWorkScheduler {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl WorkScheduler for CountingWorkScheduler {
    fn schedule_work(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every update a resolver reports.
#[derive(Default)]
pub(crate) struct FakeResolverChannel {
    pub(crate) updates: Vec<ResolverUpdate>,
}

impl FakeResolverChannel {
    pub(crate) fn last_addresses(&self) -> Result<Vec<Address>, String> {
        let update = self.updates.last().expect("no update reported");
        update.endpoints.clone().map(|_| update.addresses())
    }
}

impl ChannelController for FakeResolverChannel {
    fn update(&mut self, update: ResolverUpdate) -> Result<(), String> {
        self.updates.push(update);
        Ok(())
    }

    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String> {
        ServiceConfig::parse(config).map_err(|err| err.to_string())
    }
}

pub(crate) fn build_resolver(
    builder: &dyn ResolverBuilder,
    target: &str,
) -> (Box<dyn Resolver>, Arc<CountingWorkScheduler>) {
    let scheduler = Arc::new(CountingWorkScheduler::default());
    let target = Target::parse(target);
    let options = ResolverOptions::new(
        builder.default_authority(&target),
        default_runtime(),
        scheduler.clone(),
    );
    (builder.build(&target, options), scheduler)
}
