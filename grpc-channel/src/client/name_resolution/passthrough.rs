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

use super::{
    Address, Endpoint, Resolver, ResolverBuilder, ResolverOptions, ResolverRegistry,
    ResolverUpdate, StaticResolver, Target, parse_dial_target,
};

pub(super) const SCHEME: &str = "passthrough";

/// Hands the target's endpoint to the transport unchanged.
struct PassthroughResolverBuilder;

pub(super) fn reg(registry: &ResolverRegistry) {
    registry.add_builder(Arc::new(PassthroughResolverBuilder));
}

impl ResolverBuilder for PassthroughResolverBuilder {
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let endpoint = target.endpoint();
        let update = if endpoint.is_empty() {
            ResolverUpdate::from_error("passthrough: received empty target")
        } else {
            let (network_type, address) = parse_dial_target(endpoint);
            let address = Address::new(network_type, address);
            ResolverUpdate::from_endpoints(vec![Endpoint::new(vec![address])])
        };
        Box::new(StaticResolver::new(update, &options))
    }

    fn scheme(&self) -> &str {
        SCHEME
    }
}
