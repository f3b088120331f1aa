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
    ResolverUpdate, StaticResolver, Target, UNIX_NETWORK,
};

const UNIX_SCHEME: &str = "unix";
const UNIX_ABSTRACT_SCHEME: &str = "unix-abstract";

/// Resolves `unix:` and `unix-abstract:` targets to a single unix socket
/// address.  Abstract socket names are prefixed with a NUL byte.
struct UnixResolverBuilder {
    scheme: &'static str,
}

pub(super) fn reg(registry: &ResolverRegistry) {
    registry.add_builder(Arc::new(UnixResolverBuilder {
        scheme: UNIX_SCHEME,
    }));
    registry.add_builder(Arc::new(UnixResolverBuilder {
        scheme: UNIX_ABSTRACT_SCHEME,
    }));
}

impl UnixResolverBuilder {
    fn resolve(&self, target: &Target) -> Result<Address, String> {
        if !target.authority().is_empty() {
            return Err(format!(
                "invalid (non-empty) authority: {}",
                target.authority()
            ));
        }
        let endpoint = target.endpoint();
        if endpoint.is_empty() {
            return Err(format!("{}: empty socket path", self.scheme));
        }
        let path = if self.scheme == UNIX_ABSTRACT_SCHEME {
            format!("\0{endpoint}")
        } else {
            endpoint.to_string()
        };
        Ok(Address::new(UNIX_NETWORK, path))
    }
}

impl ResolverBuilder for UnixResolverBuilder {
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let update = match self.resolve(target) {
            Ok(address) => ResolverUpdate::from_endpoints(vec![Endpoint::new(vec![address])]),
            Err(err) => ResolverUpdate::from_error(err),
        };
        Box::new(StaticResolver::new(update, &options))
    }

    fn scheme(&self) -> &str {
        self.scheme
    }

    fn default_authority(&self, _target: &Target) -> String {
        "localhost".to_string()
    }
}
