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

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use super::ResolverBuilder;

/// A registry to store and retrieve name resolvers.  Resolvers are indexed by
/// the URI scheme they are intended to handle.
#[derive(Default)]
pub struct ResolverRegistry {
    m: Mutex<HashMap<String, Arc<dyn ResolverBuilder>>>,
}

impl ResolverRegistry {
    /// Construct an empty name resolver registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name resolver into the registry.  builder.scheme() is used as the
    /// scheme registered with this builder.  If multiple resolvers are
    /// registered with the same scheme, the one registered last takes effect.
    /// Panics if the scheme contains uppercase characters.
    pub fn add_builder(&self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme().to_string();
        if scheme.chars().any(|c| c.is_ascii_uppercase()) {
            panic!("Scheme must not contain uppercase characters: {scheme}");
        }
        self.m.lock().insert(scheme, builder);
    }

    /// Returns the resolver builder registered for the given scheme, if any.
    /// The lookup is case-insensitive.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.m.lock().get(&scheme.to_lowercase()).cloned()
    }
}

/// Global registry for resolver builders, pre-populated with the passthrough,
/// unix and unix-abstract resolvers.
pub static GLOBAL_RESOLVER_REGISTRY: LazyLock<ResolverRegistry> = LazyLock::new(|| {
    let registry = ResolverRegistry::new();
    super::passthrough::reg(&registry);
    super::unix::reg(&registry);
    registry
});
