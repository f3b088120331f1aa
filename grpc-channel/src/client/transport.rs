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

//! The pluggable connection layer under subchannels.
//!
//! The channel does not frame or carry RPCs itself.  A [`Transport`] registered
//! for an address's network type establishes connections; the established
//! connection is handed back opaquely to whoever picked the subchannel.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tonic::async_trait;

use crate::rt::Runtime;

/// An established connection.
pub struct ConnectedTransport {
    /// Handed to RPCs routed to the subchannel.
    pub connection: Arc<dyn Any + Send + Sync>,
    /// Completes when the connection is lost, with the reason if it failed.
    pub disconnected: oneshot::Receiver<Result<(), String>>,
}

/// Settings for one connection attempt.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// The attempt is abandoned after this.
    pub connect_deadline: Option<Instant>,
    /// The authority of the channel the connection is made for.
    pub authority: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: String,
        runtime: Arc<dyn Runtime>,
        options: &TransportOptions,
    ) -> Result<ConnectedTransport, String>;
}

/// A registry to store and retrieve transports.  Transports are indexed by
/// the network type of the addresses they handle.
#[derive(Default, Clone)]
pub struct TransportRegistry {
    m: Arc<Mutex<HashMap<String, Arc<dyn Transport>>>>,
}

impl Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.m.lock().keys()).finish()
    }
}

impl TransportRegistry {
    /// Construct an empty transport registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transport into the registry, replacing any transport registered
    /// for `network_type`.
    pub fn add_transport(&self, network_type: &str, transport: impl Transport + 'static) {
        self.m
            .lock()
            .insert(network_type.to_string(), Arc::new(transport));
    }

    /// Retrieve the transport for `network_type`.
    pub fn get_transport(&self, network_type: &str) -> Result<Arc<dyn Transport>, String> {
        self.m
            .lock()
            .get(network_type)
            .cloned()
            .ok_or_else(|| format!("no transport found for network type {network_type}"))
    }
}

/// The registry used when a channel is not given its own.  Empty until the
/// application registers transports.
pub static GLOBAL_TRANSPORT_REGISTRY: LazyLock<TransportRegistry> =
    LazyLock::new(TransportRegistry::new);
