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

//! An abstraction over the asynchronous runtime used by the channel for
//! background tasks and timers.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

pub mod tokio;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type BoxedTaskHandle = Box<dyn TaskHandle>;

/// An abstraction over an asynchronous runtime.
///
/// The `Runtime` trait defines the functionality the channel needs from an
/// executor: spawning background tasks and sleeping.  Channels, LB policies and
/// caches receive it as a trait object so tests and embedders can supply their
/// own.
pub trait Runtime: Send + Sync {
    /// Spawns the given asynchronous task to run in the background.
    fn spawn(&self, task: BoxFuture<()>) -> BoxedTaskHandle;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Sync + Future<Output = ()> {}

pub trait TaskHandle: Send + Sync {
    /// Abort the associated task.
    fn abort(&self);
}

/// Returns the runtime used when none is configured.
pub fn default_runtime() -> Arc<dyn Runtime> {
    Arc::new(tokio::TokioRuntime::default())
}
