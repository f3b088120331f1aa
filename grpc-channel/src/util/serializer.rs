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

//! Runs callbacks one at a time, in the order they were scheduled, against a
//! piece of state owned by the serializer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::rt::{BoxedTaskHandle, Runtime};

type Callback<T> = Box<dyn FnOnce(&mut T) + Send>;

/// A single-threaded executor that linearises every mutation of `T`.
///
/// Callbacks never run concurrently with each other, so the state needs no
/// locking of its own.  After [`CallbackSerializer::close`] no further
/// callbacks run and the state is dropped.
pub struct CallbackSerializer<T> {
    tx: mpsc::UnboundedSender<Callback<T>>,
    closed: CancellationToken,
    task: BoxedTaskHandle,
}

impl<T: Send + 'static> CallbackSerializer<T> {
    pub fn new(state: T, runtime: &Arc<dyn Runtime>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback<T>>();
        let closed = CancellationToken::new();
        let closed_clone = closed.clone();
        let task = runtime.spawn(Box::pin(async move {
            let mut state = state;
            loop {
                tokio::select! {
                    biased;
                    _ = closed_clone.cancelled() => break,
                    callback = rx.recv() => match callback {
                        Some(callback) => callback(&mut state),
                        None => break,
                    },
                }
            }
        }));
        Self { tx, closed, task }
    }

    /// Queues `callback`.  Returns false if the serializer is closed.
    pub fn schedule(&self, callback: impl FnOnce(&mut T) + Send + 'static) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.tx.send(Box::new(callback)).is_ok()
    }

    /// Stops running callbacks.  Callbacks still queued are dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Returns a handle that can schedule callbacks without owning the
    /// serializer.
    pub fn handle(&self) -> SerializerHandle<T> {
        SerializerHandle {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> Drop for CallbackSerializer<T> {
    fn drop(&mut self) {
        self.closed.cancel();
        self.task.abort();
    }
}

/// A cloneable handle for scheduling onto a [`CallbackSerializer`].
pub struct SerializerHandle<T> {
    tx: mpsc::UnboundedSender<Callback<T>>,
    closed: CancellationToken,
}

impl<T> Clone for SerializerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> SerializerHandle<T> {
    /// Queues `callback`.  Returns false if the serializer is closed.
    pub fn schedule(&self, callback: impl FnOnce(&mut T) + Send + 'static) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.tx.send(Box::new(callback)).is_ok()
    }
}
