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

//! A single-producer, multi-consumer cell holding the latest published value.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DistributorError {
    #[error("distributor is already closed")]
    AlreadyClosed,
    #[error("wait was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Empty,
    Published(T),
    Closed,
}

/// Publishes values to any number of waiters.
///
/// Waiters always observe the most recent value; values published between two
/// observations are not queued.  A producer that needs to publish a value
/// together with an error publishes a `Result`.
#[derive(Debug)]
pub struct Distributor<T> {
    tx: watch::Sender<Slot<T>>,
}

impl<T: Clone + Send + Sync> Distributor<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Slot::Empty);
        Self { tx }
    }

    /// Publishes `value`, waking every waiter.  Does nothing once closed.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if matches!(slot, Slot::Closed) {
                return false;
            }
            *slot = Slot::Published(value);
            true
        });
    }

    /// Returns the current value without waiting.
    pub fn get(&self) -> Option<T> {
        match &*self.tx.borrow() {
            Slot::Published(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Waits until a value has been published and returns the latest one.
    ///
    /// Returns early with an error if `cancel` fires or the distributor is
    /// closed.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<T, DistributorError> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(DistributorError::Cancelled),
            slot = rx.wait_for(|slot| !matches!(slot, Slot::Empty)) => match slot.as_deref() {
                Ok(Slot::Published(value)) => Ok(value.clone()),
                _ => Err(DistributorError::AlreadyClosed),
            },
        }
    }

    /// Closes the distributor.  Pending and future waits fail with
    /// [`DistributorError::AlreadyClosed`].
    pub fn close(&self) {
        self.tx.send_replace(Slot::Closed);
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.tx.borrow(), Slot::Closed)
    }
}

impl<T: Clone + Send + Sync> Default for Distributor<T> {
    fn default() -> Self {
        Self::new()
    }
}
