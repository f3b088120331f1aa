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

use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{BoxFuture, BoxedTaskHandle, Runtime, Sleep, TaskHandle};

/// A [`Runtime`] backed by the ambient tokio runtime.
///
/// Spawning panics if called outside of a tokio runtime context.
#[derive(Debug, Default)]
pub struct TokioRuntime {
    _priv: (),
}

impl TaskHandle for JoinHandle<()> {
    fn abort(&self) {
        self.abort()
    }
}

impl Sleep for tokio::time::Sleep {}

impl Runtime for TokioRuntime {
    fn spawn(&self, task: BoxFuture<()>) -> BoxedTaskHandle {
        Box::new(tokio::spawn(task))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spawned_task_runs_after_sleep() {
        let rt = TokioRuntime::default();
        let ran = Arc::new(AtomicBool::new(false));
        let sleep = rt.sleep(Duration::from_secs(5));
        let ran_clone = ran.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        rt.spawn(Box::pin(async move {
            sleep.await;
            ran_clone.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        }));
        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_task_does_not_run() {
        let rt = TokioRuntime::default();
        let ran = Arc::new(AtomicBool::new(false));
        let sleep = rt.sleep(Duration::from_secs(5));
        let ran_clone = ran.clone();
        let handle = rt.spawn(Box::pin(async move {
            sleep.await;
            ran_clone.store(true, Ordering::SeqCst);
        }));
        handle.abort();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
