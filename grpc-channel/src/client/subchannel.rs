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

//! Subchannels: the connections to individual addresses.
//!
//! An [`InternalSubchannel`] owns the connection to one address and runs the
//! connectivity state machine for it.  Internal subchannels are shared through
//! a [`SubchannelPool`]: every LB policy asking for the same address gets its
//! own [`ExternalSubchannel`] handle on the same internal subchannel, which is
//! disconnected once the last handle is dropped.

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{Subchannel, SubchannelState};
use crate::client::name_resolution::Address;
use crate::client::name_resolution::backoff::{
    DEFAULT_EXPONENTIAL_CONFIG, ExponentialBackoff,
};
use crate::client::transport::{ConnectedTransport, Transport, TransportOptions};
use crate::rt::{BoxedTaskHandle, Runtime};

/// The minimum time allowed for one connection attempt.
pub(crate) const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

type Connection = Arc<dyn Any + Send + Sync>;

/// Receives every state change of the subchannel it is registered with.
pub(crate) type StateWatcher = Arc<dyn Fn(SubchannelState) + Send + Sync>;

enum InternalSubchannelState {
    Idle,
    Connecting {
        _task: TaskGuard,
    },
    Ready {
        connection: Connection,
        _task: TaskGuard,
    },
    TransientFailure {
        error: String,
        _task: TaskGuard,
    },
}

impl InternalSubchannelState {
    fn to_subchannel_state(&self) -> SubchannelState {
        match self {
            Self::Idle => SubchannelState::new(ConnectivityState::Idle),
            Self::Connecting { .. } => SubchannelState::new(ConnectivityState::Connecting),
            Self::Ready { .. } => SubchannelState::new(ConnectivityState::Ready),
            Self::TransientFailure { error, .. } => {
                let error: Arc<dyn Error + Send + Sync> = Arc::from(Box::from(error.clone()));
                SubchannelState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    last_connection_error: Some(error),
                }
            }
        }
    }
}

impl Display for InternalSubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting { .. } => write!(f, "Connecting"),
            Self::Ready { .. } => write!(f, "Ready"),
            Self::TransientFailure { .. } => write!(f, "TransientFailure"),
        }
    }
}

// Aborts the task tied to a state when the state is left.
struct TaskGuard(Option<BoxedTaskHandle>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

enum StateMachineEvent {
    ConnectionRequested,
    ConnectionSucceeded(ConnectedTransport),
    ConnectionTimedOut,
    ConnectionFailed(String),
    ConnectionTerminated(Result<(), String>),
    BackoffExpired,
}

impl Debug for StateMachineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionRequested => write!(f, "ConnectionRequested"),
            Self::ConnectionSucceeded(_) => write!(f, "ConnectionSucceeded"),
            Self::ConnectionTimedOut => write!(f, "ConnectionTimedOut"),
            Self::ConnectionFailed(err) => write!(f, "ConnectionFailed({err})"),
            Self::ConnectionTerminated(_) => write!(f, "ConnectionTerminated"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
        }
    }
}

struct Inner {
    state: InternalSubchannelState,
    backoff: ExponentialBackoff,
    watchers: Vec<(u64, StateWatcher)>,
}

/// The connection to one address, shared by every handle on it.
pub(crate) struct InternalSubchannel {
    address: Address,
    transport: Result<Arc<dyn Transport>, String>,
    transport_options: TransportOptions,
    runtime: Arc<dyn Runtime>,
    events: mpsc::UnboundedSender<StateMachineEvent>,
    inner: Mutex<Inner>,
    next_watcher_id: AtomicU64,
    pool: Weak<SubchannelPool>,
    state_machine: Mutex<Option<BoxedTaskHandle>>,
}

impl InternalSubchannel {
    fn new(
        address: Address,
        transport: Result<Arc<dyn Transport>, String>,
        transport_options: TransportOptions,
        runtime: Arc<dyn Runtime>,
        pool: Weak<SubchannelPool>,
    ) -> Arc<Self> {
        tracing::debug!(%address, "creating subchannel");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let isc = Arc::new(Self {
            address,
            transport,
            transport_options,
            runtime: runtime.clone(),
            events: tx,
            inner: Mutex::new(Inner {
                state: InternalSubchannelState::Idle,
                backoff: ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG)
                    .unwrap_or_default(),
                watchers: Vec::new(),
            }),
            next_watcher_id: AtomicU64::new(0),
            pool,
            state_machine: Mutex::new(None),
        });

        // Events are handled one at a time, so watchers see transitions in
        // order.  The task ends when the subchannel is dropped.
        let weak = Arc::downgrade(&isc);
        let task = runtime.spawn(Box::pin(async move {
            while let Some(event) = rx.recv().await {
                let Some(isc) = weak.upgrade() else {
                    break;
                };
                tracing::trace!(address = %isc.address, ?event, "subchannel event");
                isc.handle_event(event);
            }
        }));
        *isc.state_machine.lock() = Some(task);
        isc
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// Starts connecting if the subchannel is Idle.
    pub(crate) fn connect(&self) {
        if matches!(self.inner.lock().state, InternalSubchannelState::Idle) {
            let _ = self.events.send(StateMachineEvent::ConnectionRequested);
        }
    }

    /// The established connection, if Ready.
    pub(crate) fn connection(&self) -> Option<Connection> {
        match &self.inner.lock().state {
            InternalSubchannelState::Ready { connection, .. } => Some(connection.clone()),
            _ => None,
        }
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.inner.lock().state.to_subchannel_state().connectivity_state
    }

    /// Registers `watcher`, which immediately receives the current state.
    /// Returns an id for [`InternalSubchannel::unregister_watcher`].
    pub(crate) fn register_watcher(&self, watcher: StateWatcher) -> u64 {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let state = {
            let mut inner = self.inner.lock();
            inner.watchers.push((id, watcher.clone()));
            inner.state.to_subchannel_state()
        };
        watcher(state);
        id
    }

    pub(crate) fn unregister_watcher(&self, id: u64) {
        self.inner.lock().watchers.retain(|(w, _)| *w != id);
    }

    fn handle_event(&self, event: StateMachineEvent) {
        match event {
            StateMachineEvent::ConnectionRequested => {
                if matches!(self.inner.lock().state, InternalSubchannelState::Idle) {
                    self.move_to_connecting();
                }
            }
            StateMachineEvent::ConnectionSucceeded(connected) => self.move_to_ready(connected),
            StateMachineEvent::ConnectionTimedOut => {
                self.move_to_transient_failure("connect timeout expired".to_string())
            }
            StateMachineEvent::ConnectionFailed(err) => self.move_to_transient_failure(err),
            StateMachineEvent::ConnectionTerminated(result) => {
                if let Err(err) = result {
                    tracing::debug!(address = %self.address, error = %err, "connection lost");
                }
                self.set_state(InternalSubchannelState::Idle);
            }
            StateMachineEvent::BackoffExpired => self.set_state(InternalSubchannelState::Idle),
        }
    }

    fn move_to_connecting(&self) {
        let transport = match &self.transport {
            Ok(transport) => transport.clone(),
            Err(err) => {
                tracing::warn!(address = %self.address, error = %err, "cannot connect subchannel");
                self.move_to_transient_failure(err.clone());
                return;
            }
        };
        let address = self.address.address.clone();
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        let mut options = self.transport_options.clone();
        options.connect_deadline = Some(Instant::now() + MIN_CONNECT_TIMEOUT);
        let deadline = self.runtime.sleep(MIN_CONNECT_TIMEOUT);
        let task = self.runtime.spawn(Box::pin(async move {
            let event = tokio::select! {
                _ = deadline => StateMachineEvent::ConnectionTimedOut,
                result = transport.connect(address, runtime, &options) => match result {
                    Ok(connected) => StateMachineEvent::ConnectionSucceeded(connected),
                    Err(err) => StateMachineEvent::ConnectionFailed(err),
                },
            };
            let _ = events.send(event);
        }));
        self.set_state(InternalSubchannelState::Connecting {
            _task: TaskGuard(Some(task)),
        });
    }

    fn move_to_ready(&self, connected: ConnectedTransport) {
        let ConnectedTransport {
            connection,
            disconnected,
        } = connected;
        let events = self.events.clone();
        let task = self.runtime.spawn(Box::pin(async move {
            let result = disconnected
                .await
                .unwrap_or_else(|_| Err("transport dropped".to_string()));
            let _ = events.send(StateMachineEvent::ConnectionTerminated(result));
        }));
        self.inner.lock().backoff.reset();
        self.set_state(InternalSubchannelState::Ready {
            connection,
            _task: TaskGuard(Some(task)),
        });
    }

    fn move_to_transient_failure(&self, error: String) {
        tracing::debug!(address = %self.address, %error, "connection attempt failed");
        let backoff = self.inner.lock().backoff.backoff_duration();
        let sleep = self.runtime.sleep(backoff);
        let events = self.events.clone();
        let task = self.runtime.spawn(Box::pin(async move {
            sleep.await;
            let _ = events.send(StateMachineEvent::BackoffExpired);
        }));
        self.set_state(InternalSubchannelState::TransientFailure {
            error,
            _task: TaskGuard(Some(task)),
        });
    }

    // Replaces the state and notifies watchers outside of the lock.
    fn set_state(&self, state: InternalSubchannelState) {
        let (update, watchers) = {
            let mut inner = self.inner.lock();
            tracing::debug!(address = %self.address, from = %inner.state, to = %state, "subchannel state change");
            inner.state = state;
            let watchers: Vec<StateWatcher> =
                inner.watchers.iter().map(|(_, w)| w.clone()).collect();
            (inner.state.to_subchannel_state(), watchers)
        };
        for watcher in watchers {
            watcher(update.clone());
        }
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        tracing::debug!(address = %self.address, "dropping subchannel");
        if let Some(task) = self.state_machine.get_mut().take() {
            task.abort();
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.unregister(&self.address);
        }
    }
}

/// Shares internal subchannels by address.  The pool holds them weakly.
pub(crate) struct SubchannelPool {
    subchannels: Mutex<HashMap<Address, Weak<InternalSubchannel>>>,
}

impl SubchannelPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            subchannels: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the live subchannel for `address`, creating it if needed.
    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        address: &Address,
        transport: impl FnOnce() -> Result<Arc<dyn Transport>, String>,
        transport_options: &TransportOptions,
        runtime: &Arc<dyn Runtime>,
    ) -> Arc<InternalSubchannel> {
        let mut subchannels = self.subchannels.lock();
        if let Some(isc) = subchannels.get(address).and_then(Weak::upgrade) {
            return isc;
        }
        let isc = InternalSubchannel::new(
            address.clone(),
            transport(),
            transport_options.clone(),
            runtime.clone(),
            Arc::downgrade(self),
        );
        subchannels.insert(address.clone(), Arc::downgrade(&isc));
        isc
    }

    // A replacement may already be registered under the same address.
    fn unregister(&self, address: &Address) {
        let mut subchannels = self.subchannels.lock();
        if subchannels
            .get(address)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            subchannels.remove(address);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subchannels.lock().len()
    }
}

/// The handle on an internal subchannel given to one LB policy.  Dropping it
/// stops state updates to that policy.
pub(crate) struct ExternalSubchannel {
    isc: Arc<InternalSubchannel>,
    watcher_id: Mutex<Option<u64>>,
}

impl ExternalSubchannel {
    pub(crate) fn new(isc: Arc<InternalSubchannel>) -> Arc<Self> {
        Arc::new(Self {
            isc,
            watcher_id: Mutex::new(None),
        })
    }

    /// Starts delivering state changes to `watcher`.  The watcher holds the
    /// handle weakly.
    pub(crate) fn watch(
        self: &Arc<Self>,
        on_change: impl Fn(Arc<ExternalSubchannel>, SubchannelState) + Send + Sync + 'static,
    ) {
        let weak = Arc::downgrade(self);
        let id = self.isc.register_watcher(Arc::new(move |state| {
            if let Some(sc) = weak.upgrade() {
                on_change(sc, state);
            }
        }));
        *self.watcher_id.lock() = Some(id);
    }
}

impl Subchannel for ExternalSubchannel {
    fn address(&self) -> Address {
        self.isc.address().clone()
    }

    fn connect(&self) {
        self.isc.connect();
    }

    fn connection(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.isc.connection()
    }
}

impl Drop for ExternalSubchannel {
    fn drop(&mut self) {
        if let Some(id) = self.watcher_id.get_mut().take() {
            self.isc.unregister_watcher(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::client::transport::test_utils::FakeTransport;
    use crate::rt::default_runtime;

    struct Fixture {
        pool: Arc<SubchannelPool>,
        transport: Arc<FakeTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: SubchannelPool::new(),
                transport: Arc::new(FakeTransport::default()),
            }
        }

        fn subchannel(
            &self,
            address: &str,
        ) -> (
            Arc<ExternalSubchannel>,
            mpsc::UnboundedReceiver<ConnectivityState>,
        ) {
            let transport: Arc<dyn Transport> = Arc::new(self.transport.clone());
            let isc = self.pool.get_or_create(
                &Address::tcp(address),
                || Ok(transport),
                &TransportOptions::default(),
                &default_runtime(),
            );
            let sc = ExternalSubchannel::new(isc);
            let (tx, rx) = mpsc::unbounded_channel();
            sc.watch(move |_, state| {
                let _ = tx.send(state.connectivity_state);
            });
            (sc, rx)
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ConnectivityState>) -> ConnectivityState {
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn connects_and_returns_to_idle_when_connection_is_lost() {
        let f = Fixture::new();
        let (sc, mut states) = f.subchannel("a:1");
        assert_eq!(next(&mut states).await, ConnectivityState::Idle);
        assert!(sc.connection().is_none());

        sc.connect();
        assert_eq!(next(&mut states).await, ConnectivityState::Connecting);
        assert_eq!(next(&mut states).await, ConnectivityState::Ready);
        let connection = sc.connection().unwrap();
        assert_eq!(connection.downcast_ref::<String>().unwrap(), "a:1");

        f.transport.disconnect_all();
        assert_eq!(next(&mut states).await, ConnectivityState::Idle);
        assert!(sc.connection().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_then_return_to_idle() {
        let f = Fixture::new();
        f.transport.fail.store(true, Ordering::SeqCst);
        let (sc, mut states) = f.subchannel("a:1");
        assert_eq!(next(&mut states).await, ConnectivityState::Idle);

        sc.connect();
        assert_eq!(next(&mut states).await, ConnectivityState::Connecting);
        assert_eq!(next(&mut states).await, ConnectivityState::TransientFailure);
        // Connecting again during backoff does nothing.
        sc.connect();
        let failed_at = Instant::now();
        assert_eq!(next(&mut states).await, ConnectivityState::Idle);
        // The first backoff is one second with 20% jitter.
        assert!(failed_at.elapsed() >= Duration::from_millis(800));
        assert_eq!(f.transport.attempts(), 1);
    }

    #[tokio::test]
    async fn missing_transport_fails_connection_attempts() {
        let pool = SubchannelPool::new();
        let isc = pool.get_or_create(
            &Address::tcp("a:1"),
            || Err("no transport found for network type tcp".to_string()),
            &TransportOptions::default(),
            &default_runtime(),
        );
        let sc = ExternalSubchannel::new(isc);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sc.watch(move |_, state| {
            let _ = tx.send(state);
        });
        assert_eq!(rx.recv().await.unwrap().connectivity_state, ConnectivityState::Idle);
        sc.connect();
        let state = rx.recv().await.unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        assert_eq!(
            state.last_connection_error.unwrap().to_string(),
            "no transport found for network type tcp"
        );
    }

    #[tokio::test]
    async fn pool_shares_subchannels_until_last_handle_drops() {
        let f = Fixture::new();
        let (a1, _states1) = f.subchannel("a:1");
        let (a2, mut states2) = f.subchannel("a:1");
        let (b, _states3) = f.subchannel("b:1");
        assert!(Arc::ptr_eq(&a1.isc, &a2.isc));
        assert!(!Arc::ptr_eq(&a1.isc, &b.isc));
        assert_eq!(f.pool.len(), 2);

        // Both handles observe the shared state.
        assert_eq!(next(&mut states2).await, ConnectivityState::Idle);
        a1.connect();
        assert_eq!(next(&mut states2).await, ConnectivityState::Connecting);

        drop(a1);
        assert_eq!(f.pool.len(), 2);
        drop(a2);
        assert_eq!(f.pool.len(), 1);
        drop(b);
        assert_eq!(f.pool.len(), 0);
    }

    #[tokio::test]
    async fn dropped_handles_stop_receiving_updates() {
        let f = Fixture::new();
        let (keep, mut kept_states) = f.subchannel("a:1");
        let (dropped, mut dropped_states) = f.subchannel("a:1");
        assert_eq!(next(&mut dropped_states).await, ConnectivityState::Idle);
        drop(dropped);

        keep.connect();
        assert_eq!(next(&mut kept_states).await, ConnectivityState::Idle);
        assert_eq!(next(&mut kept_states).await, ConnectivityState::Connecting);
        // The dropped handle's watcher was unregistered, so its sender is
        // gone.
        assert_eq!(dropped_states.recv().await, None);
    }
}
