//! Process-wide connection lifecycle.
//!
//! The registry tracks at most one worker that is still connecting and at
//! most one established connection. Every slot transition happens under a
//! single mutex; the handle taken out of a slot is torn down by whoever took
//! it. A handle is consumed by its teardown, so it cannot be torn down twice.
//!
//! Lifecycle events are ordered by a second lock that is taken before the
//! slot lock is released, so listeners see transitions in slot order.

use crate::config::ClientConfig;
use crate::device::{InterfaceDescriptor, Platform};
use crate::supervisor::{EstablishCallback, ReconnectSupervisor};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Per-connect-request id, used for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Established connection: the worker's cancellation token and the
/// interface it is forwarding through.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    cancel: CancellationToken,
    interface: Arc<InterfaceDescriptor>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, cancel: CancellationToken, interface: Arc<InterfaceDescriptor>) -> Self {
        Self {
            id,
            cancel,
            interface,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn interface(&self) -> &Arc<InterfaceDescriptor> {
        &self.interface
    }

    /// Stop the worker and close the interface.
    pub fn teardown(self) {
        self.cancel.cancel();
        self.interface.close();
        log::debug!("[conn {}] Torn down {}", self.id, self.interface.name());
    }
}

/// Lifecycle transitions surfaced to the UI/notification layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connecting(ConnectionId),
    Connected(ConnectionId),
    Disconnected,
}

/// Receives lifecycle events, in the order the slots changed.
///
/// Called from worker tasks and from `connect`/`disconnect`. Must not call
/// back into the registry.
pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: LifecycleEvent);
}

struct WorkerRef {
    id: ConnectionId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SupervisorState {
    connecting: Option<WorkerRef>,
    established: Option<ConnectionHandle>,
}

struct RegistryInner {
    platform: Arc<dyn Platform>,
    listener: Option<Arc<dyn LifecycleListener>>,
    state: Mutex<SupervisorState>,
    event_order: Mutex<()>,
    next_id: AtomicU64,
}

/// Owner of the connection slots. Cheap to clone; the slots are torn down
/// (without events) when the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::build(platform, None)
    }

    pub fn with_listener(platform: Arc<dyn Platform>, listener: Arc<dyn LifecycleListener>) -> Self {
        Self::build(platform, Some(listener))
    }

    fn build(platform: Arc<dyn Platform>, listener: Option<Arc<dyn LifecycleListener>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                platform,
                listener,
                state: Mutex::new(SupervisorState::default()),
                event_order: Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start a new logical connection. Any worker that is still connecting
    /// is cancelled; the established connection (if any) stays up until
    /// the new worker replaces it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, config: ClientConfig) -> ConnectionId {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();

        self.inner.start_connecting(WorkerRef {
            id,
            cancel: cancel.clone(),
        });

        let weak = Arc::downgrade(&self.inner);
        let on_establish: EstablishCallback = {
            let weak = weak.clone();
            let cancel = cancel.clone();
            Arc::new(move |interface: Arc<InterfaceDescriptor>| match weak.upgrade() {
                Some(inner) => inner.on_established(ConnectionHandle::new(id, cancel.clone(), interface)),
                None => {
                    interface.close();
                }
            })
        };

        let worker = ReconnectSupervisor::new(
            id,
            Arc::new(config),
            self.inner.platform.clone(),
            cancel,
            on_establish,
        );
        tokio::spawn(async move {
            let _ = worker.run().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_worker_exit(id);
            }
        });
        id
    }

    /// Empty both slots, report the tunnel as down, then tear down what
    /// was established.
    pub fn disconnect(&self) {
        let (established, order) = {
            let mut state = self.inner.lock();
            // Cancelled under the lock so a racing establish sees it.
            if let Some(worker) = state.connecting.take() {
                log::debug!("[conn {}] Cancelling connecting worker", worker.id);
                worker.cancel.cancel();
            }
            (state.established.take(), self.inner.order_events())
        };
        self.inner.notify(LifecycleEvent::Disconnected);
        drop(order);

        if let Some(handle) = established {
            handle.teardown();
        }
    }

    pub fn connecting_id(&self) -> Option<ConnectionId> {
        self.inner.lock().connecting.as_ref().map(|w| w.id)
    }

    pub fn established_id(&self) -> Option<ConnectionId> {
        self.inner.lock().established.as_ref().map(|h| h.id)
    }
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn order_events(&self) -> MutexGuard<'_, ()> {
        self.event_order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: LifecycleEvent) {
        if let Some(ref listener) = self.listener {
            listener.on_event(event);
        }
    }

    fn start_connecting(&self, worker: WorkerRef) {
        let id = worker.id;
        let order = {
            let mut state = self.lock();
            if let Some(previous) = state.connecting.replace(worker) {
                log::debug!("[conn {}] Superseded while connecting", previous.id);
                previous.cancel.cancel();
            }
            self.order_events()
        };
        self.notify(LifecycleEvent::Connecting(id));
        drop(order);
    }

    fn on_established(&self, handle: ConnectionHandle) {
        let id = handle.id;
        let (previous, order) = {
            let mut state = self.lock();
            if state.connecting.as_ref().is_some_and(|w| w.id == id) {
                state.connecting = None;
            }
            // A superseded or disconnected worker must not take the slot.
            if handle.cancel.is_cancelled() {
                drop(state);
                log::debug!("[conn {}] Established after cancellation", id);
                handle.teardown();
                return;
            }
            (state.established.replace(handle), self.order_events())
        };
        self.notify(LifecycleEvent::Connected(id));
        drop(order);

        if let Some(previous) = previous {
            if previous.id == id {
                // Same worker reconnected; its old interface is already done.
                previous.interface.close();
            } else {
                previous.teardown();
            }
        }
    }

    /// Drop whatever the finished worker still occupies.
    fn on_worker_exit(&self, id: ConnectionId) {
        let established = {
            let mut state = self.lock();
            if state.connecting.as_ref().is_some_and(|w| w.id == id) {
                state.connecting = None;
            }
            if state.established.as_ref().is_some_and(|h| h.id == id) {
                state.established.take()
            } else {
                None
            }
        };
        if let Some(handle) = established {
            handle.teardown();
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut().unwrap_or_else(PoisonError::into_inner));
        if let Some(worker) = state.connecting {
            worker.cancel.cancel();
        }
        if let Some(handle) = state.established {
            handle.teardown();
        }
    }
}
