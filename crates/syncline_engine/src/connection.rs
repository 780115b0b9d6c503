//! Connection monitoring.

use crate::store::{RemoteStore, StoreError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncline_model::{CollectionId, EntityId};
use tracing::debug;

/// Reachability of the remote store, as seen by this client.
///
/// Process-wide per engine instance: written only by the
/// [`ConnectionMonitor`], read by every other component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The remote store is reachable.
    Online,
    /// The remote store is unreachable; mutations queue locally.
    Offline,
    /// A reachability flip was observed once but is not yet confirmed by
    /// the next probe cycle.
    Degraded,
}

/// Unsubscribe token for a connection listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct MonitorInner {
    /// Last confirmed reachability; `None` until the first probe.
    stable: Option<bool>,
    /// A flip observed once, awaiting confirmation.
    pending: Option<bool>,
    last_probe_ms: Option<u64>,
}

/// Detects reachability of the remote store.
///
/// Probes the store with a minimal read every `probe_interval` (driven by
/// the engine's tick; [`ConnectionMonitor::probe_now`] forces a cycle when a
/// platform connectivity signal arrives). Probe errors are swallowed: a
/// network-class failure is an offline observation; anything else,
/// including a missing probe entity, proves the store answered and counts
/// as online.
///
/// State flapping is damped: a transition is emitted only after the same
/// observation holds for two consecutive probe cycles, so marginal
/// connectivity cannot thrash queue flushing. While a flip is awaiting its
/// confirming probe the reported state is [`ConnectionState::Degraded`].
pub struct ConnectionMonitor {
    store: Arc<dyn RemoteStore>,
    probe_target: (CollectionId, EntityId),
    probe_interval: Duration,
    inner: RwLock<MonitorInner>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_token: AtomicU64,
}

impl ConnectionMonitor {
    /// Creates a monitor probing the given target.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        probe_target: (CollectionId, EntityId),
        probe_interval: Duration,
    ) -> Self {
        Self {
            store,
            probe_target,
            probe_interval,
            inner: RwLock::new(MonitorInner {
                stable: None,
                pending: None,
                last_probe_ms: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Returns the current connection state.
    ///
    /// Before the first probe completes the engine is presumed online.
    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.read();
        if inner.pending.is_some() {
            return ConnectionState::Degraded;
        }
        match inner.stable {
            Some(false) => ConnectionState::Offline,
            _ => ConnectionState::Online,
        }
    }

    /// Registers a listener for confirmed state transitions.
    ///
    /// Listeners are notified synchronously, in registration order.
    pub fn on_state_change(
        &self,
        listener: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerToken {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((token, Arc::new(listener)));
        ListenerToken(token)
    }

    /// Removes a listener. Unknown tokens are ignored.
    pub fn remove_listener(&self, token: ListenerToken) {
        self.listeners.lock().retain(|(id, _)| *id != token.0);
    }

    /// Probes if the probe interval has elapsed since the last cycle.
    pub fn probe_if_due(&self, now_ms: u64) {
        let due = {
            let inner = self.inner.read();
            match inner.last_probe_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= self.probe_interval.as_millis() as u64,
            }
        };
        if due {
            self.probe_now(now_ms);
        }
    }

    /// Runs one probe cycle immediately.
    pub fn probe_now(&self, now_ms: u64) {
        let (collection_id, entity_id) = self.probe_target;
        let observed_online = match self.store.read(collection_id, entity_id) {
            Ok(_) => true,
            Err(err) => !matches!(err, StoreError::Unavailable(_)),
        };
        self.observe(observed_online, now_ms);
    }

    fn observe(&self, observed_online: bool, now_ms: u64) {
        let transition = {
            let mut inner = self.inner.write();
            inner.last_probe_ms = Some(now_ms);

            match inner.stable {
                // First observation sets the baseline without notifying.
                None => {
                    inner.stable = Some(observed_online);
                    None
                }
                Some(stable) if stable == observed_online => {
                    inner.pending = None;
                    None
                }
                Some(_) => {
                    if inner.pending == Some(observed_online) {
                        inner.stable = Some(observed_online);
                        inner.pending = None;
                        Some(observed_online)
                    } else {
                        inner.pending = Some(observed_online);
                        None
                    }
                }
            }
        };

        if let Some(online) = transition {
            let state = if online {
                ConnectionState::Online
            } else {
                ConnectionState::Offline
            };
            debug!(?state, "connection state transition");
            let listeners: Vec<StateListener> = self
                .listeners
                .lock()
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in listeners {
                listener(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex as PMutex;

    fn monitor(store: &Arc<MemoryStore>) -> ConnectionMonitor {
        ConnectionMonitor::new(
            Arc::clone(store) as Arc<dyn RemoteStore>,
            (CollectionId(0), EntityId(0)),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn missing_probe_entity_still_counts_as_online() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);

        monitor.probe_now(0);
        assert_eq!(monitor.state(), ConnectionState::Online);
    }

    #[test]
    fn transition_requires_two_consecutive_probes() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);
        monitor.probe_now(0);

        store.set_offline(true);
        monitor.probe_now(30_000);
        // One offline observation: degraded, not yet offline.
        assert_eq!(monitor.state(), ConnectionState::Degraded);

        monitor.probe_now(60_000);
        assert_eq!(monitor.state(), ConnectionState::Offline);
    }

    #[test]
    fn flap_within_one_cycle_is_suppressed() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);
        monitor.probe_now(0);

        let seen: Arc<PMutex<Vec<ConnectionState>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_state_change(move |state| sink.lock().push(state));

        store.set_offline(true);
        monitor.probe_now(30_000);
        store.set_offline(false);
        monitor.probe_now(60_000);

        assert!(seen.lock().is_empty());
        assert_eq!(monitor.state(), ConnectionState::Online);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);
        monitor.probe_now(0);

        let order: Arc<PMutex<Vec<u8>>> = Arc::new(PMutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        monitor.on_state_change(move |_| first.lock().push(1));
        monitor.on_state_change(move |_| second.lock().push(2));

        store.set_offline(true);
        monitor.probe_now(30_000);
        monitor.probe_now(60_000);

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);
        monitor.probe_now(0);

        let seen: Arc<PMutex<Vec<ConnectionState>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let token = monitor.on_state_change(move |state| sink.lock().push(state));
        monitor.remove_listener(token);

        store.set_offline(true);
        monitor.probe_now(30_000);
        monitor.probe_now(60_000);

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn probe_if_due_respects_interval() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);

        monitor.probe_if_due(0);
        store.set_offline(true);

        // Within the interval, nothing is observed.
        monitor.probe_if_due(10_000);
        monitor.probe_if_due(29_999);
        assert_eq!(monitor.state(), ConnectionState::Online);

        monitor.probe_if_due(30_000);
        assert_eq!(monitor.state(), ConnectionState::Degraded);
    }
}
