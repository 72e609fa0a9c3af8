// Copyright (C) 2025-present The NetGauze Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A live NETCONF session and the listeners attached to it.
//!
//! Listeners are keyed by subscription identifier, or by the single legacy
//! [ListenerKey::Stream] slot for RFC 5277 subscriptions whose notifications
//! carry no identifier. Registration goes through [ListenerSet] which is the
//! only place the listener map is mutated.

use crate::{
    capabilities::Capabilities,
    message::Notification,
    pump::{NotificationPump, PumpExit, PumpStats, PumpStatsSnapshot},
    transport::{Endpoint, HelloInfo, Transport, TransportError},
    ResourceKey,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKey {
    /// Subscription established with a server assigned identifier
    Subscription(Box<str>),
    /// RFC 5277 event stream, at most one per session
    Stream,
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscription(id) => write!(f, "subscription {id}"),
            Self::Stream => write!(f, "legacy stream"),
        }
    }
}

impl ListenerKey {
    pub fn for_notification(notification: &Notification) -> Self {
        match notification.subscription_id() {
            Some(id) => Self::Subscription(id.into()),
            None => Self::Stream,
        }
    }
}

/// Receiving end for the notifications of one subscription
#[derive(Debug, Clone)]
pub struct Listener {
    owner: ResourceKey,
    tx: mpsc::Sender<Notification>,
}

impl Listener {
    pub fn channel(owner: ResourceKey, buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { owner, tx }, rx)
    }

    pub const fn owner(&self) -> &ResourceKey {
        &self.owner
    }

    fn notify(&self, notification: Notification) -> bool {
        self.tx.try_send(notification).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    NoListener(ListenerKey),
    /// Listener queue is full or its receiver is gone
    Dropped(ListenerKey),
}

#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: RwLock<HashMap<ListenerKey, Listener>>,
}

impl ListenerSet {
    /// Register a listener, returning the one it replaced if any
    pub(crate) async fn register(&self, key: ListenerKey, listener: Listener) -> Option<Listener> {
        self.listeners.write().await.insert(key, listener)
    }

    /// Remove the listener under `key` if it belongs to `owner`
    pub(crate) async fn remove(&self, key: &ListenerKey, owner: &ResourceKey) -> Option<Listener> {
        let mut guard = self.listeners.write().await;
        if guard.get(key).is_some_and(|listener| listener.owner() == owner) {
            guard.remove(key)
        } else {
            None
        }
    }

    pub(crate) async fn clear(&self) -> usize {
        let mut guard = self.listeners.write().await;
        let count = guard.len();
        guard.clear();
        count
    }

    pub async fn owner_of(&self, key: &ListenerKey) -> Option<ResourceKey> {
        self.listeners
            .read()
            .await
            .get(key)
            .map(|listener| listener.owner.clone())
    }

    pub async fn keys(&self) -> Vec<ListenerKey> {
        let mut keys: Vec<_> = self.listeners.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listeners.read().await.is_empty()
    }

    pub(crate) async fn dispatch(&self, notification: Notification) -> DispatchOutcome {
        let key = ListenerKey::for_notification(&notification);
        let listener = self.listeners.read().await.get(&key).cloned();
        match listener {
            None => DispatchOutcome::NoListener(key),
            Some(listener) if listener.notify(notification) => DispatchOutcome::Delivered,
            Some(_) => DispatchOutcome::Dropped(key),
        }
    }
}

/// A connected NETCONF session identified by its mount point.
///
/// The notification pump is started with the session and stopped by
/// [Session::shutdown]; once the pump exits on its own the session reports
/// itself as disconnected and is never revived.
pub struct Session {
    identity: ResourceKey,
    endpoint: Endpoint,
    session_id: u32,
    capabilities: Capabilities,
    transport: Arc<dyn Transport>,
    listeners: Arc<ListenerSet>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    stats: Arc<PumpStats>,
    pump: Mutex<Option<JoinHandle<PumpExit>>>,
    pump_exit: OnceLock<PumpExit>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("session_id", &self.session_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Session {
    /// Wrap a transport that completed the hello exchange and start its pump
    pub(crate) fn start(
        identity: ResourceKey,
        endpoint: Endpoint,
        hello: HelloInfo,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let listeners = Arc::new(ListenerSet::default());
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PumpStats::default());
        let pump = NotificationPump::new(
            identity.clone(),
            transport.clone(),
            listeners.clone(),
            cancel.clone(),
            connected.clone(),
            stats.clone(),
        )
        .spawn();
        info!(
            "[{identity}] Session {} established with {endpoint}",
            hello.session_id
        );
        Self {
            identity,
            endpoint,
            session_id: hello.session_id,
            capabilities: hello.capabilities,
            transport,
            listeners,
            cancel,
            connected,
            stats,
            pump: Mutex::new(Some(pump)),
            pump_exit: OnceLock::new(),
        }
    }

    pub const fn identity(&self) -> &ResourceKey {
        &self.identity
    }

    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub const fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Capabilities announced by the server
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    pub fn pump_exit(&self) -> Option<PumpExit> {
        self.pump_exit.get().copied()
    }

    pub fn pump_stats(&self) -> PumpStatsSnapshot {
        self.stats.snapshot()
    }

    pub const fn listeners(&self) -> &Arc<ListenerSet> {
        &self.listeners
    }

    /// Send an operation and wait for the matching reply
    pub async fn call(&self, payload: &str, timeout: Duration) -> Result<Box<str>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.transport.sync_call(payload, timeout).await
    }

    /// Attach a listener, a listener already registered under the same key
    /// is replaced
    pub(crate) async fn register_listener(&self, key: ListenerKey, listener: Listener) {
        let owner = listener.owner().clone();
        if let Some(previous) = self.listeners.register(key.clone(), listener).await {
            warn!(
                "[{}] Listener for {key} owned by {} replaced by {owner}",
                self.identity,
                previous.owner()
            );
        } else {
            debug!("[{}] Registered listener for {key} owned by {owner}", self.identity);
        }
    }

    /// Detach the listener of `owner`, a listener that replaced it is kept
    pub(crate) async fn remove_listener(
        &self,
        key: &ListenerKey,
        owner: &ResourceKey,
    ) -> Option<Listener> {
        let removed = self.listeners.remove(key, owner).await;
        if removed.is_some() {
            debug!("[{}] Removed listener for {key} owned by {owner}", self.identity);
        }
        removed
    }

    /// Stop the pump and wait for it to exit, safe to call more than once
    pub(crate) async fn shutdown(&self) -> Option<PumpExit> {
        self.cancel.cancel();
        let handle = self.pump.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(exit) => {
                    let _ = self.pump_exit.set(exit);
                }
                Err(err) => {
                    warn!("[{}] Notification pump failed: {err}", self.identity);
                    let _ = self.pump_exit.set(PumpExit::TransportError);
                }
            }
        }
        self.connected.store(false, Ordering::Release);
        self.pump_exit()
    }

    /// Close the underlying transport
    pub(crate) async fn close_transport(&self) {
        if let Err(err) = self.transport.close().await {
            debug!("[{}] Error closing transport: {err}", self.identity);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{notification_frame, MockTransport};

    fn hello() -> HelloInfo {
        HelloInfo {
            session_id: 7,
            capabilities: Capabilities::client::<&str>(&[]),
        }
    }

    #[tokio::test]
    async fn test_listener_set_dispatch() {
        let set = ListenerSet::default();
        let owner = ResourceKey::new("lab", "sub");
        let (listener, mut rx) = Listener::channel(owner.clone(), 1);
        assert!(set
            .register(ListenerKey::Subscription("1".into()), listener)
            .await
            .is_none());

        let notification = Notification::parse(&notification_frame(Some("1"))).unwrap();
        assert_eq!(
            set.dispatch(notification.clone()).await,
            DispatchOutcome::Delivered
        );
        // queue of one is now full
        assert_eq!(
            set.dispatch(notification).await,
            DispatchOutcome::Dropped(ListenerKey::Subscription("1".into()))
        );
        assert!(rx.recv().await.is_some());

        let unmatched = Notification::parse(&notification_frame(None)).unwrap();
        assert_eq!(
            set.dispatch(unmatched).await,
            DispatchOutcome::NoListener(ListenerKey::Stream)
        );
        assert_eq!(
            set.owner_of(&ListenerKey::Subscription("1".into())).await,
            Some(owner)
        );
        assert_eq!(set.clear().await, 1);
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_register_replaces_existing_listener() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::start(
            ResourceKey::new("lab", "dev1"),
            Endpoint::new("192.0.2.1", 830),
            hello(),
            transport,
        );
        let key = ListenerKey::Subscription("5".into());
        let (first, _rx1) = Listener::channel(ResourceKey::new("lab", "a"), 4);
        let (second, _rx2) = Listener::channel(ResourceKey::new("lab", "b"), 4);
        session.register_listener(key.clone(), first).await;
        session.register_listener(key.clone(), second).await;
        assert_eq!(session.listeners().len().await, 1);
        assert_eq!(
            session.listeners().owner_of(&key).await,
            Some(ResourceKey::new("lab", "b"))
        );
        assert!(logs_contain("replaced by lab/b"));
        // the replaced owner can no longer detach it
        assert!(session
            .remove_listener(&key, &ResourceKey::new("lab", "a"))
            .await
            .is_none());
        assert!(session
            .remove_listener(&key, &ResourceKey::new("lab", "b"))
            .await
            .is_some());
        session.shutdown().await;
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_shutdown_stops_pump() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::start(
            ResourceKey::new("lab", "dev1"),
            Endpoint::new("192.0.2.1", 830),
            hello(),
            transport,
        );
        assert!(session.is_connected());
        assert_eq!(session.session_id(), 7);
        let exit = tokio::time::timeout(Duration::from_secs(5), session.shutdown())
            .await
            .expect("shutdown in time");
        assert_eq!(exit, Some(PumpExit::Cancelled));
        assert!(!session.is_connected());
        // second shutdown is a no-op
        assert_eq!(session.shutdown().await, Some(PumpExit::Cancelled));
        assert!(matches!(
            session.call("<get/>", Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_session_disconnected_when_transport_closes() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::start(
            ResourceKey::new("lab", "dev1"),
            Endpoint::new("192.0.2.1", 830),
            hello(),
            transport.clone(),
        );
        transport.close_inbound();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session noticed the closed transport");
        assert_eq!(session.shutdown().await, Some(PumpExit::TransportClosed));
    }
}
