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

//! Subscriptions to NETCONF event streams.
//!
//! Two styles are handled: RFC 5277 `<create-subscription>` whose
//! notifications carry no identifier and are bound to the single legacy
//! stream listener of a session, and `<establish-subscription>` whose reply
//! carries the identifier used to route notifications. Each owner has at
//! most one subscription, requests for an owner that is already subscribed
//! are no-ops.

use crate::{
    error::{Classify, ErrorClass},
    executor::{ExecutionError, OperationExecutor},
    message::{self, Notification, XmlError},
    operations::{Operation, StreamParams},
    session::{Listener, ListenerKey, Session},
    sink::{Sink, SinkError},
    ResourceKey,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub(crate) const fn default_listener_buffer() -> usize {
    100
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum SubscriptionStyle {
    /// `<create-subscription>` on an event stream
    #[strum(to_string = "stream")]
    Stream,
    /// `<establish-subscription>` with a peer assigned identifier
    #[strum(to_string = "established")]
    Established,
}

#[derive(Debug, strum_macros::Display)]
pub enum SubscriptionError {
    #[strum(to_string = "invalid subscription payload: {0}")]
    InvalidPayload(XmlError),

    #[strum(to_string = "unable to build sink: {0}")]
    Sink(SinkError),

    #[strum(to_string = "event stream of {session} is already subscribed by {owner}")]
    StreamInUse {
        session: ResourceKey,
        owner: ResourceKey,
    },

    #[strum(to_string = "no subscription-id in the reply: {raw}")]
    MissingSubscriptionId { raw: Box<str> },

    #[strum(to_string = "{0}")]
    Execution(ExecutionError),
}

impl std::error::Error for SubscriptionError {}

impl From<ExecutionError> for SubscriptionError {
    fn from(err: ExecutionError) -> Self {
        Self::Execution(err)
    }
}

impl From<SinkError> for SubscriptionError {
    fn from(err: SinkError) -> Self {
        Self::Sink(err)
    }
}

impl Classify for SubscriptionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidPayload(_) | Self::Sink(_) | Self::StreamInUse { .. } => {
                ErrorClass::Validation
            }
            Self::MissingSubscriptionId { .. } => ErrorClass::Protocol,
            Self::Execution(err) => err.class(),
        }
    }
}

impl SubscriptionError {
    pub fn raw_reply(&self) -> Option<&str> {
        match self {
            Self::MissingSubscriptionId { raw } => Some(raw),
            Self::Execution(err) => err.raw_reply(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// A new subscription was registered with the peer
    Created(Box<str>),
    /// The owner already had an active subscription, nothing was sent
    AlreadyActive(Box<str>),
}

impl SubscriptionOutcome {
    pub fn subscription_id(&self) -> &str {
        match self {
            Self::Created(id) | Self::AlreadyActive(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    owner: ResourceKey,
    session: ResourceKey,
    subscription_id: Box<str>,
    style: SubscriptionStyle,
    sink: Box<str>,
    active: bool,
}

impl SubscriptionRecord {
    pub const fn owner(&self) -> &ResourceKey {
        &self.owner
    }

    /// Mount point identity of the session carrying the subscription
    pub const fn session(&self) -> &ResourceKey {
        &self.session
    }

    /// Peer assigned identifier, or the owner name for stream subscriptions
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub const fn style(&self) -> SubscriptionStyle {
        self.style
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    /// Still bound to a connected session
    pub const fn is_active(&self) -> bool {
        self.active
    }

    fn listener_key(&self) -> ListenerKey {
        match self.style {
            SubscriptionStyle::Stream => ListenerKey::Stream,
            SubscriptionStyle::Established => ListenerKey::Subscription(self.subscription_id.clone()),
        }
    }
}

struct ActiveSubscription {
    record: SubscriptionRecord,
    session: Weak<Session>,
    delivery: JoinHandle<()>,
}

impl ActiveSubscription {
    fn start(
        session: &Arc<Session>,
        record: SubscriptionRecord,
        rx: mpsc::Receiver<Notification>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let delivery = spawn_delivery(record.owner.clone(), rx, sink);
        Self {
            record,
            session: Arc::downgrade(session),
            delivery,
        }
    }

    fn is_live(&self) -> bool {
        !self.delivery.is_finished()
            && self
                .session
                .upgrade()
                .is_some_and(|session| session.is_connected())
    }

    fn snapshot(&self) -> SubscriptionRecord {
        let mut record = self.record.clone();
        record.active = self.is_live();
        record
    }
}

/// State of one owner. A retired slot was removed from the manager, an
/// attempt that raced with the removal takes a fresh slot instead.
#[derive(Default)]
struct SlotState {
    active: Option<ActiveSubscription>,
    retired: bool,
}

type Slot = Arc<Mutex<SlotState>>;

/// Owns the subscription records, one per owner. Calls for the same owner
/// are serialized so that concurrent reconciliations send at most one
/// request to the peer.
pub struct SubscriptionManager {
    executor: OperationExecutor,
    slots: Mutex<HashMap<ResourceKey, Slot>>,
    listener_buffer: usize,
}

impl SubscriptionManager {
    pub fn new(executor: OperationExecutor) -> Self {
        Self {
            executor,
            slots: Mutex::new(HashMap::new()),
            listener_buffer: default_listener_buffer(),
        }
    }

    /// Capacity of the queue between the pump and the sink of a subscription
    pub fn with_listener_buffer(mut self, listener_buffer: usize) -> Self {
        self.listener_buffer = listener_buffer;
        self
    }

    /// Lock the slot of `owner`, creating it when missing. The map lock is
    /// never held while waiting for a slot.
    async fn acquire(&self, owner: &ResourceKey) -> OwnedMutexGuard<SlotState> {
        loop {
            let slot = self
                .slots
                .lock()
                .await
                .entry(owner.clone())
                .or_default()
                .clone();
            let state = slot.lock_owned().await;
            if !state.retired {
                return state;
            }
        }
    }

    /// Mark the locked slot as retired and drop it from the map
    async fn retire(&self, owner: &ResourceKey, state: &mut OwnedMutexGuard<SlotState>) {
        state.retired = true;
        let mut slots = self.slots.lock().await;
        if slots
            .get(owner)
            .is_some_and(|slot| Arc::ptr_eq(slot, OwnedMutexGuard::mutex(state)))
        {
            slots.remove(owner);
        }
    }

    /// Current subscription of `owner` if it is still bound to a live
    /// session, stale ones are released
    fn reuse(
        owner: &ResourceKey,
        current: &mut Option<ActiveSubscription>,
    ) -> Option<SubscriptionOutcome> {
        match current.take() {
            Some(active) if active.is_live() => {
                debug!(
                    "[{owner}] Subscription {} already active",
                    active.record.subscription_id
                );
                let outcome = SubscriptionOutcome::AlreadyActive(active.record.subscription_id.clone());
                *current = Some(active);
                Some(outcome)
            }
            Some(stale) => {
                info!(
                    "[{owner}] Subscription {} is no longer active, subscribing again",
                    stale.record.subscription_id
                );
                stale.delivery.abort();
                None
            }
            None => None,
        }
    }

    /// RFC 5277 subscription to an event stream
    pub async fn create_subscription(
        &self,
        session: &Arc<Session>,
        owner: &ResourceKey,
        params: &StreamParams,
        sink: Arc<dyn Sink>,
        timeout: Duration,
    ) -> Result<SubscriptionOutcome, SubscriptionError> {
        let mut state = self.acquire(owner).await;
        if let Some(outcome) = Self::reuse(owner, &mut state.active) {
            return Ok(outcome);
        }
        match self
            .subscribe_stream(session, owner, params, sink, timeout)
            .await
        {
            Ok(active) => Ok(Self::activate(active, &mut state)),
            Err(err) => {
                self.retire(owner, &mut state).await;
                Err(err)
            }
        }
    }

    async fn subscribe_stream(
        &self,
        session: &Arc<Session>,
        owner: &ResourceKey,
        params: &StreamParams,
        sink: Arc<dyn Sink>,
        timeout: Duration,
    ) -> Result<ActiveSubscription, SubscriptionError> {
        let key = ListenerKey::Stream;
        if let Some(other) = session.listeners().owner_of(&key).await {
            if &other != owner {
                return Err(SubscriptionError::StreamInUse {
                    session: session.identity().clone(),
                    owner: other,
                });
            }
        }
        // registered before the request, the first notification can follow
        // the reply immediately
        let (listener, rx) = Listener::channel(owner.clone(), self.listener_buffer);
        session.register_listener(key.clone(), listener).await;
        let payload = Operation::CreateSubscription(params.clone()).to_xml();
        if let Err(err) = self.executor.execute(session, &payload, timeout).await {
            session.remove_listener(&key, owner).await;
            return Err(err.into());
        }
        let record = SubscriptionRecord {
            owner: owner.clone(),
            session: session.identity().clone(),
            subscription_id: owner.to_string().into(),
            style: SubscriptionStyle::Stream,
            sink: sink.name().into(),
            active: true,
        };
        info!(
            "[{}] {owner} subscribed to stream {}",
            session.identity(),
            params.stream.as_deref().unwrap_or("NETCONF")
        );
        Ok(ActiveSubscription::start(session, record, rx, sink))
    }

    /// `<establish-subscription>` with a user provided payload, returns the
    /// peer assigned identifier
    pub async fn establish_subscription(
        &self,
        session: &Arc<Session>,
        owner: &ResourceKey,
        payload: &str,
        sink: Arc<dyn Sink>,
        timeout: Duration,
    ) -> Result<SubscriptionOutcome, SubscriptionError> {
        message::check_root(payload, "establish-subscription")
            .map_err(SubscriptionError::InvalidPayload)?;
        let mut state = self.acquire(owner).await;
        if let Some(outcome) = Self::reuse(owner, &mut state.active) {
            return Ok(outcome);
        }
        match self
            .subscribe_established(session, owner, payload, sink, timeout)
            .await
        {
            Ok(active) => Ok(Self::activate(active, &mut state)),
            Err(err) => {
                self.retire(owner, &mut state).await;
                Err(err)
            }
        }
    }

    async fn subscribe_established(
        &self,
        session: &Arc<Session>,
        owner: &ResourceKey,
        payload: &str,
        sink: Arc<dyn Sink>,
        timeout: Duration,
    ) -> Result<ActiveSubscription, SubscriptionError> {
        let reply = self.executor.execute(session, payload, timeout).await?;
        let subscription_id: Box<str> = match reply.subscription_id() {
            Some(id) => id.into(),
            None => {
                return Err(SubscriptionError::MissingSubscriptionId {
                    raw: reply.raw().into(),
                })
            }
        };
        let record = SubscriptionRecord {
            owner: owner.clone(),
            session: session.identity().clone(),
            subscription_id: subscription_id.clone(),
            style: SubscriptionStyle::Established,
            sink: sink.name().into(),
            active: true,
        };
        let (listener, rx) = Listener::channel(owner.clone(), self.listener_buffer);
        session.register_listener(record.listener_key(), listener).await;
        info!(
            "[{}] {owner} established subscription {subscription_id}",
            session.identity()
        );
        Ok(ActiveSubscription::start(session, record, rx, sink))
    }

    fn activate(active: ActiveSubscription, state: &mut SlotState) -> SubscriptionOutcome {
        let outcome = SubscriptionOutcome::Created(active.record.subscription_id.clone());
        state.active = Some(active);
        outcome
    }

    /// Drop the subscription of `owner`. The listener and the record are
    /// always released, the `<delete-subscription>` of an established
    /// subscription is best-effort.
    pub async fn cancel(&self, owner: &ResourceKey, timeout: Duration) -> Option<SubscriptionRecord> {
        let slot = self.slots.lock().await.get(owner).cloned()?;
        let mut state = slot.lock_owned().await;
        if state.retired {
            return None;
        }
        self.retire(owner, &mut state).await;
        let active = state.active.take()?;
        drop(state);
        let record = active.snapshot();
        if let Some(session) = active.session.upgrade() {
            session.remove_listener(&record.listener_key(), owner).await;
            if record.style == SubscriptionStyle::Established && session.is_connected() {
                let payload = Operation::DeleteSubscription(record.subscription_id.clone()).to_xml();
                match self.executor.execute(&session, &payload, timeout).await {
                    Ok(_) => debug!(
                        "[{}] Deleted subscription {}",
                        session.identity(),
                        record.subscription_id
                    ),
                    Err(err) => warn!(
                        "[{}] Unable to delete subscription {}: {err}",
                        session.identity(),
                        record.subscription_id
                    ),
                }
            }
        }
        active.delivery.abort();
        info!("[{owner}] Subscription {} cancelled", record.subscription_id);
        Some(record)
    }

    /// Release every subscription carried by the session of `identity`
    /// without contacting the peer, used when the session goes away.
    /// Returns the released subscriptions, no longer active.
    pub async fn forget_session(&self, identity: &ResourceKey) -> Vec<SubscriptionRecord> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(owner, slot)| (owner.clone(), slot.clone()))
            .collect();
        let mut released = vec![];
        for (owner, slot) in slots {
            let mut state = slot.lock_owned().await;
            let carried = state
                .active
                .as_ref()
                .is_some_and(|active| &active.record.session == identity);
            if !carried || state.retired {
                continue;
            }
            self.retire(&owner, &mut state).await;
            if let Some(active) = state.active.take() {
                active.delivery.abort();
                let mut record = active.record;
                record.active = false;
                released.push(record);
            }
        }
        if !released.is_empty() {
            debug!("[{identity}] Released {} subscriptions", released.len());
        }
        released.sort_by(|a, b| a.owner.cmp(&b.owner));
        released
    }

    pub async fn record(&self, owner: &ResourceKey) -> Option<SubscriptionRecord> {
        let slot = self.slots.lock().await.get(owner).cloned()?;
        let state = slot.lock().await;
        state.active.as_ref().map(ActiveSubscription::snapshot)
    }

    pub async fn is_active(&self, owner: &ResourceKey) -> bool {
        self.record(owner)
            .await
            .is_some_and(|record| record.is_active())
    }

    pub async fn records(&self) -> Vec<SubscriptionRecord> {
        let slots: Vec<_> = self.slots.lock().await.values().cloned().collect();
        let mut records = vec![];
        for slot in slots {
            if let Some(active) = slot.lock().await.active.as_ref() {
                records.push(active.snapshot());
            }
        }
        records.sort_by(|a, b| a.owner.cmp(&b.owner));
        records
    }

    /// Number of owners tracked, subscribed or being subscribed
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

/// Forward notifications from a listener to the sink, a failed delivery is
/// logged and the subscription stays in place
fn spawn_delivery(
    owner: ResourceKey,
    mut rx: mpsc::Receiver<Notification>,
    sink: Arc<dyn Sink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(err) = sink.deliver(&owner, notification.raw()).await {
                warn!(
                    "[{owner}] Unable to deliver notification to {} sink: {err}",
                    sink.name()
                );
            }
        }
        debug!("[{owner}] Notification delivery stopped");
    })
}
