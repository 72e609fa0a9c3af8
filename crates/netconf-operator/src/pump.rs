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

//! Background demultiplexing loop, one per session.
//!
//! The pump owns the receiving side of the transport: replies to synchronous
//! calls never reach it except the ones whose caller already gave up, those
//! are discarded here. Notifications are routed to the listener registered
//! under their subscription identifier, unmatched ones are dropped.

use crate::{
    message::{self, FrameKind, Notification},
    session::{DispatchOutcome, ListenerSet},
    transport::{Transport, TransportError},
    ResourceKey,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Reason the pump terminated, a terminated pump is never restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PumpExit {
    #[strum(to_string = "cancelled")]
    Cancelled,
    #[strum(to_string = "transport closed")]
    TransportClosed,
    #[strum(to_string = "transport error")]
    TransportError,
}

#[derive(Debug, Default)]
pub struct PumpStats {
    delivered: AtomicU64,
    replies_discarded: AtomicU64,
    unmatched: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    ignored: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStatsSnapshot {
    /// Notifications handed to a listener
    pub delivered: u64,
    /// `<rpc-reply>` frames seen by the pump
    pub replies_discarded: u64,
    /// Notifications for subscriptions without a listener
    pub unmatched: u64,
    /// Notifications lost because the listener queue was full or closed
    pub dropped: u64,
    pub malformed: u64,
    /// Frames of any other kind
    pub ignored: u64,
}

impl PumpStats {
    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            replies_discarded: self.replies_discarded.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

pub struct NotificationPump {
    identity: ResourceKey,
    transport: Arc<dyn Transport>,
    listeners: Arc<ListenerSet>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    stats: Arc<PumpStats>,
}

impl NotificationPump {
    pub(crate) fn new(
        identity: ResourceKey,
        transport: Arc<dyn Transport>,
        listeners: Arc<ListenerSet>,
        cancel: CancellationToken,
        connected: Arc<AtomicBool>,
        stats: Arc<PumpStats>,
    ) -> Self {
        Self {
            identity,
            transport,
            listeners,
            cancel,
            connected,
            stats,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<PumpExit> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> PumpExit {
        info!("[{}] Starting notification pump", self.identity);
        let exit = loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break PumpExit::Cancelled,
                frame = self.transport.receive_frame() => frame,
            };
            match frame {
                Ok(raw) => self.dispatch(raw).await,
                Err(TransportError::Closed) => break PumpExit::TransportClosed,
                Err(err) => {
                    warn!("[{}] Error receiving NETCONF frame: {err}", self.identity);
                    break PumpExit::TransportError;
                }
            }
        };
        if exit != PumpExit::Cancelled {
            // The session is dead, the registry reports it as not connected
            self.connected.store(false, Ordering::Release);
        }
        info!("[{}] Notification pump terminated: {exit}", self.identity);
        exit
    }

    async fn dispatch(&self, raw: Box<str>) {
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("[{}] Received frame: `{raw}`", self.identity);
        }
        match message::frame_kind(&raw) {
            Ok(FrameKind::RpcReply) => {
                self.stats.replies_discarded.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] Discarding rpc-reply frame", self.identity);
            }
            Ok(FrameKind::Notification) => match Notification::parse(&raw) {
                Ok(notification) => self.route(notification).await,
                Err(err) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!("[{}] Dropping malformed notification: {err}", self.identity);
                }
            },
            Ok(kind) => {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] Ignoring unexpected {kind} frame", self.identity);
            }
            Err(err) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Dropping malformed frame: {err}", self.identity);
            }
        }
    }

    async fn route(&self, notification: Notification) {
        match self.listeners.dispatch(notification).await {
            DispatchOutcome::Delivered => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::NoListener(key) => {
                self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[{}] No listener registered for {key}, dropping notification",
                    self.identity
                );
            }
            DispatchOutcome::Dropped(key) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[{}] Listener for {key} is not keeping up, dropping notification",
                    self.identity
                );
            }
        }
    }
}
