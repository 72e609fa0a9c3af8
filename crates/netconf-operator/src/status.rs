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

//! Recorded outcome of resources and the store persisting them

use crate::ResourceKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
    Connected,
    Subscribed,
    Pending,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum ResourceKind {
    MountPoint,
    Lock,
    Unlock,
    EditConfig,
    Commit,
    Get,
    GetConfig,
    Rpc,
    CreateSubscription,
    EstablishSubscription,
    Transaction,
}

/// Last recorded outcome of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// `None` until the resource has been reconciled at least once
    pub status: Option<Status>,
    /// Decoded reply on success, raw peer reply or diagnostic on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Box<str>>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(status: Status, reply: Option<Box<str>>) -> Self {
        Self {
            status: Some(status),
            reply,
            subscription_id: None,
            capabilities: vec![],
            updated_at: Utc::now(),
        }
    }

    pub fn unset() -> Self {
        Self {
            status: None,
            reply: None,
            subscription_id: None,
            capabilities: vec![],
            updated_at: Utc::now(),
        }
    }

    pub fn with_subscription_id(mut self, subscription_id: impl Into<Box<str>>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Box<str>>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(Status::Success)
    }
}

/// Backing store of resource statuses.
///
/// `fetch` is a single read returning both existence and the recorded
/// status, no caching is allowed in implementations since the dependency
/// gate relies on it reflecting the latest written state.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// `None` when the resource does not exist
    async fn fetch(&self, kind: ResourceKind, key: &ResourceKey) -> Option<StatusRecord>;

    async fn record(&self, kind: ResourceKind, key: &ResourceKey, record: StatusRecord);

    async fn remove(&self, kind: ResourceKind, key: &ResourceKey) -> Option<StatusRecord>;
}

/// In-memory [StatusStore], resources exist from the moment they are
/// declared with [MemoryStatusStore::declare].
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<(ResourceKind, ResourceKey), StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a resource known without a recorded status, a no-op if it exists
    pub async fn declare(&self, kind: ResourceKind, key: &ResourceKey) {
        self.records
            .write()
            .await
            .entry((kind, key.clone()))
            .or_insert_with(StatusRecord::unset);
    }

    pub async fn snapshot(&self) -> Vec<(ResourceKind, ResourceKey, StatusRecord)> {
        let mut snapshot: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .map(|((kind, key), record)| (*kind, key.clone(), record.clone()))
            .collect();
        snapshot.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        snapshot
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn fetch(&self, kind: ResourceKind, key: &ResourceKey) -> Option<StatusRecord> {
        self.records.read().await.get(&(kind, key.clone())).cloned()
    }

    async fn record(&self, kind: ResourceKind, key: &ResourceKey, record: StatusRecord) {
        self.records.write().await.insert((kind, key.clone()), record);
    }

    async fn remove(&self, kind: ResourceKind, key: &ResourceKey) -> Option<StatusRecord> {
        self.records.write().await.remove(&(kind, key.clone()))
    }
}
