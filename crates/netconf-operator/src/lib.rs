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

//! Orchestration of NETCONF sessions driven by declarative resource specs.
//!
//! A [registry::SessionRegistry] owns one live session per mount identity,
//! each session runs a [pump::NotificationPump] that splits the inbound
//! stream into RPC replies (discarded, the synchronous caller already has
//! them) and notifications that are routed to per-subscription listeners.
//! Operations go through the [executor::OperationExecutor], ordering between
//! operations is enforced by the [dependency::DependencyGate], and
//! subscriptions are managed by the [subscription::SubscriptionManager].

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod dependency;
pub mod error;
pub mod executor;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod message;
pub mod operations;
pub mod pump;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod session;
pub mod sink;
pub mod ssh;
pub mod status;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub(crate) const DEFAULT_NAMESPACE: &str = "default";

/// Namespaced identity of a declarative resource, rendered as
/// `namespace/name`.
///
/// The same type identifies a session in the registry, in that case it is
/// always the identity of the mount point the session was created from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    namespace: Box<str>,
    name: Box<str>,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<Box<str>>, name: impl Into<Box<str>>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of another resource living in the same namespace
    pub fn sibling(&self, name: impl Into<Box<str>>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum ResourceKeyError {
    #[strum(to_string = "resource name is empty in `{0}`")]
    EmptyName(String),
}

impl std::error::Error for ResourceKeyError {}

impl FromStr for ResourceKey {
    type Err = ResourceKeyError;

    /// Parses `namespace/name`, a bare `name` lands in the default namespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match s.split_once('/') {
            Some((namespace, name)) => (namespace, name),
            None => (DEFAULT_NAMESPACE, s),
        };
        if name.is_empty() {
            return Err(ResourceKeyError::EmptyName(s.to_string()));
        }
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        Ok(Self::new(namespace, name))
    }
}
