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

//! Ordering between operations: an operation declaring a dependency only
//! runs once the referenced resource recorded a successful outcome.

use crate::{
    error::{Classify, ErrorClass},
    status::{ResourceKind, Status, StatusStore},
    ResourceKey,
};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::debug;

/// Kinds of resources that can be depended upon, i.e. the ones recording a
/// `success`/`failed` outcome of a configuration change.
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
pub enum DependencyKind {
    Lock,
    EditConfig,
    Commit,
}

impl From<DependencyKind> for ResourceKind {
    fn from(kind: DependencyKind) -> Self {
        match kind {
            DependencyKind::Lock => ResourceKind::Lock,
            DependencyKind::EditConfig => ResourceKind::EditConfig,
            DependencyKind::Commit => ResourceKind::Commit,
        }
    }
}

/// `dependsOn` as written in a resource spec, not validated yet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOn {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

impl DependsOn {
    /// An empty kind or name means no dependency is declared
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() || self.name.is_empty()
    }

    /// Validate the declared dependency, `Ok(None)` when none is declared
    pub fn resolve(&self) -> Result<Option<DependencyRef>, DependencyError> {
        if self.is_empty() {
            return Ok(None);
        }
        DependencyRef::new(&self.kind, self.name.as_str()).map(Some)
    }
}

/// Reference to another resource in the same namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyRef {
    kind: DependencyKind,
    name: Box<str>,
}

impl DependencyRef {
    /// Unknown kinds are rejected here, not when the dependency is checked
    pub fn new(kind: &str, name: impl Into<Box<str>>) -> Result<Self, DependencyError> {
        let kind = DependencyKind::from_str(kind)
            .map_err(|_| DependencyError::UnknownKind(kind.to_string()))?;
        Ok(Self {
            kind,
            name: name.into(),
        })
    }

    pub const fn kind(&self) -> DependencyKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum DependencyError {
    #[strum(
        to_string = "invalid dependency. Only Commit, EditConfig and Lock are supported. {0} was provided"
    )]
    UnknownKind(String),

    #[strum(to_string = "provided resource {kind} {name} not found in namespace {namespace}")]
    NotFound {
        kind: DependencyKind,
        name: String,
        namespace: String,
    },

    #[strum(to_string = "dependent resource {kind} {name} from namespace {namespace} is in {status} state")]
    NotSuccessful {
        kind: DependencyKind,
        name: String,
        namespace: String,
        status: String,
    },
}

impl std::error::Error for DependencyError {}

impl Classify for DependencyError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownKind(_) => ErrorClass::Validation,
            Self::NotFound { .. } | Self::NotSuccessful { .. } => ErrorClass::DependencyUnmet,
        }
    }
}

/// Checks a dependency against the live status store on every call
#[derive(Clone)]
pub struct DependencyGate {
    store: Arc<dyn StatusStore>,
}

impl DependencyGate {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub async fn validate(
        &self,
        dependency: Option<&DependencyRef>,
        namespace: &str,
    ) -> Result<(), DependencyError> {
        let dependency = match dependency {
            Some(dependency) => dependency,
            None => return Ok(()),
        };
        let key = ResourceKey::new(namespace, dependency.name());
        let record = self
            .store
            .fetch(dependency.kind().into(), &key)
            .await
            .ok_or_else(|| DependencyError::NotFound {
                kind: dependency.kind(),
                name: dependency.name().to_string(),
                namespace: namespace.to_string(),
            })?;
        match record.status {
            Some(Status::Success) => {
                debug!("[{key}] Dependency {} is satisfied", dependency.kind());
                Ok(())
            }
            status => Err(DependencyError::NotSuccessful {
                kind: dependency.kind(),
                name: dependency.name().to_string(),
                namespace: namespace.to_string(),
                status: status.map_or_else(|| "unset".to_string(), |s| s.to_string()),
            }),
        }
    }

    /// Validate a dependency as written in a spec
    pub async fn validate_spec(
        &self,
        depends_on: &DependsOn,
        namespace: &str,
    ) -> Result<(), DependencyError> {
        let dependency = depends_on.resolve()?;
        self.validate(dependency.as_ref(), namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MemoryStatusStore, StatusRecord};
    use rstest::rstest;

    async fn gate_with(kind: ResourceKind, name: &str, status: Option<Status>) -> DependencyGate {
        let store = Arc::new(MemoryStatusStore::new());
        let key = ResourceKey::new("lab", name);
        store.declare(kind, &key).await;
        if let Some(status) = status {
            store.record(kind, &key, StatusRecord::new(status, None)).await;
        }
        DependencyGate::new(store)
    }

    #[tokio::test]
    async fn test_no_dependency() {
        let gate = DependencyGate::new(Arc::new(MemoryStatusStore::new()));
        assert_eq!(gate.validate(None, "lab").await, Ok(()));
        assert_eq!(gate.validate_spec(&DependsOn::default(), "lab").await, Ok(()));
        let half = DependsOn {
            kind: "Lock".to_string(),
            name: String::new(),
        };
        assert_eq!(gate.validate_spec(&half, "lab").await, Ok(()));
    }

    #[tokio::test]
    async fn test_successful_dependency() {
        let gate = gate_with(ResourceKind::Lock, "lock1", Some(Status::Success)).await;
        let dependency = DependencyRef::new("Lock", "lock1").expect("valid kind");
        assert_eq!(gate.validate(Some(&dependency), "lab").await, Ok(()));
    }

    #[rstest]
    #[case(Some(Status::Failed), "failed")]
    #[case(Some(Status::Pending), "pending")]
    #[case(None, "unset")]
    #[tokio::test]
    async fn test_unsuccessful_dependency(
        #[case] status: Option<Status>,
        #[case] expected: &str,
    ) {
        let gate = gate_with(ResourceKind::Lock, "lock1", status).await;
        let dependency = DependencyRef::new("Lock", "lock1").expect("valid kind");
        let result = gate.validate(Some(&dependency), "lab").await;
        match result {
            Err(err @ DependencyError::NotSuccessful { .. }) => {
                assert_eq!(err.class(), ErrorClass::DependencyUnmet);
                assert!(err.to_string().ends_with(&format!("is in {expected} state")));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_dependency() {
        let gate = gate_with(ResourceKind::Lock, "lock1", Some(Status::Success)).await;
        // same name, different kind
        let dependency = DependencyRef::new("Commit", "lock1").expect("valid kind");
        assert!(matches!(
            gate.validate(Some(&dependency), "lab").await,
            Err(DependencyError::NotFound { .. })
        ));
        // same name and kind, different namespace
        let dependency = DependencyRef::new("Lock", "lock1").expect("valid kind");
        assert!(matches!(
            gate.validate(Some(&dependency), "other").await,
            Err(DependencyError::NotFound { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_rejected_at_construction() {
        let err = DependencyRef::new("Get", "get1").expect_err("unsupported kind");
        assert_eq!(err, DependencyError::UnknownKind("Get".to_string()));
        assert_eq!(err.class(), ErrorClass::Validation);
        let spec = DependsOn {
            kind: "MountPoint".to_string(),
            name: "dev1".to_string(),
        };
        assert!(spec.resolve().is_err());
    }
}
