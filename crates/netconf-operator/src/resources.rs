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

//! Declarative resource specifications driving sessions, operations and
//! subscriptions.
//!
//! A resource is identified by `namespace/name` and tagged by `kind`:
//!
//! ```yaml
//! - name: lock1
//!   kind: Lock
//!   mount_point: dev1
//!   target: candidate
//! ```

use crate::{
    config::DefaultsConfig,
    dependency::{DependencyError, DependencyRef, DependsOn},
    error::{Classify, ErrorClass},
    executor::{Step, StepPolicy},
    operations::{Datastore, DefaultOperation, Filter, FilterType, Operation, StreamParams},
    sink::SinkConfig,
    status::ResourceKind,
    transport::{Credentials, Endpoint, EndpointError},
    ResourceKey, DEFAULT_NAMESPACE,
};
use secrecy::SecretBox;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

const fn default_running() -> Datastore {
    Datastore::Running
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, strum_macros::Display)]
pub enum ResourceError {
    #[strum(to_string = "invalid target: {0}")]
    InvalidTarget(EndpointError),

    #[strum(to_string = "either a password or a private key path is required for {0}")]
    MissingCredentials(String),

    #[strum(to_string = "mount point is not defined")]
    MissingMountPoint,

    #[strum(to_string = "transaction has no edits")]
    EmptyTransaction,

    #[strum(to_string = "{0}")]
    Dependency(DependencyError),
}

impl std::error::Error for ResourceError {}

impl From<EndpointError> for ResourceError {
    fn from(err: EndpointError) -> Self {
        Self::InvalidTarget(err)
    }
}

impl From<DependencyError> for ResourceError {
    fn from(err: DependencyError) -> Self {
        Self::Dependency(err)
    }
}

impl Classify for ResourceError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Dependency(err) => err.class(),
            _ => ErrorClass::Validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(flatten)]
    pub spec: ResourceSpec,
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace.as_str(), self.name.as_str())
    }

    pub const fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    /// Identity of the session the resource runs on, mount points are their
    /// own session
    pub fn session_key(&self) -> Result<ResourceKey, ResourceError> {
        match self.spec.mount_point() {
            None => Ok(self.key()),
            Some(mount_point) if mount_point.trim().is_empty() => {
                Err(ResourceError::MissingMountPoint)
            }
            Some(mount_point) => Ok(self.key().sibling(mount_point.trim())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResourceSpec {
    MountPoint(MountPointSpec),
    Lock(LockSpec),
    Unlock(UnlockSpec),
    EditConfig(EditConfigSpec),
    Commit(CommitSpec),
    Get(GetSpec),
    GetConfig(GetConfigSpec),
    Rpc(RpcSpec),
    CreateSubscription(CreateSubscriptionSpec),
    EstablishSubscription(EstablishSubscriptionSpec),
    Transaction(TransactionSpec),
}

impl ResourceSpec {
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::MountPoint(_) => ResourceKind::MountPoint,
            Self::Lock(_) => ResourceKind::Lock,
            Self::Unlock(_) => ResourceKind::Unlock,
            Self::EditConfig(_) => ResourceKind::EditConfig,
            Self::Commit(_) => ResourceKind::Commit,
            Self::Get(_) => ResourceKind::Get,
            Self::GetConfig(_) => ResourceKind::GetConfig,
            Self::Rpc(_) => ResourceKind::Rpc,
            Self::CreateSubscription(_) => ResourceKind::CreateSubscription,
            Self::EstablishSubscription(_) => ResourceKind::EstablishSubscription,
            Self::Transaction(_) => ResourceKind::Transaction,
        }
    }

    /// Name of the mount point, `None` for the mount point itself
    pub fn mount_point(&self) -> Option<&str> {
        match self {
            Self::MountPoint(_) => None,
            Self::Lock(spec) => Some(&spec.mount_point),
            Self::Unlock(spec) => Some(&spec.mount_point),
            Self::EditConfig(spec) => Some(&spec.mount_point),
            Self::Commit(spec) => Some(&spec.mount_point),
            Self::Get(spec) => Some(&spec.mount_point),
            Self::GetConfig(spec) => Some(&spec.mount_point),
            Self::Rpc(spec) => Some(&spec.mount_point),
            Self::CreateSubscription(spec) => Some(&spec.mount_point),
            Self::EstablishSubscription(spec) => Some(&spec.mount_point),
            Self::Transaction(spec) => Some(&spec.mount_point),
        }
    }

    /// Timeout of the resource in seconds, the configured defaults apply
    /// when it is not set
    pub fn timeout(&self, defaults: &DefaultsConfig) -> Duration {
        let timeout = match self {
            Self::MountPoint(spec) => return spec.timeout.unwrap_or(defaults.connect_timeout),
            Self::Lock(spec) => spec.timeout,
            Self::Unlock(spec) => spec.timeout,
            Self::EditConfig(spec) => spec.timeout,
            Self::Commit(spec) => spec.timeout,
            Self::Get(spec) => spec.timeout,
            Self::GetConfig(spec) => spec.timeout,
            Self::Rpc(spec) => spec.timeout,
            Self::CreateSubscription(spec) => spec.timeout,
            Self::EstablishSubscription(spec) => spec.timeout,
            Self::Transaction(spec) => spec.timeout,
        };
        timeout.unwrap_or(defaults.operation_timeout)
    }

    pub fn depends_on(&self) -> Option<&DependsOn> {
        match self {
            Self::Unlock(spec) => Some(&spec.depends_on),
            Self::EditConfig(spec) => Some(&spec.depends_on),
            Self::Commit(spec) => Some(&spec.depends_on),
            Self::Transaction(spec) => Some(&spec.depends_on),
            _ => None,
        }
    }

    /// Validated dependency, unknown kinds are rejected
    pub fn dependency(&self) -> Result<Option<DependencyRef>, ResourceError> {
        match self.depends_on() {
            Some(depends_on) => Ok(depends_on.resolve()?),
            None => Ok(None),
        }
    }

    /// The single operation of request/reply resources
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Lock(spec) => Some(Operation::Lock(spec.target)),
            Self::Unlock(spec) => Some(Operation::Unlock(spec.target)),
            Self::EditConfig(spec) => Some(Operation::EditConfig {
                target: spec.target,
                default_operation: spec.operation,
                config: spec.xml.as_str().into(),
            }),
            Self::Commit(_) => Some(Operation::Commit),
            Self::Get(spec) => Some(Operation::Get {
                filter: filter(spec.filter_type, spec.xml.as_deref()),
            }),
            Self::GetConfig(spec) => Some(Operation::GetConfig {
                source: spec.source,
                filter: filter(spec.filter_type, spec.xml.as_deref()),
            }),
            Self::Rpc(spec) => Some(Operation::Raw(spec.xml.as_str().into())),
            Self::MountPoint(_)
            | Self::CreateSubscription(_)
            | Self::EstablishSubscription(_)
            | Self::Transaction(_) => None,
        }
    }
}

fn filter(filter_type: FilterType, content: Option<&str>) -> Option<Filter> {
    content
        .filter(|content| !content.trim().is_empty())
        .map(|content| Filter {
            filter_type,
            content: content.into(),
        })
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointSpec {
    /// `host[:port]` of the NETCONF server, port 830 by default
    pub target: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Seconds bounding the dial and the hello exchange, `0` for no
    /// timeout and `defaults.connect_timeout` when not set
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub additional_capabilities: Vec<String>,
}

impl fmt::Debug for MountPointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountPointSpec")
            .field("target", &self.target)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key_path", &self.private_key_path)
            .field("timeout", &self.timeout)
            .field("additional_capabilities", &self.additional_capabilities)
            .finish()
    }
}

impl MountPointSpec {
    pub fn endpoint(&self) -> Result<Endpoint, ResourceError> {
        Ok(Endpoint::from_str(&self.target)?)
    }

    /// A private key takes precedence over a password
    pub fn credentials(&self) -> Result<Credentials, ResourceError> {
        match (&self.private_key_path, &self.password) {
            (Some(path), _) => Ok(Credentials::PrivateKey {
                username: self.username.clone(),
                path: path.clone(),
                passphrase: self
                    .passphrase
                    .as_ref()
                    .map(|passphrase| SecretBox::new(Box::new(passphrase.clone()))),
            }),
            (None, Some(password)) => Ok(Credentials::password(
                self.username.as_str(),
                password.as_str(),
            )),
            (None, None) => Err(ResourceError::MissingCredentials(self.username.clone())),
        }
    }

    /// `None` when no timeout applies
    pub fn connect_timeout(&self, defaults: &DefaultsConfig) -> Option<Duration> {
        let timeout = self.timeout.unwrap_or(defaults.connect_timeout);
        (!timeout.is_zero()).then_some(timeout)
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpec {
    pub mount_point: String,
    #[serde(default)]
    pub target: Datastore,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockSpec {
    pub mount_point: String,
    #[serde(default)]
    pub target: Datastore,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditConfigSpec {
    pub mount_point: String,
    #[serde(default)]
    pub target: Datastore,
    /// `<default-operation>`
    #[serde(default)]
    pub operation: DefaultOperation,
    pub xml: String,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSpec {
    pub mount_point: String,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSpec {
    pub mount_point: String,
    #[serde(default)]
    pub filter_type: FilterType,
    /// Filter content, no filter when empty
    #[serde(default)]
    pub xml: Option<String>,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetConfigSpec {
    pub mount_point: String,
    #[serde(default = "default_running", alias = "target")]
    pub source: Datastore,
    #[serde(default)]
    pub filter_type: FilterType,
    #[serde(default)]
    pub xml: Option<String>,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSpec {
    pub mount_point: String,
    pub xml: String,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscriptionSpec {
    pub mount_point: String,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub stop_time: Option<String>,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub sink: SinkConfig,
}

impl CreateSubscriptionSpec {
    pub fn params(&self) -> StreamParams {
        StreamParams {
            stream: self.stream.as_deref().map(Into::into),
            start_time: self.start_time.as_deref().map(Into::into),
            stop_time: self.stop_time.as_deref().map(Into::into),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishSubscriptionSpec {
    pub mount_point: String,
    /// Complete `<establish-subscription>` element
    pub xml: String,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Lock, apply a list of edits, commit and unlock as one unit
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSpec {
    pub mount_point: String,
    #[serde(default)]
    pub target: Datastore,
    #[serde(default)]
    pub operation: DefaultOperation,
    /// `<config>` contents, applied in order
    pub edits: Vec<String>,
    #[serde(default = "default_true")]
    pub lock: bool,
    #[serde(default = "default_true")]
    pub commit: bool,
    /// Only meaningful with `lock`
    #[serde(default = "default_true")]
    pub unlock: bool,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

impl TransactionSpec {
    /// Ordered steps, the unlock runs even when an earlier step failed
    pub fn steps(&self) -> Result<Vec<Step>, ResourceError> {
        if self.edits.is_empty() {
            return Err(ResourceError::EmptyTransaction);
        }
        let mut steps = Vec::with_capacity(self.edits.len() + 3);
        if self.lock {
            steps.push(Step::new(
                "lock",
                Operation::Lock(self.target).to_xml(),
                StepPolicy::Required,
            ));
        }
        for (index, edit) in self.edits.iter().enumerate() {
            let operation = Operation::EditConfig {
                target: self.target,
                default_operation: self.operation,
                config: edit.as_str().into(),
            };
            steps.push(Step::new(
                format!("edit-config[{index}]"),
                operation.to_xml(),
                StepPolicy::Required,
            ));
        }
        if self.commit {
            steps.push(Step::new(
                "commit",
                Operation::Commit.to_xml(),
                StepPolicy::Required,
            ));
        }
        if self.lock && self.unlock {
            steps.push(Step::new(
                "unlock",
                Operation::Unlock(self.target).to_xml(),
                StepPolicy::Always,
            ));
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::{
        providers::{Format, Yaml},
        Figment,
    };

    fn parse(yaml: &str) -> Vec<Resource> {
        Figment::new()
            .merge(Yaml::string(yaml))
            .extract_inner("resources")
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let resources = parse(
            r#"
resources:
  - name: dev1
    kind: MountPoint
    target: 192.0.2.1
    username: admin
    password: secret
  - name: lock1
    kind: Lock
    mount_point: dev1
  - name: edit1
    namespace: lab
    kind: EditConfig
    mount_point: dev1
    xml: <interfaces/>
    depends_on:
      kind: Lock
      name: lock1
  - name: cfg
    kind: GetConfig
    mount_point: dev1
"#,
        );
        assert_eq!(resources.len(), 4);

        let mount = &resources[0];
        assert_eq!(mount.key(), ResourceKey::new("default", "dev1"));
        assert_eq!(mount.session_key().unwrap(), mount.key());
        match &mount.spec {
            ResourceSpec::MountPoint(spec) => {
                assert_eq!(spec.timeout, None);
                assert_eq!(
                    spec.connect_timeout(&DefaultsConfig::default()),
                    Some(Duration::from_secs(15))
                );
                assert_eq!(spec.endpoint().unwrap(), Endpoint::new("192.0.2.1", 830));
                assert_eq!(spec.credentials().unwrap().username(), "admin");
                assert!(!format!("{spec:?}").contains("secret"));
            }
            other => panic!("unexpected spec {other:?}"),
        }

        let lock = &resources[1];
        assert_eq!(lock.kind(), ResourceKind::Lock);
        assert_eq!(
            lock.spec.timeout(&DefaultsConfig::default()),
            Duration::from_secs(1)
        );
        assert_eq!(
            lock.spec.operation(),
            Some(Operation::Lock(Datastore::Candidate))
        );

        let edit = &resources[2];
        assert_eq!(edit.session_key().unwrap(), ResourceKey::new("lab", "dev1"));
        assert_eq!(
            edit.spec.operation(),
            Some(Operation::EditConfig {
                target: Datastore::Candidate,
                default_operation: DefaultOperation::Merge,
                config: "<interfaces/>".into(),
            })
        );
        assert_eq!(
            edit.spec.dependency().unwrap(),
            Some(DependencyRef::new("Lock", "lock1").unwrap())
        );

        assert_eq!(
            resources[3].spec.operation(),
            Some(Operation::GetConfig {
                source: Datastore::Running,
                filter: None,
            })
        );
    }

    #[test]
    fn test_mount_point_credentials() {
        let resources = parse(
            r#"
resources:
  - name: dev1
    kind: MountPoint
    target: "[2001:db8::1]:2830"
    username: admin
    private_key_path: /keys/id_ed25519
    timeout: 0
  - name: dev2
    kind: MountPoint
    target: 192.0.2.2
    username: admin
"#,
        );
        match &resources[0].spec {
            ResourceSpec::MountPoint(spec) => {
                assert_eq!(spec.endpoint().unwrap(), Endpoint::new("2001:db8::1", 2830));
                assert!(matches!(
                    spec.credentials().unwrap(),
                    Credentials::PrivateKey { .. }
                ));
                assert_eq!(spec.connect_timeout(&DefaultsConfig::default()), None);
            }
            other => panic!("unexpected spec {other:?}"),
        }
        match &resources[1].spec {
            ResourceSpec::MountPoint(spec) => {
                let err = spec.credentials().unwrap_err();
                assert_eq!(err.class(), ErrorClass::Validation);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_kind() {
        let resources = parse(
            r#"
resources:
  - name: commit1
    kind: Commit
    mount_point: dev1
    depends_on:
      kind: Get
      name: get1
"#,
        );
        let err = resources[0].spec.dependency().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_get_filter() {
        let resources = parse(
            r#"
resources:
  - name: get1
    kind: Get
    mount_point: dev1
    filter_type: xpath
    xml: /interfaces/interface
    timeout: 5
"#,
        );
        assert_eq!(
            resources[0].spec.timeout(&DefaultsConfig::default()),
            Duration::from_secs(5)
        );
        assert_eq!(
            resources[0].spec.operation(),
            Some(Operation::Get {
                filter: Some(Filter {
                    filter_type: FilterType::Xpath,
                    content: "/interfaces/interface".into(),
                }),
            })
        );
    }

    #[test]
    fn test_transaction_steps() {
        let resources = parse(
            r#"
resources:
  - name: tx1
    kind: Transaction
    mount_point: dev1
    edits:
      - <a/>
      - <b/>
"#,
        );
        let spec = match &resources[0].spec {
            ResourceSpec::Transaction(spec) => spec.clone(),
            other => panic!("unexpected spec {other:?}"),
        };
        let steps = spec.steps().unwrap();
        let names: Vec<_> = steps.iter().map(|step| step.name.as_ref()).collect();
        assert_eq!(
            names,
            vec!["lock", "edit-config[0]", "edit-config[1]", "commit", "unlock"]
        );
        assert_eq!(steps[4].policy, StepPolicy::Always);

        let no_lock = TransactionSpec {
            lock: false,
            commit: false,
            ..spec.clone()
        };
        let names: Vec<_> = no_lock
            .steps()
            .unwrap()
            .into_iter()
            .map(|step| step.name)
            .collect();
        let expected: Vec<Box<str>> = vec!["edit-config[0]".into(), "edit-config[1]".into()];
        assert_eq!(names, expected);

        let empty = TransactionSpec {
            edits: vec![],
            ..spec
        };
        assert!(matches!(empty.steps(), Err(ResourceError::EmptyTransaction)));
    }

    #[test]
    fn test_missing_mount_point() {
        let resources = parse(
            r#"
resources:
  - name: rpc1
    kind: Rpc
    mount_point: ""
    xml: <get-schema/>
"#,
        );
        assert!(matches!(
            resources[0].session_key(),
            Err(ResourceError::MissingMountPoint)
        ));
    }
}
