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

//! Drives sessions, operations and subscriptions from declarative resources.
//!
//! Every apply records the outcome in the [StatusStore] and tells the caller
//! when to try again. Protocol failures are final. Resources that need a
//! correction are retried on a long interval.

use crate::{
    config::DefaultsConfig,
    dependency::{DependencyError, DependencyGate},
    error::{Classify, ErrorClass},
    executor::{ExecutionError, OperationExecutor, OperationRequest},
    message::{self, XmlError},
    operations::{Datastore, Operation},
    registry::{RegistryError, SessionRegistry},
    resources::{
        CreateSubscriptionSpec, EstablishSubscriptionSpec, MountPointSpec, Resource,
        ResourceError, ResourceSpec, TransactionSpec,
    },
    sink::{EventRecorder, SinkError},
    status::{ResourceKind, Status, StatusRecord, StatusStore},
    subscription::{SubscriptionError, SubscriptionManager, SubscriptionRecord, SubscriptionStyle},
    transport::Dialer,
    ResourceKey,
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Prefix of the recorded reply when a dependency is not satisfied
pub const DEPENDENCY_UNMET_PREFIX: &str = "dependency unmet: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Never,
    After(Duration),
}

#[derive(Debug, strum_macros::Display)]
pub enum ReconcileError {
    #[strum(to_string = "{0}")]
    Resource(ResourceError),

    #[strum(to_string = "{0}")]
    Registry(RegistryError),

    #[strum(to_string = "{0}")]
    Dependency(DependencyError),

    #[strum(to_string = "{0}")]
    Execution(ExecutionError),

    #[strum(to_string = "{0}")]
    Subscription(SubscriptionError),

    #[strum(to_string = "{0}")]
    Sink(SinkError),

    #[strum(to_string = "invalid payload: {0}")]
    InvalidPayload(XmlError),
}

impl std::error::Error for ReconcileError {}

impl From<ResourceError> for ReconcileError {
    fn from(err: ResourceError) -> Self {
        Self::Resource(err)
    }
}

impl From<RegistryError> for ReconcileError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<DependencyError> for ReconcileError {
    fn from(err: DependencyError) -> Self {
        Self::Dependency(err)
    }
}

impl From<ExecutionError> for ReconcileError {
    fn from(err: ExecutionError) -> Self {
        Self::Execution(err)
    }
}

impl From<SubscriptionError> for ReconcileError {
    fn from(err: SubscriptionError) -> Self {
        Self::Subscription(err)
    }
}

impl From<SinkError> for ReconcileError {
    fn from(err: SinkError) -> Self {
        Self::Sink(err)
    }
}

impl Classify for ReconcileError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Resource(err) => err.class(),
            Self::Registry(err) => err.class(),
            Self::Dependency(err) => err.class(),
            Self::Execution(err) => err.class(),
            Self::Subscription(err) => err.class(),
            Self::Sink(_) | Self::InvalidPayload(_) => ErrorClass::Validation,
        }
    }
}

impl ReconcileError {
    /// Text recorded as the reply of a failed resource: the raw peer reply
    /// when there is one, the error message otherwise
    pub fn diagnostic(&self) -> String {
        let diagnostic = match self {
            Self::Execution(ExecutionError::Step { step, error }) => {
                let detail = error
                    .raw_reply()
                    .map_or_else(|| error.to_string(), str::to_string);
                format!("step `{step}` failed: {detail}")
            }
            Self::Execution(err) => err
                .raw_reply()
                .map_or_else(|| err.to_string(), str::to_string),
            Self::Subscription(err) => err
                .raw_reply()
                .map_or_else(|| err.to_string(), str::to_string),
            err => err.to_string(),
        };
        if self.class() == ErrorClass::DependencyUnmet {
            format!("{DEPENDENCY_UNMET_PREFIX}{diagnostic}")
        } else {
            diagnostic
        }
    }
}

pub struct Reconciler {
    registry: Arc<SessionRegistry>,
    executor: OperationExecutor,
    gate: DependencyGate,
    subscriptions: SubscriptionManager,
    store: Arc<dyn StatusStore>,
    events: EventRecorder,
    defaults: DefaultsConfig,
}

impl Reconciler {
    pub fn new(dialer: Arc<dyn Dialer>, store: Arc<dyn StatusStore>, defaults: DefaultsConfig) -> Self {
        let registry =
            Arc::new(SessionRegistry::new(dialer).with_kill_timeout(defaults.kill_timeout));
        let gate = DependencyGate::new(store.clone());
        let executor = OperationExecutor::new(registry.clone(), gate.clone());
        let subscriptions = SubscriptionManager::new(executor.clone())
            .with_listener_buffer(defaults.listener_buffer);
        let events = EventRecorder::new(defaults.event_buffer);
        Self {
            registry,
            executor,
            gate,
            subscriptions,
            store,
            events,
            defaults,
        }
    }

    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub const fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Notification events of subscriptions using the event sink
    pub const fn events(&self) -> &EventRecorder {
        &self.events
    }

    pub const fn defaults(&self) -> &DefaultsConfig {
        &self.defaults
    }

    /// Reconcile a single resource and record its status
    pub async fn apply(&self, resource: &Resource) -> Requeue {
        let key = resource.key();
        let kind = resource.kind();
        debug!("[{key}] Reconciling {kind}");
        let result = match &resource.spec {
            ResourceSpec::MountPoint(spec) => self.apply_mount_point(&key, spec).await,
            ResourceSpec::CreateSubscription(spec) => {
                self.apply_create_subscription(resource, spec).await
            }
            ResourceSpec::EstablishSubscription(spec) => {
                self.apply_establish_subscription(resource, spec).await
            }
            ResourceSpec::Transaction(spec) => self.apply_transaction(resource, spec).await,
            _ => self.apply_operation(resource).await,
        };
        match result {
            Ok(record) => {
                info!(
                    "[{key}] {kind} reconciled: {}",
                    record.status.map_or_else(|| "unset".to_string(), |s| s.to_string())
                );
                self.store.record(kind, &key, record).await;
                Requeue::Never
            }
            Err(err) => {
                let class = err.class();
                let status = if class == ErrorClass::DependencyUnmet {
                    Status::Pending
                } else {
                    Status::Failed
                };
                let requeue = self.requeue(class);
                warn!("[{key}] {kind} failed with {class}: {err}, requeue: {requeue:?}");
                self.store
                    .record(kind, &key, StatusRecord::new(status, Some(err.diagnostic().into())))
                    .await;
                requeue
            }
        }
    }

    fn requeue(&self, class: ErrorClass) -> Requeue {
        match class {
            ErrorClass::Protocol => Requeue::Never,
            ErrorClass::Validation => Requeue::After(self.defaults.validation_requeue_delay),
            ErrorClass::Connection | ErrorClass::DependencyUnmet | ErrorClass::NotConnected => {
                Requeue::After(self.defaults.requeue_delay)
            }
        }
    }

    async fn apply_mount_point(
        &self,
        key: &ResourceKey,
        spec: &MountPointSpec,
    ) -> Result<StatusRecord, ReconcileError> {
        let endpoint = spec.endpoint()?;
        let credentials = spec.credentials()?;
        let session = match self
            .registry
            .connect(
                key,
                &endpoint,
                &credentials,
                spec.connect_timeout(&self.defaults),
                &spec.additional_capabilities,
            )
            .await
        {
            Ok(session) => session,
            Err(RegistryError::AlreadyConnected(_)) => self.registry.lookup(key).await?,
            Err(err) => return Err(err.into()),
        };
        Ok(StatusRecord::new(Status::Connected, None)
            .with_capabilities(session.capabilities().to_vec()))
    }

    async fn apply_operation(&self, resource: &Resource) -> Result<StatusRecord, ReconcileError> {
        let operation = match resource.spec.operation() {
            Some(operation) => operation,
            None => return Ok(StatusRecord::unset()),
        };
        if let Operation::EditConfig { config, .. } | Operation::Raw(config) = &operation {
            message::check_well_formed(config).map_err(ReconcileError::InvalidPayload)?;
        }
        let request = OperationRequest {
            target: resource.session_key()?,
            payload: operation.to_xml().into(),
            timeout: resource.spec.timeout(&self.defaults),
            dependency: resource.spec.dependency()?,
        };
        let reply = self.executor.run(&request).await?;
        Ok(StatusRecord::new(Status::Success, Some(reply.body().into())))
    }

    async fn apply_transaction(
        &self,
        resource: &Resource,
        spec: &TransactionSpec,
    ) -> Result<StatusRecord, ReconcileError> {
        for edit in &spec.edits {
            message::check_well_formed(edit).map_err(ReconcileError::InvalidPayload)?;
        }
        let steps = spec.steps()?;
        let dependency = resource.spec.dependency()?;
        self.gate
            .validate(dependency.as_ref(), &resource.namespace)
            .await?;
        let session = self.registry.lookup(&resource.session_key()?).await?;
        let replies = self
            .executor
            .execute_sequence(&session, &steps, resource.spec.timeout(&self.defaults))
            .await?;
        let reply = replies.last().map(|(_, reply)| reply.body().into());
        Ok(StatusRecord::new(Status::Success, reply))
    }

    async fn apply_create_subscription(
        &self,
        resource: &Resource,
        spec: &CreateSubscriptionSpec,
    ) -> Result<StatusRecord, ReconcileError> {
        let key = resource.key();
        let session = self.registry.lookup(&resource.session_key()?).await?;
        if let Some(record) = self.active_subscription(&key).await {
            return Ok(record);
        }
        let sink = self.events.build(&spec.sink, SubscriptionStyle::Stream)?;
        let outcome = self
            .subscriptions
            .create_subscription(
                &session,
                &key,
                &spec.params(),
                sink,
                resource.spec.timeout(&self.defaults),
            )
            .await?;
        Ok(StatusRecord::new(Status::Subscribed, None)
            .with_subscription_id(outcome.subscription_id()))
    }

    async fn apply_establish_subscription(
        &self,
        resource: &Resource,
        spec: &EstablishSubscriptionSpec,
    ) -> Result<StatusRecord, ReconcileError> {
        let key = resource.key();
        let session = self.registry.lookup(&resource.session_key()?).await?;
        if let Some(record) = self.active_subscription(&key).await {
            return Ok(record);
        }
        let sink = self
            .events
            .build(&spec.sink, SubscriptionStyle::Established)?;
        let outcome = self
            .subscriptions
            .establish_subscription(
                &session,
                &key,
                &spec.xml,
                sink,
                resource.spec.timeout(&self.defaults),
            )
            .await?;
        Ok(StatusRecord::new(Status::Subscribed, None)
            .with_subscription_id(outcome.subscription_id()))
    }

    /// Status of an already active subscription, avoids building a new sink
    async fn active_subscription(&self, owner: &ResourceKey) -> Option<StatusRecord> {
        self.subscriptions
            .record(owner)
            .await
            .filter(|record| record.is_active())
            .map(|record| {
                StatusRecord::new(Status::Subscribed, None)
                    .with_subscription_id(record.subscription_id())
            })
    }

    /// Record a subscription that stopped delivering as failed
    async fn record_lost(&self, record: &SubscriptionRecord, reason: &str) {
        let kind = match record.style() {
            SubscriptionStyle::Stream => ResourceKind::CreateSubscription,
            SubscriptionStyle::Established => ResourceKind::EstablishSubscription,
        };
        warn!(
            "[{}] Subscription {} lost: {reason}",
            record.owner(),
            record.subscription_id()
        );
        self.store
            .record(
                kind,
                record.owner(),
                StatusRecord::new(Status::Failed, Some(reason.into()))
                    .with_subscription_id(record.subscription_id()),
            )
            .await;
    }

    /// Find subscriptions whose session or delivery is gone and record them
    /// as failed. Returns the lost subscriptions.
    pub async fn check_subscriptions(&self) -> Vec<SubscriptionRecord> {
        let mut lost = vec![];
        for record in self.subscriptions.records().await {
            if record.is_active() {
                continue;
            }
            let connected = self.registry.lookup(record.session()).await.is_ok();
            let reason = if connected {
                format!("notification delivery of {} stopped", record.session())
            } else {
                format!("session {} disconnected", record.session())
            };
            self.record_lost(&record, &reason).await;
            lost.push(record);
        }
        lost
    }

    /// Apply again the subscriptions found lost by
    /// [Reconciler::check_subscriptions], together with their mount points.
    /// Returns the resources that did not settle.
    pub async fn recover_subscriptions(&self, resources: &[Resource]) -> Vec<ResourceKey> {
        let lost = self.check_subscriptions().await;
        if lost.is_empty() {
            return vec![];
        }
        let affected: Vec<Resource> = resources
            .iter()
            .filter(|resource| {
                let key = resource.key();
                lost.iter().any(|record| match resource.spec {
                    ResourceSpec::MountPoint(_) => record.session() == &key,
                    _ => record.owner() == &key,
                })
            })
            .cloned()
            .collect();
        info!("Recovering {} lost subscriptions", lost.len());
        self.reconcile_all(&affected).await
    }

    /// Release what the resource holds on the device and drop its status
    pub async fn delete(&self, resource: &Resource) {
        let key = resource.key();
        let kind = resource.kind();
        let timeout = resource.spec.timeout(&self.defaults);
        match &resource.spec {
            ResourceSpec::MountPoint(_) => {
                for record in self.subscriptions.forget_session(&key).await {
                    self.record_lost(&record, &format!("session {key} disconnected"))
                        .await;
                }
                self.registry
                    .disconnect(&key, self.defaults.close_timeout)
                    .await;
            }
            ResourceSpec::Lock(spec) => {
                let locked = self
                    .store
                    .fetch(kind, &key)
                    .await
                    .is_some_and(|record| record.is_success());
                if locked {
                    self.release_lock(resource, spec.target, timeout).await;
                }
            }
            ResourceSpec::CreateSubscription(_) | ResourceSpec::EstablishSubscription(_) => {
                self.subscriptions.cancel(&key, timeout).await;
            }
            _ => {}
        }
        self.store.remove(kind, &key).await;
        info!("[{key}] {kind} deleted");
    }

    async fn release_lock(
        &self,
        resource: &Resource,
        target: Datastore,
        timeout: Duration,
    ) {
        let key = resource.key();
        let session = match resource.session_key() {
            Ok(session_key) => self.registry.lookup(&session_key).await,
            Err(err) => {
                debug!("[{key}] No session to release the lock on: {err}");
                return;
            }
        };
        match session {
            Ok(session) => {
                let payload = Operation::Unlock(target).to_xml();
                match self.executor.execute(&session, &payload, timeout).await {
                    Ok(_) => info!("[{key}] Released lock on {target}"),
                    Err(err) => warn!("[{key}] Unable to release lock on {target}: {err}"),
                }
            }
            Err(err) => debug!("[{key}] No session to release the lock on: {err}"),
        }
    }

    /// Apply the resources in order, retrying each one as requested until it
    /// settles or `max_attempts` is reached. Returns the resources that
    /// never settled.
    pub async fn reconcile_all(&self, resources: &[Resource]) -> Vec<ResourceKey> {
        let max_attempts = self.defaults.max_attempts.max(1);
        let mut pending: VecDeque<(usize, usize, Instant)> = (0..resources.len())
            .map(|index| (index, 0, Instant::now()))
            .collect();
        let mut abandoned = vec![];
        while !pending.is_empty() {
            let now = Instant::now();
            let mut waiting = VecDeque::with_capacity(pending.len());
            while let Some((index, attempts, not_before)) = pending.pop_front() {
                if not_before > now {
                    waiting.push_back((index, attempts, not_before));
                    continue;
                }
                let resource = &resources[index];
                match self.apply(resource).await {
                    Requeue::Never => {}
                    Requeue::After(_) if attempts + 1 >= max_attempts => {
                        error!(
                            "[{}] Giving up on {} after {} attempts",
                            resource.key(),
                            resource.kind(),
                            attempts + 1
                        );
                        abandoned.push(resource.key());
                    }
                    Requeue::After(delay) => {
                        waiting.push_back((index, attempts + 1, Instant::now() + delay));
                    }
                }
            }
            pending = waiting;
            if let Some(next) = pending.iter().map(|(_, _, not_before)| *not_before).min() {
                tokio::time::sleep_until(next).await;
            }
        }
        abandoned
    }

    /// Delete the resources in reverse order
    pub async fn delete_all(&self, resources: &[Resource]) {
        for resource in resources.iter().rev() {
            self.delete(resource).await;
        }
        self.registry
            .disconnect_all(self.defaults.close_timeout)
            .await;
    }
}
