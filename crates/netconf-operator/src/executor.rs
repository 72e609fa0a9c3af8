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

//! Executes NETCONF operations against a session.
//!
//! An operation fails either at the transport layer or, with a successful
//! round trip, when the decoded reply carries `<rpc-error>` elements. In
//! both cases the raw reply, when there is one, is kept for diagnostics.

use crate::{
    dependency::{DependencyError, DependencyGate, DependencyRef},
    error::{Classify, ErrorClass},
    message::{self, RpcError, RpcReply, XmlError},
    registry::{RegistryError, SessionRegistry},
    session::Session,
    transport::TransportError,
    ResourceKey,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, trace, warn};

#[derive(Debug, strum_macros::Display)]
pub enum ExecutionError {
    #[strum(to_string = "{0} is not connected")]
    NotConnected(ResourceKey),

    #[strum(to_string = "transport error: {0}")]
    Transport(TransportError),

    #[strum(to_string = "rpc-error: {summary}")]
    Protocol {
        summary: String,
        errors: Vec<RpcError>,
        raw: Box<str>,
    },

    #[strum(to_string = "malformed rpc-reply: {error}")]
    MalformedReply { error: XmlError, raw: Box<str> },

    #[strum(to_string = "invalid operation payload: {0}")]
    InvalidPayload(XmlError),

    #[strum(to_string = "{0}")]
    Registry(RegistryError),

    #[strum(to_string = "{0}")]
    Dependency(DependencyError),

    #[strum(to_string = "step `{step}` failed: {error}")]
    Step {
        step: Box<str>,
        error: Box<ExecutionError>,
    },
}

impl std::error::Error for ExecutionError {}

impl From<RegistryError> for ExecutionError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<DependencyError> for ExecutionError {
    fn from(err: DependencyError) -> Self {
        Self::Dependency(err)
    }
}

impl Classify for ExecutionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotConnected(_) => ErrorClass::NotConnected,
            Self::Transport(TransportError::Closed) => ErrorClass::NotConnected,
            Self::Transport(_) => ErrorClass::Connection,
            Self::Protocol { .. } | Self::MalformedReply { .. } => ErrorClass::Protocol,
            Self::InvalidPayload(_) => ErrorClass::Validation,
            Self::Registry(err) => err.class(),
            Self::Dependency(err) => err.class(),
            Self::Step { error, .. } => error.class(),
        }
    }
}

impl ExecutionError {
    /// Raw reply received from the peer, if the failure happened after one
    /// was received
    pub fn raw_reply(&self) -> Option<&str> {
        match self {
            Self::Protocol { raw, .. } | Self::MalformedReply { raw, .. } => Some(raw),
            Self::Step { error, .. } => error.raw_reply(),
            _ => None,
        }
    }
}

/// Successful outcome of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    message_id: Option<Box<str>>,
    data: Option<Box<str>>,
    subscription_id: Option<Box<str>>,
    raw: Box<str>,
}

impl Reply {
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Decoded `<data>` content, or the whole reply when there is none
    pub fn body(&self) -> &str {
        self.data.as_deref().unwrap_or(&self.raw)
    }
}

impl From<RpcReply> for Reply {
    fn from(reply: RpcReply) -> Self {
        Self {
            message_id: reply.message_id().map(Into::into),
            data: reply.data().map(Into::into),
            subscription_id: reply.subscription_id().map(Into::into),
            raw: reply.into_raw(),
        }
    }
}

/// An operation to run once its dependency is satisfied, built fresh for
/// every attempt
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Mount point identity of the session
    pub target: ResourceKey,
    pub payload: Box<str>,
    pub timeout: Duration,
    /// Checked in the namespace of `target`
    pub dependency: Option<DependencyRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum StepPolicy {
    /// A failure aborts the remaining steps
    #[strum(to_string = "required")]
    Required,
    /// A failure is logged and the sequence continues
    #[strum(to_string = "optional")]
    Optional,
    /// Runs even after a required step failed, e.g. an unlock
    #[strum(to_string = "always")]
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: Box<str>,
    pub payload: Box<str>,
    pub policy: StepPolicy,
}

impl Step {
    pub fn new(name: impl Into<Box<str>>, payload: impl Into<Box<str>>, policy: StepPolicy) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            policy,
        }
    }
}

#[derive(Clone)]
pub struct OperationExecutor {
    registry: Arc<SessionRegistry>,
    gate: DependencyGate,
}

impl OperationExecutor {
    pub fn new(registry: Arc<SessionRegistry>, gate: DependencyGate) -> Self {
        Self { registry, gate }
    }

    pub async fn execute(
        &self,
        session: &Session,
        payload: &str,
        timeout: Duration,
    ) -> Result<Reply, ExecutionError> {
        let identity = session.identity();
        if !session.is_connected() {
            return Err(ExecutionError::NotConnected(identity.clone()));
        }
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("[{identity}] Sending operation: `{payload}`");
        }
        let raw = session
            .call(payload, timeout)
            .await
            .map_err(|err| match err {
                TransportError::Closed => ExecutionError::NotConnected(identity.clone()),
                err => ExecutionError::Transport(err),
            })?;
        let reply = match RpcReply::parse(&raw) {
            Ok(reply) => reply,
            Err(error) => {
                warn!("[{identity}] Unable to decode rpc-reply: {error}");
                return Err(ExecutionError::MalformedReply { error, raw });
            }
        };
        if reply.has_errors() {
            let summary = if reply.errors().is_empty() {
                format!(
                    "subscription result {}",
                    reply.subscription_result().unwrap_or_default()
                )
            } else {
                reply
                    .errors()
                    .iter()
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            debug!("[{identity}] Operation failed: {summary}");
            return Err(ExecutionError::Protocol {
                summary,
                errors: reply.errors().to_vec(),
                raw: reply.into_raw(),
            });
        }
        Ok(reply.into())
    }

    /// Check the payload and the dependency, then execute on the session of
    /// the request target
    pub async fn run(&self, request: &OperationRequest) -> Result<Reply, ExecutionError> {
        message::check_well_formed(&request.payload).map_err(ExecutionError::InvalidPayload)?;
        self.gate
            .validate(request.dependency.as_ref(), request.target.namespace())
            .await?;
        let session = self.registry.lookup(&request.target).await?;
        self.execute(&session, &request.payload, request.timeout).await
    }

    /// Execute the steps in order. The first failing required step skips the
    /// remaining non [StepPolicy::Always] steps and is reported by name.
    pub async fn execute_sequence(
        &self,
        session: &Session,
        steps: &[Step],
        timeout: Duration,
    ) -> Result<Vec<(Box<str>, Reply)>, ExecutionError> {
        let identity = session.identity();
        let mut replies = Vec::with_capacity(steps.len());
        let mut failure: Option<ExecutionError> = None;
        for step in steps {
            if failure.is_some() && step.policy != StepPolicy::Always {
                debug!("[{identity}] Skipping step `{}`", step.name);
                continue;
            }
            match self.execute(session, &step.payload, timeout).await {
                Ok(reply) => {
                    debug!("[{identity}] Step `{}` succeeded", step.name);
                    replies.push((step.name.clone(), reply));
                }
                Err(err) if step.policy == StepPolicy::Required && failure.is_none() => {
                    info!("[{identity}] Required step `{}` failed: {err}", step.name);
                    failure = Some(ExecutionError::Step {
                        step: step.name.clone(),
                        error: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!("[{identity}] {} step `{}` failed: {err}", step.policy, step.name);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(replies),
        }
    }
}
