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

//! Registry of live sessions keyed by mount point identity.
//!
//! At most one live session exists per identity. A session whose pump died
//! stays in the registry, reported as not connected, until it is either
//! disconnected or replaced by a fresh connect.

use crate::{
    capabilities::Capabilities,
    error::{Classify, ErrorClass},
    message::RpcReply,
    operations::Operation,
    session::Session,
    transport::{Credentials, Dialer, Endpoint, TransportError},
    ResourceKey,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, strum_macros::Display)]
pub enum RegistryError {
    #[strum(to_string = "{0} already connected")]
    AlreadyConnected(ResourceKey),

    #[strum(to_string = "{0} connection is already being established")]
    ConnectInProgress(ResourceKey),

    #[strum(to_string = "unable to connect to {endpoint}: {error}")]
    Dial {
        endpoint: Endpoint,
        error: TransportError,
    },

    #[strum(to_string = "hello exchange with {endpoint} failed: {error}")]
    Hello {
        endpoint: Endpoint,
        error: TransportError,
    },

    #[strum(to_string = "no session found for {0}")]
    NotFound(ResourceKey),

    #[strum(to_string = "{0} is not connected")]
    NotConnected(ResourceKey),

    #[strum(to_string = "connecting {0} was aborted by a disconnect")]
    Aborted(ResourceKey),
}

impl std::error::Error for RegistryError {}

impl Classify for RegistryError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyConnected(_)
            | Self::ConnectInProgress(_)
            | Self::Dial { .. }
            | Self::Hello { .. }
            | Self::Aborted(_) => ErrorClass::Connection,
            Self::NotFound(_) | Self::NotConnected(_) => ErrorClass::NotConnected,
        }
    }
}

/// How a session ended on [SessionRegistry::disconnect]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum DisconnectOutcome {
    /// `<close-session>` was acknowledged
    #[strum(to_string = "closed")]
    Graceful,
    /// `<kill-session>` was acknowledged after the close failed
    #[strum(to_string = "killed")]
    Killed,
    /// Neither was acknowledged, the session was torn down locally
    #[strum(to_string = "forced")]
    Forced,
    /// A connect in progress was aborted, no session was registered
    #[strum(to_string = "aborted")]
    Aborted,
    #[strum(to_string = "not found")]
    NotFound,
}

/// A connect in progress. `abort` is cancelled by a disconnect of the same
/// identity, `done` once the connect returned.
#[derive(Clone, Default)]
struct Connecting {
    abort: CancellationToken,
    done: CancellationToken,
}

/// Releases the identity reserved by an in-flight connect, also when the
/// connecting future is dropped half way.
struct ConnectGuard<'a> {
    connecting: &'a Mutex<HashMap<ResourceKey, Connecting>>,
    identity: ResourceKey,
    done: CancellationToken,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identity);
        self.done.cancel();
    }
}

pub struct SessionRegistry {
    dialer: Arc<dyn Dialer>,
    sessions: RwLock<HashMap<ResourceKey, Arc<Session>>>,
    connecting: Mutex<HashMap<ResourceKey, Connecting>>,
    kill_timeout: Option<Duration>,
}

impl SessionRegistry {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            sessions: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            kill_timeout: None,
        }
    }

    /// Timeout of the `<kill-session>` sent when `<close-session>` fails,
    /// defaults to the timeout given to [SessionRegistry::disconnect]
    pub const fn with_kill_timeout(mut self, kill_timeout: Option<Duration>) -> Self {
        self.kill_timeout = kill_timeout;
        self
    }

    /// Establish a session for `identity` and start its notification pump.
    ///
    /// `timeout` bounds the dial and the hello exchange separately, `None`
    /// or zero waits indefinitely.
    pub async fn connect<S: AsRef<str>>(
        &self,
        identity: &ResourceKey,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Option<Duration>,
        additional_capabilities: &[S],
    ) -> Result<Arc<Session>, RegistryError> {
        let (_guard, abort, stale) = {
            let mut sessions = self.sessions.write().await;
            let mut connecting = self
                .connecting
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if connecting.contains_key(identity) {
                return Err(RegistryError::ConnectInProgress(identity.clone()));
            }
            let stale = match sessions.get(identity) {
                Some(session) if session.is_connected() => {
                    return Err(RegistryError::AlreadyConnected(identity.clone()));
                }
                Some(_) => sessions.remove(identity),
                None => None,
            };
            let entry = Connecting::default();
            connecting.insert(identity.clone(), entry.clone());
            let guard = ConnectGuard {
                connecting: &self.connecting,
                identity: identity.clone(),
                done: entry.done,
            };
            (guard, entry.abort, stale)
        };
        if let Some(stale) = stale {
            info!("[{identity}] Replacing disconnected session {}", stale.session_id());
            Self::teardown(&stale, timeout).await;
        }

        let session = Arc::new(
            self.establish(identity, endpoint, credentials, timeout, additional_capabilities)
                .await?,
        );
        {
            // checked under the same lock a disconnect removes sessions with
            let mut sessions = self.sessions.write().await;
            if !abort.is_cancelled() {
                sessions.insert(identity.clone(), session.clone());
                return Ok(session);
            }
        }
        info!(
            "[{identity}] Disconnected while connecting, dropping session {}",
            session.session_id()
        );
        Self::teardown(&session, timeout).await;
        Err(RegistryError::Aborted(identity.clone()))
    }

    async fn establish<S: AsRef<str>>(
        &self,
        identity: &ResourceKey,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Option<Duration>,
        additional_capabilities: &[S],
    ) -> Result<Session, RegistryError> {
        info!(
            "[{identity}] Connecting to {endpoint} as {}",
            credentials.username()
        );
        let timeout = timeout.filter(|timeout| !timeout.is_zero());
        let transport = self
            .dialer
            .dial(endpoint, credentials, timeout)
            .await
            .map_err(|error| {
                warn!("[{identity}] Unable to connect to {endpoint}: {error}");
                RegistryError::Dial {
                    endpoint: endpoint.clone(),
                    error,
                }
            })?;
        let capabilities = Capabilities::client(additional_capabilities);
        let hello = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, transport.send_hello(&capabilities))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout))),
            None => transport.send_hello(&capabilities).await,
        };
        match hello {
            Ok(hello) => Ok(Session::start(
                identity.clone(),
                endpoint.clone(),
                hello,
                transport,
            )),
            Err(error) => {
                warn!("[{identity}] Hello exchange with {endpoint} failed: {error}");
                if let Err(err) = transport.close().await {
                    debug!("[{identity}] Error closing transport: {err}");
                }
                Err(RegistryError::Hello {
                    endpoint: endpoint.clone(),
                    error,
                })
            }
        }
    }

    /// The live session of `identity`, never blocks on a connect in progress
    pub async fn lookup(&self, identity: &ResourceKey) -> Result<Arc<Session>, RegistryError> {
        let session = self
            .sessions
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(identity.clone()))?;
        if session.is_connected() {
            Ok(session)
        } else {
            Err(RegistryError::NotConnected(identity.clone()))
        }
    }

    /// Close the session of `identity` and remove it from the registry.
    ///
    /// Tries `<close-session>` then `<kill-session>`, whatever the peer
    /// answers the identity is removed and the pump stopped before
    /// returning. A connect in progress for the identity is aborted and
    /// waited for up to `timeout`. Calling it for an unknown identity is a
    /// no-op.
    pub async fn disconnect(
        &self,
        identity: &ResourceKey,
        timeout: Duration,
    ) -> DisconnectOutcome {
        let (session, pending) = {
            let mut sessions = self.sessions.write().await;
            let pending = self
                .connecting
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(identity)
                .cloned();
            if let Some(pending) = &pending {
                pending.abort.cancel();
            }
            (sessions.remove(identity), pending)
        };
        let session = match (session, pending) {
            (Some(session), _) => session,
            (None, Some(pending)) => {
                info!("[{identity}] Aborting connect in progress");
                if tokio::time::timeout(timeout, pending.done.cancelled())
                    .await
                    .is_err()
                {
                    warn!("[{identity}] Connect still running after {timeout:?}, it will not register its session");
                }
                return DisconnectOutcome::Aborted;
            }
            (None, None) => {
                debug!("[{identity}] No session to disconnect");
                return DisconnectOutcome::NotFound;
            }
        };
        let outcome = self.close(&session, timeout).await;
        Self::teardown(&session, Some(timeout)).await;
        info!("[{identity}] Session {} {outcome}", session.session_id());
        outcome
    }

    async fn close(&self, session: &Session, timeout: Duration) -> DisconnectOutcome {
        let identity = session.identity();
        if !session.is_connected() {
            return DisconnectOutcome::Forced;
        }
        match session
            .call(&Operation::CloseSession.to_xml(), timeout)
            .await
        {
            Ok(reply) if Self::acknowledged(&reply) => return DisconnectOutcome::Graceful,
            Ok(reply) => warn!("[{identity}] close-session was not acknowledged: {reply}"),
            Err(err) => warn!("[{identity}] Unable to close session: {err}"),
        }
        let kill_timeout = self.kill_timeout.unwrap_or(timeout);
        match session
            .call(
                &Operation::KillSession(session.session_id()).to_xml(),
                kill_timeout,
            )
            .await
        {
            Ok(reply) if Self::acknowledged(&reply) => DisconnectOutcome::Killed,
            Ok(reply) => {
                warn!("[{identity}] kill-session was not acknowledged: {reply}");
                DisconnectOutcome::Forced
            }
            Err(err) => {
                warn!("[{identity}] Unable to kill session: {err}");
                DisconnectOutcome::Forced
            }
        }
    }

    fn acknowledged(reply: &str) -> bool {
        RpcReply::parse(reply).is_ok_and(|reply| reply.is_ok() && !reply.has_errors())
    }

    async fn teardown(session: &Session, timeout: Option<Duration>) {
        let identity = session.identity();
        if let Some(exit) = session.shutdown().await {
            debug!("[{identity}] Notification pump exited: {exit}");
        }
        let released = session.listeners().clear().await;
        if released > 0 {
            debug!("[{identity}] Released {released} listeners");
        }
        match timeout.filter(|timeout| !timeout.is_zero()) {
            Some(timeout) => {
                if tokio::time::timeout(timeout, session.close_transport())
                    .await
                    .is_err()
                {
                    warn!("[{identity}] Closing the transport timed out after {timeout:?}");
                }
            }
            None => session.close_transport().await,
        }
    }

    /// Disconnect every session, used on shutdown
    pub async fn disconnect_all(&self, timeout: Duration) {
        let identities = self.identities().await;
        let outcomes = futures::future::join_all(
            identities
                .iter()
                .map(|identity| self.disconnect(identity, timeout)),
        )
        .await;
        for (identity, outcome) in identities.iter().zip(outcomes) {
            debug!("[{identity}] Disconnected on shutdown: {outcome}");
        }
    }

    pub async fn identities(&self) -> Vec<ResourceKey> {
        let mut identities: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pump::PumpExit,
        test_utils::{error_reply, ok_reply, MockDialer},
    };

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn dev1() -> ResourceKey {
        ResourceKey::new("default", "dev1")
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("192.0.2.1", 830)
    }

    fn credentials() -> Credentials {
        Credentials::password("admin", "admin")
    }

    async fn connect(registry: &SessionRegistry) -> Result<Arc<Session>, RegistryError> {
        registry
            .connect::<&str>(&dev1(), &endpoint(), &credentials(), Some(TIMEOUT), &[])
            .await
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_connect_once_per_identity() {
        let dialer = Arc::new(MockDialer::new());
        let registry = SessionRegistry::new(dialer.clone());

        let session = connect(&registry).await.unwrap();
        assert!(session.is_connected());
        let found = registry.lookup(&dev1()).await.unwrap();
        assert!(Arc::ptr_eq(&session, &found));

        let second = connect(&registry).await;
        assert!(matches!(second, Err(RegistryError::AlreadyConnected(_))));
        assert_eq!(
            second.err().map(|err| err.to_string()),
            Some("default/dev1 already connected".to_string())
        );
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(registry.identities().await, vec![dev1()]);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_disconnect_aborts_connect_in_progress() {
        let dialer = Arc::new(MockDialer::new().with_delay(Duration::from_millis(100)));
        let registry = SessionRegistry::new(dialer.clone());
        let disconnect = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.disconnect(&dev1(), TIMEOUT).await
        };
        let (connected, outcome) = tokio::join!(connect(&registry), disconnect);
        assert_eq!(outcome, DisconnectOutcome::Aborted);
        assert!(matches!(connected, Err(RegistryError::Aborted(_))));
        assert!(matches!(
            registry.lookup(&dev1()).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.identities().await.is_empty());
        // the session opened by the aborted connect is closed
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(dialer.last_transport().close_count(), 1);

        // the identity can be connected again afterwards
        let session = connect(&registry).await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_concurrent_connect_dials_once() {
        let dialer = Arc::new(MockDialer::new().with_delay(Duration::from_millis(50)));
        let registry = SessionRegistry::new(dialer.clone());
        let (first, second) = tokio::join!(connect(&registry), connect(&registry));
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(RegistryError::ConnectInProgress(_)))));
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_dial_failure() {
        let dialer = Arc::new(MockDialer::new());
        dialer.fail_next_dial(TransportError::IO(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )));
        let registry = SessionRegistry::new(dialer.clone());

        let err = connect(&registry).await.unwrap_err();
        assert!(matches!(err, RegistryError::Dial { .. }));
        assert_eq!(err.class(), ErrorClass::Connection);
        assert!(matches!(
            registry.lookup(&dev1()).await,
            Err(RegistryError::NotFound(_))
        ));
        // the identity is not left reserved
        assert!(connect(&registry).await.is_ok());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_hello_failure_closes_transport() {
        let dialer = Arc::new(MockDialer::new());
        dialer.fail_hello(true);
        let registry = SessionRegistry::new(dialer.clone());
        let err = connect(&registry).await.unwrap_err();
        assert!(matches!(err, RegistryError::Hello { .. }));
        assert_eq!(dialer.last_transport().close_count(), 1);
        assert!(registry.identities().await.is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_graceful_disconnect() {
        let dialer = Arc::new(MockDialer::new());
        let registry = SessionRegistry::new(dialer.clone());
        let session = connect(&registry).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), registry.disconnect(&dev1(), TIMEOUT))
            .await
            .expect("disconnect in time");
        assert_eq!(outcome, DisconnectOutcome::Graceful);
        // the pump was blocked on receive and has terminated
        assert_eq!(session.pump_exit(), Some(PumpExit::Cancelled));
        assert!(matches!(
            registry.lookup(&dev1()).await,
            Err(RegistryError::NotFound(_))
        ));
        let transport = dialer.last_transport();
        assert_eq!(transport.calls_containing("<close-session/>"), 1);
        assert_eq!(transport.calls_containing("<kill-session>"), 0);
        assert_eq!(transport.close_count(), 1);

        assert_eq!(
            registry.disconnect(&dev1(), TIMEOUT).await,
            DisconnectOutcome::NotFound
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_disconnect_kills_when_close_fails() {
        let dialer = Arc::new(MockDialer::with_responder(Arc::new(|payload: &str| {
            if payload.contains("close-session") {
                Ok(error_reply("operation-failed", "busy"))
            } else {
                Ok(ok_reply())
            }
        })));
        let registry = SessionRegistry::new(dialer.clone());
        connect(&registry).await.unwrap();

        assert_eq!(
            registry.disconnect(&dev1(), TIMEOUT).await,
            DisconnectOutcome::Killed
        );
        let transport = dialer.last_transport();
        assert_eq!(
            transport.calls_containing("<kill-session><session-id>1</session-id></kill-session>"),
            1
        );
        assert!(registry.identities().await.is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unresponsive_peer_is_still_removed() {
        let dialer = Arc::new(MockDialer::with_responder(Arc::new(|_: &str| {
            Err(TransportError::Timeout(TIMEOUT))
        })));
        let registry = SessionRegistry::new(dialer.clone())
            .with_kill_timeout(Some(Duration::from_millis(10)));
        let session = connect(&registry).await.unwrap();

        assert_eq!(
            registry.disconnect(&dev1(), TIMEOUT).await,
            DisconnectOutcome::Forced
        );
        assert!(!session.is_connected());
        assert!(session.pump_exit().is_some());
        assert!(matches!(
            registry.lookup(&dev1()).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_dead_session_is_reported_then_replaced() {
        let dialer = Arc::new(MockDialer::new());
        let registry = SessionRegistry::new(dialer.clone());
        let session = connect(&registry).await.unwrap();

        dialer.last_transport().close_inbound();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pump noticed the closed transport");

        let err = registry.lookup(&dev1()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotConnected(_)));
        assert_eq!(err.class(), ErrorClass::NotConnected);

        let fresh = connect(&registry).await.unwrap();
        assert!(!Arc::ptr_eq(&session, &fresh));
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(session.pump_exit(), Some(PumpExit::TransportClosed));
    }
}
