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

//! NETCONF over SSH dialer built on `russh`

use crate::{
    capabilities::Capabilities,
    transport::{
        Credentials, Dialer, Endpoint, FramedTransport, HelloInfo, Transport, TransportError,
    },
};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

type ChannelStream = russh::ChannelStream<russh::client::Msg>;

/// SSH client handler to enable certain behaviors in the russh::client
/// at the moment, this is simple implementation that accepts connections to all
/// servers.
///
/// TODO: check host keys against a configured known hosts file
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct SshHandler {}

impl russh::client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Don't check the server public key
        Ok(true)
    }
}

/// Dials NETCONF servers over SSH and requests the `netconf` subsystem
#[derive(Clone)]
pub struct SshDialer {
    config: Arc<russh::client::Config>,
    inbound_buffer: usize,
}

impl SshDialer {
    pub fn new(config: Arc<russh::client::Config>) -> Self {
        Self {
            config,
            inbound_buffer: crate::transport::default_inbound_buffer(),
        }
    }

    pub fn with_inbound_buffer(mut self, inbound_buffer: usize) -> Self {
        self.inbound_buffer = inbound_buffer;
        self
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<SshTransport, TransportError> {
        let peer = endpoint.to_string();
        debug!("[{peer}] Initiating TCP connection");
        let mut session = russh::client::connect(
            Arc::clone(&self.config),
            (endpoint.host(), endpoint.port()),
            SshHandler::default(),
        )
        .await?;
        debug!("[{peer}] TCP connected");

        let auth_result = match credentials {
            Credentials::Password { username, password } => {
                debug!("[{peer}] Using password authentication for user `{username}`");
                session
                    .authenticate_password(username.as_str(), password.expose_secret().as_str())
                    .await?
            }
            Credentials::PrivateKey {
                username,
                path,
                passphrase,
            } => {
                debug!("[{peer}] Using private key authentication for user `{username}`");
                let private_key = russh::keys::load_secret_key(
                    path,
                    passphrase.as_ref().map(|p| p.expose_secret().as_str()),
                )
                .map_err(|err| TransportError::InvalidKey {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })?;
                let private_key = russh::keys::PrivateKeyWithHashAlg::new(
                    Arc::new(private_key),
                    session.best_supported_rsa_hash().await?.flatten(),
                );
                debug!(
                    "[{peer}] Negotiated private key and using `{}` hashing algorithm",
                    private_key.algorithm()
                );
                session
                    .authenticate_publickey(username.as_str(), private_key)
                    .await?
            }
        };
        if !auth_result.success() {
            error!("[{peer}] Authentication failed");
            return Err(TransportError::AuthenticationFailed(
                credentials.username().to_string(),
            ));
        }
        debug!(
            "[{peer}] Authentication successful to `{}@{peer}`, requesting the NETCONF subsystem",
            credentials.username()
        );
        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, "netconf").await?;
        info!(
            "[{peer}] NETCONF subsystem connected to `{}@{peer}`",
            credentials.username()
        );
        let inner = FramedTransport::from_stream(peer, channel.into_stream())
            .with_inbound_buffer(self.inbound_buffer);
        Ok(SshTransport {
            inner,
            session: tokio::sync::Mutex::new(session),
        })
    }
}

impl Default for SshDialer {
    fn default() -> Self {
        let config = russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..<_>::default()
        };
        Self::new(Arc::new(config))
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = match timeout.filter(|timeout| !timeout.is_zero()) {
            Some(timeout) => tokio::time::timeout(timeout, self.connect(endpoint, credentials))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??,
            None => self.connect(endpoint, credentials).await?,
        };
        Ok(Arc::new(transport))
    }
}

/// Framed NETCONF transport over an SSH channel, keeps the SSH session
/// alive for as long as the transport exists.
pub struct SshTransport {
    inner: FramedTransport<tokio::io::ReadHalf<ChannelStream>, tokio::io::WriteHalf<ChannelStream>>,
    session: tokio::sync::Mutex<russh::client::Handle<SshHandler>>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn send_hello(&self, capabilities: &Capabilities) -> Result<HelloInfo, TransportError> {
        self.inner.send_hello(capabilities).await
    }

    async fn sync_call(&self, payload: &str, timeout: Duration) -> Result<Box<str>, TransportError> {
        self.inner.sync_call(payload, timeout).await
    }

    async fn receive_frame(&self) -> Result<Box<str>, TransportError> {
        self.inner.receive_frame().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.inner.close().await;
        if let Err(err) = self
            .session
            .lock()
            .await
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("[{}] Error disconnecting SSH session: {err}", self.inner.peer());
        }
        result
    }
}
