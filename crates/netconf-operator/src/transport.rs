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

//! Transport seam between the orchestration engine and the wire.
//!
//! [Transport] is what a session needs from a NETCONF connection: the hello
//! exchange, synchronous RPC calls, a stream of unsolicited frames, and
//! close. [FramedTransport] implements it on top of any bidirectional byte
//! stream using [FrameCodec]; the SSH flavour lives in [crate::ssh].

use crate::{
    capabilities::Capabilities,
    codec::{FrameCodec, FrameCodecError, Framing},
    message::{self, Hello, XmlError},
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretBox;
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

/// Default NETCONF over SSH port as per RFC 6242
pub const DEFAULT_NETCONF_PORT: u16 = 830;

const FIRST_MESSAGE_ID: u64 = 101;

pub(crate) const fn default_inbound_buffer() -> usize {
    1_000
}

/// Remote NETCONF server address, `host[:port]` with port 830 by default
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: Box<str>,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<Box<str>>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum EndpointError {
    #[strum(to_string = "endpoint host is empty in `{0}`")]
    EmptyHost(String),

    #[strum(to_string = "invalid port in endpoint `{0}`")]
    InvalidPort(String),
}

impl std::error::Error for EndpointError {}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse_port =
            |port: &str| u16::from_str(port).map_err(|_| EndpointError::InvalidPort(s.to_string()));
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // bracketed IPv6 literal, optionally followed by `:port`
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| EndpointError::InvalidPort(s.to_string()))?;
            match rest.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None if rest.is_empty() => (host, DEFAULT_NETCONF_PORT),
                None => return Err(EndpointError::InvalidPort(s.to_string())),
            }
        } else {
            match s.split_once(':') {
                // more than one colon without brackets is a bare IPv6 address
                Some((_, rest)) if rest.contains(':') => (s, DEFAULT_NETCONF_PORT),
                Some((host, port)) => (host, parse_port(port)?),
                None => (s, DEFAULT_NETCONF_PORT),
            }
        };
        if host.is_empty() {
            return Err(EndpointError::EmptyHost(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// SSH credentials used to authenticate against the NETCONF server
#[derive(Debug)]
pub enum Credentials {
    /// Username/Password authentication
    Password {
        username: String,
        password: SecretBox<String>,
    },
    /// Username/Private key authentication, the key is loaded at dial time
    PrivateKey {
        username: String,
        path: PathBuf,
        passphrase: Option<SecretBox<String>>,
    },
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: SecretBox::new(Box::new(password.into())),
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Password { username, .. } => username,
            Self::PrivateKey { username, .. } => username,
        }
    }
}

/// Outcome of the `<hello>` exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloInfo {
    pub session_id: u32,
    pub capabilities: Capabilities,
}

#[derive(Debug, strum_macros::Display)]
pub enum TransportError {
    #[strum(to_string = "std::io::Error: `{0}`")]
    IO(std::io::Error),

    #[strum(to_string = "framing error: {0}")]
    Codec(FrameCodecError),

    #[strum(to_string = "SSH error: {0}")]
    Ssh(russh::Error),

    #[strum(to_string = "authentication failed for user `{0}`")]
    AuthenticationFailed(String),

    #[strum(to_string = "unable to load private key `{path}`: {reason}")]
    InvalidKey { path: String, reason: String },

    #[strum(to_string = "invalid UTF-8 in received frame: {0}")]
    Utf8(std::str::Utf8Error),

    #[strum(to_string = "invalid <hello> received from the peer: {0}")]
    InvalidHello(XmlError),

    #[strum(to_string = "session ID is not defined in the <hello> message received from the server")]
    SessionIdIsNotDefined,

    #[strum(to_string = "<hello> exchange did not happen yet")]
    HelloNotExchanged,

    #[strum(to_string = "<hello> was already exchanged on this transport")]
    HelloAlreadyExchanged,

    #[strum(to_string = "no response within {0:?}")]
    Timeout(Duration),

    #[strum(to_string = "transport is closed")]
    Closed,
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IO(err)
    }
}

impl From<FrameCodecError> for TransportError {
    fn from(err: FrameCodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err)
    }
}

impl From<std::str::Utf8Error> for TransportError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::Utf8(err)
    }
}

impl From<XmlError> for TransportError {
    fn from(err: XmlError) -> Self {
        Self::InvalidHello(err)
    }
}

/// A connected NETCONF transport.
///
/// `sync_call` and `receive_frame` are used concurrently: the caller of
/// `sync_call` gets the reply matching its request, every other frame is
/// handed out by `receive_frame`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Exchange `<hello>` messages announcing the given capabilities
    async fn send_hello(&self, capabilities: &Capabilities) -> Result<HelloInfo, TransportError>;

    /// Send an operation wrapped in an `<rpc>` and wait for its raw reply
    async fn sync_call(&self, payload: &str, timeout: Duration) -> Result<Box<str>, TransportError>;

    /// Next frame not consumed by a `sync_call`. Blocks until a frame
    /// arrives, and fails with [TransportError::Closed] once the transport
    /// is closed.
    async fn receive_frame(&self) -> Result<Box<str>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens transports to NETCONF servers
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the endpoint, `None` or a zero timeout waits indefinitely
    async fn dial(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

type PendingReplies = Arc<Mutex<HashMap<Box<str>, oneshot::Sender<Box<str>>>>>;

/// [Transport] over a pair of async byte streams.
///
/// After the hello exchange a reader task owns the read half: replies are
/// matched by `message-id` against in-flight calls, anything else is queued
/// for [Transport::receive_frame].
pub struct FramedTransport<R, W> {
    peer: Box<str>,
    writer: Mutex<FramedWrite<W, FrameCodec>>,
    reader: Mutex<Option<FramedRead<R, FrameCodec>>>,
    inbound: Mutex<Option<mpsc::Receiver<Box<str>>>>,
    inbound_buffer: usize,
    pending: PendingReplies,
    next_message_id: AtomicU64,
    closed: CancellationToken,
    writer_closed: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> FramedTransport<tokio::io::ReadHalf<T>, tokio::io::WriteHalf<T>>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn from_stream(peer: impl Into<Box<str>>, stream: T) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self::new(peer, read, write)
    }
}

impl<R, W> FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(peer: impl Into<Box<str>>, read: R, write: W) -> Self {
        Self {
            peer: peer.into(),
            writer: Mutex::new(FramedWrite::new(write, FrameCodec::new())),
            reader: Mutex::new(Some(FramedRead::new(read, FrameCodec::new()))),
            inbound: Mutex::new(None),
            inbound_buffer: default_inbound_buffer(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_message_id: AtomicU64::new(FIRST_MESSAGE_ID),
            closed: CancellationToken::new(),
            writer_closed: AtomicBool::new(false),
            reader_task: Mutex::new(None),
        }
    }

    pub fn with_inbound_buffer(mut self, inbound_buffer: usize) -> Self {
        self.inbound_buffer = inbound_buffer.max(1);
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn send_rpc(&self, message_id: &str, payload: &str) -> Result<(), TransportError> {
        let rpc = message::rpc_xml(message_id, payload);
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("[{}] Sending RPC with message id `{message_id}`: `{rpc}`", self.peer);
        }
        let mut writer = self.writer.lock().await;
        writer.send(rpc).await?;
        Ok(())
    }
}

async fn read_loop<R>(
    peer: Box<str>,
    mut reader: FramedRead<R, FrameCodec>,
    pending: PendingReplies,
    inbound_tx: mpsc::Sender<Box<str>>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                debug!("[{peer}] Transport closed, stopping reader");
                break;
            }
            next = reader.next() => next,
        };
        let frame = match next {
            None => {
                info!("[{peer}] Peer closed the NETCONF stream");
                break;
            }
            Some(Err(err)) => {
                warn!("[{peer}] Error reading from the NETCONF stream: {err}");
                break;
            }
            Some(Ok(frame)) => frame,
        };
        let raw: Box<str> = match std::str::from_utf8(&frame) {
            Ok(raw) => raw.into(),
            Err(err) => {
                warn!("[{peer}] Dropping frame with invalid UTF-8: {err}");
                continue;
            }
        };
        if let Ok(Some(message_id)) = message::reply_message_id(&raw) {
            let waiter = pending.lock().await.remove(&message_id);
            if let Some(waiter) = waiter {
                if waiter.send(raw).is_err() {
                    debug!("[{peer}] Caller for message id `{message_id}` is gone");
                }
                continue;
            }
        }
        match inbound_tx.try_send(raw) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[{peer}] Inbound frame queue is full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("[{peer}] No consumer for inbound frames, dropping frame");
            }
        }
    }
    closed.cancel();
    // Dropping the waiters wakes up every in-flight call with `Closed`
    pending.lock().await.clear();
}

#[async_trait]
impl<R, W> Transport for FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_hello(&self, capabilities: &Capabilities) -> Result<HelloInfo, TransportError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(TransportError::HelloAlreadyExchanged)?;
        let mut writer = self.writer.lock().await;
        writer.send(message::hello_xml(capabilities)).await?;
        let frame = reader.next().await.ok_or(TransportError::Closed)??;
        let hello = Hello::parse(std::str::from_utf8(&frame)?)?;
        let session_id = hello
            .session_id()
            .ok_or(TransportError::SessionIdIsNotDefined)?;
        if capabilities.supports_chunked_framing() && hello.capabilities().supports_chunked_framing()
        {
            writer.encoder_mut().set_framing(Framing::Chunked);
            reader.decoder_mut().set_framing(Framing::Chunked);
        }
        debug!(
            "[{}] Hello exchanged, session id {session_id}, using {} framing",
            self.peer,
            writer.encoder().framing()
        );
        drop(writer);

        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_buffer);
        *self.inbound.lock().await = Some(inbound_rx);
        let task = tokio::spawn(read_loop(
            self.peer.clone(),
            reader,
            Arc::clone(&self.pending),
            inbound_tx,
            self.closed.clone(),
        ));
        *self.reader_task.lock().await = Some(task);
        Ok(HelloInfo {
            session_id,
            capabilities: hello.capabilities().clone(),
        })
    }

    async fn sync_call(&self, payload: &str, timeout: Duration) -> Result<Box<str>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.inbound.lock().await.is_none() {
            return Err(TransportError::HelloNotExchanged);
        }
        let message_id = self
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
            .into_boxed_str();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(message_id.clone(), tx);
        if self.closed.is_cancelled() {
            self.pending.lock().await.remove(&message_id);
            return Err(TransportError::Closed);
        }

        let call = async {
            self.send_rpc(&message_id, payload).await?;
            rx.await.map_err(|_| TransportError::Closed)
        };
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        if result.is_err() {
            self.pending.lock().await.remove(&message_id);
        }
        result
    }

    async fn receive_frame(&self) -> Result<Box<str>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        let inbound = inbound.as_mut().ok_or(TransportError::HelloNotExchanged)?;
        inbound.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        let result = if self.writer_closed.swap(true, Ordering::AcqRel) {
            Ok(())
        } else {
            let mut writer = self.writer.lock().await;
            SinkExt::<String>::close(&mut *writer).await
        };
        let task = self.reader_task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("[{}] Reader task terminated abnormally: {err}", self.peer);
            }
        }
        self.pending.lock().await.clear();
        debug!("[{}] Transport closed", self.peer);
        result.map_err(TransportError::from)
    }
}
