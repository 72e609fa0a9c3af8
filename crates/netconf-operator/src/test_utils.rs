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

//! Scripted transports, dialers and sinks shared by the unit tests

use crate::{
    capabilities::Capabilities,
    sink::{Sink, SinkError},
    transport::{Credentials, Dialer, Endpoint, HelloInfo, Transport, TransportError},
    ResourceKey,
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

pub type Responder = Arc<dyn Fn(&str) -> Result<String, TransportError> + Send + Sync>;

pub fn ok_reply() -> String {
    r#"<rpc-reply xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" message-id="101"><ok/></rpc-reply>"#
        .to_string()
}

pub fn data_reply(data: &str) -> String {
    format!(
        r#"<rpc-reply xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" message-id="101"><data>{data}</data></rpc-reply>"#
    )
}

pub fn error_reply(tag: &str, message: &str) -> String {
    format!(
        r#"<rpc-reply xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" message-id="101"><rpc-error><error-type>protocol</error-type><error-tag>{tag}</error-tag><error-severity>error</error-severity><error-message>{message}</error-message></rpc-error></rpc-reply>"#
    )
}

pub fn subscription_reply(id: &str) -> String {
    format!(
        r#"<rpc-reply xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" message-id="101"><subscription-result xmlns="urn:ietf:params:xml:ns:yang:ietf-event-notifications">ok</subscription-result><subscription-id xmlns="urn:ietf:params:xml:ns:yang:ietf-event-notifications">{id}</subscription-id></rpc-reply>"#
    )
}

pub fn notification_frame(subscription_id: Option<&str>) -> String {
    let id = subscription_id
        .map(|id| format!("<subscription-id>{id}</subscription-id>"))
        .unwrap_or_default();
    format!(
        r#"<notification xmlns="urn:ietf:params:xml:ns:netconf:notification:1.0"><eventTime>2025-01-01T00:00:00Z</eventTime><push-update xmlns="urn:ietf:params:xml:ns:yang:ietf-yang-push">{id}<datastore-contents-xml/></push-update></notification>"#
    )
}

/// Responder answering `<ok/>` to everything
pub fn always_ok() -> Responder {
    Arc::new(|_| Ok(ok_reply()))
}

/// In-memory [Transport] answering calls through a [Responder]
pub struct MockTransport {
    responder: Responder,
    session_id: u32,
    fail_hello: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Box<str>>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<str>>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_responder(always_ok())
    }

    pub fn with_responder(responder: Responder) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            responder,
            session_id: 1,
            fail_hello: false,
            delay: None,
            calls: Mutex::new(vec![]),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn with_session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_failing_hello(mut self) -> Self {
        self.fail_hello = true;
        self
    }

    /// Delay every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_frame(&self, frame: &str) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame.into());
        }
    }

    /// Simulate the peer going away
    pub fn close_inbound(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_hello(&self, _capabilities: &Capabilities) -> Result<HelloInfo, TransportError> {
        if self.fail_hello {
            return Err(TransportError::SessionIdIsNotDefined);
        }
        Ok(HelloInfo {
            session_id: self.session_id,
            capabilities: Capabilities::client::<&str>(&[]),
        })
    }

    async fn sync_call(&self, payload: &str, timeout: Duration) -> Result<Box<str>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.calls.lock().unwrap().push(payload.to_string());
        if let Some(delay) = self.delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }
        (self.responder)(payload).map(Into::into)
    }

    async fn receive_frame(&self) -> Result<Box<str>, TransportError> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.close_inbound();
        Ok(())
    }
}

/// [Dialer] creating a fresh [MockTransport] per dial
pub struct MockDialer {
    responder: Responder,
    delay: Option<Duration>,
    failures: Mutex<VecDeque<TransportError>>,
    fail_hello: AtomicBool,
    dialed: Mutex<Vec<Arc<MockTransport>>>,
    next_session_id: AtomicUsize,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::with_responder(always_ok())
    }

    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder,
            delay: None,
            failures: Mutex::new(VecDeque::new()),
            fail_hello: AtomicBool::new(false),
            dialed: Mutex::new(vec![]),
            next_session_id: AtomicUsize::new(1),
        }
    }

    /// Delay every dial
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next_dial(&self, err: TransportError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn fail_hello(&self, fail: bool) {
        self.fail_hello.store(fail, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dialed.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.dialed.lock().unwrap()[index].clone()
    }

    pub fn last_transport(&self) -> Arc<MockTransport> {
        self.dialed
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("at least one dial")
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        _endpoint: &Endpoint,
        _credentials: &Credentials,
        _timeout: Option<Duration>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) as u32;
        let mut transport =
            MockTransport::with_responder(self.responder.clone()).with_session_id(session_id);
        if self.fail_hello.load(Ordering::SeqCst) {
            transport = transport.with_failing_hello();
        }
        let transport = Arc::new(transport);
        self.dialed.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// [Sink] keeping every delivered notification in memory
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<(ResourceKey, String)>>,
    notify: Notify,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn deliveries(&self) -> Vec<(ResourceKey, String)> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Wait until at least `count` delivery attempts were made
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.deliveries.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, owner: &ResourceKey, payload: &str) -> Result<(), SinkError> {
        self.deliveries
            .lock()
            .unwrap()
            .push((owner.clone(), payload.to_string()));
        self.notify.notify_waiters();
        if self.failing.load(Ordering::SeqCst) {
            Err(SinkError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}
