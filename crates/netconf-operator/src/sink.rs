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

//! Delivery targets for subscription notifications

use crate::{subscription::SubscriptionStyle, ResourceKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, trace};

pub(crate) const fn default_event_buffer() -> usize {
    1_000
}

#[derive(Debug, strum_macros::Display)]
pub enum SinkError {
    #[strum(to_string = "sink channel is closed")]
    ChannelClosed,

    #[strum(to_string = "serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "kafka")]
    #[strum(to_string = "kafka error: {0}")]
    Kafka(rdkafka::error::KafkaError),

    #[strum(to_string = "unsupported sink: {0}")]
    Unsupported(String),
}

impl std::error::Error for SinkError {}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for SinkError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Kafka(err)
    }
}

#[cfg(feature = "kafka")]
impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Receives the raw notifications of one subscription
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, owner: &ResourceKey, payload: &str) -> Result<(), SinkError>;
}

/// Sink selection of a subscription resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    #[default]
    Event,
    Kafka(KafkaSinkConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaSinkConfig {
    /// Output topic
    pub topic: String,
    /// Key/Value producer configs are defined in librdkafka
    #[serde(default)]
    pub producer_config: HashMap<String, String>,
}

/// Structured record emitted for every notification delivered to an
/// [EventSink]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub owner: ResourceKey,
    pub reason: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Fan-in point of all [EventSink]s. Consumers take events from
/// [EventRecorder::subscribe]; once the buffer is full the oldest event is
/// discarded.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    tx: async_channel::Sender<NotificationEvent>,
    // keeps the channel open while nobody is subscribed
    rx: async_channel::Receiver<NotificationEvent>,
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new(default_event_buffer())
    }
}

impl EventRecorder {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = async_channel::bounded(buffer.max(1));
        Self { tx, rx }
    }

    pub fn subscribe(&self) -> async_channel::Receiver<NotificationEvent> {
        self.rx.clone()
    }

    pub fn sink(&self, style: SubscriptionStyle) -> EventSink {
        EventSink {
            style,
            tx: self.tx.clone(),
        }
    }

    /// Build the sink described by `config` for a subscription of the given
    /// style
    pub fn build(
        &self,
        config: &SinkConfig,
        style: SubscriptionStyle,
    ) -> Result<Arc<dyn Sink>, SinkError> {
        match config {
            SinkConfig::Event => Ok(Arc::new(self.sink(style))),
            #[cfg(feature = "kafka")]
            SinkConfig::Kafka(config) => Ok(Arc::new(crate::kafka::KafkaSink::from_config(
                config.clone(),
            )?)),
            #[cfg(not(feature = "kafka"))]
            SinkConfig::Kafka(config) => Err(SinkError::Unsupported(format!(
                "kafka sink for topic `{}` requires the `kafka` feature",
                config.topic
            ))),
        }
    }
}

/// Turns notifications into [NotificationEvent]s
#[derive(Debug, Clone)]
pub struct EventSink {
    style: SubscriptionStyle,
    tx: async_channel::Sender<NotificationEvent>,
}

impl EventSink {
    pub fn reason(&self, owner: &ResourceKey) -> String {
        match self.style {
            SubscriptionStyle::Stream => format!("NetconfNotification-{owner}"),
            SubscriptionStyle::Established => "NewEstablishSubscriptionNotification".to_string(),
        }
    }
}

#[async_trait]
impl Sink for EventSink {
    fn name(&self) -> &str {
        "event"
    }

    async fn deliver(&self, owner: &ResourceKey, payload: &str) -> Result<(), SinkError> {
        let event = NotificationEvent {
            owner: owner.clone(),
            reason: self.reason(owner),
            payload: payload.to_string(),
            received_at: Utc::now(),
        };
        info!("[{owner}] Notification event {}", event.reason);
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("[{owner}] Notification payload: `{payload}`");
        }
        self.tx
            .force_send(event)
            .map(|_| ())
            .map_err(|_| SinkError::ChannelClosed)
    }
}

/// Forwards `(owner, payload)` pairs to an [async_channel]
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: async_channel::Sender<(ResourceKey, Box<str>)>,
}

impl ChannelSink {
    pub const fn new(tx: async_channel::Sender<(ResourceKey, Box<str>)>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn deliver(&self, owner: &ResourceKey, payload: &str) -> Result<(), SinkError> {
        self.tx
            .send((owner.clone(), payload.into()))
            .await
            .map_err(|_| SinkError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_sink_reasons() {
        let recorder = EventRecorder::new(10);
        let events = recorder.subscribe();
        let owner = ResourceKey::new("lab", "sub1");

        recorder
            .sink(SubscriptionStyle::Stream)
            .deliver(&owner, "<notification/>")
            .await
            .unwrap();
        recorder
            .sink(SubscriptionStyle::Established)
            .deliver(&owner, "<notification/>")
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.reason, "NetconfNotification-lab/sub1");
        assert_eq!(first.owner, owner);
        assert_eq!(first.payload, "<notification/>");
        let second = events.recv().await.unwrap();
        assert_eq!(second.reason, "NewEstablishSubscriptionNotification");
    }

    #[tokio::test]
    async fn test_event_recorder_drops_oldest_when_full() {
        let recorder = EventRecorder::new(1);
        let sink = recorder.sink(SubscriptionStyle::Established);
        let owner = ResourceKey::new("lab", "sub1");
        sink.deliver(&owner, "<first/>").await.unwrap();
        sink.deliver(&owner, "<second/>").await.unwrap();
        let events = recorder.subscribe();
        assert_eq!(events.len(), 1);
        assert_eq!(events.recv().await.unwrap().payload, "<second/>");
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, rx) = async_channel::bounded(1);
        let sink = ChannelSink::new(tx);
        let owner = ResourceKey::new("lab", "sub1");
        sink.deliver(&owner, "<notification/>").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (owner.clone(), "<notification/>".into()));
        drop(rx);
        assert!(matches!(
            sink.deliver(&owner, "<notification/>").await,
            Err(SinkError::ChannelClosed)
        ));
    }

    #[test]
    fn test_sink_config() {
        let config: SinkConfig = serde_yaml_like("type: kafka\ntopic: netconf\n");
        assert_eq!(
            config,
            SinkConfig::Kafka(KafkaSinkConfig {
                topic: "netconf".to_string(),
                producer_config: HashMap::new(),
            })
        );
        assert_eq!(serde_yaml_like::<SinkConfig>("type: event\n"), SinkConfig::Event);
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn test_kafka_without_feature() {
        let recorder = EventRecorder::default();
        let config = SinkConfig::Kafka(KafkaSinkConfig {
            topic: "netconf".to_string(),
            producer_config: HashMap::new(),
        });
        assert!(matches!(
            recorder.build(&config, SubscriptionStyle::Established),
            Err(SinkError::Unsupported(_))
        ));
    }

    fn serde_yaml_like<T: serde::de::DeserializeOwned>(yaml: &str) -> T {
        use figment::{
            providers::{Format, Yaml},
            Figment,
        };
        Figment::new().merge(Yaml::string(yaml)).extract().unwrap()
    }
}
