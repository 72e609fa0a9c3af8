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

//! Kafka delivery of notifications as JSON records

use crate::{
    sink::{KafkaSinkConfig, Sink, SinkError},
    ResourceKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::{
    config::{ClientConfig, FromClientConfigAndContext},
    error::{KafkaError, RDKafkaErrorCode},
    message::DeliveryResult,
    producer::{BaseRecord, NoCustomPartitioner, Producer, ProducerContext, ThreadedProducer},
    ClientContext,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_POLLING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct LoggingProducerContext;

impl ClientContext for LoggingProducerContext {}

impl ProducerContext<NoCustomPartitioner> for LoggingProducerContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(_) => {
                debug!("Notification delivered successfully to kafka");
            }
            Err((err, _)) => {
                warn!("Failed to deliver notification to kafka: {err}");
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct KafkaRecord<'a> {
    owner: &'a ResourceKey,
    payload: &'a str,
    received_at: DateTime<Utc>,
}

pub struct KafkaSink {
    config: KafkaSinkConfig,
    producer: ThreadedProducer<LoggingProducerContext>,
}

impl KafkaSink {
    pub fn from_config(config: KafkaSinkConfig) -> Result<Self, SinkError> {
        let mut producer_config = ClientConfig::new();
        for (k, v) in &config.producer_config {
            producer_config.set(k.as_str(), v.as_str());
        }
        let producer =
            match ThreadedProducer::from_config_and_context(&producer_config, LoggingProducerContext)
            {
                Ok(p) => p,
                Err(err) => {
                    error!("Failed to create Kafka producer: {err}");
                    Err(err)?
                }
            };
        info!("Starting Kafka notification sink to topic: `{}`", config.topic);
        Ok(Self { config, producer })
    }

    fn encode(owner: &ResourceKey, payload: &str) -> Result<Vec<u8>, SinkError> {
        let record = KafkaRecord {
            owner,
            payload,
            received_at: Utc::now(),
        };
        Ok(serde_json::to_vec(&record)?)
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn deliver(&self, owner: &ResourceKey, payload: &str) -> Result<(), SinkError> {
        let encoded = Self::encode(owner, payload)?;
        let key = owner.to_string();
        let mut record: BaseRecord<'_, String, Vec<u8>> = BaseRecord::to(self.config.topic.as_str())
            .key(&key)
            .payload(&encoded);
        let mut polling_interval = Duration::from_micros(10);
        loop {
            match self.producer.send(record) {
                Ok(_) => return Ok(()),
                Err((err, rec)) => match err {
                    KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => {
                        // Exponential backoff when the librdkafka is full
                        if polling_interval > MAX_POLLING_INTERVAL {
                            error!("[{owner}] Kafka polling interval exceeded, dropping record");
                            return Err(SinkError::Kafka(err));
                        }
                        debug!("[{owner}] Kafka message queue is full, sleeping for {polling_interval:?}");
                        tokio::time::sleep(polling_interval).await;
                        polling_interval *= 2;
                        record = rec;
                    }
                    err => {
                        error!("[{owner}] Error sending notification to Kafka: {err}");
                        return Err(SinkError::Kafka(err));
                    }
                },
            }
        }
    }
}

impl Drop for KafkaSink {
    fn drop(&mut self) {
        if let Err(err) = self.producer.flush(Duration::from_millis(1000)) {
            error!("Failed to flush notifications before shutting down: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_record() {
        let owner = ResourceKey::new("lab", "sub1");
        let encoded = KafkaSink::encode(&owner, "<notification/>").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["owner"]["namespace"], "lab");
        assert_eq!(value["owner"]["name"], "sub1");
        assert_eq!(value["payload"], "<notification/>");
        assert!(value["received_at"].is_string());
    }
}
