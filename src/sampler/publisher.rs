use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

use crate::config::{PublisherConfig, SamplerConfig, DEFAULT_CONTENT_TYPE};
use crate::messaging::{ConnectionManager, TopologyManager};
use crate::sampler::classify;
use crate::sampler::outcome::SampleOutcome;
use crate::sampler::{Sampler, SamplerError};

const TRANSIENT_DELIVERY_MODE: u8 = 1;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes the configured message N times per sample, optionally
/// under a channel transaction. Failures are reported, never retried:
/// a transparent retry could duplicate messages.
pub struct PublisherSampler {
    config: SamplerConfig,
    publisher: PublisherConfig,
    connection: ConnectionManager,
    topology: TopologyManager,
}

impl PublisherSampler {
    pub fn new(config: SamplerConfig, publisher: PublisherConfig) -> Self {
        let connection = ConnectionManager::new(config.endpoint.clone());
        let topology = TopologyManager::new(config.topology.clone());
        Self {
            config,
            publisher,
            connection,
            topology,
        }
    }

    /// One sample: N publishes of an identical payload/properties pair,
    /// then a single commit when transactional.
    pub async fn sample(&mut self) -> SampleOutcome {
        let mut outcome = SampleOutcome::new(&self.config.name);

        let channel = match self.init_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to initialize channel");
                outcome.set_message(e.to_string());
                return outcome;
            }
        };

        let iterations = self.config.iterations();

        // Built once per sample: every iteration shares them.
        let properties = self.build_properties();
        let payload = self.publisher.message.clone().into_bytes();

        outcome.request_body = Some(self.publisher.message.clone());
        outcome.sample_start();

        match self
            .publish_iterations(&channel, iterations, &payload, &properties)
            .await
        {
            Ok(()) => {
                debug!(
                    iterations,
                    exchange = %self.config.topology.exchange.name,
                    routing_key = %self.publisher.message_routing_key,
                    "Publish sample complete"
                );
                outcome.request_headers = Some(self.format_headers());
                outcome.set_ok();
            }
            Err(e) => {
                warn!(error = %e, "Publish failed");
                outcome.fail(classify::RESPONSE_CODE_PUBLISH_FAILED, e.to_string());
            }
        }

        outcome.sample_end();
        outcome
    }

    async fn publish_iterations(
        &self,
        channel: &Channel,
        iterations: u32,
        payload: &[u8],
        properties: &BasicProperties,
    ) -> Result<(), lapin::Error> {
        // Blank exchange means the default exchange: the routing key
        // addresses the queue directly.
        let exchange = &self.config.topology.exchange.name;

        for _ in 0..iterations {
            channel
                .basic_publish(
                    exchange,
                    &self.publisher.message_routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties.clone(),
                )
                .await?
                .await?;
        }

        if self.publisher.use_tx {
            channel.tx_commit().await?;
        }

        Ok(())
    }

    async fn init_channel(&mut self) -> Result<Channel, SamplerError> {
        let ready = self.connection.ensure_channel(&self.topology).await?;

        // Transaction selection rides channel initialization, not samples.
        if ready.fresh && self.publisher.use_tx {
            ready.channel.tx_select().await?;
        }

        Ok(ready.channel)
    }

    fn build_properties(&self) -> BasicProperties {
        let config = &self.publisher;

        let delivery_mode = if config.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let content_type = if config.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE
        } else {
            &config.content_type
        };

        let mut properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_content_encoding(config.content_encoding.as_str().into())
            .with_delivery_mode(delivery_mode)
            .with_correlation_id(config.correlation_id.as_str().into())
            .with_reply_to(config.reply_to.as_str().into())
            .with_kind(config.message_type.as_str().into())
            .with_priority(config.priority)
            .with_headers(self.prepare_headers());

        if !config.message_id.is_empty() {
            properties = properties.with_message_id(config.message_id.as_str().into());
        }

        if !config.app_id.is_empty() {
            properties = properties.with_app_id(config.app_id.as_str().into());
        }

        if config.timestamp {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            properties = properties.with_timestamp(now);
        }

        properties
    }

    fn prepare_headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();
        for (name, value) in &self.publisher.headers {
            headers.insert(
                name.as_str().into(),
                AMQPValue::LongString(value.as_str().into()),
            );
        }
        headers
    }

    /// Request-header text for the outcome, one `Name: value` per line.
    fn format_headers(&self) -> String {
        let mut text = String::new();
        for (name, value) in &self.publisher.headers {
            text.push_str(name);
            text.push_str(": ");
            text.push_str(value);
            text.push('\n');
        }
        text
    }
}

#[async_trait]
impl Sampler for PublisherSampler {
    fn label(&self) -> &str {
        &self.config.name
    }

    async fn run_sample(&mut self) -> SampleOutcome {
        self.sample().await
    }

    async fn close(&mut self) {
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sampler_with(publisher: PublisherConfig) -> PublisherSampler {
        PublisherSampler::new(SamplerConfig::default(), publisher)
    }

    #[test]
    fn persistent_flag_selects_delivery_mode_two() {
        let sampler = sampler_with(PublisherConfig {
            persistent: true,
            ..Default::default()
        });
        let properties = sampler.build_properties();
        assert_eq!(properties.delivery_mode(), &Some(2));

        let sampler = sampler_with(PublisherConfig::default());
        let properties = sampler.build_properties();
        assert_eq!(properties.delivery_mode(), &Some(1));
    }

    #[test]
    fn blank_content_type_falls_back_to_default() {
        let sampler = sampler_with(PublisherConfig {
            content_type: String::new(),
            ..Default::default()
        });
        let properties = sampler.build_properties();
        assert_eq!(properties.content_type(), &Some("text/plain".into()));
    }

    #[test]
    fn timestamp_only_when_enabled() {
        let sampler = sampler_with(PublisherConfig {
            timestamp: false,
            ..Default::default()
        });
        assert!(sampler.build_properties().timestamp().is_none());

        let sampler = sampler_with(PublisherConfig::default());
        assert!(sampler.build_properties().timestamp().is_some());
    }

    #[test]
    fn message_id_and_app_id_only_when_set() {
        let sampler = sampler_with(PublisherConfig::default());
        let properties = sampler.build_properties();
        assert!(properties.message_id().is_none());
        assert!(properties.app_id().is_none());

        let sampler = sampler_with(PublisherConfig {
            message_id: "m-1".to_string(),
            app_id: "loadgen".to_string(),
            ..Default::default()
        });
        let properties = sampler.build_properties();
        assert_eq!(properties.message_id(), &Some("m-1".into()));
        assert_eq!(properties.app_id(), &Some("loadgen".into()));
    }

    #[test]
    fn user_headers_land_in_properties() {
        let mut headers = BTreeMap::new();
        headers.insert("x-run".to_string(), "42".to_string());
        let sampler = sampler_with(PublisherConfig {
            headers,
            ..Default::default()
        });

        let properties = sampler.build_properties();
        let table = properties.headers().as_ref().unwrap();
        assert_eq!(
            table.inner().get("x-run"),
            Some(&AMQPValue::LongString("42".into()))
        );
    }

    #[test]
    fn header_text_is_name_colon_value_lines() {
        let mut headers = BTreeMap::new();
        headers.insert("a".to_string(), "1".to_string());
        headers.insert("b".to_string(), "2".to_string());
        let sampler = sampler_with(PublisherConfig {
            headers,
            ..Default::default()
        });

        assert_eq!(sampler.format_headers(), "a: 1\nb: 2\n");
    }
}
