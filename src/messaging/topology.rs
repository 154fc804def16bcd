use lapin::options::{
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ExchangeKind};
use tracing::{debug, info, warn};

use crate::config::{QueueSpec, TopologySpec};

/// Declares the sampler's exchange/queue pair on a fresh channel and
/// binds them. Provisioning is best-effort: a missing entity surfaces
/// later as a publish/consume failure with its own response code.
pub struct TopologyManager {
    spec: TopologySpec,
}

impl TopologyManager {
    pub fn new(spec: TopologySpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &TopologySpec {
        &self.spec
    }

    /// Called once per fresh channel. Never propagates broker errors.
    pub async fn provision(&self, channel: &Channel, connection: &Connection) {
        if let Err(e) = self.try_provision(channel, connection).await {
            warn!(error = %e, "Topology provisioning failed, operations on this channel may fail");
        }
    }

    async fn try_provision(
        &self,
        channel: &Channel,
        connection: &Connection,
    ) -> Result<(), lapin::Error> {
        // Queue before exchange: bind requires both to exist.
        let queue_configured = self.configure_queue(channel, connection).await?;

        let exchange = &self.spec.exchange;
        if !exchange.name.is_empty() {
            if exchange.redeclare {
                self.delete_exchange(connection).await;
            }

            channel
                .exchange_declare(
                    &exchange.name,
                    exchange_kind(&exchange.kind),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        auto_delete: exchange.auto_delete,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            if queue_configured {
                channel
                    .queue_bind(
                        &self.spec.queue.name,
                        &exchange.name,
                        &self.spec.routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        debug!(
            queue = %self.spec.queue.name,
            exchange = %self.spec.exchange.name,
            routing_key = %self.spec.routing_key,
            "Topology provisioned"
        );

        Ok(())
    }

    /// Declares the queue unless its name is blank (publish-only,
    /// fire-and-forget topology). Returns whether a queue was declared.
    async fn configure_queue(
        &self,
        channel: &Channel,
        connection: &Connection,
    ) -> Result<bool, lapin::Error> {
        let queue = &self.spec.queue;
        if queue.name.is_empty() {
            return Ok(false);
        }

        if queue.redeclare {
            self.delete_queue(connection).await;
        }

        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                queue_arguments(queue),
            )
            .await?;

        Ok(true)
    }

    /// Delete on a disposable channel: a failed broker operation closes
    /// the channel it ran on, and the long-lived channel must survive.
    async fn delete_queue(&self, connection: &Connection) {
        let name = &self.spec.queue.name;
        info!(queue = %name, "Deleting queue before redeclare");

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Could not open disposable channel for queue delete");
                return;
            }
        };

        if let Err(e) = channel.queue_delete(name, QueueDeleteOptions::default()).await {
            debug!(error = %e, queue = %name, "Queue delete failed, ignoring");
        }

        close_disposable(channel).await;
    }

    async fn delete_exchange(&self, connection: &Connection) {
        let name = &self.spec.exchange.name;
        info!(exchange = %name, "Deleting exchange before redeclare");

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Could not open disposable channel for exchange delete");
                return;
            }
        };

        if let Err(e) = channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
        {
            debug!(error = %e, exchange = %name, "Exchange delete failed, ignoring");
        }

        close_disposable(channel).await;
    }
}

async fn close_disposable(channel: Channel) {
    if channel.status().connected() {
        if let Err(e) = channel.close(200, "Redeclare helper done").await {
            debug!(error = %e, "Failed to close disposable channel");
        }
    }
}

pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        "fanout" => ExchangeKind::Fanout,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Queue arguments from the queue settings; unset options are omitted
/// entirely so the broker applies its own defaults.
pub fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();

    if let Some(ttl) = queue.message_ttl_ms {
        arguments.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl as i32));
    }

    if let Some(expires) = queue.expires_ms {
        arguments.insert("x-expires".into(), AMQPValue::LongInt(expires as i32));
    }

    if let Some(max_priority) = queue.max_priority {
        arguments.insert(
            "x-max-priority".into(),
            AMQPValue::LongInt(max_priority as i32),
        );
    }

    if let Some(dlx) = &queue.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.clone().into()),
        );
    }

    if let Some(dlrk) = &queue.dead_letter_routing_key {
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlrk.clone().into()),
        );
    }

    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_yields_empty_arguments() {
        let args = queue_arguments(&QueueSpec::default());
        assert!(args.inner().is_empty());
    }

    #[test]
    fn set_options_land_in_arguments() {
        let queue = QueueSpec {
            message_ttl_ms: Some(30_000),
            expires_ms: Some(60_000),
            max_priority: Some(9),
            dead_letter_exchange: Some("dead".to_string()),
            dead_letter_routing_key: Some("dead-key".to_string()),
            ..Default::default()
        };

        let args = queue_arguments(&queue);
        assert_eq!(
            args.inner().get("x-message-ttl"),
            Some(&AMQPValue::LongInt(30_000))
        );
        assert_eq!(
            args.inner().get("x-expires"),
            Some(&AMQPValue::LongInt(60_000))
        );
        assert_eq!(
            args.inner().get("x-max-priority"),
            Some(&AMQPValue::LongInt(9))
        );
        assert_eq!(
            args.inner().get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("dead".into()))
        );
        assert_eq!(
            args.inner().get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("dead-key".into()))
        );
    }

    #[test]
    fn unset_options_are_omitted() {
        let queue = QueueSpec {
            message_ttl_ms: Some(1000),
            ..Default::default()
        };

        let args = queue_arguments(&queue);
        assert!(args.inner().get("x-expires").is_none());
        assert!(args.inner().get("x-max-priority").is_none());
        assert!(args.inner().get("x-dead-letter-exchange").is_none());
    }

    #[test]
    fn exchange_kind_mapping() {
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("headers"), ExchangeKind::Headers));
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind("x-custom"), ExchangeKind::Custom(_)));
    }
}
