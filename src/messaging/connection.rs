use lapin::{Channel, Connection, ConnectionProperties};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::EndpointConfig;
use crate::messaging::topology::TopologyManager;

/// A channel ready for sampling. `fresh` is set when the channel was
/// just opened, so callers know to re-run per-channel initialization
/// (QoS, transaction selection) and drop any state tied to the old one.
pub struct ReadyChannel {
    pub channel: Channel,
    pub fresh: bool,
}

/// Owns the one broker connection and one channel a sampler instance is
/// allowed to hold. Both are created lazily and transparently replaced
/// when the peer closes them; every fresh channel is run through
/// topology provisioning before it is handed out.
pub struct ConnectionManager {
    endpoint: EndpointConfig,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl ConnectionManager {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            connection: None,
            channel: None,
        }
    }

    /// Idempotent, safe to call on every sample. Returns the current
    /// channel, reconnecting and re-provisioning topology if either the
    /// connection or the channel reports closed.
    pub async fn ensure_channel(
        &mut self,
        topology: &TopologyManager,
    ) -> Result<ReadyChannel, ConnectionError> {
        if let Some(channel) = &self.channel {
            if channel.status().connected() {
                return Ok(ReadyChannel {
                    channel: channel.clone(),
                    fresh: false,
                });
            }
            warn!(
                channel_id = channel.id(),
                "Channel closed unexpectedly, reopening"
            );
            self.channel = None;
        }

        let connection = self.ensure_connection().await?;

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create channel");
            ConnectionError::ChannelFailed(e.to_string())
        })?;

        info!(channel_id = channel.id(), "Channel created");

        // Best-effort: declare failures are logged inside and surface
        // later as publish/consume failures with their own codes.
        topology.provision(&channel, connection).await;

        self.channel = Some(channel.clone());
        Ok(ReadyChannel {
            channel,
            fresh: true,
        })
    }

    /// The live connection, reconnecting across the configured host
    /// list if there is none or it reports closed.
    async fn ensure_connection(&mut self) -> Result<&Connection, ConnectionError> {
        let connected = self
            .connection
            .as_ref()
            .is_some_and(|c| c.status().connected());

        if !connected {
            self.connection = Some(self.open_connection().await?);
        }

        Ok(self.connection.as_ref().unwrap())
    }

    /// Attempt every configured host in order; first success wins. Each
    /// attempt is bounded by the configured connect timeout.
    async fn open_connection(&self) -> Result<Connection, ConnectionError> {
        let hosts = self.endpoint.hosts();
        if hosts.is_empty() {
            return Err(ConnectionError::NoHostsConfigured);
        }

        let mut last_error = ConnectionError::NoHostsConfigured;

        for host in hosts {
            info!(
                host,
                port = self.endpoint.port,
                virtual_host = %self.endpoint.virtual_host,
                heartbeat_secs = self.endpoint.heartbeat(),
                "Connecting to broker"
            );

            let uri = self.endpoint.amqp_uri(host);
            let attempt = Connection::connect(&uri, ConnectionProperties::default());

            match timeout(self.endpoint.connect_timeout(), attempt).await {
                Ok(Ok(connection)) => {
                    info!(host, "Connected to broker");
                    return Ok(connection);
                }
                Ok(Err(e)) => {
                    warn!(error = %e, host, "Broker connect failed");
                    last_error = ConnectionError::ConnectFailed(e.to_string());
                }
                Err(_) => {
                    warn!(
                        host,
                        timeout_ms = self.endpoint.connect_timeout().as_millis() as u64,
                        "Broker connect timed out"
                    );
                    last_error = ConnectionError::ConnectTimeout(host.to_string());
                }
            }
        }

        Err(last_error)
    }

    /// Drop the channel so the next `ensure_channel` starts fresh.
    pub fn reset_channel(&mut self) {
        self.channel = None;
    }

    /// Graceful teardown at end of test. Close failures are logged and
    /// swallowed so shutdown never masks the run's results.
    pub async fn close(&mut self) {
        self.channel = None;

        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(e) = connection.close(200, "Normal shutdown").await {
                    error!(error = %e, "Failed to close connection gracefully");
                } else {
                    info!("Connection closed");
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No broker hosts configured")]
    NoHostsConfigured,

    #[error("Failed to connect to broker: {0}")]
    ConnectFailed(String),

    #[error("Timed out connecting to broker host {0}")]
    ConnectTimeout(String),

    #[error("Failed to create channel: {0}")]
    ChannelFailed(String),
}
