//! ---
//! pvsim_section: "02-messaging"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Frame codec and broker transports."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use pvsim_common::BrokerConfig;
use tracing::{debug, info, warn};

use crate::transport::{Delivery, Transport};
use crate::{Result, TransportError};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ-compatible transport over a single channel.
///
/// The queue is declared durable, publishes are persistent and confirmed, and
/// consumption uses prefetch 1 with manual acknowledgement.
pub struct AmqpTransport {
    broker: BrokerConfig,
    consumer_tag: String,
    connection: Option<Connection>,
    channel: Option<Channel>,
    consumer: Option<Consumer>,
}

impl AmqpTransport {
    /// Create a disconnected transport for `broker`.
    pub fn new(broker: BrokerConfig, consumer_tag: impl Into<String>) -> Self {
        Self {
            broker,
            consumer_tag: consumer_tag.into(),
            connection: None,
            channel: None,
            consumer: None,
        }
    }

    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.broker.username.clone(),
                    password: self.broker.password.clone(),
                },
                host: self.broker.host.clone(),
                port: self.broker.port,
            },
            vhost: self.broker.vhost.clone(),
            ..AMQPUri::default()
        }
    }

    fn live_channel(&self) -> Result<&Channel> {
        match &self.channel {
            Some(channel) if channel.status().connected() => Ok(channel),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn teardown(&mut self) {
        self.consumer = None;
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(err) = channel.close(REPLY_SUCCESS, "OK").await {
                    debug!(error = %err, "channel close failed");
                }
            }
        }
        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(err) = connection.close(REPLY_SUCCESS, "OK").await {
                    debug!(error = %err, "connection close failed");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&mut self) -> Result<()> {
        self.teardown().await;
        info!(broker = %self.broker.endpoint(), "connecting to broker");

        let connection = Connection::connect_uri(self.uri(), ConnectionProperties::default())
            .await
            .map_err(|err| {
                TransportError::Connection(format!("{}: {}", self.broker.endpoint(), err))
            })?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                &self.broker.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        self.connection = Some(connection);
        self.channel = Some(channel);
        info!(queue = %self.broker.queue, "broker channel ready");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.live_channel().is_ok()
    }

    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        let channel = self.live_channel()?;
        let confirm = channel
            .basic_publish(
                "",
                &self.broker.queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;
        if confirm.is_nack() {
            warn!(queue = %self.broker.queue, "publish nacked by broker");
            return Err(TransportError::Nacked);
        }
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        if self.consumer.is_none() {
            let channel = self.live_channel()?;
            let consumer = channel
                .basic_consume(
                    &self.broker.queue,
                    &self.consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            debug!(queue = %self.broker.queue, consumer = %self.consumer_tag, "consumer registered");
            self.consumer = Some(consumer);
        }
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let next = consumer.next().await;
        match next {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: delivery.delivery_tag,
                payload: delivery.data,
                redelivered: delivery.redelivered,
            })),
            Some(Err(err)) => {
                self.consumer = None;
                Err(TransportError::Amqp(err))
            }
            None => {
                self.consumer = None;
                Err(TransportError::Closed)
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.live_channel()?
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<()> {
        self.live_channel()?
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.teardown().await;
        info!(broker = %self.broker.endpoint(), "broker connection closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}
