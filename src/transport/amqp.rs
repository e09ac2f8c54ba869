//! `lapin` implementation of [`BrokerTransport`].

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use tokio::task::JoinHandle;

use super::{BrokerTransport, EventSender};
use crate::config::{BrokerParameters, ExchangeType};
use crate::error::ConsumerError;
use crate::state::{ConsumerEvent, Delivery};

const REPLY_SUCCESS: u16 = 200;

/// Builds the connection URI from typed parameters, so credentials and the
/// virtual host never need percent-encoding.
pub fn amqp_uri(params: &BrokerParameters) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.user.clone(),
                password: params.password.clone(),
            },
            host: params.host.clone(),
            port: params.port,
        },
        vhost: params.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(params.heartbeat),
            ..Default::default()
        },
    }
}

/// A RabbitMQ connection with a single channel.
pub struct LapinTransport {
    connection_name: String,
    connection: Option<Connection>,
    channel: Option<Channel>,
    events: Option<EventSender>,
    forwarder: Option<JoinHandle<()>>,
}

impl LapinTransport {
    /// `connection_name` shows up in the broker's management UI.
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
            connection: None,
            channel: None,
            events: None,
            forwarder: None,
        }
    }

    fn channel(&self) -> Result<&Channel, ConsumerError> {
        self.channel
            .as_ref()
            .ok_or(ConsumerError::NotConnected { resource: "channel" })
    }

    fn events(&self) -> Result<EventSender, ConsumerError> {
        self.events
            .clone()
            .ok_or(ConsumerError::NotConnected { resource: "connection" })
    }

    fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Pushes deliveries into the event channel until the subscription ends.
async fn forward_deliveries(mut consumer: lapin::Consumer, events: EventSender) {
    while let Some(delivery) = consumer.next().await {
        let event = match delivery {
            Ok(delivery) => ConsumerEvent::Delivery(Delivery {
                delivery_tag: delivery.delivery_tag,
                payload: delivery.data,
                redelivered: delivery.redelivered,
            }),
            Err(e) => {
                let _ = events.send(ConsumerEvent::ChannelClosed { reason: e.to_string() });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(ConsumerEvent::ConsumerCancelled);
}

#[async_trait]
impl BrokerTransport for LapinTransport {
    async fn connect(&mut self, params: &BrokerParameters, events: EventSender) -> Result<(), ConsumerError> {
        let properties = ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect_uri(amqp_uri(params), properties).await?;

        let notify = events.clone();
        connection.on_error(move |err| {
            let _ = notify.send(ConsumerEvent::ConnectionClosed { reason: err.to_string() });
        });

        self.connection = Some(connection);
        self.events = Some(events);
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<(), ConsumerError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(ConsumerError::NotConnected { resource: "connection" })?;
        let channel = connection.create_channel().await?;

        let notify = self.events()?;
        channel.on_error(move |err| {
            let _ = notify.send(ConsumerEvent::ChannelClosed { reason: err.to_string() });
        });

        self.channel = Some(channel);
        Ok(())
    }

    async fn declare_exchange(&mut self, name: &str, kind: ExchangeType) -> Result<(), ConsumerError> {
        self.channel()?
            .exchange_declare(name, kind.into(), ExchangeDeclareOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&mut self, name: &str) -> Result<(), ConsumerError> {
        self.channel()?
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ConsumerError> {
        self.channel()?
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), ConsumerError> {
        self.channel()?
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<String, ConsumerError> {
        // An empty tag lets the broker assign one.
        let consumer = self
            .channel()?
            .basic_consume(queue, "", BasicConsumeOptions::default(), FieldTable::default())
            .await?;
        let consumer_tag = consumer.tag().as_str().to_string();

        let events = self.events()?;
        self.stop_forwarder();
        self.forwarder = Some(tokio::spawn(forward_deliveries(consumer, events)));
        Ok(consumer_tag)
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumerError> {
        self.channel()?
            .basic_nack(delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await?;
        Ok(())
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), ConsumerError> {
        self.channel()?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close_channel(&mut self) -> Result<(), ConsumerError> {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                channel.close(REPLY_SUCCESS, "Normal shutdown").await?;
            }
        }
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), ConsumerError> {
        self.channel = None;
        self.stop_forwarder();
        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                connection.close(REPLY_SUCCESS, "Normal shutdown").await?;
            }
        }
        Ok(())
    }

    fn connection_closing_or_closed(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(true, |connection| !connection.status().connected())
    }
}

impl Drop for LapinTransport {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}
