//! The seam between the state machine driver and the broker.
//!
//! Requests are plain async calls answered by `Ok`/`Err`. Anything the broker
//! does on its own (deliveries, remote cancellation, connection or channel
//! loss) is pushed as a [`ConsumerEvent`] through the sender handed over in
//! [`BrokerTransport::connect`].

mod amqp;
#[cfg(test)]
pub(crate) mod mock;

pub use amqp::{amqp_uri, LapinTransport};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{BrokerParameters, ExchangeType};
use crate::error::ConsumerError;
use crate::state::ConsumerEvent;

/// Where a transport reports unsolicited broker notifications.
pub type EventSender = mpsc::UnboundedSender<ConsumerEvent>;

/// One connection and at most one channel to a broker.
///
/// Implementations are owned by a single consumer and driven strictly
/// sequentially.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Opens the connection and registers close notifications on `events`.
    async fn connect(&mut self, params: &BrokerParameters, events: EventSender) -> Result<(), ConsumerError>;

    /// Opens the channel and registers its close notification.
    async fn open_channel(&mut self) -> Result<(), ConsumerError>;

    async fn declare_exchange(&mut self, name: &str, kind: ExchangeType) -> Result<(), ConsumerError>;

    async fn declare_queue(&mut self, name: &str) -> Result<(), ConsumerError>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ConsumerError>;

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), ConsumerError>;

    /// Subscribes to `queue`, returning the broker-assigned consumer tag.
    /// Deliveries and remote cancellation arrive as events afterwards.
    async fn consume(&mut self, queue: &str) -> Result<String, ConsumerError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConsumerError>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumerError>;

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), ConsumerError>;

    async fn close_channel(&mut self) -> Result<(), ConsumerError>;

    async fn close_connection(&mut self) -> Result<(), ConsumerError>;

    /// True when there is no connection or it is already shutting down.
    fn connection_closing_or_closed(&self) -> bool;
}
