//! Recording transport for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{BrokerTransport, EventSender};
use crate::config::{BrokerParameters, ExchangeType};
use crate::error::ConsumerError;
use crate::state::{ConsumerEvent, Delivery};

pub(crate) const MOCK_CONSUMER_TAG: &str = "ctag-mock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect,
    OpenChannel,
    DeclareExchange { name: String, kind: ExchangeType },
    DeclareQueue(String),
    BindQueue { queue: String, exchange: String, routing_key: String },
    SetQos(u16),
    Consume(String),
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
    Cancel(String),
    CloseChannel,
    CloseConnection,
}

impl Call {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Call::Connect => "connect",
            Call::OpenChannel => "open_channel",
            Call::DeclareExchange { .. } => "declare_exchange",
            Call::DeclareQueue(_) => "declare_queue",
            Call::BindQueue { .. } => "bind_queue",
            Call::SetQos(_) => "set_qos",
            Call::Consume(_) => "consume",
            Call::Ack(_) => "ack",
            Call::Nack { .. } => "nack",
            Call::Cancel(_) => "cancel",
            Call::CloseChannel => "close_channel",
            Call::CloseConnection => "close_connection",
        }
    }
}

/// How the fake broker behaves for one connection attempt.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockScript {
    /// Requests with this label fail.
    pub fail_on: Option<&'static str>,
    /// Requests with this label never get an answer.
    pub hang_on: Option<&'static str>,
    /// Requests with this label find no open channel.
    pub unusable_on: Option<&'static str>,
    /// Delivered right after the subscription is acknowledged.
    pub deliveries: Vec<Delivery>,
    /// The broker revokes the subscription after the deliveries.
    pub cancel_after_deliveries: bool,
    /// The broker drops the connection after the deliveries.
    pub drop_after_deliveries: bool,
}

impl MockScript {
    pub(crate) fn refuse_connection() -> Self {
        Self {
            fail_on: Some("connect"),
            ..Default::default()
        }
    }
}

/// Calls shared between a [`MockTransport`] and the test inspecting it.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn labels(&self) -> Vec<&'static str> {
        self.calls().iter().map(Call::label).collect()
    }

    pub(crate) fn count(&self, label: &str) -> usize {
        self.calls().iter().filter(|c| c.label() == label).count()
    }
}

pub(crate) struct MockTransport {
    script: MockScript,
    log: CallLog,
    events: Option<EventSender>,
    connection_open: bool,
}

impl MockTransport {
    pub(crate) fn new(script: MockScript) -> (Self, CallLog) {
        Self::with_log(script, CallLog::default())
    }

    /// Several transports may share one log, e.g. across reconnects.
    pub(crate) fn with_log(script: MockScript, log: CallLog) -> (Self, CallLog) {
        let transport = Self {
            script,
            log: log.clone(),
            events: None,
            connection_open: false,
        };
        (transport, log)
    }

    async fn record(&self, call: Call) -> Result<(), ConsumerError> {
        let label = call.label();
        self.log.push(call);
        if self.script.hang_on == Some(label) {
            std::future::pending::<()>().await;
        }
        if self.script.unusable_on == Some(label) {
            return Err(ConsumerError::NotConnected { resource: "channel" });
        }
        if self.script.fail_on == Some(label) {
            return Err(ConsumerError::from(format!("mock broker rejected {}", label)));
        }
        Ok(())
    }

    fn notify(&self, event: ConsumerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&mut self, _params: &BrokerParameters, events: EventSender) -> Result<(), ConsumerError> {
        self.record(Call::Connect).await?;
        self.events = Some(events);
        self.connection_open = true;
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<(), ConsumerError> {
        self.record(Call::OpenChannel).await
    }

    async fn declare_exchange(&mut self, name: &str, kind: ExchangeType) -> Result<(), ConsumerError> {
        self.record(Call::DeclareExchange { name: name.to_string(), kind }).await
    }

    async fn declare_queue(&mut self, name: &str) -> Result<(), ConsumerError> {
        self.record(Call::DeclareQueue(name.to_string())).await
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ConsumerError> {
        self.record(Call::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
        .await
    }

    async fn set_qos(&mut self, prefetch_count: u16) -> Result<(), ConsumerError> {
        self.record(Call::SetQos(prefetch_count)).await
    }

    async fn consume(&mut self, queue: &str) -> Result<String, ConsumerError> {
        self.record(Call::Consume(queue.to_string())).await?;

        for delivery in self.script.deliveries.clone() {
            self.notify(ConsumerEvent::Delivery(delivery));
        }
        if self.script.cancel_after_deliveries {
            self.notify(ConsumerEvent::ConsumerCancelled);
        }
        if self.script.drop_after_deliveries {
            self.connection_open = false;
            self.notify(ConsumerEvent::ConnectionClosed {
                reason: "connection reset by peer".to_string(),
            });
        }
        Ok(MOCK_CONSUMER_TAG.to_string())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.record(Call::Ack(delivery_tag)).await
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumerError> {
        self.record(Call::Nack { delivery_tag, requeue }).await
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), ConsumerError> {
        self.record(Call::Cancel(consumer_tag.to_string())).await
    }

    async fn close_channel(&mut self) -> Result<(), ConsumerError> {
        self.record(Call::CloseChannel).await
    }

    async fn close_connection(&mut self) -> Result<(), ConsumerError> {
        self.connection_open = false;
        self.record(Call::CloseConnection).await
    }

    fn connection_closing_or_closed(&self) -> bool {
        !self.connection_open
    }
}
