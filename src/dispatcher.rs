//! Hands each delivered message to the processing callback and settles it
//! with the broker.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::config::FailurePolicy;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::logging::ConsumerLog;
use crate::state::Delivery;
use crate::transport::BrokerTransport;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Acked,
    Requeued,
}

pub struct Dispatcher<H: ?Sized> {
    handler: Arc<H>,
    policy: FailurePolicy,
    log: ConsumerLog,
}

impl<H: MessageHandler + ?Sized> Dispatcher<H> {
    pub fn new(handler: Arc<H>, policy: FailurePolicy, log: ConsumerLog) -> Self {
        Self { handler, policy, log }
    }

    /// Invokes the handler once with the payload, then acknowledges the
    /// delivery. A failing or panicking handler still gets its message
    /// acknowledged unless the policy is [`FailurePolicy::NackRequeue`].
    ///
    /// Only a failed ack/nack is returned as an error.
    pub async fn dispatch<T>(&self, transport: &mut T, delivery: Delivery) -> Result<Acknowledgement, ConsumerError>
    where
        T: BrokerTransport + ?Sized,
    {
        let delivery_tag = delivery.delivery_tag;

        let failure = match AssertUnwindSafe(self.handler.handle_message(&delivery.payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        };

        let Some(reason) = failure else {
            transport.ack(delivery_tag).await?;
            self.log.debug(format_args!("Message acknowledged. Tag: {}", delivery_tag));
            return Ok(Acknowledgement::Acked);
        };

        match self.policy {
            FailurePolicy::Ack => {
                self.log.error(format_args!(
                    "Handler '{}' failed, acknowledging anyway. Tag: {}, Error: {}",
                    self.handler.handler_name(),
                    delivery_tag,
                    reason
                ));
                transport.ack(delivery_tag).await?;
                Ok(Acknowledgement::Acked)
            }
            FailurePolicy::NackRequeue => {
                self.log.error(format_args!(
                    "Handler '{}' failed, requeueing. Tag: {}, Error: {}",
                    self.handler.handler_name(),
                    delivery_tag,
                    reason
                ));
                transport.nack(delivery_tag, true).await?;
                Ok(Acknowledgement::Requeued)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
