//! Defines the processing callback invoked for every delivered message.

use crate::error::ConsumerError;
use crate::logging::ConsumerLog;
use async_trait::async_trait;

/// A trait for processing message bodies from the consumer's queue.
///
/// The payload is handed over untouched; parsing is entirely up to the
/// implementation. A returned error (or a panic) is logged by the dispatcher
/// and, depending on the configured policy, the message is acknowledged anyway
/// or requeued.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single message body.
    async fn handle_message(&self, payload: &[u8]) -> Result<(), ConsumerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Adapts a plain closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wraps `f` as a handler called `name`.
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(&[u8]) -> Result<(), ConsumerError> + Send + Sync,
{
    FnHandler { name: name.into(), f }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&[u8]) -> Result<(), ConsumerError> + Send + Sync,
{
    async fn handle_message(&self, payload: &[u8]) -> Result<(), ConsumerError> {
        (self.f)(payload)
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Logs every body it receives. This is what the service binary registers.
pub struct LogPayloadHandler {
    log: ConsumerLog,
}

impl LogPayloadHandler {
    pub fn new(log: ConsumerLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl MessageHandler for LogPayloadHandler {
    async fn handle_message(&self, payload: &[u8]) -> Result<(), ConsumerError> {
        self.log.info(format_args!(
            "Got body on callback function: {}",
            String::from_utf8_lossy(payload)
        ));
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "LogPayloadHandler"
    }
}
