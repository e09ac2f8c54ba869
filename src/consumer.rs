//! Drives a [`StateMachine`] against a [`BrokerTransport`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{BrokerParameters, Topology};
use crate::dispatcher::Dispatcher;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::logging::ConsumerLog;
use crate::state::{ConsumerEvent, ConsumerState, Effect, RuntimeFlags, StateMachine};
use crate::transport::{BrokerTransport, EventSender};

/// Requests a graceful stop from another task.
///
/// The request is seen before any acknowledgment still queued in the
/// consumer, so a setup in progress does not outrun it.
#[derive(Debug, Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    events: EventSender,
}

impl StopHandle {
    /// Has no effect once the consumer is gone.
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // Wakes a consumer parked on the event channel.
        let _ = self.events.send(ConsumerEvent::StopRequested);
    }
}

/// One logical connection to the broker, from connect to teardown.
///
/// A consumer is single-use: once its loop has stopped, the supervisor
/// builds a fresh one.
pub struct Consumer<T, H: ?Sized> {
    params: BrokerParameters,
    machine: StateMachine,
    transport: T,
    dispatcher: Dispatcher<H>,
    log: ConsumerLog,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<ConsumerEvent>,
    stop_requested: Arc<AtomicBool>,
    /// Acknowledgments of our own requests, processed before broker notifications.
    pending: VecDeque<ConsumerEvent>,
    started: bool,
}

impl<T, H> Consumer<T, H>
where
    T: BrokerTransport,
    H: MessageHandler + ?Sized,
{
    pub fn new(params: BrokerParameters, topology: Topology, transport: T, handler: Arc<H>, log: ConsumerLog) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            machine: StateMachine::new(topology, params.prefetch_count),
            dispatcher: Dispatcher::new(handler, params.failure_policy, log.clone()),
            params,
            transport,
            log,
            events_tx,
            events_rx,
            stop_requested: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        self.log.name()
    }

    pub fn state(&self) -> ConsumerState {
        self.machine.state()
    }

    pub fn flags(&self) -> &RuntimeFlags {
        self.machine.flags()
    }

    pub fn should_reconnect(&self) -> bool {
        self.machine.flags().should_reconnect
    }

    pub fn was_consuming(&self) -> bool {
        self.machine.flags().was_consuming
    }

    pub fn is_consuming(&self) -> bool {
        self.machine.flags().consuming
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: self.stop_requested.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// Connects and consumes until the loop is stopped: by [`Consumer::stop`],
    /// a [`StopHandle`], or a broker failure that asks for a reconnect.
    ///
    /// Returns `Err` only for failures the state machine cannot absorb
    /// (see [`ConsumerError::is_fatal`]).
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        if !self.started {
            self.started = true;
            self.pending.push_back(ConsumerEvent::Start);
        }
        self.drive().await
    }

    /// Stops consuming. When a subscription is active, or its request is
    /// still unanswered, this cancels it and waits for the channel and
    /// connection to close; otherwise the loop ends at once. Only the first
    /// call does anything.
    pub async fn stop(&mut self) -> Result<(), ConsumerError> {
        self.apply(ConsumerEvent::StopRequested).await?;
        if !self.machine.loop_stopped() {
            self.log.info(format_args!("Waiting for the subscription to be cancelled"));
            self.drive().await?;
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<(), ConsumerError> {
        while !self.machine.loop_stopped() {
            let event = if self.stop_requested.swap(false, Ordering::SeqCst) {
                ConsumerEvent::StopRequested
            } else if let Some(event) = self.pending.pop_front() {
                event
            } else {
                let event = self
                    .events_rx
                    .recv()
                    .await
                    .ok_or(ConsumerError::EventChannelClosed)?;
                if matches!(event, ConsumerEvent::StopRequested) {
                    self.stop_requested.store(false, Ordering::SeqCst);
                }
                event
            };
            self.apply(event).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, event: ConsumerEvent) -> Result<(), ConsumerError> {
        let from = self.machine.state();
        let name = event.name();
        let transition = self.machine.handle(event);

        if transition.is_empty() {
            self.log.debug(format_args!("Ignored '{}' in state {}", name, from));
            return Ok(());
        }
        for state in &transition.path {
            self.log.debug(format_args!("'{}': {} -> {}", name, from, state));
        }
        for effect in transition.effects {
            self.execute(effect).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, effect: Effect) -> Result<(), ConsumerError> {
        let timeout = self.params.handshake_timeout;

        match effect {
            Effect::OpenConnection => {
                self.log.info(format_args!(
                    "Connecting to RabbitMQ at {}:{} (vhost '{}')",
                    self.params.host, self.params.port, self.params.virtual_host
                ));
                let events = self.events_tx.clone();
                let opened = bounded(timeout, "connect", self.transport.connect(&self.params, events)).await?;
                match opened {
                    Ok(()) => {
                        self.log.info(format_args!("Connection opened"));
                        self.pending.push_back(ConsumerEvent::ConnectionOpened);
                    }
                    Err(e) => {
                        self.log.error(format_args!("Connection open failed: {}", e));
                        self.pending.push_back(ConsumerEvent::ConnectionOpenFailed { reason: e.to_string() });
                    }
                }
            }
            Effect::OpenChannel => {
                self.log.info(format_args!("Creating a new channel"));
                let opened = bounded(timeout, "open_channel", self.transport.open_channel()).await?;
                self.acknowledge(opened, "open_channel", ConsumerEvent::ChannelOpened, "The channel has been opened");
            }
            Effect::DeclareExchange { name, kind } => {
                self.log.info(format_args!("Declaring exchange '{}' ({})", name, kind));
                let declared = bounded(timeout, "declare_exchange", self.transport.declare_exchange(&name, kind)).await?;
                self.acknowledge(declared, "declare_exchange", ConsumerEvent::ExchangeDeclared, "Exchange declared");
            }
            Effect::DeclareQueue { name } => {
                self.log.info(format_args!("Declaring queue '{}'", name));
                let declared = bounded(timeout, "declare_queue", self.transport.declare_queue(&name)).await?;
                self.acknowledge(declared, "declare_queue", ConsumerEvent::QueueDeclared, "Queue declared");
            }
            Effect::BindQueue { queue, exchange, routing_key } => {
                self.log.info(format_args!(
                    "Binding '{}' to '{}' with '{}'",
                    exchange, queue, routing_key
                ));
                let bound = bounded(
                    timeout,
                    "bind_queue",
                    self.transport.bind_queue(&queue, &exchange, &routing_key),
                )
                .await?;
                self.acknowledge(bound, "bind_queue", ConsumerEvent::QueueBound, "Queue bound");
            }
            Effect::SetQos { prefetch_count } => {
                let set = bounded(timeout, "set_qos", self.transport.set_qos(prefetch_count)).await?;
                if set.is_ok() {
                    self.log.info(format_args!("QoS prefetch count set to {}", prefetch_count));
                }
                self.acknowledge(set, "set_qos", ConsumerEvent::QosSet, "QoS acknowledged");
            }
            Effect::StartConsuming { queue } => {
                self.log.info(format_args!("Issuing consumer related RPC commands"));
                match bounded(timeout, "consume", self.transport.consume(&queue)).await? {
                    Ok(consumer_tag) => {
                        self.log.info(format_args!(
                            "Consumer started with tag '{}'. Waiting for messages...",
                            consumer_tag
                        ));
                        self.pending.push_back(ConsumerEvent::ConsumeOk { consumer_tag });
                    }
                    Err(e) => self.channel_failed("consume", e),
                }
            }
            Effect::Dispatch(delivery) => {
                let delivery_tag = delivery.delivery_tag;
                if let Err(e) = fatal(self.dispatcher.dispatch(&mut self.transport, delivery).await)? {
                    self.log.warn(format_args!("Could not settle delivery {}: {}", delivery_tag, e));
                    self.pending.push_back(ConsumerEvent::ChannelClosed { reason: e.to_string() });
                }
            }
            Effect::CancelConsumer { consumer_tag } => {
                self.log.info(format_args!("Sending a Basic.Cancel RPC command to RabbitMQ"));
                let cancelled = bounded(timeout, "cancel", self.transport.cancel(&consumer_tag)).await?;
                self.acknowledge(
                    cancelled,
                    "cancel",
                    ConsumerEvent::CancelOk,
                    "RabbitMQ acknowledged the cancellation of the consumer",
                );
            }
            Effect::CloseChannel => {
                self.log.info(format_args!("Closing the channel"));
                let reason = match bounded(timeout, "close_channel", self.transport.close_channel()).await? {
                    Ok(()) => "closed by client".to_string(),
                    Err(e) => e.to_string(),
                };
                self.log.warn(format_args!("Channel was closed: {}", reason));
                self.pending.push_back(ConsumerEvent::ChannelClosed { reason });
            }
            Effect::CloseConnection => {
                let reason = if self.transport.connection_closing_or_closed() {
                    self.log.info(format_args!("Connection is closing or already closed"));
                    "already closed".to_string()
                } else {
                    self.log.info(format_args!("Closing connection"));
                    match bounded(timeout, "close_connection", self.transport.close_connection()).await? {
                        Ok(()) => "closed by client".to_string(),
                        Err(e) => e.to_string(),
                    }
                };
                self.pending.push_back(ConsumerEvent::ConnectionClosed { reason });
            }
            Effect::StopLoop => {
                if self.machine.flags().should_reconnect {
                    self.log.info(format_args!("Stopped, reconnect necessary"));
                } else {
                    self.log.info(format_args!("Stopped"));
                }
            }
        }
        Ok(())
    }

    /// Queues `ok` on success; a failed channel-level request closes the channel.
    fn acknowledge(
        &mut self,
        result: Result<(), ConsumerError>,
        operation: &str,
        ok: ConsumerEvent,
        message: &str,
    ) {
        match result {
            Ok(()) => {
                self.log.info(format_args!("{}", message));
                self.pending.push_back(ok);
            }
            Err(e) => self.channel_failed(operation, e),
        }
    }

    fn channel_failed(&mut self, operation: &str, error: ConsumerError) {
        self.log.warn(format_args!("Channel request '{}' failed: {}", operation, error));
        self.pending.push_back(ConsumerEvent::ChannelClosed { reason: error.to_string() });
    }
}

/// Applies the handshake timeout, if any, to one broker request.
///
/// The outer error is fatal and ends the run; the inner result is a broker
/// answer the state machine handles.
async fn bounded<F, R>(
    timeout: Option<Duration>,
    operation: &'static str,
    request: F,
) -> Result<Result<R, ConsumerError>, ConsumerError>
where
    F: Future<Output = Result<R, ConsumerError>>,
{
    let answer = match timeout {
        None => request.await,
        Some(limit) => tokio::time::timeout(limit, request)
            .await
            .unwrap_or_else(|_| Err(ConsumerError::Timeout { operation, timeout: limit })),
    };
    fatal(answer)
}

/// Lifts fatal errors out of a request result.
fn fatal<R>(result: Result<R, ConsumerError>) -> Result<Result<R, ConsumerError>, ConsumerError> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        other => Ok(other),
    }
}
