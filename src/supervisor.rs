//! Keeps a consumer alive across broker failures.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::consumer::Consumer;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::logging::ConsumerLog;
use crate::transport::BrokerTransport;

/// Longest wait between two connection attempts, in seconds.
pub const MAX_RECONNECT_DELAY_SECS: u64 = 30;

/// Backoff between connection attempts.
///
/// A run that never reached the consuming state waits one second longer than
/// the previous one, up to [`MAX_RECONNECT_DELAY_SECS`]. A run that did consume
/// reconnects immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectDelay {
    seconds: u64,
}

impl ReconnectDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, was_consuming: bool) -> Duration {
        self.seconds = if was_consuming {
            0
        } else {
            (self.seconds + 1).min(MAX_RECONNECT_DELAY_SECS)
        };
        Duration::from_secs(self.seconds)
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

/// Ends a [`Supervisor`] run from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Runs consumers built by `factory` one after another, waiting
/// [`ReconnectDelay`] between them, until a clean stop or a fatal error.
pub struct Supervisor<T, H: ?Sized, F> {
    factory: F,
    delay: ReconnectDelay,
    log: ConsumerLog,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    _consumer: PhantomData<fn() -> Consumer<T, H>>,
}

impl<T, H, F> Supervisor<T, H, F>
where
    T: BrokerTransport,
    H: MessageHandler + ?Sized,
    F: FnMut() -> Consumer<T, H> + Send,
{
    /// `factory` must build an equivalent consumer (same name, same handler) each call.
    pub fn new(factory: F, log: ConsumerLog) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            factory,
            delay: ReconnectDelay::new(),
            log,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            _consumer: PhantomData,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Returns `Ok` after a clean stop or shutdown, `Err` when a consumer
    /// failed in a way that is not a broker disconnect.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        let mut consumer = (self.factory)();

        loop {
            let stop = consumer.stop_handle();
            let outcome = {
                let name = consumer.name().to_string();
                let run = consumer.run();
                tokio::pin!(run);
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut self.shutdown_rx) => {
                        // The run keeps going until the teardown completes.
                        self.log.info(format_args!("Shutdown requested, stopping '{}'", name));
                        stop.stop();
                        Outcome::Shutdown(run.await)
                    }
                    result = &mut run => Outcome::Finished(result),
                }
            };

            match outcome {
                Outcome::Shutdown(result) => return result,
                Outcome::Finished(Err(e)) => {
                    self.log.error(format_args!("Got an error from '{}': {}", consumer.name(), e));
                    if let Err(stop_error) = consumer.stop().await {
                        self.log.warn(format_args!("Stopping after failure also failed: {}", stop_error));
                    }
                    return Err(e);
                }
                Outcome::Finished(Ok(())) if !consumer.should_reconnect() => {
                    self.log.info(format_args!("'{}' stopped, not reconnecting", consumer.name()));
                    return Ok(());
                }
                Outcome::Finished(Ok(())) => {
                    consumer.stop().await?;
                    let delay = self.delay.next(consumer.was_consuming());
                    self.log.info(format_args!("Reconnecting after {} seconds", delay.as_secs()));

                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut self.shutdown_rx) => {
                            self.log.info(format_args!("Shutdown requested during reconnect backoff"));
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    consumer = (self.factory)();
                }
            }
        }
    }
}

enum Outcome {
    Shutdown(Result<(), ConsumerError>),
    Finished(Result<(), ConsumerError>),
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // Every handle is gone, so no shutdown can arrive.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerParameters, Topology};
    use crate::handler::handler_fn;
    use crate::logging::capture::{capturing, CapturingLog};
    use crate::state::Delivery;
    use crate::transport::mock::{CallLog, MockScript, MockTransport};
    use log::Level;
    use std::collections::VecDeque;

    #[test]
    fn test_delay_grows_by_one_second_up_to_ceiling() {
        let mut delay = ReconnectDelay::new();

        let observed: Vec<u64> = (0..33).map(|_| delay.next(false).as_secs()).collect();

        let mut expected: Vec<u64> = (1..=30).collect();
        expected.extend([30, 30, 30]);
        assert_eq!(observed, expected);
    }

    #[test]
    fn test_delay_resets_after_consuming_run() {
        let mut delay = ReconnectDelay::new();
        delay.next(false);
        delay.next(false);
        delay.next(false);

        assert_eq!(delay.next(true), Duration::ZERO);
        assert_eq!(delay.next(false), Duration::from_secs(1));
        assert_eq!(delay.current(), Duration::from_secs(1));
    }

    type TestHandler = dyn MessageHandler;

    fn scripted_factory(
        scripts: Vec<MockScript>,
        calls: CallLog,
        log: ConsumerLog,
        on_exhausted: ShutdownSlot,
    ) -> impl FnMut() -> Consumer<MockTransport, TestHandler> + Send {
        let mut scripts: VecDeque<MockScript> = scripts.into();
        let handler: Arc<TestHandler> = Arc::new(handler_fn("noop", |_: &[u8]| Ok(())));
        move || {
            let script = scripts.pop_front().unwrap_or_else(|| {
                if let Some(handle) = on_exhausted.lock().unwrap().as_ref() {
                    handle.shutdown();
                }
                MockScript::refuse_connection()
            });
            let (transport, _) = MockTransport::with_log(script, calls.clone());
            Consumer::new(
                BrokerParameters::default(),
                Topology::default(),
                transport,
                handler.clone(),
                log.clone(),
            )
        }
    }

    type ShutdownSlot = Arc<std::sync::Mutex<Option<ShutdownHandle>>>;

    fn reconnect_delays(sink: &CapturingLog) -> Vec<String> {
        sink.lines()
            .into_iter()
            .filter(|(level, line)| *level == Level::Info && line.contains("Reconnecting after"))
            .map(|(_, line)| line)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_on_failures_and_resets_after_consuming() {
        let calls = CallLog::default();
        let (log, sink) = capturing("PARSE_CONSUMER");
        let slot: ShutdownSlot = Default::default();
        let consuming_then_cancelled = MockScript {
            deliveries: vec![Delivery::new(1, b"hello".to_vec())],
            cancel_after_deliveries: true,
            ..Default::default()
        };
        let factory = scripted_factory(
            vec![
                MockScript::refuse_connection(),
                MockScript::refuse_connection(),
                consuming_then_cancelled,
                MockScript::refuse_connection(),
            ],
            calls.clone(),
            log.clone(),
            slot.clone(),
        );
        let supervisor = Supervisor::new(factory, log.named("SUPERVISOR"));
        *slot.lock().unwrap() = Some(supervisor.shutdown_handle());

        supervisor.run().await.unwrap();

        let delays = reconnect_delays(&sink);
        assert_eq!(
            delays,
            vec![
                "[SUPERVISOR] Reconnecting after 1 seconds",
                "[SUPERVISOR] Reconnecting after 2 seconds",
                "[SUPERVISOR] Reconnecting after 0 seconds",
                "[SUPERVISOR] Reconnecting after 1 seconds",
            ]
        );
        assert_eq!(calls.count("connect"), 4);
        assert_eq!(calls.count("ack"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_run_ends_supervision() {
        let (log, _) = capturing("PARSE_CONSUMER");
        let handler: Arc<TestHandler> = Arc::new(handler_fn("noop", |_: &[u8]| Ok(())));
        let calls = CallLog::default();
        let mut built = 0;
        let factory = {
            let calls = calls.clone();
            let log = log.clone();
            move || {
                built += 1;
                let (transport, _) = MockTransport::with_log(MockScript::refuse_connection(), calls.clone());
                let consumer = Consumer::new(
                    BrokerParameters::default(),
                    Topology::default(),
                    transport,
                    handler.clone(),
                    log.clone(),
                );
                consumer.stop_handle().stop();
                assert_eq!(built, 1, "a clean stop must not rebuild the consumer");
                consumer
            }
        };

        Supervisor::new(factory, log).run().await.unwrap();

        assert!(calls.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_consumer_error_ends_supervision() {
        let calls = CallLog::default();
        let (log, sink) = capturing("PARSE_CONSUMER");
        let broken = MockScript {
            unusable_on: Some("declare_queue"),
            ..Default::default()
        };
        let factory = scripted_factory(vec![broken], calls.clone(), log.clone(), Default::default());

        let result = Supervisor::new(factory, log.named("SUPERVISOR")).run().await;

        assert!(matches!(result, Err(ConsumerError::NotConnected { .. })));
        assert_eq!(
            calls.labels(),
            vec!["connect", "open_channel", "declare_exchange", "declare_queue", "close_connection"]
        );
        assert!(sink.contains(Level::Error, "[SUPERVISOR] Got an error from 'PARSE_CONSUMER'"));
        assert!(!sink.contains(Level::Info, "Reconnecting after"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_consuming_consumer() {
        let (log, _) = capturing("PARSE_CONSUMER");
        let calls = CallLog::default();
        let slot: ShutdownSlot = Default::default();
        let factory = scripted_factory(vec![MockScript::default()], calls.clone(), log.clone(), slot.clone());
        let supervisor = Supervisor::new(factory, log);
        let shutdown = supervisor.shutdown_handle();

        let task = tokio::spawn(supervisor.run());
        while calls.count("consume") == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.shutdown();

        task.await.unwrap().unwrap();
        assert_eq!(
            &calls.labels()[calls.labels().len() - 3..],
            &["cancel", "close_channel", "close_connection"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_subscribe() {
        let (log, _) = capturing("PARSE_CONSUMER");
        let calls = CallLog::default();
        let unanswered = MockScript {
            hang_on: Some("consume"),
            ..Default::default()
        };
        let factory = scripted_factory(vec![unanswered], calls.clone(), log.clone(), Default::default());
        let supervisor = Supervisor::new(factory, log);
        let shutdown = supervisor.shutdown_handle();

        let task = tokio::spawn(supervisor.run());
        while calls.count("consume") == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.shutdown();

        task.await.unwrap().unwrap();
        assert_eq!(calls.labels().last(), Some(&"close_connection"));
        assert_eq!(calls.count("connect"), 1);
    }
}
