//! Process glue: the parse consumer, its supervisor and the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;

use crate::config::{BrokerParameters, ServiceConfig, Topology};
use crate::consumer::Consumer;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::http;
use crate::logging::ConsumerLog;
use crate::supervisor::Supervisor;
use crate::transport::LapinTransport;

/// Name of the service's single consumer, also used as the AMQP connection name.
pub const CONSUMER_NAME: &str = "PARSE_CONSUMER";

const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Builds one parse consumer on a fresh `lapin` connection.
pub fn build_consumer<H>(params: BrokerParameters, handler: Arc<H>, log: &ConsumerLog) -> Consumer<LapinTransport, H>
where
    H: MessageHandler + ?Sized,
{
    Consumer::new(
        params,
        Topology::default(),
        LapinTransport::new(CONSUMER_NAME),
        handler,
        log.named(CONSUMER_NAME),
    )
}

/// A supervisor that rebuilds the parse consumer after every disconnect.
pub fn consumer_supervisor<H>(
    params: BrokerParameters,
    handler: Arc<H>,
    log: ConsumerLog,
) -> Supervisor<LapinTransport, H, impl FnMut() -> Consumer<LapinTransport, H> + Send>
where
    H: MessageHandler + ?Sized + 'static,
{
    let consumer_log = log.clone();
    let factory = move || build_consumer(params.clone(), handler.clone(), &consumer_log);
    Supervisor::new(factory, log.named("SUPERVISOR"))
}

/// Runs the supervisor to completion. An `Err` means the consumer gave up
/// for a reason other than a broker disconnect.
pub async fn start_consumer<H, F>(supervisor: Supervisor<LapinTransport, H, F>, log: ConsumerLog) -> Result<(), ConsumerError>
where
    H: MessageHandler + ?Sized,
    F: FnMut() -> Consumer<LapinTransport, H> + Send,
{
    match supervisor.run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            log.error(format_args!("Got an error: {}", e));
            Err(e)
        }
    }
}

enum Exit {
    Interrupted(std::io::Result<()>),
    Server(Result<(), ConsumerError>),
    Consumer(Result<Result<(), ConsumerError>, JoinError>),
}

/// Serves the liveness endpoint and runs the consumer until Ctrl-C.
///
/// When either the server or the consumer ends, both are restarted after a
/// short pause.
pub async fn run<H>(config: ServiceConfig, handler: Arc<H>, log: ConsumerLog) -> Result<(), ConsumerError>
where
    H: MessageHandler + ?Sized + 'static,
{
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let http_log = log.named("HTTP");

    loop {
        log.info(format_args!("Run Server..."));
        let supervisor = consumer_supervisor(config.broker.clone(), handler.clone(), log.clone());
        let shutdown = supervisor.shutdown_handle();
        let mut consumer_task = tokio::spawn(start_consumer(supervisor, log.named(CONSUMER_NAME)));

        let exit = tokio::select! {
            signal = &mut interrupt => Exit::Interrupted(signal),
            served = http::serve(&config.http, &http_log) => Exit::Server(served),
            joined = &mut consumer_task => Exit::Consumer(joined),
        };

        match exit {
            Exit::Interrupted(signal) => {
                signal?;
                log.info(format_args!("Ctrl+C received. Shutting down."));
                shutdown.shutdown();
                log_consumer_exit(&log, consumer_task.await);
                log.info(format_args!("Application has shut down."));
                return Ok(());
            }
            Exit::Server(served) => {
                match served {
                    Ok(()) => log.warn(format_args!("HTTP server exited")),
                    Err(e) => log.error(format_args!("Exit main loop with: {}", e)),
                }
                shutdown.shutdown();
                log_consumer_exit(&log, consumer_task.await);
            }
            Exit::Consumer(joined) => log_consumer_exit(&log, joined),
        }

        log.info(format_args!("Try to restart server..."));
        tokio::time::sleep(RESTART_PAUSE).await;
    }
}

fn log_consumer_exit(log: &ConsumerLog, joined: Result<Result<(), ConsumerError>, JoinError>) {
    match joined {
        Ok(Ok(())) => log.info(format_args!("Consumer finished")),
        // start_consumer already logged the cause
        Ok(Err(_)) => log.warn(format_args!("Consumer exited with an error")),
        Err(e) => log.error(format_args!("Consumer task failed: {}", e)),
    }
}
