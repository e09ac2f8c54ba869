use std::io::Write;
use std::sync::Arc;

use rabbitmq_consumer::{app, ConsumerLog, LogPayloadHandler, ServiceConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{:<8} {} {:<30} {:>4}: {}",
                record.level(),
                buf.timestamp(),
                record.file().unwrap_or(record.target()),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .init();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Could not load configuration: {}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "Using RabbitMQ at {}:{} (delivery mode {:?}, prefetch {})",
        config.broker.host,
        config.broker.port,
        config.broker.delivery_mode,
        config.broker.prefetch_count
    );

    let log = ConsumerLog::process("MAIN");
    let handler = Arc::new(LogPayloadHandler::new(log.named(app::CONSUMER_NAME)));

    if let Err(e) = app::run(config, handler, log).await {
        log::error!("Application failed: {}", e);
        std::process::exit(1);
    }
}
