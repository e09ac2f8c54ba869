//! Liveness endpoint.

use axum::{http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;

use crate::config::HttpConfig;
use crate::error::ConsumerError;
use crate::logging::ConsumerLog;

pub const LIVENESS_PATH: &str = "/test-broker";
pub const LIVENESS_BODY: &str = "System is online.";

/// Routes served by the service. The answer does not depend on broker state.
pub fn router() -> Router {
    Router::new().route(LIVENESS_PATH, get(liveness_handler))
}

async fn liveness_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, LIVENESS_BODY)
}

/// Binds `config` and serves [`router`] until the server fails.
pub async fn serve(config: &HttpConfig, log: &ConsumerLog) -> Result<(), ConsumerError> {
    let listener = TcpListener::bind(config.bind_address()).await?;
    log.info(format_args!("HTTP server listening on {}", listener.local_addr()?));
    axum::serve(listener, router()).await?;
    Ok(())
}
