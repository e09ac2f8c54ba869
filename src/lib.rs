//! # RabbitMQ Consumer
//! A RabbitMQ consumer service built around an explicit connection state
//! machine, with reconnect backoff and an HTTP liveness endpoint.

pub mod app;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod http;
pub mod logging;
pub mod state;
pub mod supervisor;
pub mod transport;

// Re-export key components for easy access
pub use config::{BrokerParameters, FailurePolicy, ServiceConfig, Topology};
pub use consumer::{Consumer, StopHandle};
pub use error::ConsumerError;
pub use handler::{handler_fn, LogPayloadHandler, MessageHandler};
pub use logging::ConsumerLog;
pub use state::{ConsumerEvent, ConsumerState, StateMachine};
pub use supervisor::{ReconnectDelay, ShutdownHandle, Supervisor};
pub use transport::{BrokerTransport, LapinTransport};
