//! Service configuration resolved from the environment.
//!
//! Every value is parsed into a typed field at load time. Unset or blank
//! variables fall back to their defaults; malformed ones are reported as
//! [`ConsumerError::Config`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use lapin::ExchangeKind;

use crate::error::ConsumerError;

pub const DEFAULT_HOST: &str = "rabbitmq";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PASSWORD: &str = "password";
pub const DEFAULT_VIRTUAL_HOST: &str = "/";
pub const DEFAULT_PREFETCH_COUNT: u16 = 0;
pub const DEFAULT_HEARTBEAT_SECS: u16 = 300;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Exchange this consumer binds to.
pub const EXCHANGE: &str = "message";
/// Queue this consumer reads from.
pub const QUEUE: &str = "text";
/// Routing key binding [`QUEUE`] to [`EXCHANGE`].
pub const ROUTING_KEY: &str = "example.text";

/// What the dispatcher does with a message whose callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Acknowledge anyway. The message is dropped.
    #[default]
    Ack,
    /// Negative-acknowledge with requeue so the broker redelivers it.
    NackRequeue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ack" => Ok(FailurePolicy::Ack),
            "nack" | "nack-requeue" | "requeue" => Ok(FailurePolicy::NackRequeue),
            other => Err(format!("expected 'ack' or 'nack', got '{}'", other)),
        }
    }
}

/// AMQP `delivery-mode` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u8>() {
            Ok(1) => Ok(DeliveryMode::Transient),
            Ok(2) => Ok(DeliveryMode::Persistent),
            Ok(other) => Err(format!("delivery mode must be 1 or 2, got {}", other)),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Exchange types a topology can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        };
        f.write_str(name)
    }
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

/// The single exchange/queue/binding this consumer declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub queue: String,
    pub routing_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: EXCHANGE.to_string(),
            exchange_type: ExchangeType::Direct,
            queue: QUEUE.to_string(),
            routing_key: ROUTING_KEY.to_string(),
        }
    }
}

/// Connection parameters for one consumer.
///
/// Use [`BrokerParameters::from_env`] in the service, or
/// [`BrokerParameters::builder`] to construct one by hand.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerParameters {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub user: String,
    pub password: String,
    /// Heartbeat interval negotiated with the broker, in seconds.
    pub heartbeat: u16,
    /// Persistence mode for anything this service publishes.
    pub delivery_mode: DeliveryMode,
    /// QoS prefetch limit. Zero means unlimited.
    pub prefetch_count: u16,
    /// Upper bound on each broker request. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
}

impl fmt::Debug for BrokerParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerParameters")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("user", &self.user)
            .field("password", &"***")
            .field("heartbeat", &self.heartbeat)
            .field("delivery_mode", &self.delivery_mode)
            .field("prefetch_count", &self.prefetch_count)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

impl Default for BrokerParameters {
    fn default() -> Self {
        BrokerParametersBuilder::default().build()
    }
}

impl BrokerParameters {
    /// Creates a new `BrokerParametersBuilder` seeded with the defaults.
    pub fn builder() -> BrokerParametersBuilder {
        BrokerParametersBuilder::default()
    }

    /// Reads the `RABBITMQ_*` variables of the process environment.
    pub fn from_env() -> Result<Self, ConsumerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves every parameter through `lookup`, applying defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConsumerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let handshake_secs: u64 =
            parse_var(&lookup, "RABBITMQ_HANDSHAKE_TIMEOUT", DEFAULT_HANDSHAKE_TIMEOUT_SECS)?;

        Ok(Self::builder()
            .host(string_var(&lookup, "RABBITMQ_HOST", DEFAULT_HOST))
            .port(parse_var(&lookup, "RABBITMQ_PORT", DEFAULT_PORT)?)
            .user(string_var(&lookup, "RABBITMQ_DEFAULT_USER", DEFAULT_USER))
            .password(string_var(&lookup, "RABBITMQ_DEFAULT_PASS", DEFAULT_PASSWORD))
            .virtual_host(string_var(&lookup, "RABBITMQ_DEFAULT_VIRTUAL_HOST", DEFAULT_VIRTUAL_HOST))
            .delivery_mode(parse_var(&lookup, "RABBITMQ_DEFAULT_DELIVERY_MODE", DeliveryMode::Persistent)?)
            .prefetch_count(parse_var(&lookup, "RABBITMQ_DEFAULT_PREFETCH_COUNT", DEFAULT_PREFETCH_COUNT)?)
            .heartbeat(parse_var(&lookup, "RABBITMQ_HEARTBEAT", DEFAULT_HEARTBEAT_SECS)?)
            .handshake_timeout((handshake_secs > 0).then(|| Duration::from_secs(handshake_secs)))
            .failure_policy(parse_var(&lookup, "RABBITMQ_CALLBACK_FAILURE_POLICY", FailurePolicy::Ack)?)
            .build())
    }
}

/// A builder for creating `BrokerParameters` instances.
#[derive(Debug, Clone)]
pub struct BrokerParametersBuilder {
    host: String,
    port: u16,
    virtual_host: String,
    user: String,
    password: String,
    heartbeat: u16,
    delivery_mode: DeliveryMode,
    prefetch_count: u16,
    handshake_timeout: Option<Duration>,
    failure_policy: FailurePolicy,
}

impl Default for BrokerParametersBuilder {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            virtual_host: DEFAULT_VIRTUAL_HOST.to_string(),
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            heartbeat: DEFAULT_HEARTBEAT_SECS,
            delivery_mode: DeliveryMode::Persistent,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            handshake_timeout: Some(Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS)),
            failure_policy: FailurePolicy::Ack,
        }
    }
}

impl BrokerParametersBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = seconds;
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Sets the QoS prefetch count. Zero leaves in-flight messages unbounded.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn build(self) -> BrokerParameters {
        BrokerParameters {
            host: self.host,
            port: self.port,
            virtual_host: self.virtual_host,
            user: self.user,
            password: self.password,
            heartbeat: self.heartbeat,
            delivery_mode: self.delivery_mode,
            prefetch_count: self.prefetch_count,
            handshake_timeout: self.handshake_timeout,
            failure_policy: self.failure_policy,
        }
    }
}

/// Bind address of the liveness endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HTTP_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

impl HttpConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConsumerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            host: string_var(&lookup, "HTTP_HOST", DEFAULT_HTTP_HOST),
            port: parse_var(&lookup, "HTTP_PORT", DEFAULT_HTTP_PORT)?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything the service binary needs.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub broker: BrokerParameters,
    pub http: HttpConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConsumerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConsumerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            broker: BrokerParameters::from_lookup(&lookup)?,
            http: HttpConfig::from_lookup(&lookup)?,
        })
    }
}

fn lookup_non_blank<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|value| !value.trim().is_empty())
}

fn string_var<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup_non_blank(lookup, key).unwrap_or_else(|| default.to_string())
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConsumerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup_non_blank(lookup, key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConsumerError::Config {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
