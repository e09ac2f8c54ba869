//! The connection/channel lifecycle as an explicit state machine.
//!
//! [`StateMachine::handle`] is a pure transition: it takes one
//! [`ConsumerEvent`], updates the state and runtime flags, and returns the
//! [`Effect`]s the driver must perform, in order. It never touches the network.
//! Every broker request it asks for is answered by exactly one follow-up event,
//! so no step starts before its predecessor has been acknowledged.

use std::fmt;

use crate::config::{ExchangeType, Topology};

/// Lifecycle states of a single consumer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    /// Connection is up, channel open request outstanding.
    ConnectionOpen,
    ChannelOpen,
    ExchangeDeclaring,
    ExchangeDeclared,
    QueueDeclaring,
    QueueDeclared,
    Binding,
    Bound,
    SettingQos,
    /// QoS acknowledged, subscribe request outstanding.
    QosSet,
    Consuming,
    Cancelling,
    Cancelled,
    ChannelClosing,
    ChannelClosed,
    ConnectionClosing,
    ConnectionClosed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A message handed over by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            payload: payload.into(),
            redelivered: false,
        }
    }
}

/// Inputs to the state machine: broker acknowledgments, broker notifications
/// and local requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Start,
    ConnectionOpened,
    ConnectionOpenFailed { reason: String },
    ConnectionClosed { reason: String },
    ChannelOpened,
    ChannelClosed { reason: String },
    ExchangeDeclared,
    QueueDeclared,
    QueueBound,
    QosSet,
    ConsumeOk { consumer_tag: String },
    /// The broker revoked the subscription.
    ConsumerCancelled,
    /// The broker confirmed our own cancel request.
    CancelOk,
    Delivery(Delivery),
    StopRequested,
}

impl ConsumerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConsumerEvent::Start => "start",
            ConsumerEvent::ConnectionOpened => "connection-opened",
            ConsumerEvent::ConnectionOpenFailed { .. } => "connection-open-failed",
            ConsumerEvent::ConnectionClosed { .. } => "connection-closed",
            ConsumerEvent::ChannelOpened => "channel-opened",
            ConsumerEvent::ChannelClosed { .. } => "channel-closed",
            ConsumerEvent::ExchangeDeclared => "exchange-declared",
            ConsumerEvent::QueueDeclared => "queue-declared",
            ConsumerEvent::QueueBound => "queue-bound",
            ConsumerEvent::QosSet => "qos-set",
            ConsumerEvent::ConsumeOk { .. } => "consume-ok",
            ConsumerEvent::ConsumerCancelled => "consumer-cancelled",
            ConsumerEvent::CancelOk => "cancel-ok",
            ConsumerEvent::Delivery(_) => "delivery",
            ConsumerEvent::StopRequested => "stop-requested",
        }
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenConnection,
    OpenChannel,
    DeclareExchange { name: String, kind: ExchangeType },
    DeclareQueue { name: String },
    BindQueue { queue: String, exchange: String, routing_key: String },
    SetQos { prefetch_count: u16 },
    StartConsuming { queue: String },
    Dispatch(Delivery),
    CancelConsumer { consumer_tag: String },
    CloseChannel,
    CloseConnection,
    StopLoop,
}

/// Flags mutated only by the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeFlags {
    pub closing: bool,
    /// True between a subscribe acknowledgment and cancellation or connection loss.
    pub consuming: bool,
    /// Latched once the subscription was acknowledged.
    pub was_consuming: bool,
    pub should_reconnect: bool,
    pub consumer_tag: Option<String>,
}

/// Result of handling one event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// States entered, in order.
    pub path: Vec<ConsumerState>,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && self.effects.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConsumerState,
    flags: RuntimeFlags,
    topology: Topology,
    prefetch_count: u16,
    loop_stopped: bool,
}

impl StateMachine {
    pub fn new(topology: Topology, prefetch_count: u16) -> Self {
        Self {
            state: ConsumerState::Idle,
            flags: RuntimeFlags::default(),
            topology,
            prefetch_count,
            loop_stopped: false,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    /// Whether a `StopLoop` effect has been emitted.
    pub fn loop_stopped(&self) -> bool {
        self.loop_stopped
    }

    pub fn handle(&mut self, event: ConsumerEvent) -> Transition {
        let mut t = Transition::default();
        if self.loop_stopped {
            return t;
        }

        match event {
            ConsumerEvent::Start => {
                if self.state == ConsumerState::Idle {
                    self.enter(&mut t, ConsumerState::Connecting);
                    t.effects.push(Effect::OpenConnection);
                }
            }
            ConsumerEvent::ConnectionOpened => {
                if self.state == ConsumerState::Connecting {
                    self.enter(&mut t, ConsumerState::ConnectionOpen);
                    t.effects.push(Effect::OpenChannel);
                }
            }
            ConsumerEvent::ConnectionOpenFailed { .. } => {
                if self.state != ConsumerState::ConnectionClosed {
                    self.enter(&mut t, ConsumerState::ConnectionClosed);
                }
                self.reconnect(&mut t);
            }
            ConsumerEvent::ConnectionClosed { .. } => {
                if self.state == ConsumerState::ConnectionClosed {
                    return t;
                }
                self.flags.consuming = false;
                self.enter(&mut t, ConsumerState::ConnectionClosed);
                if self.flags.closing {
                    self.stop_loop(&mut t);
                } else {
                    self.reconnect(&mut t);
                }
            }
            ConsumerEvent::ChannelOpened => {
                if self.state == ConsumerState::ConnectionOpen {
                    self.enter(&mut t, ConsumerState::ChannelOpen);
                    self.enter(&mut t, ConsumerState::ExchangeDeclaring);
                    t.effects.push(Effect::DeclareExchange {
                        name: self.topology.exchange.clone(),
                        kind: self.topology.exchange_type,
                    });
                }
            }
            ConsumerEvent::ExchangeDeclared => {
                if self.state == ConsumerState::ExchangeDeclaring {
                    self.enter(&mut t, ConsumerState::ExchangeDeclared);
                    self.enter(&mut t, ConsumerState::QueueDeclaring);
                    t.effects.push(Effect::DeclareQueue {
                        name: self.topology.queue.clone(),
                    });
                }
            }
            ConsumerEvent::QueueDeclared => {
                if self.state == ConsumerState::QueueDeclaring {
                    self.enter(&mut t, ConsumerState::QueueDeclared);
                    self.enter(&mut t, ConsumerState::Binding);
                    t.effects.push(Effect::BindQueue {
                        queue: self.topology.queue.clone(),
                        exchange: self.topology.exchange.clone(),
                        routing_key: self.topology.routing_key.clone(),
                    });
                }
            }
            ConsumerEvent::QueueBound => {
                if self.state == ConsumerState::Binding {
                    self.enter(&mut t, ConsumerState::Bound);
                    self.enter(&mut t, ConsumerState::SettingQos);
                    t.effects.push(Effect::SetQos {
                        prefetch_count: self.prefetch_count,
                    });
                }
            }
            ConsumerEvent::QosSet => {
                if self.state == ConsumerState::SettingQos {
                    self.enter(&mut t, ConsumerState::QosSet);
                    t.effects.push(Effect::StartConsuming {
                        queue: self.topology.queue.clone(),
                    });
                }
            }
            ConsumerEvent::ConsumeOk { consumer_tag } => {
                if self.state == ConsumerState::QosSet {
                    self.flags.consuming = true;
                    self.flags.was_consuming = true;
                    self.flags.consumer_tag = Some(consumer_tag.clone());
                    self.enter(&mut t, ConsumerState::Consuming);
                    if self.flags.closing {
                        self.enter(&mut t, ConsumerState::Cancelling);
                        t.effects.push(Effect::CancelConsumer { consumer_tag });
                    }
                }
            }
            ConsumerEvent::ConsumerCancelled => {
                if self.state == ConsumerState::Consuming {
                    self.flags.consuming = false;
                    self.enter(&mut t, ConsumerState::ChannelClosing);
                    t.effects.push(Effect::CloseChannel);
                }
            }
            ConsumerEvent::CancelOk => {
                if self.state == ConsumerState::Cancelling {
                    self.flags.consuming = false;
                    self.enter(&mut t, ConsumerState::Cancelled);
                    self.enter(&mut t, ConsumerState::ChannelClosing);
                    t.effects.push(Effect::CloseChannel);
                }
            }
            ConsumerEvent::ChannelClosed { .. } => {
                if matches!(
                    self.state,
                    ConsumerState::Idle
                        | ConsumerState::Connecting
                        | ConsumerState::ChannelClosed
                        | ConsumerState::ConnectionClosing
                        | ConsumerState::ConnectionClosed
                ) {
                    return t;
                }
                self.flags.consuming = false;
                self.enter(&mut t, ConsumerState::ChannelClosed);
                self.close_connection(&mut t);
            }
            ConsumerEvent::Delivery(delivery) => {
                if matches!(self.state, ConsumerState::Consuming | ConsumerState::Cancelling) {
                    t.effects.push(Effect::Dispatch(delivery));
                }
            }
            ConsumerEvent::StopRequested => self.stop(&mut t),
        }

        t
    }

    fn enter(&mut self, t: &mut Transition, next: ConsumerState) {
        self.state = next;
        t.path.push(next);
    }

    fn reconnect(&mut self, t: &mut Transition) {
        self.flags.should_reconnect = true;
        self.stop(t);
    }

    fn stop(&mut self, t: &mut Transition) {
        if self.flags.closing {
            return;
        }
        self.flags.closing = true;

        if self.flags.consuming {
            if let Some(consumer_tag) = self.flags.consumer_tag.clone() {
                self.enter(t, ConsumerState::Cancelling);
                t.effects.push(Effect::CancelConsumer { consumer_tag });
                return;
            }
        }
        if self.state == ConsumerState::QosSet {
            // Subscribe in flight: cancel once it is confirmed.
            return;
        }

        self.close_connection(t);
        self.stop_loop(t);
    }

    fn close_connection(&mut self, t: &mut Transition) {
        self.flags.consuming = false;
        if self.connection_live() {
            self.enter(t, ConsumerState::ConnectionClosing);
            t.effects.push(Effect::CloseConnection);
        }
    }

    fn connection_live(&self) -> bool {
        !matches!(
            self.state,
            ConsumerState::Idle
                | ConsumerState::Connecting
                | ConsumerState::ConnectionClosing
                | ConsumerState::ConnectionClosed
        )
    }

    fn stop_loop(&mut self, t: &mut Transition) {
        if !self.loop_stopped {
            self.loop_stopped = true;
            t.effects.push(Effect::StopLoop);
        }
    }
}
