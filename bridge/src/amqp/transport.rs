//! AMQP transport abstraction.
//!
//! The bridge never speaks the AMQP wire protocol itself. It drives
//! connections and links through these traits; concrete implementations
//! (an AMQP client library, or [`super::memory`]) live behind them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::message::AmqpMessage;
use crate::error::Result;

/// Options for opening an AMQP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    /// AMQP container id announced in OPEN.
    pub container_id: String,
    /// Idle heartbeat; zero disables it.
    pub heartbeat: Duration,
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            container_id: "mqtt-bridge".to_string(),
            heartbeat: Duration::ZERO,
        }
    }

    /// Set the container id.
    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Options for creating a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Explicit link name; implementations generate one when absent.
    pub link_name: Option<String>,
}

impl LinkOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            link_name: Some(name.into()),
        }
    }
}

/// Opaque identifier of an unsettled inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// A message received on a receiver link, not yet settled.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub tag: DeliveryTag,
    pub message: AmqpMessage,
}

/// Opens connections to the messaging backbone.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Connect and open an AMQP connection.
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn AmqpConnection>>;
}

/// An open AMQP connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Create (but do not attach) a sender link targeting `address`.
    fn sender(&self, address: &str, options: LinkOptions) -> Box<dyn SenderLink>;

    /// Create (but do not attach) a receiver link sourcing from `address`.
    fn receiver(&self, address: &str, options: LinkOptions) -> Box<dyn ReceiverLink>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

/// A sender link.
#[async_trait]
pub trait SenderLink: Send {
    /// Attach the link; resolves once the peer has answered the ATTACH.
    async fn attach(&mut self) -> Result<()>;

    /// Send a message; resolves with the remote delivery outcome.
    async fn send(&mut self, message: AmqpMessage) -> Result<()>;

    /// Detach the link.
    async fn detach(&mut self) -> Result<()>;
}

/// A receiver link.
#[async_trait]
pub trait ReceiverLink: Send {
    /// Attach the link; resolves once the peer has answered the ATTACH.
    async fn attach(&mut self) -> Result<()>;

    /// Next inbound delivery, or `None` when the link has ended.
    ///
    /// Must be cancel safe: it is raced against settlement requests.
    async fn recv(&mut self) -> Result<Option<InboundDelivery>>;

    /// Settle a delivery with the accepted outcome.
    async fn accept(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Detach the link.
    async fn detach(&mut self) -> Result<()>;
}
