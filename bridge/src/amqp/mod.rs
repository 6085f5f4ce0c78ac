//! AMQP 1.0 side of the bridge.
//!
//! - [`message`]: the application message model
//! - [`transport`]: connector/connection/link traits the bridge drives
//! - [`memory`]: an in-memory router implementing those traits

pub mod memory;
pub mod message;
pub mod transport;

pub use memory::{MemoryConnector, MemoryListener, MemoryRouter, RoutedMessage};
pub use message::{AmqpMessage, AmqpValue, Body, MessageId};
pub use transport::{
    AmqpConnection, AmqpConnector, ConnectionOptions, DeliveryTag, InboundDelivery, LinkOptions,
    ReceiverLink, SenderLink,
};
