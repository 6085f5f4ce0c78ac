//! MQTT to AMQP 1.0 bridge.
//!
//! Every MQTT 3.1.1 connection becomes a [`BridgeSession`]: the session opens
//! an AMQP connection, registers the client's will and session with the Will
//! and Subscription services, and then relays publishes, subscriptions and
//! acknowledgments in both directions until the client goes away.
//!
//! ## Components
//!
//! - [`protocol`]: messages exchanged with the services and their AMQP encoding
//! - [`endpoint`]: one adapter per AMQP link (will, subscription, publish, receiver)
//! - [`BridgeSession`]: connect handshake and steady-state relaying
//! - [`Bridge`]: MQTT listener running one session per connection
//! - [`amqp`]: the transport seam plus an in-memory router
//! - [`LoopbackServices`]: in-memory Will and Subscription services
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mqtt_bridge::amqp::MemoryRouter;
//! use mqtt_bridge::{Bridge, BridgeConfig, LoopbackServices};
//!
//! #[tokio::main]
//! async fn main() -> mqtt_bridge::Result<()> {
//!     let router = MemoryRouter::new();
//!     let _services = LoopbackServices::start(&router);
//!
//!     let config = BridgeConfig::default().with_listen_addr("127.0.0.1:1883");
//!     let bridge = Bridge::new(config, Arc::new(router.connector()))?;
//!     bridge.serve().await
//! }
//! ```

pub mod amqp;
mod codec;
mod config;
pub mod endpoint;
mod error;
mod loopback;
mod mqtt;
pub mod protocol;
mod server;
mod session;
mod types;

pub use config::BridgeConfig;
pub use error::{DecodeError, Error, Result};
pub use loopback::LoopbackServices;
pub use mqtt::MqttEndpoint;
pub use server::{Bridge, BridgeBuilder};
pub use session::{BridgeSession, DEFAULT_HANDSHAKE_TIMEOUT, SessionOptions, SessionState};
pub use types::{ConnectRefusal, MqttConnect, MqttEvent, MqttWill, QoS, TopicSubscription};

#[cfg(test)]
mod tests;
