//! MQTT-facing surface of a bridge session.
//!
//! Outbound traffic goes through [`MqttEndpoint`]; inbound traffic arrives as
//! [`MqttEvent`](crate::MqttEvent)s on a channel owned by the session.

use bytes::Bytes;

use crate::types::{ConnectRefusal, QoS};

/// Outbound side of one MQTT connection.
///
/// Calls never block: implementations queue the packet toward the client.
pub trait MqttEndpoint: Send {
    /// Send CONNACK accepted.
    fn accept(&mut self, session_present: bool);

    /// Send CONNACK refused.
    fn reject(&mut self, refusal: ConnectRefusal);

    /// Send a PUBLISH. Returns the packet identifier allocated for it when
    /// QoS > 0, or `None` if the connection can no longer be written to.
    fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS, dup: bool, retain: bool)
    -> Option<u16>;

    /// Send PUBACK.
    fn publish_acknowledge(&mut self, message_id: u16);

    /// Send SUBACK with one granted QoS per requested filter.
    fn subscribe_acknowledge(&mut self, message_id: u16, granted: Vec<QoS>);

    /// Send UNSUBACK.
    fn unsubscribe_acknowledge(&mut self, message_id: u16);
}
