//! Common types for the bridge.

use bytes::Bytes;

/// MQTT Quality of Service level.
///
/// `ExactlyOnce` is accepted on the wire but the bridge never completes its
/// delivery cycle. Levels are ordered by delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged delivery).
    AtLeastOnce = 1,
    /// Exactly once delivery (assured delivery).
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse a QoS level from its numeric wire value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Numeric wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<QoS> for rumqttc::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// A topic filter with the QoS requested for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    /// Topic filter.
    pub topic: String,
    /// Requested QoS.
    pub qos: QoS,
}

impl TopicSubscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Last will carried by an MQTT CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// The parts of an MQTT CONNECT the bridge acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConnect {
    /// Client identifier.
    pub client_id: String,
    /// Clean session flag.
    pub clean_session: bool,
    /// Keep alive interval in seconds.
    pub keep_alive: u16,
    /// Optional last will.
    pub will: Option<MqttWill>,
}

impl MqttConnect {
    /// Create a CONNECT description with clean session and no will.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            will: None,
        }
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the last will.
    pub fn with_will(mut self, will: MqttWill) -> Self {
        self.will = Some(will);
        self
    }
}

/// CONNACK refusal reasons the bridge can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRefusal {
    /// Backbone or backend services unreachable.
    ServerUnavailable,
    /// Client identifier not acceptable.
    IdentifierRejected,
}

/// Inbound MQTT events delivered to a bridge session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    /// PUBLISH from the client.
    Publish {
        /// Packet identifier, present when QoS > 0.
        message_id: Option<u16>,
        qos: QoS,
        dup: bool,
        retain: bool,
        topic: String,
        payload: Bytes,
    },
    /// PUBACK for a QoS 1 delivery the bridge forwarded.
    PubAck { message_id: u16 },
    /// SUBSCRIBE with its ordered filters.
    Subscribe {
        message_id: u16,
        subscriptions: Vec<TopicSubscription>,
    },
    /// UNSUBSCRIBE with its topic filters.
    Unsubscribe { message_id: u16, topics: Vec<String> },
    /// Clean DISCONNECT.
    Disconnect,
    /// Transport went away.
    Closed,
}
