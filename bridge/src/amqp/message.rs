//! AMQP application message model.
//!
//! Only the sections the bridge reads or writes are modelled: properties
//! (message-id, correlation-id, to, subject), message annotations and the body.

use std::collections::BTreeMap;

use bytes::Bytes;

/// AMQP message-id / correlation-id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Ulong(u64),
    String(String),
}

/// Subset of the AMQP type system carried in annotations and value bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmqpValue {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ulong(u64),
    String(String),
    Binary(Bytes),
    List(Vec<AmqpValue>),
    /// Ordered map; AMQP maps preserve encoding order.
    Map(Vec<(AmqpValue, AmqpValue)>),
}

impl AmqpValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmqpValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AmqpValue::Ubyte(v) => Some(u64::from(*v)),
            AmqpValue::Ulong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmqpValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for AmqpValue {
    fn from(v: bool) -> Self {
        AmqpValue::Bool(v)
    }
}

impl From<u8> for AmqpValue {
    fn from(v: u8) -> Self {
        AmqpValue::Ubyte(v)
    }
}

impl From<&str> for AmqpValue {
    fn from(v: &str) -> Self {
        AmqpValue::String(v.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(v: String) -> Self {
        AmqpValue::String(v)
    }
}

/// AMQP message body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Single data section.
    Data(Bytes),
    /// Single amqp-value section.
    Value(AmqpValue),
}

/// An AMQP application message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AmqpMessage {
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<MessageId>,
    /// The `to` property.
    pub address: Option<String>,
    pub subject: Option<String>,
    pub annotations: BTreeMap<String, AmqpValue>,
    pub body: Body,
}

impl AmqpMessage {
    /// Create a message with the given subject and nothing else.
    pub fn with_subject(subject: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            ..Default::default()
        }
    }

    /// Set a message annotation.
    pub fn annotate(mut self, key: &str, value: impl Into<AmqpValue>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    /// Look up a message annotation.
    pub fn annotation(&self, key: &str) -> Option<&AmqpValue> {
        self.annotations.get(key)
    }
}
