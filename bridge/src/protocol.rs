//! Protocol messages exchanged with the Will and Subscription services.
//!
//! Every message is an AMQP application message identified by its `subject`.
//! Flags travel as message annotations, MQTT packet identifiers as
//! message-id (requests) or correlation-id (replies), and payloads as a single
//! data section.
//!
//! | Message | Direction | Carries |
//! |---------|-----------|---------|
//! | [`Will`] | to Will Service | topic, QoS, retain, payload |
//! | [`WillClear`] | to Will Service | nothing |
//! | [`Session`] | to Subscription Service | clean session, client id |
//! | [`SessionPresent`] | from Subscription Service | session present flag |
//! | [`Subscribe`] | to Subscription Service | client id, id, ordered filters |
//! | [`Suback`] | from Subscription Service | id, granted QoS per filter |
//! | [`Unsubscribe`] | to Subscription Service | client id, id, topics |
//! | [`Unsuback`] | from Subscription Service | id |
//! | [`Publish`] | both | id (QoS > 0), QoS, dup, retain, topic, payload |

use bytes::Bytes;

use crate::amqp::{AmqpMessage, AmqpValue, Body, MessageId};
use crate::error::DecodeError;
use crate::types::{MqttWill, QoS, TopicSubscription};

pub const SUBJECT_WILL: &str = "will";
pub const SUBJECT_WILL_CLEAR: &str = "will-clear";
pub const SUBJECT_SESSION: &str = "session";
pub const SUBJECT_SESSION_PRESENT: &str = "session-present";
pub const SUBJECT_SUBSCRIBE: &str = "subscribe";
pub const SUBJECT_SUBACK: &str = "suback";
pub const SUBJECT_UNSUBSCRIBE: &str = "unsubscribe";
pub const SUBJECT_UNSUBACK: &str = "unsuback";
pub const SUBJECT_PUBLISH: &str = "publish";

pub const ANNOTATION_RETAIN: &str = "x-opt-retain";
pub const ANNOTATION_QOS: &str = "x-opt-qos";
pub const ANNOTATION_DUP: &str = "x-opt-dup";
pub const ANNOTATION_CLEAN_SESSION: &str = "x-opt-clean-session";
pub const ANNOTATION_CLIENT_ID: &str = "x-opt-client-id";
pub const ANNOTATION_SESSION_PRESENT: &str = "x-opt-session-present";

/// Last will registered with the Will Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub retain: bool,
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

impl From<&MqttWill> for Will {
    fn from(will: &MqttWill) -> Self {
        Self {
            retain: will.retain,
            topic: will.topic.clone(),
            qos: will.qos,
            payload: will.payload.clone(),
        }
    }
}

impl Will {
    pub fn encode(&self) -> AmqpMessage {
        let mut msg = AmqpMessage::with_subject(SUBJECT_WILL)
            .annotate(ANNOTATION_RETAIN, self.retain)
            .annotate(ANNOTATION_QOS, self.qos.as_u8());
        msg.address = Some(self.topic.clone());
        msg.body = Body::Data(self.payload.clone());
        msg
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_WILL)?;
        Ok(Self {
            retain: bool_annotation(msg, ANNOTATION_RETAIN)?,
            topic: address(msg)?,
            qos: qos_annotation(msg)?,
            payload: data_body(msg)?,
        })
    }
}

/// Clears the will registered under the sending link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WillClear;

impl WillClear {
    pub fn encode(&self) -> AmqpMessage {
        AmqpMessage::with_subject(SUBJECT_WILL_CLEAR)
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_WILL_CLEAR)?;
        Ok(WillClear)
    }
}

/// Session registration sent on every connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub clean_session: bool,
    pub client_id: String,
}

impl Session {
    pub fn encode(&self) -> AmqpMessage {
        AmqpMessage::with_subject(SUBJECT_SESSION)
            .annotate(ANNOTATION_CLEAN_SESSION, self.clean_session)
            .annotate(ANNOTATION_CLIENT_ID, self.client_id.as_str())
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_SESSION)?;
        Ok(Self {
            clean_session: bool_annotation(msg, ANNOTATION_CLEAN_SESSION)?,
            client_id: string_annotation(msg, ANNOTATION_CLIENT_ID)?,
        })
    }
}

/// Reply to [`Session`]; its arrival completes the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPresent {
    pub session_present: bool,
}

impl SessionPresent {
    pub fn encode(&self) -> AmqpMessage {
        AmqpMessage::with_subject(SUBJECT_SESSION_PRESENT)
            .annotate(ANNOTATION_SESSION_PRESENT, self.session_present)
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_SESSION_PRESENT)?;
        Ok(Self {
            session_present: bool_annotation(msg, ANNOTATION_SESSION_PRESENT)?,
        })
    }
}

/// Subscription request. Filter order is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub client_id: String,
    pub message_id: u16,
    pub subscriptions: Vec<TopicSubscription>,
}

impl Subscribe {
    pub fn encode(&self) -> AmqpMessage {
        let filters = self
            .subscriptions
            .iter()
            .map(|s| (AmqpValue::from(s.topic.as_str()), AmqpValue::from(s.qos.as_u8())))
            .collect();

        let mut msg = AmqpMessage::with_subject(SUBJECT_SUBSCRIBE)
            .annotate(ANNOTATION_CLIENT_ID, self.client_id.as_str());
        msg.message_id = Some(MessageId::Ulong(u64::from(self.message_id)));
        msg.body = Body::Value(AmqpValue::Map(filters));
        msg
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_SUBSCRIBE)?;

        let Body::Value(AmqpValue::Map(entries)) = &msg.body else {
            return Err(DecodeError::invalid("body", "expected a map of topic filters"));
        };
        let subscriptions = entries
            .iter()
            .map(|(topic, qos)| {
                let topic = topic
                    .as_str()
                    .ok_or_else(|| DecodeError::invalid("body", "topic filter is not a string"))?;
                Ok(TopicSubscription::new(topic, qos_value(qos)?))
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(Self {
            client_id: string_annotation(msg, ANNOTATION_CLIENT_ID)?,
            message_id: packet_id(msg.message_id.as_ref(), "message-id")?,
            subscriptions,
        })
    }
}

/// Reply to [`Subscribe`], one granted QoS per requested filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub message_id: u16,
    pub granted_qos: Vec<QoS>,
}

impl Suback {
    pub fn encode(&self) -> AmqpMessage {
        let granted = self
            .granted_qos
            .iter()
            .map(|q| AmqpValue::from(q.as_u8()))
            .collect();

        let mut msg = AmqpMessage::with_subject(SUBJECT_SUBACK);
        msg.correlation_id = Some(MessageId::Ulong(u64::from(self.message_id)));
        msg.body = Body::Value(AmqpValue::List(granted));
        msg
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_SUBACK)?;

        let Body::Value(AmqpValue::List(values)) = &msg.body else {
            return Err(DecodeError::invalid("body", "expected a list of granted qos"));
        };
        let granted_qos = values
            .iter()
            .map(qos_value)
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(Self {
            message_id: packet_id(msg.correlation_id.as_ref(), "correlation-id")?,
            granted_qos,
        })
    }
}

/// Unsubscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub client_id: String,
    pub message_id: u16,
    pub topics: Vec<String>,
}

impl Unsubscribe {
    pub fn encode(&self) -> AmqpMessage {
        let topics = self
            .topics
            .iter()
            .map(|t| AmqpValue::from(t.as_str()))
            .collect();

        let mut msg = AmqpMessage::with_subject(SUBJECT_UNSUBSCRIBE)
            .annotate(ANNOTATION_CLIENT_ID, self.client_id.as_str());
        msg.message_id = Some(MessageId::Ulong(u64::from(self.message_id)));
        msg.body = Body::Value(AmqpValue::List(topics));
        msg
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_UNSUBSCRIBE)?;

        let Body::Value(AmqpValue::List(values)) = &msg.body else {
            return Err(DecodeError::invalid("body", "expected a list of topics"));
        };
        let topics = values
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DecodeError::invalid("body", "topic is not a string"))
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(Self {
            client_id: string_annotation(msg, ANNOTATION_CLIENT_ID)?,
            message_id: packet_id(msg.message_id.as_ref(), "message-id")?,
            topics,
        })
    }
}

/// Reply to [`Unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsuback {
    pub message_id: u16,
}

impl Unsuback {
    pub fn encode(&self) -> AmqpMessage {
        let mut msg = AmqpMessage::with_subject(SUBJECT_UNSUBACK);
        msg.correlation_id = Some(MessageId::Ulong(u64::from(self.message_id)));
        msg
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_UNSUBACK)?;
        Ok(Self {
            message_id: packet_id(msg.correlation_id.as_ref(), "correlation-id")?,
        })
    }
}

/// A published application message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Present only when QoS > 0.
    pub message_id: Option<u16>,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub topic: String,
    pub payload: Bytes,
}

impl Publish {
    pub fn encode(&self) -> AmqpMessage {
        let mut msg = AmqpMessage::with_subject(SUBJECT_PUBLISH)
            .annotate(ANNOTATION_RETAIN, self.retain)
            .annotate(ANNOTATION_QOS, self.qos.as_u8())
            .annotate(ANNOTATION_DUP, self.dup);
        if self.qos != QoS::AtMostOnce {
            msg.message_id = self.message_id.map(|id| MessageId::Ulong(u64::from(id)));
        }
        msg.address = Some(self.topic.clone());
        msg.body = Body::Data(self.payload.clone());
        msg
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        expect_subject(msg, SUBJECT_PUBLISH)?;

        let qos = qos_annotation(msg)?;
        let message_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(packet_id(msg.message_id.as_ref(), "message-id")?),
        };

        Ok(Self {
            message_id,
            qos,
            dup: bool_annotation(msg, ANNOTATION_DUP)?,
            retain: bool_annotation(msg, ANNOTATION_RETAIN)?,
            topic: address(msg)?,
            payload: data_body(msg)?,
        })
    }
}

/// Messages the bridge sends to the services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRequest {
    Will(Will),
    WillClear(WillClear),
    Session(Session),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Publish(Publish),
}

impl ServiceRequest {
    pub fn encode(&self) -> AmqpMessage {
        match self {
            ServiceRequest::Will(m) => m.encode(),
            ServiceRequest::WillClear(m) => m.encode(),
            ServiceRequest::Session(m) => m.encode(),
            ServiceRequest::Subscribe(m) => m.encode(),
            ServiceRequest::Unsubscribe(m) => m.encode(),
            ServiceRequest::Publish(m) => m.encode(),
        }
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        match subject(msg)? {
            SUBJECT_WILL => Will::decode(msg).map(ServiceRequest::Will),
            SUBJECT_WILL_CLEAR => WillClear::decode(msg).map(ServiceRequest::WillClear),
            SUBJECT_SESSION => Session::decode(msg).map(ServiceRequest::Session),
            SUBJECT_SUBSCRIBE => Subscribe::decode(msg).map(ServiceRequest::Subscribe),
            SUBJECT_UNSUBSCRIBE => Unsubscribe::decode(msg).map(ServiceRequest::Unsubscribe),
            SUBJECT_PUBLISH => Publish::decode(msg).map(ServiceRequest::Publish),
            other => Err(DecodeError::UnexpectedSubject(other.to_string())),
        }
    }
}

/// Messages the services send to the bridge on the client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    SessionPresent(SessionPresent),
    Suback(Suback),
    Unsuback(Unsuback),
    Publish(Publish),
}

impl ServiceReply {
    pub fn encode(&self) -> AmqpMessage {
        match self {
            ServiceReply::SessionPresent(m) => m.encode(),
            ServiceReply::Suback(m) => m.encode(),
            ServiceReply::Unsuback(m) => m.encode(),
            ServiceReply::Publish(m) => m.encode(),
        }
    }

    pub fn decode(msg: &AmqpMessage) -> Result<Self, DecodeError> {
        match subject(msg)? {
            SUBJECT_SESSION_PRESENT => {
                SessionPresent::decode(msg).map(ServiceReply::SessionPresent)
            }
            SUBJECT_SUBACK => Suback::decode(msg).map(ServiceReply::Suback),
            SUBJECT_UNSUBACK => Unsuback::decode(msg).map(ServiceReply::Unsuback),
            SUBJECT_PUBLISH => Publish::decode(msg).map(ServiceReply::Publish),
            other => Err(DecodeError::UnexpectedSubject(other.to_string())),
        }
    }
}

fn subject(msg: &AmqpMessage) -> Result<&str, DecodeError> {
    msg.subject.as_deref().ok_or(DecodeError::MissingSubject)
}

fn expect_subject(msg: &AmqpMessage, expected: &str) -> Result<(), DecodeError> {
    let got = subject(msg)?;
    if got != expected {
        return Err(DecodeError::UnexpectedSubject(got.to_string()));
    }
    Ok(())
}

fn annotation<'a>(msg: &'a AmqpMessage, key: &'static str) -> Result<&'a AmqpValue, DecodeError> {
    msg.annotation(key).ok_or(DecodeError::MissingField(key))
}

fn bool_annotation(msg: &AmqpMessage, key: &'static str) -> Result<bool, DecodeError> {
    annotation(msg, key)?
        .as_bool()
        .ok_or_else(|| DecodeError::invalid(key, "expected a boolean"))
}

fn string_annotation(msg: &AmqpMessage, key: &'static str) -> Result<String, DecodeError> {
    annotation(msg, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DecodeError::invalid(key, "expected a string"))
}

fn qos_annotation(msg: &AmqpMessage) -> Result<QoS, DecodeError> {
    let value = annotation(msg, ANNOTATION_QOS)?;
    qos_value(value).map_err(|_| DecodeError::invalid(ANNOTATION_QOS, format!("{value:?} is not a qos level")))
}

fn qos_value(value: &AmqpValue) -> Result<QoS, DecodeError> {
    value
        .as_u64()
        .and_then(|v| u8::try_from(v).ok())
        .and_then(QoS::from_u8)
        .ok_or_else(|| DecodeError::invalid("qos", format!("{value:?} is not a qos level")))
}

fn packet_id(id: Option<&MessageId>, field: &'static str) -> Result<u16, DecodeError> {
    match id {
        None => Err(DecodeError::MissingField(field)),
        Some(MessageId::Ulong(v)) => {
            u16::try_from(*v).map_err(|_| DecodeError::invalid(field, format!("{v} out of range")))
        }
        Some(MessageId::String(s)) => Err(DecodeError::invalid(field, format!("{s:?} is not numeric"))),
    }
}

fn address(msg: &AmqpMessage) -> Result<String, DecodeError> {
    msg.address.clone().ok_or(DecodeError::MissingField("to"))
}

fn data_body(msg: &AmqpMessage) -> Result<Bytes, DecodeError> {
    match &msg.body {
        Body::Data(data) => Ok(data.clone()),
        Body::Empty => Ok(Bytes::new()),
        Body::Value(_) => Err(DecodeError::invalid("body", "expected a data section")),
    }
}
