//! Error types for the bridge.

use std::io;
use std::time::Duration;

use crate::types::QoS;

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// AMQP connection or link failure.
    #[error("amqp transport error: {0}")]
    Transport(String),

    /// The connect handshake did not complete before its deadline.
    #[error("timeout on connecting to amqp services after {0:?}")]
    HandshakeTimeout(Duration),

    /// Malformed inbound protocol message.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Requested delivery semantics the bridge cannot complete.
    #[error("translation gap: {0:?} delivery is not supported")]
    TranslationGap(QoS),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// MQTT protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Operation on a session that is closing or closed.
    #[error("session closed")]
    SessionClosed,

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Bridge is already running.
    #[error("bridge already running")]
    AlreadyRunning,
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Failure to decode an AMQP application message into a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Message carries no subject.
    #[error("missing subject")]
    MissingSubject,

    /// Subject is not one of the known message kinds for this direction.
    #[error("unexpected subject: {0}")]
    UnexpectedSubject(String),

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong type or an out-of-range value.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl DecodeError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
