//! MQTT 3.1.1 packet IO.
//!
//! Framing and parsing come from `rumqttc::mqttbytes::v4`; this module adds
//! async read/write over a byte stream and the packet constructors the bridge
//! needs.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use rumqttc::mqttbytes::v4::*;

use crate::error::{Error, Result};
use crate::types::{ConnectRefusal, QoS};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a single packet.
///
/// Bytes past the packet stay in `buf` for the next call. Cancelling the
/// returned future loses no data.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok(packet) => return Ok(packet),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(Error::Protocol(e.to_string())),
            }
        }

        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Write a single packet and flush.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: Packet,
    max_size: usize,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(packet.size());
    packet
        .write(&mut buf, max_size)
        .map_err(|e| Error::Protocol(e.to_string()))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// CONNACK accepting the connection.
pub fn create_connack(session_present: bool) -> Packet {
    Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, session_present))
}

/// CONNACK refusing the connection.
pub fn create_refusal(refusal: ConnectRefusal) -> Packet {
    let code = match refusal {
        ConnectRefusal::ServerUnavailable => ConnectReturnCode::ServiceUnavailable,
        ConnectRefusal::IdentifierRejected => ConnectReturnCode::BadClientId,
    };
    Packet::ConnAck(ConnAck::new(code, false))
}

/// PUBLISH toward the client. `pkid` is ignored at QoS 0.
pub fn create_publish(
    topic: &str,
    payload: Bytes,
    qos: QoS,
    pkid: u16,
    dup: bool,
    retain: bool,
) -> Packet {
    let mut publish = Publish::new(topic, qos.into(), payload.to_vec());
    publish.dup = dup;
    publish.retain = retain;
    if qos != QoS::AtMostOnce {
        publish.pkid = pkid;
    }
    Packet::Publish(publish)
}

pub fn create_puback(pkid: u16) -> Packet {
    Packet::PubAck(PubAck::new(pkid))
}

pub fn create_suback(pkid: u16, granted: &[QoS]) -> Packet {
    let codes = granted
        .iter()
        .map(|q| SubscribeReasonCode::Success((*q).into()))
        .collect();
    Packet::SubAck(SubAck::new(pkid, codes))
}

pub fn create_unsuback(pkid: u16) -> Packet {
    Packet::UnsubAck(UnsubAck::new(pkid))
}

pub fn create_pingresp() -> Packet {
    Packet::PingResp
}

/// Allocates PUBLISH packet identifiers: 1..=65535, wrapping, never 0.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIdAllocator {
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_ids_wrap_past_zero() {
        let mut ids = PacketIdAllocator { next: u16::MAX - 1 };
        assert_eq!(ids.next_id(), u16::MAX - 1);
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[tokio::test]
    async fn test_read_packet_keeps_trailing_bytes() {
        let mut wire = Vec::new();
        for packet in [create_puback(7), create_pingresp()] {
            let mut buf = BytesMut::new();
            packet.write(&mut buf, MAX_PACKET_SIZE).unwrap();
            wire.extend_from_slice(&buf);
        }

        let mut reader = wire.as_slice();
        let mut buf = BytesMut::new();
        match read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE).await.unwrap() {
            Packet::PubAck(ack) => assert_eq!(ack.pkid, 7),
            other => panic!("unexpected packet: {:?}", other),
        }
        assert!(matches!(
            read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE).await.unwrap(),
            Packet::PingResp
        ));
        assert!(matches!(
            read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_publish_pkid_only_above_qos0() {
        match create_publish("t", Bytes::from_static(b"x"), QoS::AtMostOnce, 9, false, true) {
            Packet::Publish(p) => {
                assert_eq!(p.pkid, 0);
                assert!(p.retain);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
        match create_publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, 9, true, false) {
            Packet::Publish(p) => {
                assert_eq!(p.pkid, 9);
                assert!(p.dup);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }
}
