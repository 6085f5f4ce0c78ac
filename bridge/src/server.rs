//! Bridge supervisor.
//!
//! Accepts MQTT 3.1.1 connections and runs one [`BridgeSession`] per
//! connection: handshake, relay, close.
//!
//! Each connection gets a writer task fed by a channel (the session's
//! [`MqttEndpoint`]) and a reader task that turns packets into
//! [`MqttEvent`]s. PINGREQ is answered by the reader directly, and the
//! connection is dropped after 1.5 × keep-alive without a packet.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::amqp::AmqpConnector;
use crate::codec::{self, Packet, PacketIdAllocator};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::mqtt::MqttEndpoint;
use crate::session::{BridgeSession, SessionOptions};
use crate::types::{ConnectRefusal, MqttConnect, MqttEvent, MqttWill, QoS, TopicSubscription};

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Capacity of the per-connection inbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Builder for Bridge.
pub struct BridgeBuilder {
    config: BridgeConfig,
    connector: Arc<dyn AmqpConnector>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig, connector: Arc<dyn AmqpConnector>) -> Self {
        Self {
            config,
            connector,
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Called with the client id once a session is accepted.
    pub fn on_connect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Called with the client id once an accepted session has closed.
    pub fn on_disconnect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Validate the config and build the bridge.
    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;
        let session_options = self.config.session_options()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Bridge {
            config: self.config,
            session_options,
            connector: self.connector,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
        })
    }
}

/// MQTT listener bridging every connection to the AMQP services.
pub struct Bridge {
    config: BridgeConfig,
    session_options: SessionOptions,
    connector: Arc<dyn AmqpConnector>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Bridge {
    /// Create a bridge with the given config and connector.
    pub fn new(config: BridgeConfig, connector: Arc<dyn AmqpConnector>) -> Result<Self> {
        BridgeBuilder::new(config, connector).build()
    }

    /// Create a builder for this bridge.
    pub fn builder(config: BridgeConfig, connector: Arc<dyn AmqpConnector>) -> BridgeBuilder {
        BridgeBuilder::new(config, connector)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    pub async fn serve(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let result = self.accept_loop().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Stop accepting connections. Sessions already running are left to
    /// finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn accept_loop(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("Bridge listening on {}", self.config.listen_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!("Accepted connection from {}", addr);

                    let ctx = ConnectionContext {
                        connector: Arc::clone(&self.connector),
                        session_options: self.session_options.clone(),
                        on_connect: self.on_connect.clone(),
                        on_disconnect: self.on_disconnect.clone(),
                        max_packet_size: self.config.max_packet_size,
                    };

                    tokio::spawn(async move {
                        if let Err(e) = ctx.handle_connection(stream, addr).await {
                            debug!("Connection {} error: {}", addr, e);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("Bridge on {} shutting down", self.config.listen_addr);
                    return Ok(());
                }
            }
        }
    }
}

/// Everything a connection task needs, detached from the bridge.
struct ConnectionContext {
    connector: Arc<dyn AmqpConnector>,
    session_options: SessionOptions,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
    max_packet_size: usize,
}

impl ConnectionContext {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (mut reader, writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);

        let first = tokio::time::timeout(
            self.session_options.handshake_timeout,
            codec::read_packet(&mut reader, &mut read_buf, self.max_packet_size),
        )
        .await
        .map_err(|_| Error::Protocol(format!("no CONNECT from {}", addr)))??;

        let connect = match first {
            Packet::Connect(connect) => connect,
            other => {
                return Err(Error::UnexpectedPacket {
                    expected: "Connect".to_string(),
                    got: format!("{:?}", other),
                });
            }
        };

        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, packets_rx, self.max_packet_size));

        let Some(connect) = to_mqtt_connect(connect) else {
            warn!("Rejecting {}: empty client id without clean session", addr);
            let _ = packets_tx.send(codec::create_refusal(ConnectRefusal::IdentifierRejected));
            drop(packets_tx);
            let _ = writer_task.await;
            return Ok(());
        };
        let client_id = connect.client_id.clone();
        debug!(
            "Client {} connecting from {}, keep_alive={}s",
            client_id, addr, connect.keep_alive
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(read_loop(
            client_id.clone(),
            connect.keep_alive,
            reader,
            read_buf,
            self.max_packet_size,
            events_tx,
            packets_tx.clone(),
        ));

        let endpoint = TcpMqttEndpoint::new(packets_tx);
        let mut session =
            BridgeSession::new(connect, self.session_options.clone(), endpoint, events_rx);

        let result = match session.open(self.connector.as_ref()).await {
            Ok(_) => {
                if let Some(ref on_connect) = self.on_connect {
                    on_connect(&client_id);
                }
                let result = session.run().await;
                session.close().await;
                if let Some(ref on_disconnect) = self.on_disconnect {
                    on_disconnect(&client_id);
                }
                info!("Client {} disconnected", client_id);
                result
            }
            Err(e) => Err(e),
        };

        reader_task.abort();
        drop(session);
        let _ = writer_task.await;
        result
    }
}

/// Session-side handle of one MQTT connection.
pub(crate) struct TcpMqttEndpoint {
    packets: mpsc::UnboundedSender<Packet>,
    packet_ids: PacketIdAllocator,
}

impl TcpMqttEndpoint {
    pub(crate) fn new(packets: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            packets,
            packet_ids: PacketIdAllocator::default(),
        }
    }

    fn send(&self, packet: Packet) -> bool {
        self.packets.send(packet).is_ok()
    }
}

impl MqttEndpoint for TcpMqttEndpoint {
    fn accept(&mut self, session_present: bool) {
        self.send(codec::create_connack(session_present));
    }

    fn reject(&mut self, refusal: ConnectRefusal) {
        self.send(codec::create_refusal(refusal));
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        dup: bool,
        retain: bool,
    ) -> Option<u16> {
        let pkid = match qos {
            QoS::AtMostOnce => 0,
            _ => self.packet_ids.next_id(),
        };
        if !self.send(codec::create_publish(topic, payload, qos, pkid, dup, retain)) {
            return None;
        }
        (pkid != 0).then_some(pkid)
    }

    fn publish_acknowledge(&mut self, message_id: u16) {
        self.send(codec::create_puback(message_id));
    }

    fn subscribe_acknowledge(&mut self, message_id: u16, granted: Vec<QoS>) {
        self.send(codec::create_suback(message_id, &granted));
    }

    fn unsubscribe_acknowledge(&mut self, message_id: u16) {
        self.send(codec::create_unsuback(message_id));
    }
}

/// Assign a client id when allowed. `None` means the CONNECT must be refused.
fn to_mqtt_connect(connect: codec::Connect) -> Option<MqttConnect> {
    let client_id = if connect.client_id.is_empty() {
        if !connect.clean_session {
            return None;
        }
        uuid::Uuid::new_v4().to_string()
    } else {
        connect.client_id
    };

    let mut mqtt_connect = MqttConnect::new(client_id)
        .with_clean_session(connect.clean_session)
        .with_keep_alive(connect.keep_alive);
    if let Some(will) = connect.last_will {
        mqtt_connect = mqtt_connect.with_will(MqttWill {
            topic: will.topic,
            payload: will.message,
            qos: will.qos.into(),
            retain: will.retain,
        });
    }
    Some(mqtt_connect)
}

async fn write_loop(
    mut writer: WriteHalf<TcpStream>,
    mut packets: mpsc::UnboundedReceiver<Packet>,
    max_packet_size: usize,
) {
    while let Some(packet) = packets.recv().await {
        if let Err(e) = codec::write_packet(&mut writer, packet, max_packet_size).await {
            debug!("write failed: {}", e);
            return;
        }
    }
}

/// 1.5 × keep-alive without a packet drops the client; 0 disables it.
fn keep_alive_timeout(keep_alive: u16) -> Option<Duration> {
    (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500))
}

async fn read_loop(
    client_id: String,
    keep_alive: u16,
    mut reader: ReadHalf<TcpStream>,
    mut read_buf: BytesMut,
    max_packet_size: usize,
    events: mpsc::Sender<MqttEvent>,
    packets: mpsc::UnboundedSender<Packet>,
) {
    let timeout_duration = keep_alive_timeout(keep_alive);

    loop {
        let read = codec::read_packet(&mut reader, &mut read_buf, max_packet_size);
        let result = match timeout_duration {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Client {} keep-alive timeout ({}s), disconnecting", client_id, keep_alive);
                    break;
                }
            },
            None => read.await,
        };

        let packet = match result {
            Ok(packet) => packet,
            Err(Error::ConnectionClosed) => break,
            Err(e) => {
                debug!("Client {} read error: {}", client_id, e);
                break;
            }
        };

        let event = match packet {
            Packet::Publish(publish) => {
                let qos = QoS::from(publish.qos);
                MqttEvent::Publish {
                    message_id: (qos != QoS::AtMostOnce).then_some(publish.pkid),
                    qos,
                    dup: publish.dup,
                    retain: publish.retain,
                    topic: publish.topic.to_string(),
                    payload: publish.payload,
                }
            }
            Packet::PubAck(ack) => MqttEvent::PubAck {
                message_id: ack.pkid,
            },
            Packet::Subscribe(subscribe) => MqttEvent::Subscribe {
                message_id: subscribe.pkid,
                subscriptions: subscribe
                    .filters
                    .into_iter()
                    .map(|f| TopicSubscription::new(f.path, f.qos.into()))
                    .collect(),
            },
            Packet::Unsubscribe(unsubscribe) => MqttEvent::Unsubscribe {
                message_id: unsubscribe.pkid,
                topics: unsubscribe.topics,
            },
            Packet::PingReq => {
                let _ = packets.send(codec::create_pingresp());
                continue;
            }
            Packet::Disconnect => {
                let _ = events.send(MqttEvent::Disconnect).await;
                break;
            }
            other => {
                trace!("Ignoring packet from {}: {:?}", client_id, other);
                continue;
            }
        };

        if events.send(event).await.is_err() {
            return;
        }
    }

    let _ = events.send(MqttEvent::Closed).await;
}
