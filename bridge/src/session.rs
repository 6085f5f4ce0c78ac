//! Bridge session: one MQTT connection mapped onto the AMQP services.
//!
//! A session owns its AMQP connection and every endpoint opened on it. It is
//! driven by a single task; link tasks and handlers only post
//! [`SessionEvent`]s back onto the session's channel, so no state here is
//! shared.
//!
//! ## Connect handshake
//!
//! 1. Open the AMQP connection (heartbeat = keep-alive).
//! 2. Arm the deadline, then attach the receiver, Will and Subscription links.
//! 3. Send the Will, if any, and wait for its delivery outcome.
//! 4. Send Session and wait for SessionPresent.
//!
//! Every receive handler is registered before the links attach, but Suback,
//! Unsuback and Publish stay gated until SessionPresent is dispatched.
//!
//! Any failure, or the deadline firing first, rejects the connection with
//! "server unavailable" and releases everything. Success accepts the
//! connection with the session-present flag.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all, try_join3};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::amqp::{AmqpConnection, AmqpConnector, ConnectionOptions, DeliveryTag};
use crate::endpoint::{
    Completion, PublishEndpoint, RESERVED_ADDRESS_PREFIX, ReceiverEndpoint, SubscriptionEndpoint,
    WillEndpoint, client_address,
};
use crate::error::{Error, Result};
use crate::mqtt::MqttEndpoint;
use crate::protocol::{Publish, Session, Subscribe, Suback, Unsuback, Unsubscribe, Will};
use crate::types::{ConnectRefusal, MqttConnect, MqttEvent, QoS};

/// Default deadline for the connect handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Where and how a session reaches the messaging backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub container_id: String,
    pub handshake_timeout: Duration,
}

impl SessionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            container_id: "mqtt-bridge".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Lifecycle of a session. No transition leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Events posted to the session by link tasks and receive handlers.
#[derive(Debug)]
enum SessionEvent {
    WillSent(Result<()>),
    SessionSent(Result<()>),
    SessionPresent(bool),
    Suback(Suback),
    Unsuback(Unsuback),
    AmqpPublish(Publish, DeliveryTag),
    Published {
        message_id: Option<u16>,
        qos: QoS,
        topic: String,
        result: Result<()>,
    },
    PublishAttached {
        topic: String,
        result: Result<()>,
    },
    WillCleared(Result<()>),
}

/// Bridges one MQTT connection to the AMQP services.
pub struct BridgeSession<M: MqttEndpoint> {
    connect: MqttConnect,
    options: SessionOptions,
    mqtt: M,
    mqtt_events: mpsc::Receiver<MqttEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state: SessionState,
    connection: Option<Arc<dyn AmqpConnection>>,
    receiver: Option<ReceiverEndpoint>,
    will: Option<WillEndpoint>,
    subscription: Option<SubscriptionEndpoint>,
    publishers: HashMap<String, PublishEndpoint>,
}

impl<M: MqttEndpoint> BridgeSession<M> {
    /// Create a session for an accepted CONNECT. `mqtt_events` carries
    /// everything the client sends after it.
    pub fn new(
        connect: MqttConnect,
        options: SessionOptions,
        mqtt: M,
        mqtt_events: mpsc::Receiver<MqttEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connect,
            options,
            mqtt,
            mqtt_events,
            events_tx,
            events_rx,
            state: SessionState::Connecting,
            connection: None,
            receiver: None,
            will: None,
            subscription: None,
            publishers: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.connect.client_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The MQTT endpoint the session writes to.
    pub fn mqtt(&self) -> &M {
        &self.mqtt
    }

    /// Topics that currently have a publish endpoint.
    pub fn publish_topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.publishers.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// Run the connect handshake and answer the CONNECT.
    ///
    /// Returns the session-present flag sent in CONNACK. On failure the
    /// client has been refused and the session is `Closed`.
    pub async fn open(&mut self, connector: &dyn AmqpConnector) -> Result<bool> {
        if self.state != SessionState::Connecting {
            return Err(Error::SessionClosed);
        }

        match self.handshake(connector).await {
            Ok(session_present) => {
                self.mqtt.accept(session_present);
                self.state = SessionState::Active;
                info!(
                    client_id = %self.connect.client_id,
                    session_present,
                    "connection accepted"
                );
                Ok(session_present)
            }
            Err(e) => {
                error!(client_id = %self.connect.client_id, "connect handshake failed: {}", e);
                self.mqtt.reject(ConnectRefusal::ServerUnavailable);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, connector: &dyn AmqpConnector) -> Result<bool> {
        let client_id = self.connect.client_id.clone();
        let heartbeat = Duration::from_millis(u64::from(self.connect.keep_alive) * 1000);
        let options = ConnectionOptions::new(self.options.host.clone(), self.options.port)
            .with_container_id(self.options.container_id.clone())
            .with_heartbeat(heartbeat);

        let connection = connector.connect(&options).await?;
        self.connection = Some(Arc::clone(&connection));
        debug!(client_id = %client_id, "amqp connection open, heartbeat {:?}", heartbeat);

        let timeout = self.options.handshake_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let receiver = self.receiver.insert(ReceiverEndpoint::new(
            connection.as_ref(),
            &client_address(&client_id),
        ));
        let will = self.will.insert(WillEndpoint::new(connection.as_ref(), &client_id));
        let subscription = self
            .subscription
            .insert(SubscriptionEndpoint::new(connection.as_ref()));

        let events = self.events_tx.clone();
        receiver.on_session_present(move |m| {
            let _ = events.send(SessionEvent::SessionPresent(m.session_present));
        });
        receiver.gate_on_session_present();
        let events = self.events_tx.clone();
        receiver.on_suback(move |m| {
            let _ = events.send(SessionEvent::Suback(m));
        });
        let events = self.events_tx.clone();
        receiver.on_unsuback(move |m| {
            let _ = events.send(SessionEvent::Unsuback(m));
        });
        let events = self.events_tx.clone();
        receiver.on_publish(move |m, tag| {
            let _ = events.send(SessionEvent::AmqpPublish(m, tag));
        });

        tokio::select! {
            opened = try_join3(receiver.open(), will.open(), subscription.open()) => {
                opened?;
            }
            _ = &mut deadline => return Err(Error::HandshakeTimeout(timeout)),
        }

        if let Some(ref mqtt_will) = self.connect.will {
            let events = self.events_tx.clone();
            will.send_will(
                &Will::from(mqtt_will),
                Some(Box::new(move |result| {
                    let _ = events.send(SessionEvent::WillSent(result));
                })),
            );

            loop {
                let event = tokio::select! {
                    event = self.events_rx.recv() => event,
                    _ = &mut deadline => return Err(Error::HandshakeTimeout(timeout)),
                };
                match event {
                    Some(SessionEvent::WillSent(result)) => {
                        result?;
                        debug!(client_id = %client_id, "will registered");
                        break;
                    }
                    Some(other) => trace!("ignoring {:?} while registering will", other),
                    None => return Err(Error::SessionClosed),
                }
            }
        }

        let session = Session {
            clean_session: self.connect.clean_session,
            client_id: client_id.clone(),
        };
        let events = self.events_tx.clone();
        subscription.send_session(
            &session,
            Some(Box::new(move |result| {
                let _ = events.send(SessionEvent::SessionSent(result));
            })),
        );

        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                _ = &mut deadline => return Err(Error::HandshakeTimeout(timeout)),
            };
            match event {
                Some(SessionEvent::SessionPresent(session_present)) => return Ok(session_present),
                Some(SessionEvent::SessionSent(Ok(()))) => {
                    debug!(client_id = %client_id, "session registered");
                }
                Some(SessionEvent::SessionSent(Err(e))) => return Err(e),
                Some(other) => trace!("ignoring {:?} while awaiting session-present", other),
                None => return Err(Error::SessionClosed),
            }
        }
    }

    /// Relay traffic in both directions until the MQTT transport closes.
    pub async fn run(&mut self) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(Error::SessionClosed);
        }

        loop {
            tokio::select! {
                event = self.mqtt_events.recv() => {
                    let event = event.unwrap_or(MqttEvent::Closed);
                    if !self.handle_mqtt_event(event).await {
                        return Ok(());
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_session_event(event).await;
                }
            }
        }
    }

    /// Returns false once the transport has closed.
    async fn handle_mqtt_event(&mut self, event: MqttEvent) -> bool {
        match event {
            MqttEvent::Publish {
                message_id,
                qos,
                dup,
                retain,
                topic,
                payload,
            } => {
                self.publish_to_amqp(Publish {
                    message_id,
                    qos,
                    dup,
                    retain,
                    topic,
                    payload,
                });
            }
            MqttEvent::PubAck { message_id } => {
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.settle(message_id);
                }
            }
            MqttEvent::Subscribe {
                message_id,
                subscriptions,
            } => {
                debug!(
                    client_id = %self.connect.client_id,
                    "subscribe {} with {} filters", message_id, subscriptions.len()
                );
                let subscribe = Subscribe {
                    client_id: self.connect.client_id.clone(),
                    message_id,
                    subscriptions,
                };
                if let Some(ref subscription) = self.subscription {
                    subscription.send_subscribe(&subscribe, Some(log_failure("subscribe")));
                }
            }
            MqttEvent::Unsubscribe { message_id, topics } => {
                debug!(
                    client_id = %self.connect.client_id,
                    "unsubscribe {} from {:?}", message_id, topics
                );
                let unsubscribe = Unsubscribe {
                    client_id: self.connect.client_id.clone(),
                    message_id,
                    topics,
                };
                if let Some(ref subscription) = self.subscription {
                    subscription.send_unsubscribe(&unsubscribe, Some(log_failure("unsubscribe")));
                }
            }
            MqttEvent::Disconnect => {
                info!(client_id = %self.connect.client_id, "disconnect, clearing will");
                if let Some(ref will) = self.will {
                    let events = self.events_tx.clone();
                    will.clear_will(Some(Box::new(move |result| {
                        let _ = events.send(SessionEvent::WillCleared(result));
                    })));
                }
            }
            MqttEvent::Closed => {
                debug!(client_id = %self.connect.client_id, "mqtt transport closed");
                if let Some(will) = self.will.as_mut() {
                    will.close().await;
                }
                return false;
            }
        }
        true
    }

    fn publish_to_amqp(&mut self, publish: Publish) {
        if publish.topic.starts_with(RESERVED_ADDRESS_PREFIX) {
            warn!(
                client_id = %self.connect.client_id,
                "refusing publish to reserved address {}", publish.topic
            );
            return;
        }
        if publish.qos == QoS::ExactlyOnce {
            warn!(
                client_id = %self.connect.client_id,
                topic = %publish.topic,
                "{}", Error::TranslationGap(publish.qos)
            );
        }

        let Some(connection) = self.connection.clone() else {
            return;
        };

        let endpoint = match self.publishers.entry(publish.topic.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut endpoint = PublishEndpoint::new(connection.as_ref(), &publish.topic);
                let events = self.events_tx.clone();
                let topic = publish.topic.clone();
                endpoint.open_in_background(Some(Box::new(move |result| {
                    let _ = events.send(SessionEvent::PublishAttached { topic, result });
                })));
                entry.insert(endpoint)
            }
        };

        let events = self.events_tx.clone();
        let (message_id, qos, topic) = (publish.message_id, publish.qos, publish.topic.clone());
        endpoint.send_publish(
            &publish,
            Some(Box::new(move |result| {
                let _ = events.send(SessionEvent::Published {
                    message_id,
                    qos,
                    topic,
                    result,
                });
            })),
        );
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Published {
                message_id,
                qos,
                topic,
                result,
            } => match result {
                Ok(()) => {
                    if let (QoS::AtLeastOnce, Some(id)) = (qos, message_id) {
                        self.mqtt.publish_acknowledge(id);
                    }
                }
                Err(e) => warn!(
                    client_id = %self.connect.client_id,
                    "publish to {} failed, ack withheld: {}", topic, e
                ),
            },
            SessionEvent::Suback(suback) => {
                self.mqtt
                    .subscribe_acknowledge(suback.message_id, suback.granted_qos);
            }
            SessionEvent::Unsuback(unsuback) => {
                self.mqtt.unsubscribe_acknowledge(unsuback.message_id);
            }
            SessionEvent::AmqpPublish(publish, tag) => {
                debug!(
                    client_id = %self.connect.client_id,
                    "relaying publish on {} to client", publish.topic
                );
                let id = self.mqtt.publish(
                    &publish.topic,
                    publish.payload,
                    QoS::AtLeastOnce,
                    publish.dup,
                    publish.retain,
                );
                match (id, self.receiver.as_mut()) {
                    (Some(id), Some(receiver)) => receiver.track(id, tag),
                    _ => warn!(
                        client_id = %self.connect.client_id,
                        "cannot relay publish on {}, left unsettled", publish.topic
                    ),
                }
            }
            SessionEvent::PublishAttached { topic, result } => match result {
                Ok(()) => {
                    debug!(client_id = %self.connect.client_id, "publish link to {} open", topic);
                }
                Err(e) => {
                    warn!(
                        client_id = %self.connect.client_id,
                        "cannot open publish link to {}: {}", topic, e
                    );
                    // the next publish on this topic attaches a fresh link
                    if let Some(mut endpoint) = self.publishers.remove(&topic) {
                        endpoint.close().await;
                    }
                }
            },
            SessionEvent::WillCleared(result) => {
                if let Err(e) = result {
                    warn!(client_id = %self.connect.client_id, "will clear failed: {}", e);
                }
                if let Some(will) = self.will.as_mut() {
                    will.close().await;
                }
            }
            other => trace!("ignoring late handshake event {:?}", other),
        }
    }

    /// Release every endpoint, then the AMQP connection. Idempotent.
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        let mut closes: Vec<BoxFuture<'_, ()>> = Vec::new();
        if let Some(will) = self.will.as_mut() {
            closes.push(will.close().boxed());
        }
        if let Some(subscription) = self.subscription.as_mut() {
            closes.push(subscription.close().boxed());
        }
        if let Some(receiver) = self.receiver.as_mut() {
            closes.push(receiver.close().boxed());
        }
        for endpoint in self.publishers.values_mut() {
            closes.push(endpoint.close().boxed());
        }
        join_all(closes).await;

        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(client_id = %self.connect.client_id, "amqp connection close failed: {}", e);
            }
        }

        self.state = SessionState::Closed;
        debug!(client_id = %self.connect.client_id, "session closed");
    }
}

fn log_failure(what: &'static str) -> Completion {
    Box::new(move |result| {
        if let Err(e) = result {
            warn!("{} send failed: {}", what, e);
        }
    })
}
