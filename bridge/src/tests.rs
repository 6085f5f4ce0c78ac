//! Session and bridge tests.
//!
//! Sessions are driven against the in-memory AMQP router with a recording
//! MQTT endpoint; the bridge tests use a standard rumqttc client over TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::amqp::{AmqpMessage, MemoryListener, MemoryRouter};
use crate::endpoint::{SUBSCRIPTION_SERVICE_ENDPOINT, WILL_SERVICE_ENDPOINT, client_address};
use crate::protocol::{Publish, ServiceRequest, Session, SessionPresent, Suback};
use crate::{
    BridgeSession, ConnectRefusal, Error, LoopbackServices, MqttConnect, MqttEndpoint, MqttEvent,
    MqttWill, QoS, SessionOptions, SessionState, TopicSubscription,
};

/// What the session wrote toward the MQTT client.
#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Accepted(bool),
    Rejected(ConnectRefusal),
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        dup: bool,
        retain: bool,
        message_id: Option<u16>,
    },
    PubAck(u16),
    SubAck(u16, Vec<QoS>),
    UnsubAck(u16),
}

/// MQTT endpoint double that reports every call on a channel.
struct RecordingEndpoint {
    tx: mpsc::UnboundedSender<Sent>,
    next_id: u16,
}

impl MqttEndpoint for RecordingEndpoint {
    fn accept(&mut self, session_present: bool) {
        let _ = self.tx.send(Sent::Accepted(session_present));
    }

    fn reject(&mut self, refusal: ConnectRefusal) {
        let _ = self.tx.send(Sent::Rejected(refusal));
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        dup: bool,
        retain: bool,
    ) -> Option<u16> {
        let message_id = if qos == QoS::AtMostOnce {
            None
        } else {
            self.next_id += 1;
            Some(self.next_id)
        };
        let _ = self.tx.send(Sent::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            dup,
            retain,
            message_id,
        });
        message_id
    }

    fn publish_acknowledge(&mut self, message_id: u16) {
        let _ = self.tx.send(Sent::PubAck(message_id));
    }

    fn subscribe_acknowledge(&mut self, message_id: u16, granted: Vec<QoS>) {
        let _ = self.tx.send(Sent::SubAck(message_id, granted));
    }

    fn unsubscribe_acknowledge(&mut self, message_id: u16) {
        let _ = self.tx.send(Sent::UnsubAck(message_id));
    }
}

type TestSession = BridgeSession<RecordingEndpoint>;

/// A session plus the handles a test drives it with.
struct Client {
    session: TestSession,
    events: mpsc::Sender<MqttEvent>,
    sent: mpsc::UnboundedReceiver<Sent>,
}

fn client(connect: MqttConnect) -> Client {
    let (tx, sent) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::channel(16);
    let endpoint = RecordingEndpoint { tx, next_id: 0 };
    let session = BridgeSession::new(
        connect,
        SessionOptions::new("localhost", 5672),
        endpoint,
        events_rx,
    );
    Client {
        session,
        events,
        sent,
    }
}

async fn next_sent(sent: &mut mpsc::UnboundedReceiver<Sent>) -> Sent {
    tokio::time::timeout(Duration::from_secs(2), sent.recv())
        .await
        .expect("timed out waiting for mqtt output")
        .expect("endpoint dropped")
}

async fn next_routed(listener: &mut MemoryListener) -> AmqpMessage {
    tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("timed out waiting for amqp message")
        .expect("listener closed")
        .message
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn subjects(messages: &[AmqpMessage]) -> Vec<&str> {
    messages
        .iter()
        .map(|m| m.subject.as_deref().unwrap_or(""))
        .collect()
}

fn will(topic: &str) -> MqttWill {
    MqttWill {
        topic: topic.to_string(),
        payload: Bytes::from_static(b"offline"),
        qos: QoS::AtLeastOnce,
        retain: true,
    }
}

/// Open a session against loopback services and spawn its relay loop.
async fn active(
    router: &MemoryRouter,
    connect: MqttConnect,
) -> (
    tokio::task::JoinHandle<TestSession>,
    mpsc::Sender<MqttEvent>,
    mpsc::UnboundedReceiver<Sent>,
) {
    let Client {
        mut session,
        events,
        mut sent,
    } = client(connect);

    session.open(&router.connector()).await.unwrap();
    assert!(matches!(next_sent(&mut sent).await, Sent::Accepted(_)));

    let handle = tokio::spawn(async move {
        session.run().await.unwrap();
        session
    });
    (handle, events, sent)
}

mod handshake_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_will() {
        let router = MemoryRouter::new();
        let mut subscription_service = router.listen(SUBSCRIPTION_SERVICE_ENDPOINT);
        let mut will_service = router.listen(WILL_SERVICE_ENDPOINT);

        let Client {
            mut session,
            mut sent,
            ..
        } = client(MqttConnect::new("dev-1").with_keep_alive(30));

        let connector = router.connector();
        let (opened, ()) = tokio::join!(session.open(&connector), async {
            let msg = next_routed(&mut subscription_service).await;
            assert_eq!(
                ServiceRequest::decode(&msg).unwrap(),
                ServiceRequest::Session(Session {
                    clean_session: true,
                    client_id: "dev-1".to_string(),
                })
            );
            router.deliver(
                &client_address("dev-1"),
                SessionPresent {
                    session_present: false,
                }
                .encode(),
            );
        });

        assert!(!opened.unwrap());
        assert_eq!(session.client_id(), "dev-1");
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(next_sent(&mut sent).await, Sent::Accepted(false));

        let options = router.connection_options();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].heartbeat, Duration::from_millis(30_000));

        assert!(will_service.try_recv().is_none());
        assert!(router.sent_to(WILL_SERVICE_ENDPOINT).is_empty());

        session.close().await;
    }

    #[tokio::test]
    async fn test_will_registered_before_session() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);

        let Client {
            mut session,
            mut sent,
            ..
        } = client(MqttConnect::new("dev-1").with_will(will("devices/dev-1/status")));

        session.open(&router.connector()).await.unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::Accepted(false));

        let order: Vec<_> = router
            .sent_messages()
            .into_iter()
            .map(|m| (m.address, m.message.subject.unwrap_or_default()))
            .collect();
        assert_eq!(
            order,
            vec![
                (WILL_SERVICE_ENDPOINT.to_string(), "will".to_string()),
                (SUBSCRIPTION_SERVICE_ENDPOINT.to_string(), "session".to_string()),
            ]
        );

        let will_links: Vec<_> = router
            .sent_messages()
            .into_iter()
            .filter(|m| m.address == WILL_SERVICE_ENDPOINT)
            .map(|m| m.link_name)
            .collect();
        assert_eq!(will_links, vec!["dev-1".to_string()]);

        session.close().await;
    }

    #[tokio::test]
    async fn test_session_present_flag_forwarded() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);

        for expected in [false, true] {
            let Client {
                mut session,
                mut sent,
                ..
            } = client(MqttConnect::new("dev-1").with_clean_session(false));

            assert_eq!(session.open(&router.connector()).await.unwrap(), expected);
            assert_eq!(next_sent(&mut sent).await, Sent::Accepted(expected));
            session.close().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let router = MemoryRouter::new();
        // swallows Session without replying
        let _subscription_service = router.listen(SUBSCRIPTION_SERVICE_ENDPOINT);

        let Client {
            mut session,
            mut sent,
            ..
        } = client(MqttConnect::new("dev-1"));

        let started = tokio::time::Instant::now();
        let result = session.open(&router.connector()).await;
        assert!(matches!(result, Err(Error::HandshakeTimeout(t)) if t == Duration::from_millis(5000)));
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            next_sent(&mut sent).await,
            Sent::Rejected(ConnectRefusal::ServerUnavailable)
        );

        // a late reply reaches no handler
        router.deliver(
            &client_address("dev-1"),
            Suback {
                message_id: 1,
                granted_qos: vec![QoS::AtLeastOnce],
            }
            .encode(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent.try_recv().is_err());

        assert_eq!(router.detach_count(WILL_SERVICE_ENDPOINT), 1);
        assert_eq!(router.detach_count(SUBSCRIPTION_SERVICE_ENDPOINT), 1);
        assert_eq!(router.detach_count(&client_address("dev-1")), 1);
        assert_eq!(router.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_backbone_unavailable() {
        let router = MemoryRouter::new();
        let Client {
            mut session,
            mut sent,
            ..
        } = client(MqttConnect::new("dev-1"));

        let result = session.open(&router.unavailable_connector()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(
            next_sent(&mut sent).await,
            Sent::Rejected(ConnectRefusal::ServerUnavailable)
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert!(router.connection_options().is_empty());
    }

    #[tokio::test]
    async fn test_will_rejection_fails_handshake() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        router.reject(WILL_SERVICE_ENDPOINT);

        let Client {
            mut session,
            mut sent,
            ..
        } = client(MqttConnect::new("dev-1").with_will(will("devices/dev-1/status")));

        assert!(matches!(
            session.open(&router.connector()).await,
            Err(Error::Transport(_))
        ));
        assert_eq!(
            next_sent(&mut sent).await,
            Sent::Rejected(ConnectRefusal::ServerUnavailable)
        );
        assert!(router.sent_to(SUBSCRIPTION_SERVICE_ENDPOINT).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_rejection_fails_before_deadline() {
        let router = MemoryRouter::new();
        router.reject(SUBSCRIPTION_SERVICE_ENDPOINT);

        let Client {
            mut session,
            mut sent,
            ..
        } = client(MqttConnect::new("dev-1"));

        let started = tokio::time::Instant::now();
        assert!(matches!(
            session.open(&router.connector()).await,
            Err(Error::Transport(_))
        ));
        assert!(started.elapsed() < Duration::from_millis(5000));
        assert_eq!(
            next_sent(&mut sent).await,
            Sent::Rejected(ConnectRefusal::ServerUnavailable)
        );
    }

    #[tokio::test]
    async fn test_publish_right_after_session_present_relayed() {
        let router = MemoryRouter::new();
        let mut subscription_service = router.listen(SUBSCRIPTION_SERVICE_ENDPOINT);

        let Client {
            mut session,
            events,
            mut sent,
        } = client(MqttConnect::new("dev-1").with_clean_session(false));

        let address = client_address("dev-1");
        let connector = router.connector();
        let (opened, ()) = tokio::join!(session.open(&connector), async {
            next_routed(&mut subscription_service).await;
            router.deliver(
                &address,
                SessionPresent {
                    session_present: true,
                }
                .encode(),
            );
            router.deliver(
                &address,
                Publish {
                    message_id: Some(7),
                    qos: QoS::AtLeastOnce,
                    dup: false,
                    retain: false,
                    topic: "devices/dev-1/queued".to_string(),
                    payload: Bytes::from_static(b"queued"),
                }
                .encode(),
            );
        });
        assert!(opened.unwrap());
        assert_eq!(next_sent(&mut sent).await, Sent::Accepted(true));

        let handle = tokio::spawn(async move {
            session.run().await.unwrap();
            session
        });
        assert_eq!(
            next_sent(&mut sent).await,
            Sent::Publish {
                topic: "devices/dev-1/queued".to_string(),
                payload: Bytes::from_static(b"queued"),
                qos: QoS::AtLeastOnce,
                dup: false,
                retain: false,
                message_id: Some(1),
            }
        );
        // only session-present is settled until the client acknowledges
        assert_eq!(router.accepted(&address).len(), 1);

        events
            .send(MqttEvent::PubAck { message_id: 1 })
            .await
            .unwrap();
        wait_until(|| router.accepted(&address).len() == 2).await;

        events.send(MqttEvent::Closed).await.unwrap();
        handle.await.unwrap().close().await;
    }

    #[tokio::test]
    async fn test_open_and_run_after_close() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);

        let Client { mut session, .. } = client(MqttConnect::new("dev-1"));
        assert!(matches!(session.run().await, Err(Error::SessionClosed)));

        session.open(&router.connector()).await.unwrap();
        session.close().await;
        assert!(matches!(
            session.open(&router.connector()).await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(session.run().await, Err(Error::SessionClosed)));
    }
}

mod relay_tests {
    use super::*;

    fn mqtt_publish(topic: &str, qos: QoS, message_id: Option<u16>) -> MqttEvent {
        MqttEvent::Publish {
            message_id,
            qos,
            dup: false,
            retain: false,
            topic: topic.to_string(),
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[tokio::test]
    async fn test_publish_endpoint_reused_per_topic() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(mqtt_publish("sensors/temp", QoS::AtLeastOnce, Some(1)))
            .await
            .unwrap();
        events
            .send(mqtt_publish("sensors/temp", QoS::AtLeastOnce, Some(2)))
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(1));
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(2));

        events.send(MqttEvent::Closed).await.unwrap();
        let mut session = handle.await.unwrap();
        assert_eq!(session.publish_topics(), vec!["sensors/temp"]);

        let links: Vec<_> = router
            .sent_messages()
            .into_iter()
            .filter(|m| m.address == "sensors/temp")
            .map(|m| m.link_name)
            .collect();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0], links[1]);

        session.close().await;
        assert_eq!(router.detach_count("sensors/temp"), 1);
    }

    #[tokio::test]
    async fn test_puback_only_for_at_least_once() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(mqtt_publish("a", QoS::AtMostOnce, None))
            .await
            .unwrap();
        events
            .send(mqtt_publish("b", QoS::ExactlyOnce, Some(8)))
            .await
            .unwrap();
        events
            .send(mqtt_publish("a", QoS::AtLeastOnce, Some(9)))
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(9));

        // all three were forwarded
        assert_eq!(router.sent_to("a").len(), 2);
        wait_until(|| router.sent_to("b").len() == 1).await;

        events.send(MqttEvent::Closed).await.unwrap();
        let mut session = handle.await.unwrap();
        assert_eq!(session.publish_topics(), vec!["a", "b"]);
        session.close().await;
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_delivery_withholds_puback() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        router.reject("restricted");
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(mqtt_publish("restricted", QoS::AtLeastOnce, Some(1)))
            .await
            .unwrap();
        events
            .send(mqtt_publish("open", QoS::AtLeastOnce, Some(2)))
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(2));

        events.send(MqttEvent::Closed).await.unwrap();
        let mut session = handle.await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        session.close().await;
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_attach_does_not_stall_other_topics() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        router.stall_attach("sensors/slow");
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(mqtt_publish("sensors/slow", QoS::AtLeastOnce, Some(1)))
            .await
            .unwrap();
        events
            .send(mqtt_publish("sensors/fast", QoS::AtLeastOnce, Some(2)))
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(2));

        events
            .send(MqttEvent::Unsubscribe {
                message_id: 3,
                topics: vec!["sensors/fast".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::UnsubAck(3));
        assert!(router.sent_to("sensors/slow").is_empty());

        router.release_attach("sensors/slow");
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(1));
        assert_eq!(router.sent_to("sensors/slow").len(), 1);

        events.send(MqttEvent::Closed).await.unwrap();
        handle.await.unwrap().close().await;
    }

    #[tokio::test]
    async fn test_failed_attach_drops_publish_link() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        router.refuse_attach("sensors/closed");
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(mqtt_publish("sensors/closed", QoS::AtLeastOnce, Some(1)))
            .await
            .unwrap();
        events
            .send(mqtt_publish("sensors/open", QoS::AtLeastOnce, Some(2)))
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(2));

        events.send(MqttEvent::Closed).await.unwrap();
        let mut session = handle.await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.publish_topics(), vec!["sensors/open"]);
        session.close().await;
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_to_reserved_address_refused() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(mqtt_publish(WILL_SERVICE_ENDPOINT, QoS::AtLeastOnce, Some(1)))
            .await
            .unwrap();
        events
            .send(mqtt_publish(&client_address("dev-2"), QoS::AtLeastOnce, Some(2)))
            .await
            .unwrap();
        events
            .send(mqtt_publish("sensors/temp", QoS::AtLeastOnce, Some(3)))
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(3));

        events.send(MqttEvent::Closed).await.unwrap();
        let mut session = handle.await.unwrap();
        assert_eq!(session.publish_topics(), vec!["sensors/temp"]);
        assert!(router.sent_to(WILL_SERVICE_ENDPOINT).is_empty());
        assert!(router.sent_to(&client_address("dev-2")).is_empty());
        session.close().await;
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_suback_aligns_with_subscribe() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(MqttEvent::Subscribe {
                message_id: 4,
                subscriptions: vec![
                    TopicSubscription::new("a", QoS::ExactlyOnce),
                    TopicSubscription::new("b", QoS::AtMostOnce),
                    TopicSubscription::new("c", QoS::AtLeastOnce),
                ],
            })
            .await
            .unwrap();
        assert_eq!(
            next_sent(&mut sent).await,
            Sent::SubAck(4, vec![QoS::AtLeastOnce, QoS::AtMostOnce, QoS::AtLeastOnce])
        );

        events
            .send(MqttEvent::Unsubscribe {
                message_id: 5,
                topics: vec!["b".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::UnsubAck(5));

        let subjects_sent = router.sent_to(SUBSCRIPTION_SERVICE_ENDPOINT);
        assert_eq!(
            subjects(&subjects_sent),
            vec!["session", "subscribe", "unsubscribe"]
        );

        events.send(MqttEvent::Closed).await.unwrap();
        handle.await.unwrap().close().await;
    }

    #[tokio::test]
    async fn test_amqp_publish_settled_after_puback() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        // only the session-present reply has been settled so far
        let address = client_address("dev-1");
        wait_until(|| router.accepted(&address).len() == 1).await;
        let accepted_before = 1;

        let publish = Publish {
            message_id: None,
            qos: QoS::AtMostOnce,
            dup: true,
            retain: true,
            topic: "commands/dev-1".to_string(),
            payload: Bytes::from_static(b"reboot"),
        };
        router.deliver(&address, publish.encode());

        assert_eq!(
            next_sent(&mut sent).await,
            Sent::Publish {
                topic: "commands/dev-1".to_string(),
                payload: Bytes::from_static(b"reboot"),
                qos: QoS::AtLeastOnce,
                dup: true,
                retain: true,
                message_id: Some(1),
            }
        );
        assert_eq!(router.accepted(&address).len(), accepted_before);

        events
            .send(MqttEvent::PubAck { message_id: 1 })
            .await
            .unwrap();
        wait_until(|| router.accepted(&address).len() == accepted_before + 1).await;

        events.send(MqttEvent::Closed).await.unwrap();
        handle.await.unwrap().close().await;
    }
}

mod teardown_tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnect_clears_will() {
        let router = MemoryRouter::new();
        let services = LoopbackServices::start(&router);
        let connect = MqttConnect::new("dev-1").with_will(will("devices/dev-1/status"));
        let (handle, events, _sent) = active(&router, connect).await;

        wait_until(|| services.will("dev-1").is_some()).await;

        events.send(MqttEvent::Disconnect).await.unwrap();
        wait_until(|| router.detach_count(WILL_SERVICE_ENDPOINT) == 1).await;

        assert_eq!(
            subjects(&router.sent_to(WILL_SERVICE_ENDPOINT)),
            vec!["will", "will-clear"]
        );
        assert_eq!(router.detach_count(SUBSCRIPTION_SERVICE_ENDPOINT), 0);
        assert_eq!(router.detach_count(&client_address("dev-1")), 0);
        wait_until(|| services.will("dev-1").is_none()).await;

        events.send(MqttEvent::Closed).await.unwrap();
        let mut session = handle.await.unwrap();
        session.close().await;
        assert_eq!(router.detach_count(WILL_SERVICE_ENDPOINT), 1);
        assert_eq!(router.detach_count(SUBSCRIPTION_SERVICE_ENDPOINT), 1);
    }

    #[tokio::test]
    async fn test_transport_close_keeps_will() {
        let router = MemoryRouter::new();
        let services = LoopbackServices::start(&router);
        let connect = MqttConnect::new("dev-1").with_will(will("devices/dev-1/status"));
        let (handle, events, _sent) = active(&router, connect).await;

        wait_until(|| services.will("dev-1").is_some()).await;

        events.send(MqttEvent::Closed).await.unwrap();
        let session = handle.await.unwrap();

        assert_eq!(router.detach_count(WILL_SERVICE_ENDPOINT), 1);
        assert_eq!(router.detach_count(SUBSCRIPTION_SERVICE_ENDPOINT), 0);
        assert_eq!(subjects(&router.sent_to(WILL_SERVICE_ENDPOINT)), vec!["will"]);
        assert!(services.will("dev-1").is_some());
        drop(session);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let (handle, events, mut sent) = active(&router, MqttConnect::new("dev-1")).await;

        events
            .send(MqttEvent::Publish {
                message_id: Some(1),
                qos: QoS::AtLeastOnce,
                dup: false,
                retain: false,
                topic: "t".to_string(),
                payload: Bytes::new(),
            })
            .await
            .unwrap();
        assert_eq!(next_sent(&mut sent).await, Sent::PubAck(1));
        events.send(MqttEvent::Closed).await.unwrap();
        let mut session = handle.await.unwrap();

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        for address in [
            WILL_SERVICE_ENDPOINT.to_string(),
            SUBSCRIPTION_SERVICE_ENDPOINT.to_string(),
            client_address("dev-1"),
            "t".to_string(),
        ] {
            assert_eq!(router.detach_count(&address), 1, "{}", address);
        }
        assert_eq!(router.closed_connections(), 1);
    }
}

// ============================================================================
// Tests: bridge with standard rumqttc client
// ============================================================================

mod bridge_tests {
    use super::*;
    use crate::{Bridge, BridgeConfig};
    use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS as RumqttQoS};

    /// Find an available port for testing.
    fn find_available_port() -> u16 {
        static PORT: AtomicUsize = AtomicUsize::new(19000);
        PORT.fetch_add(1, Ordering::SeqCst) as u16
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn start_bridge(router: &MemoryRouter, port: u16) -> (Arc<Bridge>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));

        let config = BridgeConfig::default().with_listen_addr(format!("127.0.0.1:{}", port));
        let bridge = Bridge::builder(config, Arc::new(router.connector()))
            .on_connect({
                let connected = Arc::clone(&connected);
                move |_| {
                    connected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_disconnect({
                let disconnected = Arc::clone(&disconnected);
                move |_| {
                    disconnected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();
        let bridge = Arc::new(bridge);

        let serving = Arc::clone(&bridge);
        tokio::spawn(async move {
            let _ = serving.serve().await;
        });

        (bridge, connected, disconnected)
    }

    #[tokio::test]
    async fn test_bridge_connect_subscribe_publish() {
        init_logging();
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let port = find_available_port();
        let (bridge, connected, disconnected) = start_bridge(&router, port);

        tokio::time::sleep(Duration::from_millis(100)).await;

        // Connect with rumqttc
        let mut options = MqttOptions::new("e2e-client", "127.0.0.1", port);
        options.set_keep_alive(Duration::from_secs(5));
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let event = eventloop.poll().await;
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                assert_eq!(ack.code, rumqttc::mqttbytes::v4::ConnectReturnCode::Success);
                assert!(!ack.session_present);
            }
            other => panic!("expected ConnAck, got {:?}", other),
        }
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        client
            .subscribe("e2e/topic", RumqttQoS::AtLeastOnce)
            .await
            .unwrap();

        let mut subscribed = false;
        for _ in 0..10 {
            if let Ok(Event::Incoming(Incoming::SubAck(ack))) = eventloop.poll().await {
                assert_eq!(
                    ack.return_codes,
                    vec![rumqttc::mqttbytes::v4::SubscribeReasonCode::Success(
                        RumqttQoS::AtLeastOnce
                    )]
                );
                subscribed = true;
                break;
            }
        }
        assert!(subscribed, "Did not receive SubAck");

        client
            .publish("e2e/topic", RumqttQoS::AtLeastOnce, false, b"hello".to_vec())
            .await
            .unwrap();

        let mut acked = false;
        let mut received = false;
        for _ in 0..20 {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::PubAck(_))) => acked = true,
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    assert_eq!(p.topic, "e2e/topic");
                    assert_eq!(&p.payload[..], b"hello");
                    assert_eq!(p.qos, RumqttQoS::AtLeastOnce);
                    received = true;
                }
                Ok(_) => {}
                Err(e) => panic!("connection error: {:?}", e),
            }
            if acked && received {
                break;
            }
        }
        assert!(acked, "Did not receive PubAck");
        assert!(received, "Did not receive Publish");

        // the client's PUBACK settles the delivery on its address
        let address = client_address("e2e-client");
        tokio::spawn(async move { while eventloop.poll().await.is_ok() {} });
        wait_until(|| router.accepted(&address).len() >= 3).await;

        client.disconnect().await.unwrap();
        wait_until(|| disconnected.load(Ordering::SeqCst) == 1).await;
        // DISCONNECT clears the will even when none was registered
        assert_eq!(
            subjects(&router.sent_to(WILL_SERVICE_ENDPOINT)),
            vec!["will-clear"]
        );

        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_bridge_refuses_when_backbone_down() {
        init_logging();
        let router = MemoryRouter::new();
        let port = find_available_port();

        let config = BridgeConfig::default().with_listen_addr(format!("127.0.0.1:{}", port));
        let bridge = Arc::new(Bridge::new(config, Arc::new(router.unavailable_connector())).unwrap());
        let serving = Arc::clone(&bridge);
        tokio::spawn(async move {
            let _ = serving.serve().await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut options = MqttOptions::new("refused-client", "127.0.0.1", port);
        options.set_keep_alive(Duration::from_secs(5));
        let (_client, mut eventloop) = AsyncClient::new(options, 10);

        let event = eventloop.poll().await;
        assert!(
            event.is_err()
                || matches!(event, Ok(Event::Incoming(Incoming::ConnAck(ref ack)))
                    if ack.code == rumqttc::mqttbytes::v4::ConnectReturnCode::ServiceUnavailable),
            "expected refusal, got {:?}",
            event
        );

        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_bridge_serve_twice() {
        let router = MemoryRouter::new();
        let port = find_available_port();
        let (bridge, _, _) = start_bridge(&router, port);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(bridge.serve().await, Err(Error::AlreadyRunning)));

        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let router = MemoryRouter::new();
        let config = BridgeConfig::default().with_messaging_url("not a url");
        assert!(matches!(
            Bridge::new(config, Arc::new(router.connector())),
            Err(Error::InvalidConfig(_))
        ));
    }
}
