//! Loopback Will and Subscription services on a [`MemoryRouter`].
//!
//! Answers the bridge the way the real backends do, closely enough to run
//! the bridge standalone:
//!
//! - Session: replies SessionPresent, true only when a non-clean session for
//!   that client was registered before; a clean session forgets the client
//! - Subscribe: records exact topic subscriptions, replies Suback granting
//!   at most QoS 1 per filter
//! - Unsubscribe: forgets the topics, replies Unsuback
//! - Will / WillClear: keeps the registered will per link name
//! - Publish on a topic address: forwarded to every client subscribed to
//!   exactly that topic and currently attached
//!
//! Wills are recorded but never fired.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::amqp::{MemoryListener, MemoryRouter, RoutedMessage};
use crate::codec::PacketIdAllocator;
use crate::endpoint::{
    CLIENT_ENDPOINT_PREFIX, SUBSCRIPTION_SERVICE_ENDPOINT, WILL_SERVICE_ENDPOINT, client_address,
};
use crate::protocol::{
    Publish, ServiceReply, ServiceRequest, SessionPresent, Suback, Unsuback, Will,
};
use crate::types::{QoS, TopicSubscription};

#[derive(Default)]
struct ServiceState {
    persistent_sessions: HashSet<String>,
    subscriptions: HashMap<String, Vec<TopicSubscription>>,
    wills: HashMap<String, Will>,
    packet_ids: PacketIdAllocator,
}

/// Running loopback services. Dropping stops them.
pub struct LoopbackServices {
    state: Arc<Mutex<ServiceState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LoopbackServices {
    /// Attach the services to `router`. Must be called inside a tokio runtime.
    pub fn start(router: &MemoryRouter) -> Self {
        let state = Arc::new(Mutex::new(ServiceState::default()));

        let will_service = router.listen(WILL_SERVICE_ENDPOINT);
        let subscription_service = router.listen(SUBSCRIPTION_SERVICE_ENDPOINT);
        let mut unrouted = router.listen_unrouted();

        let tasks = vec![
            tokio::spawn(run_will_service(will_service, Arc::clone(&state))),
            tokio::spawn(run_subscription_service(
                subscription_service,
                router.clone(),
                Arc::clone(&state),
            )),
            tokio::spawn({
                let router = router.clone();
                let state = Arc::clone(&state);
                async move {
                    while let Some(routed) = unrouted.recv().await {
                        route_publish(&router, &state, routed);
                    }
                }
            }),
        ];

        Self { state, tasks }
    }

    /// The will currently registered for a client.
    pub fn will(&self, client_id: &str) -> Option<Will> {
        self.state.lock().wills.get(client_id).cloned()
    }

    /// The client's subscriptions, in subscription order.
    pub fn subscriptions(&self, client_id: &str) -> Vec<TopicSubscription> {
        self.state
            .lock()
            .subscriptions
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for LoopbackServices {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_will_service(mut listener: MemoryListener, state: Arc<Mutex<ServiceState>>) {
    while let Some(routed) = listener.recv().await {
        match ServiceRequest::decode(&routed.message) {
            Ok(ServiceRequest::Will(will)) => {
                debug!("will registered for {} on {}", routed.link_name, will.topic);
                state.lock().wills.insert(routed.link_name, will);
            }
            Ok(ServiceRequest::WillClear(_)) => {
                debug!("will cleared for {}", routed.link_name);
                state.lock().wills.remove(&routed.link_name);
            }
            Ok(other) => warn!("will service ignoring {:?}", other),
            Err(e) => warn!("will service: {}", e),
        }
    }
}

async fn run_subscription_service(
    mut listener: MemoryListener,
    router: MemoryRouter,
    state: Arc<Mutex<ServiceState>>,
) {
    while let Some(routed) = listener.recv().await {
        let request = match ServiceRequest::decode(&routed.message) {
            Ok(request) => request,
            Err(e) => {
                warn!("subscription service: {}", e);
                continue;
            }
        };

        let (client_id, reply) = {
            let mut state = state.lock();
            match request {
                ServiceRequest::Session(session) => {
                    let present = if session.clean_session {
                        state.persistent_sessions.remove(&session.client_id);
                        state.subscriptions.remove(&session.client_id);
                        false
                    } else {
                        !state.persistent_sessions.insert(session.client_id.clone())
                    };
                    let reply = ServiceReply::SessionPresent(SessionPresent {
                        session_present: present,
                    });
                    (session.client_id, reply)
                }
                ServiceRequest::Subscribe(subscribe) => {
                    let granted = subscribe
                        .subscriptions
                        .iter()
                        .map(|s| grant(s.qos))
                        .collect();
                    let existing = state
                        .subscriptions
                        .entry(subscribe.client_id.clone())
                        .or_default();
                    for sub in subscribe.subscriptions {
                        existing.retain(|s| s.topic != sub.topic);
                        existing.push(TopicSubscription::new(sub.topic, grant(sub.qos)));
                    }
                    let reply = ServiceReply::Suback(Suback {
                        message_id: subscribe.message_id,
                        granted_qos: granted,
                    });
                    (subscribe.client_id, reply)
                }
                ServiceRequest::Unsubscribe(unsubscribe) => {
                    if let Some(existing) = state.subscriptions.get_mut(&unsubscribe.client_id) {
                        existing.retain(|s| !unsubscribe.topics.contains(&s.topic));
                    }
                    let reply = ServiceReply::Unsuback(Unsuback {
                        message_id: unsubscribe.message_id,
                    });
                    (unsubscribe.client_id, reply)
                }
                other => {
                    warn!("subscription service ignoring {:?}", other);
                    continue;
                }
            }
        };

        trace!("subscription service replying to {}: {:?}", client_id, reply);
        router.deliver(&client_address(&client_id), reply.encode());
    }
}

fn route_publish(router: &MemoryRouter, state: &Mutex<ServiceState>, routed: RoutedMessage) {
    if routed.address.starts_with(CLIENT_ENDPOINT_PREFIX) {
        debug!("dropping message for detached client address {}", routed.address);
        return;
    }

    let publish = match ServiceRequest::decode(&routed.message) {
        Ok(ServiceRequest::Publish(publish)) => publish,
        Ok(other) => {
            warn!("ignoring {:?} sent to {}", other, routed.address);
            return;
        }
        Err(e) => {
            warn!("ignoring message sent to {}: {}", routed.address, e);
            return;
        }
    };

    let mut deliveries = Vec::new();
    {
        let mut state = state.lock();
        let ServiceState {
            subscriptions,
            packet_ids,
            ..
        } = &mut *state;

        for (client_id, subs) in subscriptions.iter() {
            let Some(sub) = subs.iter().find(|s| s.topic == publish.topic) else {
                continue;
            };
            let address = client_address(client_id);
            if !router.has_receiver(&address) {
                continue;
            }

            let qos = publish.qos.min(sub.qos);
            let message_id = (qos != QoS::AtMostOnce).then(|| packet_ids.next_id());
            deliveries.push((
                address,
                Publish {
                    message_id,
                    qos,
                    dup: false,
                    retain: publish.retain,
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
            ));
        }
    }

    trace!("routing publish on {} to {} clients", publish.topic, deliveries.len());
    for (address, publish) in deliveries {
        router.deliver(&address, ServiceReply::Publish(publish).encode());
    }
}

fn grant(requested: QoS) -> QoS {
    requested.min(QoS::AtLeastOnce)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::protocol::{Session, Subscribe, WillClear};

    async fn reply(listener: &mut MemoryListener) -> ServiceReply {
        let routed = tokio::time::timeout(Duration::from_secs(1), listener.recv())
            .await
            .unwrap()
            .unwrap();
        ServiceReply::decode(&routed.message).unwrap()
    }

    fn session(client_id: &str, clean_session: bool) -> ServiceRequest {
        ServiceRequest::Session(Session {
            clean_session,
            client_id: client_id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_session_present_only_for_resumed_sessions() {
        let router = MemoryRouter::new();
        let _services = LoopbackServices::start(&router);
        let mut client = router.listen("$mqtt.to.dev-1");

        let expected = [(false, false), (false, true), (true, false), (false, false)];
        for (clean, present) in expected {
            router.deliver(SUBSCRIPTION_SERVICE_ENDPOINT, session("dev-1", clean).encode());
            assert_eq!(
                reply(&mut client).await,
                ServiceReply::SessionPresent(SessionPresent {
                    session_present: present
                })
            );
        }
    }

    #[tokio::test]
    async fn test_suback_caps_granted_qos() {
        let router = MemoryRouter::new();
        let services = LoopbackServices::start(&router);
        let mut client = router.listen("$mqtt.to.dev-1");

        let subscribe = ServiceRequest::Subscribe(Subscribe {
            client_id: "dev-1".to_string(),
            message_id: 11,
            subscriptions: vec![
                TopicSubscription::new("a", QoS::ExactlyOnce),
                TopicSubscription::new("b", QoS::AtMostOnce),
                TopicSubscription::new("c", QoS::AtLeastOnce),
            ],
        });
        router.deliver(SUBSCRIPTION_SERVICE_ENDPOINT, subscribe.encode());

        assert_eq!(
            reply(&mut client).await,
            ServiceReply::Suback(Suback {
                message_id: 11,
                granted_qos: vec![QoS::AtLeastOnce, QoS::AtMostOnce, QoS::AtLeastOnce],
            })
        );
        assert_eq!(services.subscriptions("dev-1").len(), 3);
    }

    #[tokio::test]
    async fn test_publish_routed_to_exact_subscribers() {
        let router = MemoryRouter::new();
        let services = LoopbackServices::start(&router);
        let mut client = router.listen("$mqtt.to.dev-1");

        router.deliver(
            SUBSCRIPTION_SERVICE_ENDPOINT,
            ServiceRequest::Subscribe(Subscribe {
                client_id: "dev-1".to_string(),
                message_id: 1,
                subscriptions: vec![TopicSubscription::new("sensors/temp", QoS::AtLeastOnce)],
            })
            .encode(),
        );
        reply(&mut client).await;
        assert_eq!(services.subscriptions("dev-1").len(), 1);

        for topic in ["sensors/humidity", "sensors/temp"] {
            let publish = Publish {
                message_id: Some(5),
                qos: QoS::AtLeastOnce,
                dup: true,
                retain: false,
                topic: topic.to_string(),
                payload: Bytes::from_static(b"21.5"),
            };
            router.deliver(topic, publish.encode());
        }

        match reply(&mut client).await {
            ServiceReply::Publish(publish) => {
                assert_eq!(publish.topic, "sensors/temp");
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert!(!publish.dup);
                assert!(publish.message_id.is_some());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(client.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_will_bookkeeping() {
        let router = MemoryRouter::new();
        let services = LoopbackServices::start(&router);

        let will = Will {
            retain: false,
            topic: "devices/dev-1/status".to_string(),
            qos: QoS::AtMostOnce,
            payload: Bytes::from_static(b"offline"),
        };
        router.deliver(WILL_SERVICE_ENDPOINT, will.encode());

        tokio::time::timeout(Duration::from_secs(1), async {
            while services.will("router").is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        router.deliver(WILL_SERVICE_ENDPOINT, WillClear.encode());
        tokio::time::timeout(Duration::from_secs(1), async {
            while services.will("router").is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
