use super::link::SenderEndpoint;
use super::{Completion, SUBSCRIPTION_SERVICE_ENDPOINT};
use crate::amqp::{AmqpConnection, LinkOptions};
use crate::error::Result;
use crate::protocol::{Session, Subscribe, Unsubscribe};

/// Sender endpoint toward the Subscription Service.
///
/// Replies arrive on the client's [`ReceiverEndpoint`](super::ReceiverEndpoint).
pub struct SubscriptionEndpoint {
    link: SenderEndpoint,
}

impl SubscriptionEndpoint {
    pub fn new(connection: &dyn AmqpConnection) -> Self {
        let link = connection.sender(SUBSCRIPTION_SERVICE_ENDPOINT, LinkOptions::default());
        Self {
            link: SenderEndpoint::new(SUBSCRIPTION_SERVICE_ENDPOINT, link),
        }
    }

    pub async fn open(&mut self) -> Result<()> {
        self.link.open().await
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn send_session(&self, session: &Session, done: Option<Completion>) {
        self.link.send(session.encode(), done);
    }

    pub fn send_subscribe(&self, subscribe: &Subscribe, done: Option<Completion>) {
        self.link.send(subscribe.encode(), done);
    }

    pub fn send_unsubscribe(&self, unsubscribe: &Unsubscribe, done: Option<Completion>) {
        self.link.send(unsubscribe.encode(), done);
    }

    pub async fn close(&mut self) {
        self.link.close().await;
    }
}
