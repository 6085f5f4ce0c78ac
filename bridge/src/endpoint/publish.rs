use super::Completion;
use super::link::SenderEndpoint;
use crate::amqp::{AmqpConnection, LinkOptions};
use crate::error::Result;
use crate::protocol::Publish;

/// Sender endpoint for one topic; the link targets the topic name itself.
pub struct PublishEndpoint {
    link: SenderEndpoint,
}

impl PublishEndpoint {
    pub fn new(connection: &dyn AmqpConnection, topic: &str) -> Self {
        let link = connection.sender(topic, LinkOptions::default());
        Self {
            link: SenderEndpoint::new(topic, link),
        }
    }

    pub fn topic(&self) -> &str {
        self.link.address()
    }

    pub async fn open(&mut self) -> Result<()> {
        self.link.open().await
    }

    /// Attach on the link task; sends queue until it completes.
    pub fn open_in_background(&mut self, attached: Option<Completion>) {
        self.link.open_in_background(attached);
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn send_publish(&self, publish: &Publish, done: Option<Completion>) {
        self.link.send(publish.encode(), done);
    }

    pub async fn close(&mut self) {
        self.link.close().await;
    }
}
