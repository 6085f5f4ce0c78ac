use super::link::SenderEndpoint;
use super::{Completion, WILL_SERVICE_ENDPOINT};
use crate::amqp::{AmqpConnection, LinkOptions};
use crate::error::Result;
use crate::protocol::{Will, WillClear};

/// Sender endpoint toward the Will Service.
///
/// The link name is the client identifier, which is how the service keys the
/// registered will.
pub struct WillEndpoint {
    link: SenderEndpoint,
}

impl WillEndpoint {
    pub fn new(connection: &dyn AmqpConnection, client_id: &str) -> Self {
        let link = connection.sender(WILL_SERVICE_ENDPOINT, LinkOptions::named(client_id));
        Self {
            link: SenderEndpoint::new(WILL_SERVICE_ENDPOINT, link),
        }
    }

    pub async fn open(&mut self) -> Result<()> {
        self.link.open().await
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Register the client's last will.
    pub fn send_will(&self, will: &Will, done: Option<Completion>) {
        self.link.send(will.encode(), done);
    }

    /// Clear the will after a clean disconnect.
    pub fn clear_will(&self, done: Option<Completion>) {
        self.link.send(WillClear.encode(), done);
    }

    pub async fn close(&mut self) {
        self.link.close().await;
    }
}
