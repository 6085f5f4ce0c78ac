use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::amqp::{AmqpConnection, DeliveryTag, InboundDelivery, LinkOptions, ReceiverLink};
use crate::error::{Error, Result};
use crate::protocol::{Publish, ServiceReply, SessionPresent, Suback, Unsuback};

type Handler<T> = Box<dyn Fn(T) + Send + 'static>;
type PublishHandler = Box<dyn Fn(Publish, DeliveryTag) + Send + 'static>;

/// One handler slot per reply kind.
#[derive(Default)]
struct Handlers {
    session_present: Option<Handler<SessionPresent>>,
    suback: Option<Handler<Suback>>,
    unsuback: Option<Handler<Unsuback>>,
    publish: Option<PublishHandler>,
    // Suback, Unsuback and Publish wait for a SessionPresent
    gated: bool,
}

enum Command {
    Accept(DeliveryTag),
    Close(oneshot::Sender<()>),
}

/// Receiver endpoint on the client's unique address.
///
/// Inbound messages are decoded into [`ServiceReply`] and handed to the
/// handler registered for their kind. Replies are accepted on dispatch;
/// publishes stay unsettled until [`settle`](Self::settle) is called with the
/// MQTT packet identifier they were forwarded under.
pub struct ReceiverEndpoint {
    address: String,
    link: Option<Box<dyn ReceiverLink>>,
    handlers: Arc<Mutex<Handlers>>,
    tx: Option<mpsc::UnboundedSender<Command>>,
    unsettled: HashMap<u16, DeliveryTag>,
}

impl ReceiverEndpoint {
    pub fn new(connection: &dyn AmqpConnection, address: &str) -> Self {
        Self {
            address: address.to_string(),
            link: Some(connection.receiver(address, LinkOptions::default())),
            handlers: Arc::new(Mutex::new(Handlers::default())),
            tx: None,
            unsettled: HashMap::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Attach the link and start dispatching. No-op when already open.
    pub async fn open(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Ok(());
        }
        let Some(mut link) = self.link.take() else {
            return Err(Error::Transport(format!("link on {} already closed", self.address)));
        };

        link.attach().await?;
        trace!("receiver link on {} attached", self.address);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(self.address.clone(), link, Arc::clone(&self.handlers), rx));
        self.tx = Some(tx);
        Ok(())
    }

    /// Hold Suback, Unsuback and Publish handlers until a SessionPresent has
    /// been dispatched. The gate opens in the same dispatch, so a reply that
    /// directly follows SessionPresent always finds its handler.
    pub fn gate_on_session_present(&self) {
        self.handlers.lock().gated = true;
    }

    /// Replace the SessionPresent handler.
    pub fn on_session_present<F>(&self, f: F)
    where
        F: Fn(SessionPresent) + Send + 'static,
    {
        self.handlers.lock().session_present = Some(Box::new(f));
    }

    /// Replace the Suback handler.
    pub fn on_suback<F>(&self, f: F)
    where
        F: Fn(Suback) + Send + 'static,
    {
        self.handlers.lock().suback = Some(Box::new(f));
    }

    /// Replace the Unsuback handler.
    pub fn on_unsuback<F>(&self, f: F)
    where
        F: Fn(Unsuback) + Send + 'static,
    {
        self.handlers.lock().unsuback = Some(Box::new(f));
    }

    /// Replace the Publish handler. The delivery tag must be
    /// [`track`](Self::track)ed to be settled later.
    pub fn on_publish<F>(&self, f: F)
    where
        F: Fn(Publish, DeliveryTag) + Send + 'static,
    {
        self.handlers.lock().publish = Some(Box::new(f));
    }

    /// Bind an MQTT packet identifier to an unsettled delivery.
    pub fn track(&mut self, message_id: u16, tag: DeliveryTag) {
        if let Some(previous) = self.unsettled.insert(message_id, tag) {
            warn!(
                "packet id {} reused on {} before delivery {:?} was settled",
                message_id, self.address, previous
            );
        }
    }

    /// Accept the delivery bound to `message_id`. Returns false if none is.
    pub fn settle(&mut self, message_id: u16) -> bool {
        let Some(tag) = self.unsettled.remove(&message_id) else {
            debug!("no delivery to settle for packet id {} on {}", message_id, self.address);
            return false;
        };
        match self.tx {
            Some(ref tx) => tx.send(Command::Accept(tag)).is_ok(),
            None => false,
        }
    }

    /// Detach the link. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.link = None;
        self.unsettled.clear();

        let Some(tx) = self.tx.take() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn drive(
    address: String,
    mut link: Box<dyn ReceiverLink>,
    handlers: Arc<Mutex<Handlers>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut receiving = true;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Accept(tag)) => {
                    if let Err(e) = link.accept(tag).await {
                        warn!("accept {:?} on {} failed: {}", tag, address, e);
                    }
                }
                Some(Command::Close(done)) => {
                    if let Err(e) = link.detach().await {
                        debug!("detach from {} failed: {}", address, e);
                    }
                    let _ = done.send(());
                    return;
                }
                None => {
                    let _ = link.detach().await;
                    return;
                }
            },

            delivery = link.recv(), if receiving => match delivery {
                Ok(Some(delivery)) => {
                    let tag = delivery.tag;
                    if dispatch(&address, &handlers, delivery) {
                        if let Err(e) = link.accept(tag).await {
                            warn!("accept {:?} on {} failed: {}", tag, address, e);
                        }
                    }
                }
                Ok(None) => {
                    debug!("receiver link on {} ended", address);
                    receiving = false;
                }
                Err(e) => {
                    warn!("receive on {} failed: {}", address, e);
                    receiving = false;
                }
            },
        }
    }
}

/// Hand a delivery to its handler. Returns true when it should be accepted
/// right away.
fn dispatch(address: &str, handlers: &Mutex<Handlers>, delivery: InboundDelivery) -> bool {
    let reply = match ServiceReply::decode(&delivery.message) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("dropping undecodable message on {}: {}", address, e);
            return true;
        }
    };

    let mut handlers = handlers.lock();
    if handlers.gated && !matches!(reply, ServiceReply::SessionPresent(_)) {
        return match reply {
            ServiceReply::Publish(m) => {
                warn!("publish for {} on {} before session-present, left unsettled", m.topic, address);
                false
            }
            _ => {
                debug!("dropping reply on {} before session-present", address);
                true
            }
        };
    }

    match reply {
        ServiceReply::SessionPresent(m) => {
            handlers.gated = false;
            match handlers.session_present {
                Some(ref f) => f(m),
                None => debug!("no session-present handler on {}", address),
            }
        }
        ServiceReply::Suback(m) => match handlers.suback {
            Some(ref f) => f(m),
            None => debug!("no suback handler on {}", address),
        },
        ServiceReply::Unsuback(m) => match handlers.unsuback {
            Some(ref f) => f(m),
            None => debug!("no unsuback handler on {}", address),
        },
        ServiceReply::Publish(m) => match handlers.publish {
            Some(ref f) => {
                f(m, delivery.tag);
                return false;
            }
            None => {
                warn!("no publish handler on {}, message for {} left unsettled", address, m.topic);
                return false;
            }
        },
    }
    true
}
