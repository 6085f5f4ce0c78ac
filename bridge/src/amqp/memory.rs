//! In-memory AMQP backbone.
//!
//! [`MemoryRouter`] behaves like a minimal AMQP router: senders deliver to an
//! address, receivers attached to that address consume from it. Messages sent
//! to an address nobody listens on are kept in a backlog until a receiver
//! attaches (or handed to the unrouted listener, if one is installed).
//!
//! The router records what tests want to observe (connection options, every
//! message sent on a sender link, settlements, link detaches) and supports
//! fault injection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};

use super::message::AmqpMessage;
use super::transport::{
    AmqpConnection, AmqpConnector, ConnectionOptions, DeliveryTag, InboundDelivery, LinkOptions,
    ReceiverLink, SenderLink,
};
use crate::error::{Error, Result};

/// A message as seen by the router.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    /// Target address.
    pub address: String,
    /// Name of the sender link it was sent on.
    pub link_name: String,
    pub message: AmqpMessage,
}

struct ReceiverSlot {
    id: u64,
    tx: mpsc::UnboundedSender<RoutedMessage>,
}

#[derive(Default)]
struct RouterState {
    receivers: HashMap<String, Vec<ReceiverSlot>>,
    backlog: HashMap<String, VecDeque<RoutedMessage>>,
    unrouted: Option<mpsc::UnboundedSender<RoutedMessage>>,
    rejecting: HashSet<String>,
    stalled: HashSet<String>,
    refusing_attach: HashSet<String>,
    sent: Vec<RoutedMessage>,
    accepted: HashMap<String, Vec<DeliveryTag>>,
    detached: HashMap<String, usize>,
    connections: Vec<ConnectionOptions>,
    closed_connections: usize,
}

struct RouterInner {
    state: Mutex<RouterState>,
    next_id: AtomicU64,
    attach_released: Notify,
}

/// In-memory AMQP router shared by connectors, tests and loopback services.
#[derive(Clone)]
pub struct MemoryRouter {
    inner: Arc<RouterInner>,
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                state: Mutex::new(RouterState::default()),
                next_id: AtomicU64::new(1),
                attach_released: Notify::new(),
            }),
        }
    }

    /// A connector whose connections attach to this router.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            router: self.clone(),
            available: true,
        }
    }

    /// A connector that refuses every connection attempt.
    pub fn unavailable_connector(&self) -> MemoryConnector {
        MemoryConnector {
            router: self.clone(),
            available: false,
        }
    }

    /// Consume messages sent to `address`, starting with any backlog.
    pub fn listen(&self, address: &str) -> MemoryListener {
        let (id, rx) = self.register(address);
        MemoryListener {
            router: self.clone(),
            address: address.to_string(),
            id,
            rx,
        }
    }

    /// Receive every message sent to an address without receivers.
    ///
    /// Replaces any previously installed unrouted listener.
    pub fn listen_unrouted(&self) -> mpsc::UnboundedReceiver<RoutedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().unrouted = Some(tx);
        rx
    }

    /// Deliver a message to `address` as if sent by a peer.
    pub fn deliver(&self, address: &str, message: AmqpMessage) {
        self.route(RoutedMessage {
            address: address.to_string(),
            link_name: "router".to_string(),
            message,
        });
    }

    /// Make every send to `address` fail with a rejected outcome.
    pub fn reject(&self, address: &str) {
        self.inner.state.lock().rejecting.insert(address.to_string());
    }

    /// Hold sender attaches to `address` until [`release_attach`](Self::release_attach).
    pub fn stall_attach(&self, address: &str) {
        self.inner.state.lock().stalled.insert(address.to_string());
    }

    pub fn release_attach(&self, address: &str) {
        self.inner.state.lock().stalled.remove(address);
        self.inner.attach_released.notify_waiters();
    }

    /// Make sender attaches to `address` fail.
    pub fn refuse_attach(&self, address: &str) {
        self.inner
            .state
            .lock()
            .refusing_attach
            .insert(address.to_string());
    }

    /// Connection options of every connection opened so far, in order.
    pub fn connection_options(&self) -> Vec<ConnectionOptions> {
        self.inner.state.lock().connections.clone()
    }

    /// Number of connections closed so far.
    pub fn closed_connections(&self) -> usize {
        self.inner.state.lock().closed_connections
    }

    /// Every message sent on a sender link, in send order.
    pub fn sent_messages(&self) -> Vec<RoutedMessage> {
        self.inner.state.lock().sent.clone()
    }

    /// Messages sent on sender links to `address`, in send order.
    pub fn sent_to(&self, address: &str) -> Vec<AmqpMessage> {
        self.inner
            .state
            .lock()
            .sent
            .iter()
            .filter(|m| m.address == address)
            .map(|m| m.message.clone())
            .collect()
    }

    /// Deliveries accepted by receivers attached to `address`.
    pub fn accepted(&self, address: &str) -> Vec<DeliveryTag> {
        self.inner
            .state
            .lock()
            .accepted
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of link detaches seen for `address`.
    pub fn detach_count(&self, address: &str) -> usize {
        self.inner
            .state
            .lock()
            .detached
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a receiver is currently attached to `address`.
    pub fn has_receiver(&self, address: &str) -> bool {
        self.inner
            .state
            .lock()
            .receivers
            .get(address)
            .is_some_and(|slots| !slots.is_empty())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, address: &str) -> (u64, mpsc::UnboundedReceiver<RoutedMessage>) {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.inner.state.lock();
        if let Some(backlog) = state.backlog.remove(address) {
            for msg in backlog {
                let _ = tx.send(msg);
            }
        }
        state
            .receivers
            .entry(address.to_string())
            .or_default()
            .push(ReceiverSlot { id, tx });
        trace!("receiver {} attached to {}", id, address);
        (id, rx)
    }

    fn unregister(&self, address: &str, id: u64) {
        let mut state = self.inner.state.lock();
        if let Some(slots) = state.receivers.get_mut(address) {
            slots.retain(|s| s.id != id);
            if slots.is_empty() {
                state.receivers.remove(address);
            }
        }
    }

    fn route(&self, routed: RoutedMessage) {
        let mut state = self.inner.state.lock();

        if let Some(slots) = state.receivers.get_mut(&routed.address) {
            slots.retain(|s| !s.tx.is_closed());
            if let Some(slot) = slots.first() {
                let _ = slot.tx.send(routed);
                return;
            }
        }

        if let Some(ref unrouted) = state.unrouted {
            if !unrouted.is_closed() {
                let _ = unrouted.send(routed);
                return;
            }
        }

        debug!("no receiver on {}, queueing", routed.address);
        state
            .backlog
            .entry(routed.address.clone())
            .or_default()
            .push_back(routed);
    }

    async fn wait_attach(&self, address: &str) -> Result<()> {
        loop {
            let released = self.inner.attach_released.notified();
            {
                let state = self.inner.state.lock();
                if state.refusing_attach.contains(address) {
                    return Err(Error::Transport(format!("attach to {} refused", address)));
                }
                if !state.stalled.contains(address) {
                    return Ok(());
                }
            }
            released.await;
        }
    }

    fn is_rejecting(&self, address: &str) -> bool {
        self.inner.state.lock().rejecting.contains(address)
    }

    fn note_accept(&self, address: &str, tag: DeliveryTag) {
        self.inner
            .state
            .lock()
            .accepted
            .entry(address.to_string())
            .or_default()
            .push(tag);
    }

    fn note_detach(&self, address: &str) {
        *self
            .inner
            .state
            .lock()
            .detached
            .entry(address.to_string())
            .or_default() += 1;
    }
}

/// A consumer on a router address, for services and tests.
pub struct MemoryListener {
    router: MemoryRouter,
    address: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<RoutedMessage>,
}

impl MemoryListener {
    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<RoutedMessage> {
        self.rx.recv().await
    }

    /// Take the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<RoutedMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.router.unregister(&self.address, self.id);
    }
}

/// Connector for a [`MemoryRouter`].
#[derive(Clone)]
pub struct MemoryConnector {
    router: MemoryRouter,
    available: bool,
}

#[async_trait]
impl AmqpConnector for MemoryConnector {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn AmqpConnection>> {
        if !self.available {
            return Err(Error::Transport(format!(
                "connection refused by {}:{}",
                options.host, options.port
            )));
        }

        self.router
            .inner
            .state
            .lock()
            .connections
            .push(options.clone());

        Ok(Arc::new(MemoryConnection {
            router: self.router.clone(),
            container_id: options.container_id.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    router: MemoryRouter,
    container_id: String,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn link_name(&self, address: &str, options: LinkOptions) -> String {
        options
            .link_name
            .unwrap_or_else(|| format!("{}-{}-{}", self.container_id, address, self.router.next_id()))
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn sender(&self, address: &str, options: LinkOptions) -> Box<dyn SenderLink> {
        Box::new(MemorySender {
            router: self.router.clone(),
            address: address.to_string(),
            link_name: self.link_name(address, options),
            attached: false,
        })
    }

    fn receiver(&self, address: &str, options: LinkOptions) -> Box<dyn ReceiverLink> {
        let _ = self.link_name(address, options);
        Box::new(MemoryReceiver {
            router: self.router.clone(),
            address: address.to_string(),
            slot: None,
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.router.inner.state.lock().closed_connections += 1;
        }
        Ok(())
    }
}

struct MemorySender {
    router: MemoryRouter,
    address: String,
    link_name: String,
    attached: bool,
}

#[async_trait]
impl SenderLink for MemorySender {
    async fn attach(&mut self) -> Result<()> {
        self.router.wait_attach(&self.address).await?;
        self.attached = true;
        Ok(())
    }

    async fn send(&mut self, message: AmqpMessage) -> Result<()> {
        if !self.attached {
            return Err(Error::Transport(format!("link {} not attached", self.link_name)));
        }
        if self.router.is_rejecting(&self.address) {
            return Err(Error::Transport(format!("delivery rejected by {}", self.address)));
        }

        let routed = RoutedMessage {
            address: self.address.clone(),
            link_name: self.link_name.clone(),
            message,
        };
        self.router.inner.state.lock().sent.push(routed.clone());
        self.router.route(routed);
        Ok(())
    }

    async fn detach(&mut self) -> Result<()> {
        if self.attached {
            self.attached = false;
            self.router.note_detach(&self.address);
        }
        Ok(())
    }
}

struct MemoryReceiver {
    router: MemoryRouter,
    address: String,
    slot: Option<(u64, mpsc::UnboundedReceiver<RoutedMessage>)>,
}

#[async_trait]
impl ReceiverLink for MemoryReceiver {
    async fn attach(&mut self) -> Result<()> {
        if self.slot.is_none() {
            self.slot = Some(self.router.register(&self.address));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<InboundDelivery>> {
        let Some((_, rx)) = self.slot.as_mut() else {
            return Err(Error::Transport(format!("receiver on {} not attached", self.address)));
        };

        Ok(rx.recv().await.map(|routed| InboundDelivery {
            tag: DeliveryTag(self.router.next_id()),
            message: routed.message,
        }))
    }

    async fn accept(&mut self, tag: DeliveryTag) -> Result<()> {
        self.router.note_accept(&self.address, tag);
        Ok(())
    }

    async fn detach(&mut self) -> Result<()> {
        if let Some((id, _)) = self.slot.take() {
            self.router.unregister(&self.address, id);
            self.router.note_detach(&self.address);
        }
        Ok(())
    }
}
