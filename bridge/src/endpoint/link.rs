//! Task-driven sender link shared by the sender endpoints.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::Completion;
use crate::amqp::{AmqpMessage, SenderLink};
use crate::error::{Error, Result};

enum Command {
    Send {
        message: AmqpMessage,
        done: Option<Completion>,
    },
    Close(oneshot::Sender<()>),
}

/// A sender link plus the task that drives it.
///
/// Lifecycle: created detached, [`open`](Self::open) attaches and starts the
/// task, [`close`](Self::close) drains queued sends and detaches. A closed
/// link cannot be reopened.
pub(crate) struct SenderEndpoint {
    address: String,
    link: Option<Box<dyn SenderLink>>,
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl SenderEndpoint {
    pub(crate) fn new(address: impl Into<String>, link: Box<dyn SenderLink>) -> Self {
        Self {
            address: address.into(),
            link: Some(link),
            tx: None,
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Attach the link and start its task. No-op when already open.
    pub(crate) async fn open(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Ok(());
        }
        let Some(mut link) = self.link.take() else {
            return Err(Error::Transport(format!("link to {} already closed", self.address)));
        };

        link.attach().await?;
        trace!("sender link to {} attached", self.address);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(self.address.clone(), link, rx));
        self.tx = Some(tx);
        Ok(())
    }

    /// Start the link task and attach on it, without waiting.
    ///
    /// Sends queue behind the attach. If it fails, `attached` gets the error
    /// and every queued or later send fails.
    pub(crate) fn open_in_background(&mut self, attached: Option<Completion>) {
        if self.tx.is_some() {
            if let Some(attached) = attached {
                attached(Ok(()));
            }
            return;
        }
        let Some(link) = self.link.take() else {
            if let Some(attached) = attached {
                attached(Err(Error::Transport(format!("link to {} already closed", self.address))));
            }
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(attach_then_drive(self.address.clone(), link, rx, attached));
        self.tx = Some(tx);
    }

    /// Queue a message. Fails the completion when the link is not open.
    pub(crate) fn send(&self, message: AmqpMessage, done: Option<Completion>) {
        let Some(ref tx) = self.tx else {
            if let Some(done) = done {
                done(Err(Error::Transport(format!("link to {} not open", self.address))));
            }
            return;
        };

        if let Err(mpsc::error::SendError(cmd)) = tx.send(Command::Send { message, done }) {
            if let Command::Send { done: Some(done), .. } = cmd {
                done(Err(Error::Transport(format!("link to {} stopped", self.address))));
            }
        }
    }

    /// Detach the link after queued sends. Safe to call repeatedly.
    pub(crate) async fn close(&mut self) {
        // never opened
        self.link = None;

        let Some(tx) = self.tx.take() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn attach_then_drive(
    address: String,
    mut link: Box<dyn SenderLink>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    attached: Option<Completion>,
) {
    match link.attach().await {
        Ok(()) => {
            trace!("sender link to {} attached", address);
            if let Some(attached) = attached {
                attached(Ok(()));
            }
            drive(address, link, rx).await;
        }
        Err(e) => {
            warn!("attach to {} failed: {}", address, e);
            let reason = e.to_string();
            if let Some(attached) = attached {
                attached(Err(e));
            }

            rx.close();
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Send { done, .. } => {
                        if let Some(done) = done {
                            done(Err(Error::Transport(format!(
                                "link to {} not attached: {}",
                                address, reason
                            ))));
                        }
                    }
                    Command::Close(done) => {
                        let _ = done.send(());
                    }
                }
            }
        }
    }
}

async fn drive(address: String, mut link: Box<dyn SenderLink>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Send { message, done } => {
                let result = link.send(message).await;
                if let Err(ref e) = result {
                    debug!("send to {} failed: {}", address, e);
                }
                if let Some(done) = done {
                    done(result);
                }
            }
            Command::Close(done) => {
                if let Err(e) = link.detach().await {
                    debug!("detach from {} failed: {}", address, e);
                }
                let _ = done.send(());
                return;
            }
        }
    }

    // owner dropped without closing
    let _ = link.detach().await;
}
