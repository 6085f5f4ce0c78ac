//! Service endpoint adapters.
//!
//! Each endpoint wraps exactly one AMQP link and is driven by its own task.
//! Typed sends are queued to that task and complete in submission order; the
//! optional completion callback receives the remote delivery outcome.
//!
//! - [`WillEndpoint`]: sender to the Will Service, link named after the client
//! - [`SubscriptionEndpoint`]: sender to the Subscription Service
//! - [`PublishEndpoint`]: sender to one topic address
//! - [`ReceiverEndpoint`]: receiver on the client's unique address

mod link;
mod publish;
mod receiver;
mod subscription;
mod will;

pub use publish::PublishEndpoint;
pub use receiver::ReceiverEndpoint;
pub use subscription::SubscriptionEndpoint;
pub use will::WillEndpoint;

use crate::error::Result;

/// Address of the Will Service.
pub const WILL_SERVICE_ENDPOINT: &str = "$mqtt.willservice";

/// Address of the Subscription Service.
pub const SUBSCRIPTION_SERVICE_ENDPOINT: &str = "$mqtt.subscriptionservice";

/// Prefix of the unique per-client receiver address.
pub const CLIENT_ENDPOINT_PREFIX: &str = "$mqtt.to.";

/// Prefix shared by the service and per-client addresses. Client topics may
/// not use it.
pub const RESERVED_ADDRESS_PREFIX: &str = "$mqtt.";

/// Unique receiver address for a client.
pub fn client_address(client_id: &str) -> String {
    format!("{}{}", CLIENT_ENDPOINT_PREFIX, client_id)
}

/// Completion callback for a send; runs on the link task.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;
