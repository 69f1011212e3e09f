pub mod error;
pub mod hub;
pub mod remote;
pub mod session;

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use serde_json::Value;
use tokio::sync::mpsc;

pub use error::ChannelError;
pub use hub::PresenceHub;
pub use remote::RemoteProvider;
pub use session::ChannelSession;

/// Full presence table of a channel: every raw row, grouped by presence key,
/// in the order the provider holds them.
pub type RawSnapshot = BTreeMap<String, Vec<Value>>;

/// Field added by providers to every row to identify the session that owns it.
pub const PRESENCE_REF_FIELD: &str = "presence_ref";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Key rows are grouped under in snapshots (conventionally the user id).
    pub key: String,
    /// Deliver this subscription's own broadcasts back to it.
    pub broadcast_self: bool,
}

impl ChannelConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            broadcast_self: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The whole presence table changed.
    Sync(RawSnapshot),
    /// An ephemeral message from another subscriber.
    Broadcast { event: String, payload: Value },
}

/// Outbound half of one subscription.
///
/// Every call is non-blocking: the provider queues or applies it immediately.
pub trait ChannelLink: Send + Debug {
    /// Publishes (or replaces) this subscription's row in the presence table.
    fn track(&self, payload: Value) -> Result<(), ChannelError>;

    /// Removes this subscription's row from the presence table.
    fn untrack(&self) -> Result<(), ChannelError>;

    /// Sends an ephemeral broadcast on the channel.
    fn send(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Leaves the channel. No event is delivered afterwards.
    fn unsubscribe(&mut self) -> Result<(), ChannelError>;
}

/// A live subscription: the link to talk to the channel, and the queue of
/// snapshots and broadcasts coming back from it.
#[derive(Debug)]
pub struct Subscription {
    pub link: Box<dyn ChannelLink>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

pub trait ChannelProvider: Send + Sync + 'static {
    fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        config: ChannelConfig,
    ) -> Result<Subscription, ChannelError>;
}
