use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChannelConfig, ChannelError, ChannelEvent, ChannelLink, ChannelProvider};
use crate::{RoomId, config::PresenceConfig, presence::Announcement};

/// One subscription to the presence channel, owned for the lifetime of a
/// scope (a mounted view, a joined room).
///
/// The session is released exactly once: untrack, then unsubscribe. That
/// happens on [`ChannelSession::retract`] or, failing that, when the session
/// is dropped. Once released no further event is delivered.
#[derive(Debug)]
#[must_use = "ChannelSession must be kept, otherwise it is immediately retracted"]
pub struct ChannelSession {
    channel: String,
    key: String,
    room_id: Option<RoomId>,
    link: Box<dyn ChannelLink>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    tracked: bool,
    released: bool,
}

impl ChannelSession {
    pub fn open<P: ChannelProvider>(
        provider: &Arc<P>,
        config: &PresenceConfig,
        key: &str,
        room_id: Option<RoomId>,
    ) -> Result<Self, ChannelError> {
        let channel_config = ChannelConfig {
            key: key.to_string(),
            broadcast_self: config.broadcast_self,
        };
        let subscription = provider.subscribe(&config.channel, channel_config)?;
        debug!(channel = %config.channel, %key, room_id = ?room_id, "Opened presence session");

        Ok(Self {
            channel: config.channel.clone(),
            key: key.to_string(),
            room_id,
            link: subscription.link,
            events: Some(subscription.events),
            tracked: false,
            released: false,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Publishes the complete record, replacing this session's previous one.
    /// A failure leaves the previous announcement standing.
    pub fn announce(&mut self, announcement: &Announcement) {
        if self.released {
            warn!(channel = %self.channel, key = %self.key, "Announce on released session ignored");
            return;
        }
        match self.link.track(announcement.to_value()) {
            Ok(()) => {
                self.tracked = true;
                debug!(channel = %self.channel, key = %self.key, status = ?announcement.status, rooms = ?announcement.active_rooms, "Announced presence");
            }
            Err(e) => {
                warn!(channel = %self.channel, key = %self.key, error = %e, "Failed to announce presence");
            }
        }
    }

    /// Fire-and-forget ephemeral message.
    pub fn broadcast(&self, event: &str, payload: Value) {
        if self.released {
            return;
        }
        if let Err(e) = self.link.send(event, payload) {
            warn!(channel = %self.channel, key = %self.key, %event, error = %e, "Failed to send broadcast");
        }
    }

    /// Next snapshot or broadcast for this session. `None` once the provider
    /// stops delivering or the session is released.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.events.is_some()
    }

    /// Stops delivery without leaving the channel, after the provider closed
    /// the event stream.
    pub fn stop_receiving(&mut self) {
        if let Some(mut events) = self.events.take() {
            events.close();
        }
    }

    /// Removes the announcement, then unsubscribes.
    pub fn retract(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop_receiving();

        if self.tracked {
            if let Err(e) = self.link.untrack() {
                warn!(channel = %self.channel, key = %self.key, error = %e, "Failed to retract presence");
            }
            self.tracked = false;
        }
        if let Err(e) = self.link.unsubscribe() {
            warn!(channel = %self.channel, key = %self.key, error = %e, "Failed to unsubscribe");
        }
        debug!(channel = %self.channel, key = %self.key, room_id = ?self.room_id, "Released presence session");
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.release();
    }
}
