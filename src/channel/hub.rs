use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    ChannelConfig, ChannelError, ChannelEvent, ChannelLink, ChannelProvider, PRESENCE_REF_FIELD,
    RawSnapshot, Subscription,
};

/// In-process channel provider.
///
/// Every channel keeps one presence row per subscription. Any change to the
/// table is fanned out as a full snapshot to every subscriber of the channel,
/// the writer included. Channels are created on first subscribe and removed
/// when their last subscriber leaves.
#[derive(Debug, Default)]
pub struct PresenceHub {
    channels: RwLock<HashMap<String, Arc<HubChannel>>>,
    next_member: AtomicU64,
}

#[derive(Debug)]
struct HubChannel {
    name: String,
    // Member ids grow monotonically, so iteration is join order.
    members: Mutex<BTreeMap<u64, Member>>,
}

#[derive(Debug)]
struct Member {
    key: String,
    presence_ref: String,
    broadcast_self: bool,
    sender: mpsc::UnboundedSender<ChannelEvent>,
    row: Option<Value>,
}

impl HubChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Mutex::new(BTreeMap::new()),
        }
    }

    fn snapshot(members: &BTreeMap<u64, Member>) -> RawSnapshot {
        let mut snapshot = RawSnapshot::new();
        for member in members.values() {
            if let Some(row) = &member.row {
                snapshot
                    .entry(member.key.clone())
                    .or_default()
                    .push(row.clone());
            }
        }
        snapshot
    }

    /// Sends the current table to every member. Called with the member lock
    /// held so each subscriber sees snapshots in table order.
    fn fan_out(&self, members: &BTreeMap<u64, Member>) {
        let snapshot = Self::snapshot(members);
        trace!(channel = %self.name, rows = snapshot.len(), "Fanning out presence snapshot");
        for (member_id, member) in members {
            if member.sender.send(ChannelEvent::Sync(snapshot.clone())).is_err() {
                trace!(channel = %self.name, %member_id, "Subscriber queue closed");
            }
        }
    }
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_count(&self) -> Result<usize, ChannelError> {
        Ok(self.channels.read()?.len())
    }

    pub fn list_channels(&self) -> Result<Vec<String>, ChannelError> {
        let mut names: Vec<String> = self.channels.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn subscriber_count(&self, channel: &str) -> Result<usize, ChannelError> {
        let channel = self.get_channel(channel)?;
        let members = channel.members.lock()?;
        Ok(members.len())
    }

    /// Current presence table of a channel.
    pub fn presence_table(&self, channel: &str) -> Result<RawSnapshot, ChannelError> {
        let channel = self.get_channel(channel)?;
        let members = channel.members.lock()?;
        Ok(HubChannel::snapshot(&members))
    }

    fn get_channel(&self, channel: &str) -> Result<Arc<HubChannel>, ChannelError> {
        self.channels
            .read()?
            .get(channel)
            .cloned()
            .ok_or_else(|| ChannelError::ChannelNotFound(channel.to_string()))
    }

    fn remove_channel_if_empty(&self, channel: &str) -> Result<(), ChannelError> {
        let mut channels = self.channels.write()?;
        let is_empty = match channels.get(channel) {
            Some(c) => c.members.lock()?.is_empty(),
            None => false,
        };
        if is_empty {
            channels.remove(channel);
            debug!(%channel, "Removed empty channel");
        }
        Ok(())
    }
}

impl ChannelProvider for PresenceHub {
    fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        config: ChannelConfig,
    ) -> Result<Subscription, ChannelError> {
        let (sender, events) = mpsc::unbounded_channel();
        let member_id = self.next_member.fetch_add(1, Ordering::Relaxed);

        let hub_channel = {
            let mut channels = self.channels.write()?;
            let hub_channel = channels
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(HubChannel::new(channel)))
                .clone();

            let mut members = hub_channel.members.lock()?;
            // A new subscriber starts from the current table.
            let _ = sender.send(ChannelEvent::Sync(HubChannel::snapshot(&members)));
            members.insert(
                member_id,
                Member {
                    key: config.key.clone(),
                    presence_ref: Uuid::new_v4().to_string(),
                    broadcast_self: config.broadcast_self,
                    sender,
                    row: None,
                },
            );
            drop(members);
            hub_channel
        };

        debug!(%channel, key = %config.key, %member_id, "Subscribed to channel");

        Ok(Subscription {
            link: Box::new(HubLink {
                hub: Arc::clone(self),
                channel: hub_channel,
                member_id,
                closed: false,
            }),
            events,
        })
    }
}

/// Link to one membership of a [`PresenceHub`] channel.
///
/// Dropping the link without unsubscribing removes the membership and its
/// row, as a provider does when a connection goes away.
#[derive(Debug)]
pub struct HubLink {
    hub: Arc<PresenceHub>,
    channel: Arc<HubChannel>,
    member_id: u64,
    closed: bool,
}

impl HubLink {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed {
            Err(ChannelError::Closed(self.channel.name.clone()))
        } else {
            Ok(())
        }
    }
}

impl ChannelLink for HubLink {
    fn track(&self, payload: Value) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let mut members = self.channel.members.lock()?;
        let member = members
            .get_mut(&self.member_id)
            .ok_or_else(|| ChannelError::NotSubscribed(self.channel.name.clone()))?;

        let mut row = payload;
        if let Value::Object(fields) = &mut row {
            fields.insert(
                PRESENCE_REF_FIELD.to_string(),
                Value::String(member.presence_ref.clone()),
            );
        }
        member.row = Some(row);

        self.channel.fan_out(&members);
        Ok(())
    }

    fn untrack(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let mut members = self.channel.members.lock()?;
        let member = members
            .get_mut(&self.member_id)
            .ok_or_else(|| ChannelError::NotSubscribed(self.channel.name.clone()))?;

        if member.row.take().is_some() {
            self.channel.fan_out(&members);
        }
        Ok(())
    }

    fn send(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let members = self.channel.members.lock()?;
        for (member_id, member) in members.iter() {
            if *member_id == self.member_id && !member.broadcast_self {
                continue;
            }
            let _ = member.sender.send(ChannelEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        {
            let mut members = self.channel.members.lock()?;
            if let Some(member) = members.remove(&self.member_id) {
                if member.row.is_some() {
                    self.channel.fan_out(&members);
                }
            }
        }

        debug!(channel = %self.channel.name, member_id = %self.member_id, "Unsubscribed from channel");
        self.hub.remove_channel_if_empty(&self.channel.name)
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
    }
}
