use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, trace, warn};

use super::fsm::{LifecycleEvent, LifecycleState, Visibility};
use crate::{
    RoomId, UserId,
    channel::{ChannelEvent, ChannelProvider, ChannelSession},
    config::PresenceConfig,
    identity::{Identity, IdentityProvider},
    presence::{
        Activity, PresenceRecord, PresenceState, TypingEvent, apply_snapshot, apply_typing,
        build_announcement,
    },
};

#[derive(Debug)]
enum Command {
    Visibility(Visibility),
    Room(Option<RoomId>),
    Typing {
        is_typing: bool,
        applied: oneshot::Sender<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Owns one presence session and the canonical state reduced from it.
///
/// Runs as a single task: provider events, visibility changes, room changes
/// and typing updates are handled one at a time, so the state is only ever
/// written here. Callers talk to it through a [`PresenceHandle`].
pub struct PresenceController<P, I>
where
    P: ChannelProvider,
    I: IdentityProvider,
{
    provider: Arc<P>,
    identity_provider: I,
    config: PresenceConfig,
    room_id: Option<RoomId>,
    visibility: Visibility,
    is_typing: bool,
    identity: Option<Identity>,
    session: Option<ChannelSession>,
    lifecycle: LifecycleState,
    typing_deadlines: HashMap<UserId, Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<PresenceState>,
    lifecycle_tx: watch::Sender<LifecycleState>,
}

impl<P, I> PresenceController<P, I>
where
    P: ChannelProvider,
    I: IdentityProvider,
{
    /// Mounts a presence scope for `room_id` and starts its task.
    pub fn spawn(
        provider: Arc<P>,
        identity_provider: I,
        config: PresenceConfig,
        room_id: Option<RoomId>,
        visibility: Visibility,
    ) -> PresenceHandle {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(PresenceState::default());
        let (lifecycle_tx, lifecycle) = watch::channel(LifecycleState::Joining);

        let controller = Self {
            provider,
            identity_provider,
            config,
            room_id,
            visibility,
            is_typing: false,
            identity: None,
            session: None,
            lifecycle: LifecycleState::Joining,
            typing_deadlines: HashMap::new(),
            commands,
            state_tx,
            lifecycle_tx,
        };

        PresenceHandle {
            commands: command_tx,
            state,
            lifecycle,
            task: tokio::spawn(controller.run()),
        }
    }

    async fn run(mut self) {
        self.join().await;

        loop {
            let typing_deadline = self.typing_deadlines.values().min().copied();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Visibility(visibility)) => self.set_visibility(visibility),
                    Some(Command::Room(room_id)) => self.change_room(room_id).await,
                    Some(Command::Typing { is_typing, applied }) => {
                        self.set_typing(is_typing);
                        let _ = applied.send(());
                    }
                    Some(Command::Shutdown(done)) => {
                        self.teardown();
                        let _ = done.send(());
                        return;
                    }
                    // Every handle is gone: the scope was torn down.
                    None => break,
                },
                event = next_event(&mut self.session) => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!(channel = %self.config.channel, "Provider stopped delivering presence events");
                        if let Some(session) = self.session.as_mut() {
                            session.stop_receiving();
                        }
                    }
                },
                _ = sleep_until(typing_deadline) => self.expire_typing(),
            }
        }

        self.teardown();
    }

    fn transition(&mut self, event: LifecycleEvent) {
        let next = self.lifecycle.on_event(event);
        if next != self.lifecycle {
            debug!(from = ?self.lifecycle, to = ?next, ?event, "Presence lifecycle transition");
            self.lifecycle = next;
            self.lifecycle_tx.send_replace(next);
        }
    }

    async fn join(&mut self) {
        let Some(identity) = self.identity_provider.current_user().await else {
            debug!(room_id = ?self.room_id, "No authenticated user, presence stays inactive");
            self.transition(LifecycleEvent::IdentityMissing);
            return;
        };

        match ChannelSession::open(&self.provider, &self.config, &identity.id, self.room_id.clone())
        {
            Ok(session) => {
                info!(user_id = %identity.id, channel = %self.config.channel, room_id = ?self.room_id, "Presence session joined");
                self.session = Some(session);
                self.identity = Some(identity);
                self.transition(LifecycleEvent::Joined(self.visibility));
                self.announce();
            }
            Err(e) => {
                warn!(user_id = %identity.id, channel = %self.config.channel, error = %e, "Failed to open presence session");
                self.transition(LifecycleEvent::SubscribeFailed);
            }
        }
    }

    fn announce(&mut self) {
        let (Some(activity), Some(identity), Some(session)) = (
            self.lifecycle.activity(),
            self.identity.as_ref(),
            self.session.as_mut(),
        ) else {
            return;
        };

        let announcement = build_announcement(
            identity,
            activity,
            self.room_id.as_ref(),
            self.is_typing,
            Utc::now(),
        );
        session.announce(&announcement);
    }

    fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
        if visibility == Visibility::Hidden {
            self.is_typing = false;
        }
        let before = self.lifecycle;
        self.transition(LifecycleEvent::VisibilityChanged(visibility));
        if self.lifecycle != before {
            self.announce();
        }
    }

    async fn change_room(&mut self, room_id: Option<RoomId>) {
        if room_id == self.room_id {
            return;
        }
        info!(from = ?self.room_id, to = ?room_id, "Presence room changed");
        self.room_id = room_id;

        match self.lifecycle {
            LifecycleState::Active(_) => {
                self.transition(LifecycleEvent::RoomChanged);
                self.release_session();
                self.transition(LifecycleEvent::Rejoin);
                self.join().await;
            }
            LifecycleState::Inactive => {
                self.transition(LifecycleEvent::RoomChanged);
                self.join().await;
            }
            _ => {}
        }
    }

    /// Retracts the current session and forgets everything it reported.
    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.retract();
        }
        self.is_typing = false;
        self.typing_deadlines.clear();
        self.state_tx.send_replace(PresenceState::default());
    }

    fn teardown(&mut self) {
        if self.lifecycle.is_closed() {
            return;
        }
        self.transition(LifecycleEvent::Teardown);
        if let Some(session) = self.session.take() {
            session.retract();
        }
        self.transition(LifecycleEvent::Released);
        info!(channel = %self.config.channel, room_id = ?self.room_id, "Presence scope torn down");
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Sync(raw) => {
                let state = apply_snapshot(&raw);
                self.typing_deadlines
                    .retain(|user_id, _| state.get(user_id).is_some_and(|r| r.is_typing));
                if let Some(timeout) = self.config.typing_timeout {
                    let deadline = Instant::now() + timeout;
                    for record in state.records().filter(|record| record.is_typing) {
                        self.typing_deadlines
                            .entry(record.user_id().clone())
                            .or_insert(deadline);
                    }
                }
                debug!(users = state.len(), "Applied presence snapshot");
                self.state_tx.send_replace(state);
            }
            ChannelEvent::Broadcast { event, payload } if event == self.config.typing_event => {
                match serde_json::from_value::<TypingEvent>(payload) {
                    Ok(typing) => self.apply_typing_event(&typing),
                    Err(e) => warn!(error = %e, "Ignoring malformed typing event"),
                }
            }
            ChannelEvent::Broadcast { event, .. } => {
                trace!(%event, "Ignoring unrelated broadcast");
            }
        }
    }

    fn apply_typing_event(&mut self, event: &TypingEvent) {
        let scope = self.room_id.as_deref();
        let mut typing_now = false;
        self.state_tx.send_if_modified(|state| {
            let changed = apply_typing(state, event, scope);
            typing_now = state.get(&event.user_id).is_some_and(|r| r.is_typing);
            changed
        });

        let in_scope = scope.is_none_or(|room| event.room_id.as_deref() == Some(room));
        if !in_scope {
            return;
        }
        match self.config.typing_timeout {
            Some(timeout) if typing_now => {
                self.typing_deadlines
                    .insert(event.user_id.clone(), Instant::now() + timeout);
            }
            _ => {
                self.typing_deadlines.remove(&event.user_id);
            }
        }
    }

    /// Local echo first, then the broadcast, then the announcement so that the
    /// table carries the flag too. A failed broadcast keeps the echo.
    fn set_typing(&mut self, is_typing: bool) {
        match self.lifecycle.activity() {
            Some(Activity::Online) => {}
            Some(Activity::Away) if !is_typing => {}
            _ => {
                debug!(is_typing, lifecycle = ?self.lifecycle, "Typing update ignored");
                return;
            }
        }

        let Some(user_id) = self.identity.as_ref().map(|identity| identity.id.clone()) else {
            return;
        };

        self.is_typing = is_typing;
        let event = TypingEvent {
            user_id,
            room_id: self.room_id.clone(),
            is_typing,
        };
        self.apply_typing_event(&event);

        if let Some(session) = &self.session {
            match serde_json::to_value(&event) {
                Ok(payload) => session.broadcast(&self.config.typing_event, payload),
                Err(e) => warn!(error = %e, "Failed to encode typing event"),
            }
        }
        self.announce();
    }

    fn expire_typing(&mut self) {
        let now = Instant::now();
        let expired: Vec<UserId> = self
            .typing_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(user_id, _)| user_id.clone())
            .collect();

        let mut own_expired = false;
        for user_id in expired {
            self.typing_deadlines.remove(&user_id);
            debug!(%user_id, "Typing indicator expired");
            if self.identity.as_ref().is_some_and(|identity| identity.id == user_id) {
                self.is_typing = false;
                own_expired = true;
            }
            let cleared = TypingEvent {
                user_id,
                room_id: None,
                is_typing: false,
            };
            self.state_tx
                .send_if_modified(|state| apply_typing(state, &cleared, None));
        }
        if own_expired {
            self.announce();
        }
    }
}

async fn next_event(session: &mut Option<ChannelSession>) -> Option<ChannelEvent> {
    match session {
        Some(session) if session.is_receiving() => session.recv().await,
        _ => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running [`PresenceController`].
///
/// Reads go straight to the live state; everything else is queued to the
/// controller task. Dropping the last handle tears the scope down, which
/// retracts the announcement and unsubscribes.
#[derive(Debug)]
pub struct PresenceHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<PresenceState>,
    lifecycle: watch::Receiver<LifecycleState>,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    /// Live, read-only view of the canonical state.
    pub fn state(&self) -> watch::Receiver<PresenceState> {
        self.state.clone()
    }

    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.clone()
    }

    pub fn current_lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    pub fn users_in_room(&self, room_id: &str) -> Vec<PresenceRecord> {
        self.state.borrow().users_in_room(room_id)
    }

    pub fn typing_users(&self, room_id: Option<&str>) -> Vec<PresenceRecord> {
        self.state.borrow().typing_users(room_id)
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.send(Command::Visibility(visibility));
    }

    pub fn set_room(&self, room_id: Option<RoomId>) {
        self.send(Command::Room(room_id));
    }

    /// Returns once the local echo is applied and the broadcast and announcement
    /// are handed to the provider. Delivery is not awaited.
    pub async fn set_typing(&self, is_typing: bool) {
        let (applied, done) = oneshot::channel();
        self.send(Command::Typing { is_typing, applied });
        let _ = done.await;
    }

    /// Tears the scope down and waits for the controller task to finish.
    pub async fn shutdown(self) {
        let (done_tx, done) = oneshot::channel();
        self.send(Command::Shutdown(done_tx));
        let _ = done.await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Presence controller task failed");
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Presence controller already stopped");
        }
    }
}
