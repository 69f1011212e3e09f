use crate::presence::Activity;

// --- FSM Types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Resolving the identity and subscribing.
    Joining,
    /// No identity or no subscription: presence is unknown, nothing is announced.
    Inactive,
    /// Subscribed and announcing.
    Active(Activity),
    /// Retracting and unsubscribing.
    Leaving,
    /// Torn down for good.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    pub fn activity(self) -> Activity {
        match self {
            Visibility::Visible => Activity::Online,
            Visibility::Hidden => Activity::Away,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Joined(Visibility),
    IdentityMissing,
    SubscribeFailed,
    VisibilityChanged(Visibility),
    RoomChanged,
    Rejoin,
    Teardown,
    Released,
}

// --- FSM Implementation ---

impl LifecycleState {
    pub fn on_event(self, event: LifecycleEvent) -> LifecycleState {
        use self::{LifecycleEvent as E, LifecycleState as S};

        match (self, event) {
            // Teardown wins from anywhere but the end.
            (S::Closed, _) => S::Closed,
            (_, E::Teardown) => S::Leaving,

            // Joining
            (S::Joining, E::Joined(visibility)) => S::Active(visibility.activity()),
            (S::Joining, E::IdentityMissing) | (S::Joining, E::SubscribeFailed) => S::Inactive,

            // Active
            (S::Active(_), E::VisibilityChanged(visibility)) => S::Active(visibility.activity()),
            (S::Active(_), E::RoomChanged) => S::Leaving,

            // A room change remounts the scope, which joins again once.
            (S::Inactive, E::RoomChanged) => S::Joining,

            // Leaving
            (S::Leaving, E::Rejoin) => S::Joining,
            (S::Leaving, E::Released) => S::Closed,

            // Default: remain in current state
            (state, _) => state,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active(_))
    }

    pub fn activity(&self) -> Option<Activity> {
        match self {
            LifecycleState::Active(activity) => Some(*activity),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, LifecycleState::Closed)
    }
}
