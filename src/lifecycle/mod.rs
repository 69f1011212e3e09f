pub mod controller;
pub mod fsm;

pub use controller::{PresenceController, PresenceHandle};
pub use fsm::{LifecycleEvent, LifecycleState, Visibility};
