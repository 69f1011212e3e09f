pub mod api;
pub mod channel;
pub mod config;
pub mod identity;
pub mod lifecycle;
pub mod presence;
pub mod server;
pub mod ws;

pub type RoomId = String;
pub type UserId = String;
