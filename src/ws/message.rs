use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::channel::RawSnapshot;

/// Frames a client sends to the relay. `sub` names one subscription of the
/// connection; a connection may hold several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "data")]
#[ts(export)]
pub enum ClientFrame {
    Subscribe {
        sub: u64,
        channel: String,
        key: String,
        #[serde(default)]
        broadcast_self: bool,
    },
    Track {
        sub: u64,
        payload: Value,
    },
    Untrack {
        sub: u64,
    },
    Broadcast {
        sub: u64,
        event: String,
        payload: Value,
    },
    Unsubscribe {
        sub: u64,
    },
}

impl ClientFrame {
    pub fn sub(&self) -> u64 {
        match self {
            ClientFrame::Subscribe { sub, .. }
            | ClientFrame::Track { sub, .. }
            | ClientFrame::Untrack { sub }
            | ClientFrame::Broadcast { sub, .. }
            | ClientFrame::Unsubscribe { sub } => *sub,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl TryFrom<&str> for ClientFrame {
    type Error = serde_json::Error;
    fn try_from(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "data")]
#[ts(export)]
pub enum ServerFrame {
    Subscribed {
        sub: u64,
        channel: String,
    },
    PresenceState {
        sub: u64,
        state: RawSnapshot,
    },
    Broadcast {
        sub: u64,
        event: String,
        payload: Value,
    },
    Error {
        sub: Option<u64>,
        message: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl TryFrom<&str> for ServerFrame {
    type Error = serde_json::Error;
    fn try_from(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_use_type_and_data() {
        let frame = ClientFrame::Track {
            sub: 3,
            payload: json!({ "user_id": "alice" }),
        };
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({ "type": "Track", "data": { "sub": 3, "payload": { "user_id": "alice" } } })
        );
        assert_eq!(frame.sub(), 3);
    }

    #[test]
    fn subscribe_defaults_broadcast_self() {
        let frame = ClientFrame::try_from(
            r#"{"type":"Subscribe","data":{"sub":1,"channel":"online-users","key":"alice"}}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                sub: 1,
                channel: "online-users".to_string(),
                key: "alice".to_string(),
                broadcast_self: false,
            }
        );
    }

    #[test]
    fn error_frames_parse_from_text() {
        let frame = ServerFrame::try_from(
            r#"{"type":"Error","data":{"sub":4,"message":"Subscription '4' does not exist"}}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            ServerFrame::Error {
                sub: Some(4),
                message: "Subscription '4' does not exist".to_string(),
            }
        );
    }

    #[test]
    fn unknown_frames_are_rejected() {
        assert!(ClientFrame::try_from(r#"{"type":"Join","data":{"sub":1}}"#).is_err());
        assert!(ServerFrame::try_from("not json").is_err());
    }
}
