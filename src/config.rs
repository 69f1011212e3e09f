use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHANNEL: &str = "online-users";
pub const DEFAULT_TYPING_EVENT: &str = "typing";

const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_HEARTBEAT_INTERVAL_SECS: &str = "30";
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: &str = "60";

/// Settings of a presence controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Name of the presence channel every client joins.
    pub channel: String,
    /// Broadcast event name carrying typing notifications.
    pub typing_event: String,
    /// Whether our own broadcasts are echoed back by the provider.
    pub broadcast_self: bool,
    /// Clear a raised `is_typing` locally when no update arrives in time.
    /// `None` keeps it until the next event or snapshot.
    #[serde(with = "optional_millis")]
    pub typing_timeout: Option<Duration>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            typing_event: DEFAULT_TYPING_EVENT.to_string(),
            broadcast_self: false,
            typing_timeout: None,
        }
    }
}

impl PresenceConfig {
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = Some(timeout);
        self
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Settings of the relay server, from flags or `PRESENCE_*` env vars.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(name = "presence-relay", about = "Presence relay server")]
pub struct RelayConfig {
    #[arg(long, env = "PRESENCE_RELAY_ADDR", default_value = DEFAULT_RELAY_ADDR)]
    pub addr: SocketAddr,
    /// How often the relay pings each client, in seconds.
    #[arg(
        long = "heartbeat-interval",
        env = "PRESENCE_HEARTBEAT_INTERVAL_SECS",
        default_value = DEFAULT_HEARTBEAT_INTERVAL_SECS,
        value_parser = parse_secs
    )]
    pub heartbeat_interval: Duration,
    /// How long the relay waits for a pong before dropping the client, in seconds.
    #[arg(
        long = "heartbeat-timeout",
        env = "PRESENCE_HEARTBEAT_TIMEOUT_SECS",
        default_value = DEFAULT_HEARTBEAT_TIMEOUT_SECS,
        value_parser = parse_secs
    )]
    pub heartbeat_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
    match raw.parse::<u64>() {
        Ok(0) => Err("must be at least one second".to_string()),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_config_reads_partial_json() {
        let config: PresenceConfig =
            serde_json::from_str(r#"{ "channel": "room-presence", "typing_timeout": 1500 }"#)
                .unwrap();

        assert_eq!(config.channel, "room-presence");
        assert_eq!(config.typing_event, DEFAULT_TYPING_EVENT);
        assert_eq!(config.typing_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn relay_config_defaults_match_the_flags() {
        let config = RelayConfig::try_parse_from(["presence-relay"]).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn relay_config_reads_flags() {
        let config = RelayConfig::try_parse_from([
            "presence-relay",
            "--addr",
            "0.0.0.0:9000",
            "--heartbeat-interval",
            "5",
        ])
        .unwrap();

        assert_eq!(config.addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
    }

    #[test]
    fn relay_config_rejects_bad_durations() {
        for bad in ["nope", "0", "-3"] {
            let parsed =
                RelayConfig::try_parse_from(["presence-relay", "--heartbeat-timeout", bad]);
            assert!(parsed.is_err(), "{bad} was accepted");
        }
        assert!(RelayConfig::try_parse_from(["presence-relay", "--addr", "localhost"]).is_err());
    }
}
