//! ICE server list handed to clients before call setup.

use crate::config::TurnConfig;
use common::secret::ExposeSecret;
use serde::Serialize;

/// Public STUN servers used as a fallback when the self-hosted relay is
/// unreachable.
pub const PUBLIC_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const TURN_PORT: &str = ":3478";
const TURNS_PORT: &str = ":5349";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    fn open(urls: impl Into<String>) -> Self {
        Self {
            urls: urls.into(),
            username: None,
            credential: None,
        }
    }

    fn authenticated(urls: impl Into<String>, username: &str, credential: &str) -> Self {
        Self {
            urls: urls.into(),
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// Body of `GET /webrtc/turn-credentials`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ttl: u64,
}

/// Build the ICE server list for `turn`.
///
/// Relay entries (UDP, TCP and TLS) are only included when both a username
/// and a credential are configured.
#[must_use]
pub fn ice_configuration(turn: &TurnConfig) -> IceConfiguration {
    let mut ice_servers: Vec<IceServer> = PUBLIC_STUN_SERVERS
        .iter()
        .map(|url| IceServer::open(*url))
        .collect();

    ice_servers.push(IceServer::open(turn.url.replacen("turn:", "stun:", 1)));

    if let (Some(username), Some(credential)) = (&turn.username, &turn.credential) {
        let credential = credential.expose_secret();
        let turns_url = turn
            .url
            .replacen("turn:", "turns:", 1)
            .replacen(TURN_PORT, TURNS_PORT, 1);

        ice_servers.push(IceServer::authenticated(&turn.url, username, credential));
        ice_servers.push(IceServer::authenticated(
            format!("{}?transport=tcp", turn.url),
            username,
            credential,
        ));
        ice_servers.push(IceServer::authenticated(turns_url, username, credential));
    }

    IceConfiguration {
        ice_servers,
        ttl: turn.ttl_seconds,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::SecretString;

    fn urls(config: &IceConfiguration) -> Vec<&str> {
        config.ice_servers.iter().map(|s| s.urls.as_str()).collect()
    }

    #[test]
    fn test_stun_only_without_credentials() {
        let config = ice_configuration(&TurnConfig::default());

        assert_eq!(
            urls(&config),
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
                "stun:localhost:3478",
            ]
        );
        assert!(config.ice_servers.iter().all(|s| s.credential.is_none()));
        assert_eq!(config.ttl, 3600);
    }

    #[test]
    fn test_relay_entries_with_credentials() {
        let turn = TurnConfig {
            url: "turn:relay.example.org:3478".to_string(),
            username: Some("relay".to_string()),
            credential: Some(SecretString::from("pass")),
            ttl_seconds: 600,
        };
        let config = ice_configuration(&turn);

        assert_eq!(
            urls(&config),
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
                "stun:relay.example.org:3478",
                "turn:relay.example.org:3478",
                "turn:relay.example.org:3478?transport=tcp",
                "turns:relay.example.org:5349",
            ]
        );
        let last = config.ice_servers.last().unwrap();
        assert_eq!(last.username.as_deref(), Some("relay"));
        assert_eq!(last.credential.as_deref(), Some("pass"));
        assert_eq!(config.ttl, 600);
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(ice_configuration(&TurnConfig::default())).unwrap();

        assert_eq!(json["ttl"], 3600);
        assert_eq!(json["iceServers"][0]["urls"], "stun:stun.l.google.com:19302");
        assert!(json["iceServers"][0].get("username").is_none());
    }
}
