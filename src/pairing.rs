//! Server-pairing notification parser.
//!
//! A pairing notification is a decrypted push payload whose `data.body`
//! field is a JSON document carrying game-server connection parameters:
//!
//! ```json
//! { "server": "1.2.3.4:28083", "playerToken": 123456789,
//!   "playerId": "76561198000000000", … }
//! ```
//!
//! `playerToken` arrives as a number or a numeric string depending on
//! the sender; both forms are accepted.

use serde_json::Value;

/// Connection parameters extracted from a pairing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPairing {
    pub host: String,
    pub port: u16,
    pub player_id: u64,
    pub player_token: i32,
}

/// Why a notification could not be parsed as a pairing.
#[derive(Debug, PartialEq, Eq)]
pub enum PairingError {
    MissingField(&'static str),
    InvalidField(&'static str),
    /// `data.body` was present but is not valid JSON.
    BodyNotJson,
}

impl std::fmt::Display for PairingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(name) => write!(f, "pairing notification is missing {name}"),
            Self::InvalidField(name) => write!(f, "pairing notification has a malformed {name}"),
            Self::BodyNotJson => write!(f, "pairing notification body is not valid JSON"),
        }
    }
}

impl std::error::Error for PairingError {}

/// Parse a decoded notification object into connection parameters.
pub fn parse_pairing_notification(notification: &Value) -> Result<ServerPairing, PairingError> {
    let data = notification
        .get("data")
        .and_then(Value::as_object)
        .ok_or(PairingError::MissingField("data"))?;
    let body_text = data
        .get("body")
        .and_then(Value::as_str)
        .ok_or(PairingError::MissingField("body"))?;
    let body: Value = serde_json::from_str(body_text).map_err(|_| PairingError::BodyNotJson)?;

    let server = body
        .get("server")
        .and_then(Value::as_str)
        .ok_or(PairingError::MissingField("server"))?;
    let (host, port) = server
        .split_once(':')
        .ok_or(PairingError::InvalidField("server"))?;
    if host.is_empty() {
        return Err(PairingError::InvalidField("server"));
    }
    let port: u16 = port.parse().map_err(|_| PairingError::InvalidField("server"))?;

    let player_token = match body.get("playerToken") {
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or(PairingError::InvalidField("playerToken"))?,
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| PairingError::InvalidField("playerToken"))?,
        Some(_) => return Err(PairingError::InvalidField("playerToken")),
        None => return Err(PairingError::MissingField("playerToken")),
    };

    let player_id: u64 = body
        .get("playerId")
        .and_then(Value::as_str)
        .ok_or(PairingError::MissingField("playerId"))?
        .parse()
        .map_err(|_| PairingError::InvalidField("playerId"))?;

    Ok(ServerPairing {
        host: host.to_string(),
        port,
        player_id,
        player_token,
    })
}
