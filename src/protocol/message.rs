//! Wire envelope: the outer shape every message shares, regardless of
//! payload. See §3 "Message" and §6 "Envelope JSON schema".

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Enumerated message types. Fixed and exhaustive per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    Ping,
    Pong,
    Disconnect,
    GetStats,
    Stats,
    StartMiner,
    StopMiner,
    MinerAck,
    Deploy,
    DeployAck,
    GetLogs,
    Logs,
    Error,
}

impl MessageType {
    /// The two plaintext-on-the-wire types (§4.4, §8): everything else must
    /// be sealed.
    pub fn is_plaintext(self) -> bool {
        matches!(self, MessageType::Handshake | MessageType::HandshakeAck)
    }
}

/// Envelope carried on the wire (pre-sealing for encrypted types). `id` is
/// globally unique per sender; `reply_to` is empty for requests and set to
/// the corresponding request's `id` for replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(rename = "ts")]
    pub timestamp: chrono::DateTime<Utc>,
    pub payload: Value,
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
}

impl Message {
    /// Build a new request/notification message with a fresh id.
    pub fn new(kind: MessageType, from: impl Into<String>, to: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from: from.into(),
            to: to.into(),
            timestamp: Utc::now(),
            payload,
            reply_to: None,
        }
    }

    /// Build a reply to `self`: copies `self.id` into `reply_to`, swaps
    /// `from`/`to`, and gets a fresh `id` of its own.
    pub fn reply(&self, kind: MessageType, from: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from: from.into(),
            to: self.from.clone(),
            timestamp: Utc::now(),
            payload,
            reply_to: Some(self.id),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn serialize(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn deserialize(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_swaps_addresses_and_sets_reply_to() {
        let req = Message::new(MessageType::Ping, "node-a", "node-b", json!({"sentAt": 1}));
        let rep = req.reply(MessageType::Pong, "node-b", json!({"sentAt": 1, "receivedAt": 2}));

        assert_eq!(rep.reply_to, Some(req.id));
        assert_eq!(rep.from, "node-b");
        assert_eq!(rep.to, "node-a");
        assert_ne!(rep.id, req.id);
    }

    #[test]
    fn request_has_no_reply_to() {
        let req = Message::new(MessageType::GetStats, "a", "b", json!({}));
        assert!(!req.is_reply());
    }

    #[test]
    fn json_round_trip() {
        let msg = Message::new(MessageType::Ping, "a", "b", json!({"sentAt": 123}));
        let bytes = msg.serialize().unwrap();
        let back = Message::deserialize(&bytes).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.kind, MessageType::Ping);
    }

    #[test]
    fn plaintext_types_are_exactly_handshake_pair() {
        assert!(MessageType::Handshake.is_plaintext());
        assert!(MessageType::HandshakeAck.is_plaintext());
        assert!(!MessageType::Ping.is_plaintext());
        assert!(!MessageType::Stats.is_plaintext());
    }
}
