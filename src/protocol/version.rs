//! Protocol version negotiation and the shared response-validation helper.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::{ErrorPayload, ProtocolError};
use super::message::{Message, MessageType};

/// Versions this build understands, most-preferred first.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// The version advertised as `version` in a `handshake` we send.
pub const CURRENT_VERSION: &str = "1.0";

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

pub fn unsupported_version_reason(peer_version: &str) -> String {
    format!(
        "incompatible version: peer requested {peer_version}, supported versions are {}",
        SUPPORTED_VERSIONS.join(", ")
    )
}

/// Validate an inbound message against an expected reply type and parse its
/// payload, per §4.2 "Response validation":
///   (a) fail if the message is missing entirely,
///   (b) if it's an `error` message, parse and raise the remote `ProtocolError`,
///   (c) if its type doesn't match `expected`, raise a type-mismatch error,
///   (d) otherwise parse the payload into `T`.
pub fn validate_response<T: DeserializeOwned>(
    msg: Option<&Message>,
    expected: MessageType,
) -> Result<T, ProtocolError> {
    let msg = msg.ok_or_else(|| ProtocolError::timeout("no response received"))?;

    if msg.kind == MessageType::Error {
        let payload: ErrorPayload = serde_json::from_value(msg.payload.clone())
            .map_err(|e| ProtocolError::invalid_message(format!("malformed error payload: {e}")))?;
        return Err(payload.into());
    }

    if msg.kind != expected {
        return Err(ProtocolError::invalid_message(format!(
            "expected {expected:?}, got {:?}",
            msg.kind
        )));
    }

    serde_json::from_value(msg.payload.clone())
        .map_err(|e| ProtocolError::invalid_message(format!("malformed payload: {e}")))
}

/// Parse a payload of any shape out of a message's `payload` field, without
/// the reply-type matching above (used by the worker side, which already
/// knows it received a request of the type it expects).
pub fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ProtocolError::invalid_message(format!("malformed payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::PongPayload;
    use serde_json::json;

    #[test]
    fn missing_message_is_timeout() {
        let err = validate_response::<PongPayload>(None, MessageType::Pong).unwrap_err();
        assert_eq!(err.code, super::super::error::ErrorCode::Timeout);
    }

    #[test]
    fn error_reply_surfaces_remote_code() {
        let err_payload = json!({"code": 1003, "message": "miner not found"});
        let msg = Message::new(MessageType::Error, "b", "a", err_payload);
        let err = validate_response::<PongPayload>(Some(&msg), MessageType::Pong).unwrap_err();
        assert_eq!(err.code, super::super::error::ErrorCode::NotFound);
        assert_eq!(err.message, "miner not found");
    }

    #[test]
    fn type_mismatch_is_invalid_message() {
        let msg = Message::new(MessageType::Stats, "b", "a", json!({}));
        let err = validate_response::<PongPayload>(Some(&msg), MessageType::Pong).unwrap_err();
        assert_eq!(err.code, super::super::error::ErrorCode::InvalidMessage);
    }

    #[test]
    fn happy_path_parses_payload() {
        let payload = json!({"sentAt": 1, "receivedAt": 2});
        let msg = Message::new(MessageType::Pong, "b", "a", payload);
        let pong: PongPayload = validate_response(Some(&msg), MessageType::Pong).unwrap();
        assert_eq!(pong.sent_at, 1);
        assert_eq!(pong.received_at, 2);
    }

    #[test]
    fn version_support() {
        assert!(is_supported_version("1.0"));
        assert!(!is_supported_version("9.9"));
    }
}
