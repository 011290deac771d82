//! Wire-level protocol errors (codes 1000-1999).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried in [`ErrorPayload`], per the protocol catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 1000,
    InvalidMessage = 1001,
    Unauthorized = 1002,
    NotFound = 1003,
    OperationFailed = 1004,
    Timeout = 1005,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Wire-level error reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Typed protocol error. Constructed either locally (we rejected a message)
/// or from a remote `error` reply.
#[derive(Debug, Clone, Error)]
#[error("protocol error {code:?}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OperationFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidMessage, message)
    }

    pub fn into_payload(self) -> ErrorPayload {
        ErrorPayload {
            code: self.code.as_u16(),
            message: self.message,
            details: self.details,
        }
    }
}

impl From<ErrorPayload> for ProtocolError {
    fn from(payload: ErrorPayload) -> Self {
        let code = match payload.code {
            1001 => ErrorCode::InvalidMessage,
            1002 => ErrorCode::Unauthorized,
            1003 => ErrorCode::NotFound,
            1004 => ErrorCode::OperationFailed,
            1005 => ErrorCode::Timeout,
            _ => ErrorCode::Unknown,
        };
        Self {
            code,
            message: payload.message,
            details: payload.details,
        }
    }
}

/// Branch on a caller-held error without string matching.
pub fn is_protocol_error(err: &dyn std::error::Error) -> bool {
    err.downcast_ref::<ProtocolError>().is_some()
}

pub fn protocol_error_code(err: &(dyn std::error::Error + 'static)) -> Option<ErrorCode> {
    err.downcast_ref::<ProtocolError>().map(|e| e.code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_payload() {
        let err = ProtocolError::not_found("miner xmrig-0").with_details("no such miner");
        let payload = err.clone().into_payload();
        let back: ProtocolError = payload.into();
        assert_eq!(back.code, ErrorCode::NotFound);
        assert_eq!(back.message, "miner xmrig-0");
        assert_eq!(back.details.as_deref(), Some("no such miner"));
    }

    #[test]
    fn unknown_code_maps_to_unknown() {
        let payload = ErrorPayload {
            code: 9999,
            message: "weird".into(),
            details: None,
        };
        let err: ProtocolError = payload.into();
        assert_eq!(err.code, ErrorCode::Unknown);
    }
}
