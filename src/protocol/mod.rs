//! Wire protocol: message envelope, payload catalog, protocol-level errors,
//! and version negotiation. Everything here describes bytes on the wire, not
//! what a node does with them (see [`crate::controller`] and [`crate::worker`]).

mod error;
mod message;
mod payload;
mod version;

pub use error::{is_protocol_error, protocol_error_code, ErrorCode, ErrorPayload, ProtocolError};
pub use message::{Message, MessageType};
pub use payload::*;
pub use version::{
    is_supported_version, parse_payload, unsupported_version_reason, validate_response,
    CURRENT_VERSION, SUPPORTED_VERSIONS,
};
