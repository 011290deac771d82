//! Handshake message construction and verification, shared by both the
//! dialing (initiator) and accepting (responder) sides of a connection.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::identity::NodeManager;
use crate::protocol::{ErrorCode, HandshakeAckPayload, HandshakePayload, IdentityBlob, ProtocolError, CURRENT_VERSION};

pub const CHALLENGE_LEN: usize = 32;

pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut challenge);
    challenge
}

fn identity_blob(manager: &NodeManager) -> IdentityBlob {
    let record = manager.record();
    IdentityBlob {
        id: record.id.clone(),
        name: record.name.clone(),
        public_key: record.public_key.clone(),
        role: record.role,
    }
}

/// MAC over `challenge` under `shared_secret`: `SHA-256(shared_secret ||
/// challenge)`. No dedicated HMAC primitive is pulled in for this single
/// use; the shared secret is already uniformly random 32 bytes, so keyed
/// hashing this way is sound.
pub fn challenge_mac(shared_secret: &[u8; 32], challenge: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(challenge);
    hasher.finalize().into()
}

pub fn build_handshake(manager: &NodeManager, challenge: &[u8]) -> HandshakePayload {
    HandshakePayload {
        identity: identity_blob(manager),
        challenge: BASE64.encode(challenge),
        version: CURRENT_VERSION.to_string(),
    }
}

/// Responder side: derive the shared secret from the peer's identity,
/// compute the ack, and report both so the caller can install the secret
/// on the connection before sending.
pub fn build_handshake_ack(
    manager: &NodeManager,
    handshake: &HandshakePayload,
) -> Result<(HandshakeAckPayload, [u8; 32]), ProtocolError> {
    let peer_pub = BASE64
        .decode(&handshake.identity.public_key)
        .map_err(|e| ProtocolError::new(ErrorCode::InvalidMessage, format!("bad public key encoding: {e}")))?;
    let shared_secret = manager
        .derive_shared_secret(&peer_pub)
        .map_err(|e| ProtocolError::new(ErrorCode::InvalidMessage, e.to_string()))?;

    let challenge = BASE64
        .decode(&handshake.challenge)
        .map_err(|e| ProtocolError::new(ErrorCode::InvalidMessage, format!("bad challenge encoding: {e}")))?;
    let mac = challenge_mac(&shared_secret, &challenge);

    Ok((
        HandshakeAckPayload {
            identity: identity_blob(manager),
            challenge_response: BASE64.encode(mac),
            accepted: true,
            reason: None,
        },
        shared_secret,
    ))
}

pub fn rejection_ack(manager: &NodeManager, reason: impl Into<String>) -> HandshakeAckPayload {
    HandshakeAckPayload {
        identity: identity_blob(manager),
        challenge_response: String::new(),
        accepted: false,
        reason: Some(reason.into()),
    }
}

/// Initiator side: verify the ack's MAC against the challenge we sent and
/// the shared secret we derived from the ack's reported public key.
pub fn verify_ack(
    manager: &NodeManager,
    challenge: &[u8],
    ack: &HandshakeAckPayload,
) -> Result<[u8; 32], ProtocolError> {
    if !ack.accepted {
        return Err(ProtocolError::new(
            ErrorCode::Unauthorized,
            ack.reason.clone().unwrap_or_else(|| "handshake rejected".into()),
        ));
    }

    let peer_pub = BASE64
        .decode(&ack.identity.public_key)
        .map_err(|e| ProtocolError::new(ErrorCode::InvalidMessage, format!("bad public key encoding: {e}")))?;
    let shared_secret = manager
        .derive_shared_secret(&peer_pub)
        .map_err(|e| ProtocolError::new(ErrorCode::InvalidMessage, e.to_string()))?;

    let expected_mac = challenge_mac(&shared_secret, challenge);
    let given_mac = BASE64
        .decode(&ack.challenge_response)
        .map_err(|e| ProtocolError::new(ErrorCode::Unauthorized, format!("bad challenge response encoding: {e}")))?;

    if given_mac.as_slice() != expected_mac.as_slice() {
        return Err(ProtocolError::new(ErrorCode::Unauthorized, "challenge response mismatch"));
    }

    Ok(shared_secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path, name: &str) -> NodeManager {
        NodeManager::generate(name, Role::Dual, dir.join("priv"), dir.join("id.json")).unwrap()
    }

    #[test]
    fn full_handshake_round_trip_yields_matching_secret() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let a = manager(dir_a.path(), "a");
        let b = manager(dir_b.path(), "b");

        let challenge = generate_challenge();
        let handshake = build_handshake(&a, &challenge);

        let (ack, responder_secret) = build_handshake_ack(&b, &handshake).unwrap();
        let initiator_secret = verify_ack(&a, &challenge, &ack).unwrap();

        assert_eq!(responder_secret, initiator_secret);
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let a = manager(dir_a.path(), "a");
        let b = manager(dir_b.path(), "b");

        let challenge = generate_challenge();
        let handshake = build_handshake(&a, &challenge);
        let (mut ack, _) = build_handshake_ack(&b, &handshake).unwrap();
        ack.challenge_response = BASE64.encode([0u8; 32]);

        let err = verify_ack(&a, &challenge, &ack).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[test]
    fn explicit_rejection_surfaces_reason() {
        let dir_a = tempdir().unwrap();
        let a = manager(dir_a.path(), "a");
        let challenge = generate_challenge();
        let ack = rejection_ack(&a, "incompatible version");
        let err = verify_ack(&a, &challenge, &ack).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert!(err.message.contains("incompatible version"));
    }
}
