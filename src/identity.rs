//! Node identity: long-term X25519 keypair, public identity record, and
//! per-peer shared-secret derivation.
//!
//! The private key never appears in the serialized identity record and is
//! persisted to a separate, owner-only file (§5: private key material never
//! leaves its owning structure).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Node role: initiates requests, handles them, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Worker,
    Dual,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity not initialized")]
    NotInitialized,
    #[error("on-disk identity is corrupt: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// Public, persisted identity record. Never carries the private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    pub public_key: String, // base64
    pub role: Role,
    pub created_at: u64,
}

/// Validate a human node name: 1-64 chars, alphanumeric/-/_/space, must
/// start and end alphanumeric.
pub fn validate_name(name: &str) -> IdentityResult<()> {
    let len = name.chars().count();
    if len == 0 || len > 64 {
        return Err(IdentityError::InvalidName(format!(
            "name length {len} out of range 1..=64"
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ');
    if !valid_chars {
        return Err(IdentityError::InvalidName(
            "name contains characters outside [A-Za-z0-9-_ ]".into(),
        ));
    }
    let first = name.chars().next().unwrap();
    let last = name.chars().last().unwrap();
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(IdentityError::InvalidName(
            "name must start and end with an alphanumeric character".into(),
        ));
    }
    Ok(())
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Derive the node id: hex of the first 16 bytes of SHA-256(public_key).
pub fn derive_node_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..16])
}

/// Owns the long-term keypair, the public identity record, and the paths
/// identity state is persisted under.
pub struct NodeManager {
    secret: StaticSecret,
    record: IdentityRecord,
    private_key_path: PathBuf,
    identity_path: PathBuf,
}

impl NodeManager {
    /// Generate a fresh identity, persisting it to `private_key_path` (mode
    /// 0600, parent dir 0700) and `identity_path` (mode 0644). Overwrites any
    /// existing identity at those paths.
    pub fn generate(
        name: &str,
        role: Role,
        private_key_path: impl Into<PathBuf>,
        identity_path: impl Into<PathBuf>,
    ) -> IdentityResult<Self> {
        validate_name(name)?;
        let private_key_path = private_key_path.into();
        let identity_path = identity_path.into();

        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        let id = derive_node_id(public.as_bytes());

        let record = IdentityRecord {
            id,
            name: name.to_string(),
            public_key: BASE64.encode(public.as_bytes()),
            role,
            created_at: now(),
        };

        let manager = Self {
            secret,
            record,
            private_key_path,
            identity_path,
        };
        manager.persist()?;
        Ok(manager)
    }

    /// Load a previously generated identity from disk.
    pub fn load(
        private_key_path: impl Into<PathBuf>,
        identity_path: impl Into<PathBuf>,
    ) -> IdentityResult<Self> {
        let private_key_path = private_key_path.into();
        let identity_path = identity_path.into();

        if !private_key_path.exists() || !identity_path.exists() {
            return Err(IdentityError::NotInitialized);
        }

        let key_bytes = fs::read(&private_key_path)?;
        let secret_bytes: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Corrupt("private key is not 32 bytes".into()))?;
        let secret = StaticSecret::from(secret_bytes);

        let record_json = fs::read_to_string(&identity_path)?;
        let record: IdentityRecord = serde_json::from_str(&record_json)
            .map_err(|e| IdentityError::Corrupt(format!("identity record: {e}")))?;

        // Sanity-check that the persisted public key matches the private key.
        let public = PublicKey::from(&secret);
        let expected = BASE64.encode(public.as_bytes());
        if expected != record.public_key {
            return Err(IdentityError::Corrupt(
                "private key does not match persisted public key".into(),
            ));
        }

        Ok(Self {
            secret,
            record,
            private_key_path,
            identity_path,
        })
    }

    fn persist(&self) -> IdentityResult<()> {
        if let Some(parent) = self.private_key_path.parent() {
            fs::create_dir_all(parent)?;
            set_dir_mode(parent, 0o700)?;
        }
        fs::write(&self.private_key_path, self.secret.to_bytes())?;
        set_file_mode(&self.private_key_path, 0o600)?;

        if let Some(parent) = self.identity_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.record)
            .map_err(|e| IdentityError::Corrupt(e.to_string()))?;
        fs::write(&self.identity_path, json)?;
        set_file_mode(&self.identity_path, 0o644)?;
        Ok(())
    }

    pub fn record(&self) -> &IdentityRecord {
        &self.record
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn public_key_base64(&self) -> &str {
        &self.record.public_key
    }

    /// SHA-256(ECDH(local_priv, peer_pub)) as the 32-byte per-peer shared
    /// secret. The post-hash is mandatory: raw ECDH output is never used
    /// directly as a symmetric key.
    pub fn derive_shared_secret(&self, peer_public_key: &[u8]) -> IdentityResult<[u8; 32]> {
        let key_bytes: [u8; 32] = peer_public_key
            .try_into()
            .map_err(|_| IdentityError::InvalidKey("public key must be 32 bytes".into()))?;
        let peer_pub = PublicKey::from(key_bytes);
        let shared = self.secret.diffie_hellman(&peer_pub);
        Ok(Sha256::digest(shared.as_bytes()).into())
    }

    pub fn update_name(&mut self, name: &str) -> IdentityResult<()> {
        validate_name(name)?;
        self.record.name = name.to_string();
        self.persist()
    }

    pub fn update_role(&mut self, role: Role) -> IdentityResult<()> {
        self.record.role = role;
        self.persist()
    }

    /// Remove both persisted files. Best-effort per file; absence of either
    /// file is not an error.
    pub fn delete(
        private_key_path: impl AsRef<Path>,
        identity_path: impl AsRef<Path>,
    ) -> IdentityResult<()> {
        match fs::remove_file(private_key_path) {
            Ok(()) | Err(_) => {}
        }
        match fs::remove_file(identity_path) {
            Ok(()) | Err(_) => {}
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paths(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join("private.key"), dir.join("node.json"))
    }

    #[test]
    fn generate_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let (key_path, id_path) = paths(dir.path());

        let manager = NodeManager::generate("node-a", Role::Dual, &key_path, &id_path).unwrap();
        let pubkey = manager.public_key_base64().to_string();
        let id = manager.id().to_string();

        let reloaded = NodeManager::load(&key_path, &id_path).unwrap();
        assert_eq!(reloaded.public_key_base64(), pubkey);
        assert_eq!(reloaded.id(), id);
    }

    #[test]
    fn load_without_files_is_not_initialized() {
        let dir = tempdir().unwrap();
        let (key_path, id_path) = paths(dir.path());
        let err = NodeManager::load(&key_path, &id_path).unwrap_err();
        assert!(matches!(err, IdentityError::NotInitialized));
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let (key_a, id_a) = paths(dir_a.path());
        let (key_b, id_b) = paths(dir_b.path());

        let a = NodeManager::generate("a", Role::Dual, &key_a, &id_a).unwrap();
        let b = NodeManager::generate("b", Role::Dual, &key_b, &id_b).unwrap();

        let secret_from_a = a
            .derive_shared_secret(b.public_key().as_bytes())
            .unwrap();
        let secret_from_b = b
            .derive_shared_secret(a.public_key().as_bytes())
            .unwrap();

        assert_eq!(secret_from_a, secret_from_b);
        assert_eq!(secret_from_a.len(), 32);
    }

    #[test]
    fn derive_shared_secret_rejects_bad_length() {
        let dir = tempdir().unwrap();
        let (key_path, id_path) = paths(dir.path());
        let manager = NodeManager::generate("a", Role::Worker, &key_path, &id_path).unwrap();
        let err = manager.derive_shared_secret(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, IdentityError::InvalidKey(_)));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("xmrig-0").is_ok());
        assert!(validate_name("a b_c").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading-dash").is_err());
        assert!(validate_name("trailing-dash-").is_err());
        assert!(validate_name("has/slash").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn update_name_persists() {
        let dir = tempdir().unwrap();
        let (key_path, id_path) = paths(dir.path());
        let mut manager = NodeManager::generate("a", Role::Worker, &key_path, &id_path).unwrap();
        manager.update_name("renamed").unwrap();
        let reloaded = NodeManager::load(&key_path, &id_path).unwrap();
        assert_eq!(reloaded.record().name, "renamed");
    }

    #[test]
    fn delete_is_best_effort() {
        let dir = tempdir().unwrap();
        let (key_path, id_path) = paths(dir.path());
        NodeManager::delete(&key_path, &id_path).unwrap();
        NodeManager::generate("a", Role::Worker, &key_path, &id_path).unwrap();
        NodeManager::delete(&key_path, &id_path).unwrap();
        assert!(!key_path.exists());
        assert!(!id_path.exists());
    }
}
