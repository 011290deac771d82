//! Sealed deployment bundles: build, verify, and safely extract profile and
//! miner archives. §3 "Bundle", §4.6 "Bundle deployment", §8 "bundle
//! round-trip" and "tar slip refused".
//!
//! A bundle's `data` is always `seal(derive_key(password), plaintext)` from
//! [`crate::transport::seal`] — the same ChaCha20-Poly1305 envelope used for
//! every application message, keyed by hashing an arbitrary password string
//! rather than installing a 32-byte connection secret directly. That lets a
//! bundle be built offline with an operator-chosen passphrase, or inline
//! during a live deploy using the connection's shared secret (base64) as
//! the password, per §4.6.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::protocol::BundleType;
use crate::transport::seal;

/// Per-file cap during miner/full bundle extraction (§4.6, §8).
pub const MAX_EXTRACTED_FILE_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("decryption failed (wrong password or corrupt data)")]
    DecryptionFailed,
    #[error("malformed profile json: {0}")]
    MalformedProfile(#[from] serde_json::Error),
    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),
    #[error("archive entry exceeds size cap: {0}")]
    EntryTooLarge(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BundleResult<T> = Result<T, BundleError>;

/// A sealed deployment artifact as carried on the wire or persisted to disk.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub bundle_type: BundleType,
    pub name: String,
    /// Sealed blob: `nonce || ciphertext || tag`.
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`.
    pub checksum: String,
}

fn derive_key(password: &str) -> chacha20poly1305::Key {
    let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    seal::key_from_shared_secret(&digest)
}

fn checksum_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl Bundle {
    /// Checksum holds: `SHA-256(data) == checksum`, per §3 and §8.
    pub fn verify(&self) -> bool {
        checksum_of(&self.data) == self.checksum
    }

    pub fn build_profile(name: impl Into<String>, profile_json: &[u8], password: &str) -> Self {
        let data = seal::seal(&derive_key(password), profile_json);
        let checksum = checksum_of(&data);
        Self {
            bundle_type: BundleType::Profile,
            name: name.into(),
            data,
            checksum,
        }
    }

    /// Seal a pre-built tar archive (see [`build_miner_archive`]) into a
    /// `miner` or `full` bundle.
    pub fn build_archive(bundle_type: BundleType, name: impl Into<String>, tar_bytes: &[u8], password: &str) -> Self {
        let data = seal::seal(&derive_key(password), tar_bytes);
        let checksum = checksum_of(&data);
        Self {
            bundle_type,
            name: name.into(),
            data,
            checksum,
        }
    }

    /// Decrypt and return the bundle's plaintext, verifying the checksum
    /// first. For `profile` bundles this is the raw JSON bytes; for
    /// `miner`/`full` it's the tar archive.
    pub fn open(&self, password: &str) -> BundleResult<Vec<u8>> {
        if !self.verify() {
            return Err(BundleError::ChecksumMismatch);
        }
        seal::open(&derive_key(password), &self.data).ok_or(BundleError::DecryptionFailed)
    }
}

/// Extract a `profile` bundle: verify checksum, decrypt, parse as JSON.
/// Does not call into [`crate::capabilities::ProfileManager`] itself — the
/// worker does that with the returned value, per §4.6.
pub fn extract_profile_bundle(bundle: &Bundle, password: &str) -> BundleResult<Value> {
    let plaintext = bundle.open(password)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Result of extracting a `miner`/`full` bundle.
#[derive(Debug, Clone)]
pub struct MinerExtraction {
    /// Name of the first executable entry encountered, if any.
    pub miner_binary: Option<String>,
    /// Files written, relative to `install_dir`.
    pub files_written: Vec<PathBuf>,
    /// An embedded `profile.json` entry, parsed, if the archive carried one.
    pub embedded_profile: Option<Value>,
}

/// Build a tar archive from `(relative path, contents, executable)` entries,
/// for use with [`Bundle::build_archive`]. A convenience for tests and for
/// any caller assembling a miner bundle outside the wire path.
pub fn build_miner_archive(entries: &[(&str, &[u8], bool)]) -> BundleResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents, executable) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(if *executable { 0o755 } else { 0o644 });
        header.set_cksum();
        builder.append_data(&mut header, path, *contents)?;
    }
    Ok(builder.into_inner()?)
}

/// Verify that `path` (as recorded in a tar entry) cannot escape the
/// destination directory: no absolute component, no `..` component.
fn is_safe_entry_path(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Extract a `miner`/`full` bundle under `install_dir`. Refuses any entry
/// with an absolute path, a `..` component, or a symlink/hardlink; caps
/// per-file size; records the first executable entry as the miner binary;
/// returns any embedded `profile.json` for the worker to best-effort save.
pub fn extract_miner_bundle(bundle: &Bundle, password: &str, install_dir: &Path) -> BundleResult<MinerExtraction> {
    let tar_bytes = bundle.open(password)?;
    let mut archive = tar::Archive::new(tar_bytes.as_slice());

    std::fs::create_dir_all(install_dir)?;

    let mut miner_binary = None;
    let mut files_written = Vec::new();
    let mut embedded_profile = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(BundleError::UnsafeEntry("symlink/hardlink entries are not permitted".into()));
        }
        if !entry_type.is_file() {
            continue;
        }

        let rel_path = entry.path()?.into_owned();
        if !is_safe_entry_path(&rel_path) {
            return Err(BundleError::UnsafeEntry(format!("{}", rel_path.display())));
        }

        let size = entry.header().size()?;
        if size > MAX_EXTRACTED_FILE_SIZE {
            return Err(BundleError::EntryTooLarge(format!("{}", rel_path.display())));
        }

        let mut contents = Vec::with_capacity(size as usize);
        entry.by_ref().take(MAX_EXTRACTED_FILE_SIZE + 1).read_to_end(&mut contents)?;
        if contents.len() as u64 > MAX_EXTRACTED_FILE_SIZE {
            return Err(BundleError::EntryTooLarge(format!("{}", rel_path.display())));
        }

        if rel_path.file_name().and_then(|n| n.to_str()) == Some("profile.json") {
            embedded_profile = Some(serde_json::from_slice(&contents)?);
        }

        let mode = entry.header().mode().unwrap_or(0);
        let is_executable = mode & 0o111 != 0;
        let dest = install_dir.join(&rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &contents)?;
        set_executable(&dest, is_executable)?;

        if miner_binary.is_none() && is_executable {
            miner_binary = Some(rel_path.display().to_string());
        }
        files_written.push(rel_path);
    }

    Ok(MinerExtraction {
        miner_binary,
        files_written,
        embedded_profile,
    })
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if !executable {
        return Ok(());
    }
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn profile_bundle_round_trips() {
        let profile = br#"{"name":"p1","minerType":"xmrig","config":{"pool":"p.example:3333"}}"#;
        let bundle = Bundle::build_profile("p1", profile, "pw");
        assert!(bundle.verify());

        let recovered = bundle.open("pw").unwrap();
        assert_eq!(recovered, profile);
    }

    #[test]
    fn wrong_password_fails_to_open() {
        let profile = br#"{"name":"p1"}"#;
        let bundle = Bundle::build_profile("p1", profile, "pw");
        let err = bundle.open("pw2").unwrap_err();
        assert!(matches!(err, BundleError::DecryptionFailed));
    }

    #[test]
    fn tampered_data_falsifies_checksum() {
        let profile = br#"{"name":"p1"}"#;
        let mut bundle = Bundle::build_profile("p1", profile, "pw");
        bundle.data[0] ^= 0xFF;
        assert!(!bundle.verify());
        assert!(matches!(bundle.open("pw"), Err(BundleError::ChecksumMismatch)));
    }

    #[test]
    fn extract_profile_bundle_parses_json() {
        let profile = br#"{"name":"p1","minerType":"xmrig","config":{"pool":"p.example:3333"}}"#;
        let bundle = Bundle::build_profile("p1", profile, "pw");
        let parsed = extract_profile_bundle(&bundle, "pw").unwrap();
        assert_eq!(parsed["name"], "p1");
    }

    #[test]
    fn miner_bundle_extracts_binary_and_config() {
        let dir = tempdir().unwrap();
        let archive = build_miner_archive(&[
            ("xmrig", b"#!/bin/sh\necho fake-miner\n", true),
            ("config.json", b"{\"pool\":\"p.example:3333\"}", false),
        ])
        .unwrap();
        let bundle = Bundle::build_archive(BundleType::Miner, "xmrig-bundle", &archive, "pw");

        let extraction = extract_miner_bundle(&bundle, "pw", dir.path()).unwrap();
        assert_eq!(extraction.miner_binary.as_deref(), Some("xmrig"));
        assert!(dir.path().join("xmrig").exists());
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn embedded_profile_is_surfaced() {
        let dir = tempdir().unwrap();
        let archive = build_miner_archive(&[
            ("xmrig", b"binary", true),
            ("profile.json", br#"{"name":"embedded"}"#, false),
        ])
        .unwrap();
        let bundle = Bundle::build_archive(BundleType::Full, "full-bundle", &archive, "pw");

        let extraction = extract_miner_bundle(&bundle, "pw", dir.path()).unwrap();
        assert_eq!(extraction.embedded_profile.unwrap()["name"], "embedded");
    }

    #[test]
    fn path_traversal_entry_is_refused() {
        let dir = tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let evil = b"rm -rf /";
        header.set_size(evil.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "../etc/passwd", &evil[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let bundle = Bundle::build_archive(BundleType::Miner, "evil", &archive, "pw");
        let err = extract_miner_bundle(&bundle, "pw", dir.path()).unwrap_err();
        assert!(matches!(err, BundleError::UnsafeEntry(_)));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn oversized_entry_is_refused() {
        // The size check happens against the declared header field before
        // any body bytes are read, so the archive need not actually carry
        // 100 MiB of content to exercise the cap.
        let dir = tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(MAX_EXTRACTED_FILE_SIZE + 1);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "huge.bin", &b"small"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let bundle = Bundle::build_archive(BundleType::Miner, "huge", &archive, "pw");
        let err = extract_miner_bundle(&bundle, "pw", dir.path()).unwrap_err();
        assert!(matches!(err, BundleError::EntryTooLarge(_)));
    }
}
