//! Trust-on-first-use certificate pinning.
//!
//! Devices present self-signed certificates, so CA validation is replaced by
//! pinning: the first handshake with a host stores the SHA-256 fingerprint of
//! its leaf certificate, and later handshakes are compared against it.

mod verifier;

pub use verifier::{PIN_REJECTED_MARKER, PinningVerifier, pinned_client_config};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const PIN_FILE: &str = "certificate-pins.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub host: String,
    pub sha256_fingerprint: String,
    pub first_seen: DateTime<Utc>,
}

/// Result of comparing a presented certificate with the pin store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutcome {
    /// First contact; the fingerprint is now pinned.
    Pinned,
    Matched,
    Mismatch { stored: String, presented: String },
}

/// What to do when a host presents a certificate that differs from its pin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinPolicy {
    /// Log a security alert and let the request through.
    #[default]
    Warn,
    /// Log a security alert and abort the handshake.
    Enforce,
}

impl FromStr for PinPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(PinPolicy::Warn),
            "enforce" => Ok(PinPolicy::Enforce),
            other => Err(format!("unknown pin policy '{}' (expected warn|enforce)", other)),
        }
    }
}

impl std::fmt::Display for PinPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinPolicy::Warn => write!(f, "warn"),
            PinPolicy::Enforce => write!(f, "enforce"),
        }
    }
}

/// SHA-256 of a DER certificate, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Default location of the pin store.
pub fn default_pin_store_path() -> Option<PathBuf> {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .map(|d| d.join("camdeploy").join(PIN_FILE))
}

/// Host → pinned fingerprint map, safe for concurrent handshakes.
#[derive(Debug, Default)]
pub struct CertificateStore {
    path: Option<PathBuf>,
    records: Mutex<HashMap<String, CertificateRecord>>,
}

impl CertificateStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the store backed by `path`. A missing or unreadable file yields an
    /// empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match load_records(&path) {
            Ok(records) => {
                tracing::debug!("Loaded {} certificate pins from {:?}", records.len(), path);
                records
            }
            Err(e) => {
                tracing::warn!("Starting with empty pin store: {:#}", e);
                HashMap::new()
            }
        };
        Self {
            path: Some(path),
            records: Mutex::new(records),
        }
    }

    /// Compare `presented` with the pin for `host`, pinning on first contact.
    ///
    /// A mismatch never replaces the stored pin.
    pub fn check(&self, host: &str, presented: &str) -> PinOutcome {
        let mut records = self.lock();
        match records.get(host) {
            Some(record) if record.sha256_fingerprint == presented => return PinOutcome::Matched,
            Some(record) => {
                return PinOutcome::Mismatch {
                    stored: record.sha256_fingerprint.clone(),
                    presented: presented.to_string(),
                };
            }
            None => {}
        }

        records.insert(
            host.to_string(),
            CertificateRecord {
                host: host.to_string(),
                sha256_fingerprint: presented.to_string(),
                first_seen: Utc::now(),
            },
        );
        // Written under the lock so the file always holds the newest map.
        if let Err(e) = self.persist(&records) {
            tracing::warn!("Failed to persist certificate pin for {}: {:#}", host, e);
        }
        PinOutcome::Pinned
    }

    /// Drop the pin for `host`. Returns whether one existed.
    pub fn forget(&self, host: &str) -> Result<bool> {
        let mut records = self.lock();
        if records.remove(host).is_none() {
            return Ok(false);
        }
        self.persist(&records)?;
        Ok(true)
    }

    /// All pins, sorted by host.
    pub fn records(&self) -> Vec<CertificateRecord> {
        let records = self.lock();
        let mut list: Vec<_> = records.values().cloned().collect();
        list.sort_by(|a, b| a.host.cmp(&b.host));
        list
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CertificateRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the store file atomically: write a sibling temp file, then
    /// rename it over the original.
    fn persist(&self, records: &HashMap<String, CertificateRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create pin store directory")?;
        }

        let mut list: Vec<_> = records.values().collect();
        list.sort_by(|a, b| a.host.cmp(&b.host));
        let content = serde_json::to_string_pretty(&list).context("Failed to serialize pins")?;
        let tmp = path.with_extension("tmp");
        write_owner_only(&tmp, content.as_bytes()).context("Failed to write pin store")?;
        fs::rename(&tmp, path).context("Failed to replace pin store")?;
        Ok(())
    }
}

fn write_owner_only(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn load_records(path: &Path) -> Result<HashMap<String, CertificateRecord>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path).context("Failed to read pin store")?;
    let list: Vec<CertificateRecord> =
        serde_json::from_str(&content).context("Failed to parse pin store")?;
    Ok(list.into_iter().map(|r| (r.host.clone(), r)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_contact_pins_then_matches() {
        let store = CertificateStore::in_memory();
        assert_eq!(store.check("10.0.0.5", "aa"), PinOutcome::Pinned);
        assert_eq!(store.check("10.0.0.5", "aa"), PinOutcome::Matched);
    }

    #[test]
    fn test_mismatch_keeps_original_pin() {
        let store = CertificateStore::in_memory();
        store.check("cam", "aa");
        assert_eq!(
            store.check("cam", "bb"),
            PinOutcome::Mismatch {
                stored: "aa".into(),
                presented: "bb".into()
            }
        );
        assert_eq!(store.records()[0].sha256_fingerprint, "aa");
    }

    #[test]
    fn test_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins").join(PIN_FILE);

        let store = CertificateStore::open(&path);
        store.check("192.168.1.10", "f00d");
        drop(store);

        let reopened = CertificateStore::open(&path);
        assert_eq!(reopened.check("192.168.1.10", "f00d"), PinOutcome::Matched);
        assert!(reopened.forget("192.168.1.10").unwrap());
        assert!(!reopened.forget("192.168.1.10").unwrap());
        assert!(CertificateStore::open(&path).records().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PIN_FILE);
        CertificateStore::open(&path).check("h", "x");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_concurrent_first_contacts_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PIN_FILE);

        for round in 0..10 {
            let store = std::sync::Arc::new(CertificateStore::open(&path));
            let handles: Vec<_> = (0..64)
                .map(|i| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        store.check(&format!("10.{}.0.{}", round, i), &format!("fp-{}", i))
                    })
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), PinOutcome::Pinned);
            }
            drop(store);

            let reopened = CertificateStore::open(&path);
            assert_eq!(reopened.records().len(), 64 * (round + 1));
            assert_eq!(
                reopened.check(&format!("10.{}.0.7", round), "fp-7"),
                PinOutcome::Matched
            );
        }
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PIN_FILE);
        fs::write(&path, "not json").unwrap();
        assert!(CertificateStore::open(&path).records().is_empty());
    }

    #[test]
    fn test_pin_policy_parse() {
        assert_eq!("Enforce".parse::<PinPolicy>().unwrap(), PinPolicy::Enforce);
        assert_eq!("warn".parse::<PinPolicy>().unwrap(), PinPolicy::Warn);
        assert!("block".parse::<PinPolicy>().is_err());
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
