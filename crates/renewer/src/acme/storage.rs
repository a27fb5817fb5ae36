//! Certificate ledger and file persistence
//!
//! Both ledgers live as single JSON files under the data directory:
//!
//! ```text
//! data/
//! ├── accounts.json        # ACME accounts, see `account`
//! ├── certs.json           # Issued certificates, one record per logical name
//! └── certs_backup.json    # Byte copy of certs.json taken before each cycle mutates it
//! ```
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target, so a crash mid-write leaves the previous file intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};

use certwarden_common::LogicalName;
use certwarden_config::CertificateRequest;

use super::error::StorageError;

/// Certificate material returned by a successful order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateBundle {
    /// Primary domain (first requested domain)
    pub domain: String,
    /// Order certificate URL
    #[serde(default)]
    pub cert_url: String,
    /// Stable certificate URL
    #[serde(default)]
    pub cert_stable_url: String,
    /// PEM-encoded certificate private key
    pub private_key: String,
    /// PEM-encoded leaf certificate followed by its issuer chain
    pub certificate: String,
    /// PEM-encoded issuer chain
    #[serde(default)]
    pub issuer_certificate: String,
    /// PEM-encoded certificate signing request
    #[serde(default)]
    pub csr: String,
}

/// One issued certificate together with where it is deployed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    #[serde(flatten)]
    pub bundle: CertificateBundle,
    pub logical_name: LogicalName,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub lb_name: String,
    pub lb_port: u16,
    /// Earliest time at which the certificate is renewed
    pub next_update: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build the record for a freshly issued bundle
    pub fn issued(
        request: &CertificateRequest,
        bundle: CertificateBundle,
        next_update: DateTime<Utc>,
    ) -> Self {
        Self {
            bundle,
            logical_name: request.logical_name(),
            labels: request.target.labels.clone(),
            lb_name: request.target.lb_name.clone(),
            lb_port: request.target.lb_port,
            next_update,
        }
    }
}

/// Durable mapping from logical name to the latest issued certificate
#[derive(Debug)]
pub struct CertificateLedger {
    path: PathBuf,
    backup_path: PathBuf,
    records: Vec<CertificateRecord>,
}

impl CertificateLedger {
    /// Create an empty ledger bound to its file and backup locations
    pub fn new(path: impl Into<PathBuf>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_path: backup_path.into(),
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory records with the file's content
    ///
    /// A missing file is reported as [`StorageError::NotFound`] and leaves
    /// the ledger empty.
    pub fn load(&mut self) -> Result<(), StorageError> {
        self.records.clear();
        self.records = read_json_array(&self.path)?;
        debug!(
            path = %self.path.display(),
            records = self.records.len(),
            "Loaded certificate ledger"
        );
        Ok(())
    }

    /// Write the in-memory records back to the file
    pub fn save(&self) -> Result<(), StorageError> {
        let content = serde_json::to_vec_pretty(&self.records)?;
        write_atomic(&self.path, &content)?;
        info!(
            path = %self.path.display(),
            records = self.records.len(),
            "Saved certificate ledger"
        );
        Ok(())
    }

    /// Copy the ledger file byte for byte to the backup location
    ///
    /// Returns `false` without touching the backup when no ledger file
    /// exists yet.
    pub fn backup(&self) -> Result<bool, StorageError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %self.path.display(), "No certificate ledger to back up");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        write_atomic(&self.backup_path, &content)?;
        debug!(
            backup = %self.backup_path.display(),
            bytes = content.len(),
            "Backed up certificate ledger"
        );
        Ok(true)
    }

    pub fn get(&self, name: &LogicalName) -> Option<&CertificateRecord> {
        self.records.iter().find(|r| &r.logical_name == name)
    }

    /// Insert a record, replacing any record with the same logical name
    pub fn set(&mut self, record: CertificateRecord) {
        match self
            .records
            .iter_mut()
            .find(|r| r.logical_name == record.logical_name)
        {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn records(&self) -> &[CertificateRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read a JSON array file, separating "missing" from "unreadable"
pub(crate) fn read_json_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StorageError::NotFound {
                path: path.display().to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Replace `path` with `contents` via a same-directory temporary file
///
/// The file ends up readable by the owner only on Unix; ledgers hold private
/// keys.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}
