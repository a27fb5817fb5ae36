//! ACME account ledger
//!
//! One account per email address, matched case-insensitively. Accounts are
//! created on first successful registration and never deleted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{AcmeError, StorageError};
use super::storage::{read_json_array, write_atomic};

/// Account private key, either as stored or ready for signing
#[derive(Clone)]
pub enum AccountKey {
    /// PEM text as read from the ledger
    Encoded(String),
    /// Parsed key pair, alongside the PEM it was parsed from
    Decoded(DecodedKey),
}

/// Parsed account key pair
#[derive(Clone)]
pub struct DecodedKey {
    pem: String,
    key_pair: Arc<KeyPair>,
}

impl DecodedKey {
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

impl fmt::Debug for DecodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedKey")
            .field("algorithm", &self.key_pair.algorithm())
            .finish()
    }
}

impl AccountKey {
    /// Generate a fresh ECDSA P-256 key
    pub fn generate() -> Result<Self, AcmeError> {
        let key_pair = KeyPair::generate()?;
        Ok(AccountKey::Decoded(DecodedKey {
            pem: key_pair.serialize_pem(),
            key_pair: Arc::new(key_pair),
        }))
    }

    /// Parse the stored PEM; decoding an already decoded key is a no-op
    pub fn decode(self) -> Result<Self, rcgen::Error> {
        match self {
            AccountKey::Encoded(pem) => {
                let key_pair = KeyPair::from_pem(&pem)?;
                Ok(AccountKey::Decoded(DecodedKey {
                    pem,
                    key_pair: Arc::new(key_pair),
                }))
            }
            decoded @ AccountKey::Decoded(_) => Ok(decoded),
        }
    }

    pub fn pem(&self) -> &str {
        match self {
            AccountKey::Encoded(pem) => pem,
            AccountKey::Decoded(key) => &key.pem,
        }
    }

    pub fn decoded(&self) -> Option<&DecodedKey> {
        match self {
            AccountKey::Encoded(_) => None,
            AccountKey::Decoded(key) => Some(key),
        }
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountKey::Encoded(_) => f.write_str("AccountKey::Encoded(..)"),
            AccountKey::Decoded(key) => f.debug_tuple("AccountKey::Decoded").field(key).finish(),
        }
    }
}

/// An issuing identity and its CA registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "StoredAccount", from = "StoredAccount")]
pub struct Account {
    pub email: String,
    /// Registration resource returned by the CA, opaque to this crate
    pub registration: Option<serde_json::Value>,
    pub key: AccountKey,
}

impl Account {
    /// Unregistered account with a freshly generated key
    pub fn generate(email: &str) -> Result<Self, AcmeError> {
        Ok(Self {
            email: email.to_string(),
            registration: None,
            key: AccountKey::generate()?,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Decode the stored key in place
    pub fn decode_key(mut self) -> Result<Self, AcmeError> {
        let email = self.email.clone();
        self.key = self.key.decode().map_err(|e| AcmeError::AccountKey {
            email,
            message: e.to_string(),
        })?;
        Ok(self)
    }

    fn matches(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email)
    }
}

/// On-disk shape of an account
#[derive(Serialize, Deserialize)]
struct StoredAccount {
    email: String,
    #[serde(default)]
    registration: Option<serde_json::Value>,
    pem_private_key: String,
}

impl From<Account> for StoredAccount {
    fn from(account: Account) -> Self {
        Self {
            pem_private_key: account.key.pem().to_string(),
            email: account.email,
            registration: account.registration,
        }
    }
}

impl From<StoredAccount> for Account {
    fn from(stored: StoredAccount) -> Self {
        Self {
            email: stored.email,
            registration: stored.registration,
            key: AccountKey::Encoded(stored.pem_private_key),
        }
    }
}

/// In-memory account ledger bound to its file
#[derive(Debug)]
pub struct AccountLedger {
    path: PathBuf,
    accounts: Vec<Account>,
}

impl AccountLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accounts: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, email: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.matches(email))
    }

    /// Insert an account, replacing one with the same email
    ///
    /// Returns the replaced account, if any.
    pub fn set(&mut self, account: Account) -> Option<Account> {
        match self.accounts.iter_mut().find(|a| a.matches(&account.email)) {
            Some(existing) => Some(std::mem::replace(existing, account)),
            None => {
                self.accounts.push(account);
                None
            }
        }
    }

    pub fn load(&mut self) -> Result<(), StorageError> {
        self.accounts.clear();
        self.accounts = read_json_array(&self.path)?;
        debug!(
            path = %self.path.display(),
            accounts = self.accounts.len(),
            "Loaded account ledger"
        );
        Ok(())
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let content = serde_json::to_vec_pretty(&self.accounts)?;
        write_atomic(&self.path, &content)
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Undo a `set`: restore the replaced account or drop the appended one
    fn revert(&mut self, email: &str, previous: Option<Account>) {
        match previous {
            Some(previous) => {
                self.set(previous);
            }
            None => self.accounts.retain(|a| !a.matches(email)),
        }
    }
}

fn corrupt_copy_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// Account ledger shared by concurrent issuance tasks
#[derive(Debug, Clone)]
pub struct AccountStore {
    inner: Arc<Mutex<AccountLedger>>,
}

impl AccountStore {
    pub fn new(ledger: AccountLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Load the ledger at `path`
    ///
    /// A missing file yields an empty store. An unreadable one also yields an
    /// empty store, after its bytes are copied to `<path>.corrupt` so the
    /// next registration cannot destroy them. Only a failure to make that
    /// copy is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let mut ledger = AccountLedger::new(path);
        match ledger.load() {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(
                    path = %ledger.path().display(),
                    "Account ledger not found, new accounts will be created on demand"
                );
            }
            Err(e) => {
                let aside = corrupt_copy_path(ledger.path());
                fs::copy(ledger.path(), &aside)?;
                warn!(
                    path = %ledger.path().display(),
                    copy = %aside.display(),
                    error = %e,
                    "Account ledger unreadable, starting empty"
                );
                ledger.accounts.clear();
            }
        }
        Ok(Self::new(ledger))
    }

    pub fn get(&self, email: &str) -> Option<Account> {
        self.inner.lock().get(email).cloned()
    }

    /// Record a newly registered account and persist the ledger
    ///
    /// If persisting fails the in-memory ledger is restored, so the account
    /// is never observed as stored.
    pub fn register(&self, account: Account) -> Result<(), StorageError> {
        let email = account.email.clone();
        let mut ledger = self.inner.lock();

        let previous = ledger.set(account);
        if let Err(e) = ledger.save() {
            warn!(email = %email, error = %e, "Failed to persist account, rolling back");
            ledger.revert(&email, previous);
            return Err(e);
        }

        info!(email = %email, accounts = ledger.len(), "Saved ACME account");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
