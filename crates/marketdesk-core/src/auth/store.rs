//! Durable key/value storage for the session's credentials.
//!
//! The store knows nothing about tokens; it only persists three string
//! entries under the keys below. The keys match what the browser front end
//! writes to local storage, so both clients can share a persisted session.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};

/// Key of the access credential.
pub const ACCESS_TOKEN_KEY: &str = "token";

/// Key of the refresh credential.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Key of the JSON-serialized user record.
pub const USER_KEY: &str = "user";

/// Every key the session writes, in the order it writes them.
pub const SESSION_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY];

pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-process store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("Credential map lock poisoned"))
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Credentials file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    entries: BTreeMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Store backed by a single JSON file.
pub struct FileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn read(&self) -> Result<CredentialFile> {
        let path = self.path();
        if !path.exists() {
            return Ok(CredentialFile::default());
        }
        let contents = std::fs::read_to_string(&path)
            .context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    fn write(&self, mut file: CredentialFile) -> Result<()> {
        let path = self.path();
        if file.entries.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).context("Failed to remove credentials file")?;
            }
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).context("Failed to create data directory")?;
        file.updated_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(&file)?;
        std::fs::write(&path, contents).context("Failed to write credentials file")?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut CredentialFile)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("Credentials file lock poisoned"))?;
        let mut file = self.read()?;
        f(&mut file);
        self.write(file)
    }

    /// When the file was last written, if it exists.
    pub fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read()?.updated_at)
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read()?.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|file| {
            file.entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(|file| {
            file.entries.remove(key);
        })
    }
}

/// Store backed by the OS keychain, one entry per key.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}
