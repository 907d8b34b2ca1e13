use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};

const SERVICE_NAME: &str = "edudash";

const ACCESS_ENTRY: &str = "access_token";
const REFRESH_ENTRY: &str = "refresh_token";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// The raw credential pair as persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Durable backing medium for the credential pair.
///
/// Absence of a stored pair is `Ok(None)`, never an error.
pub trait CredentialStorage: Send + Sync {
    fn load(&self) -> Result<Option<TokenPair>>;
    fn save(&self, pair: &TokenPair) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// OS keychain storage; access and refresh tokens are two entries.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, name: &str) -> Result<Entry> {
        Entry::new(&self.service, name).context("Failed to create keyring entry")
    }

    fn read(&self, name: &str) -> Result<Option<String>> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStorage for KeyringStorage {
    fn load(&self) -> Result<Option<TokenPair>> {
        match (self.read(ACCESS_ENTRY)?, self.read(REFRESH_ENTRY)?) {
            (Some(access), Some(refresh)) => Ok(Some(TokenPair { access, refresh })),
            _ => Ok(None),
        }
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        self.entry(ACCESS_ENTRY)?
            .set_password(&pair.access)
            .context("Failed to store access token in keychain")?;
        self.entry(REFRESH_ENTRY)?
            .set_password(&pair.refresh)
            .context("Failed to store refresh token in keychain")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.remove(ACCESS_ENTRY)?;
        self.remove(REFRESH_ENTRY)
    }
}

/// JSON file storage under the cache directory.
pub struct FileStorage {
    cache_dir: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

impl CredentialStorage for FileStorage {
    fn load(&self) -> Result<Option<TokenPair>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let pair = serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(pair))
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir).context("Failed to create cache directory")?;
        let contents = serde_json::to_string_pretty(pair)?;
        std::fs::write(self.session_path(), contents).context("Failed to write session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// In-process storage; nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    pair: Mutex<Option<TokenPair>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: TokenPair) -> Self {
        Self { pair: Mutex::new(Some(pair)) }
    }
}

impl CredentialStorage for MemoryStorage {
    fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.pair.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?.clone())
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        *self.pair.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))? = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.pair.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))? = None;
        Ok(())
    }
}
