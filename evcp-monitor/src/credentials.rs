//! Credential cache
//!
//! A charging point registers with the registry once and keeps the issued
//! username/password locally, keyed by CP id, so that a restart reuses the
//! same identity. The registry cannot hand out an existing password again,
//! which makes the cache the only copy.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CredentialError;

/// Identity used to authenticate with the controller
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub cp_id: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        cp_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            cp_id: cp_id.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("cp_id", &self.cp_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// On-disk record. The CP id is the key, not part of the record.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialRecord {
    username: String,
    password: String,
}

/// Storage backend for cached credentials
pub trait CredentialStore: Send + Sync {
    /// Cached credentials for `cp_id`, if any
    fn load(&self, cp_id: &str) -> Result<Option<Credentials>, CredentialError>;

    /// Persist credentials under their CP id
    fn save(&self, credentials: &Credentials) -> Result<(), CredentialError>;
}

/// One JSON file per CP: `{dir}/{cp_id}_credentials.json`
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, cp_id: &str) -> PathBuf {
        self.dir.join(format!("{}_credentials.json", cp_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, cp_id: &str) -> Result<Option<Credentials>, CredentialError> {
        let path = self.path_for(cp_id);
        if !path.exists() {
            debug!("No cached credentials at {:?}", path);
            return Ok(None);
        }

        let data = fs::read_to_string(&path)?;
        let record: CredentialRecord = serde_json::from_str(&data)?;
        info!("Using stored credentials from {:?} (user {})", path, record.username);

        Ok(Some(Credentials::new(cp_id, record.username, record.password)))
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&credentials.cp_id);
        let temp_path = path.with_extension("json.tmp");
        let record = CredentialRecord {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };

        // Write then rename so a crash never leaves a half-written cache
        fs::write(&temp_path, serde_json::to_string_pretty(&record)?)?;
        fs::rename(&temp_path, &path)?;

        info!("Credentials saved to {:?}", path);
        Ok(())
    }
}

/// In-memory store for tests and ephemeral nodes
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one entry
    pub fn with(credentials: Credentials) -> Self {
        let store = Self::new();
        store
            .entries
            .lock()
            .insert(credentials.cp_id.clone(), credentials);
        store
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, cp_id: &str) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.entries.lock().get(cp_id).cloned())
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        self.entries
            .lock()
            .insert(credentials.cp_id.clone(), credentials.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        assert!(store.load("CP-001").unwrap().is_none());

        store.save(&Credentials::new("CP-001", "cp_001", "pw")).unwrap();
        let loaded = store.load("CP-001").unwrap().unwrap();
        assert_eq!(loaded.username, "cp_001");
        assert!(store.load("CP-002").unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store_roundtrip() -> Result<(), CredentialError> {
        let dir = tempdir()?;
        let store = FileCredentialStore::new(dir.path().join("data"));

        assert!(store.load("CP-004")?.is_none());

        let creds = Credentials::new("CP-004", "cp_004", "0123456789abcdef");
        store.save(&creds)?;

        // A fresh store over the same directory sees the record
        let reopened = FileCredentialStore::new(dir.path().join("data"));
        assert_eq!(reopened.load("CP-004")?, Some(creds));
        assert!(!store.path_for("CP-004").with_extension("json.tmp").exists());

        Ok(())
    }

    #[test]
    fn test_file_store_reads_plain_record() -> Result<(), CredentialError> {
        let dir = tempdir()?;
        let store = FileCredentialStore::new(dir.path());
        fs::write(
            store.path_for("CP-009"),
            r#"{ "username": "cp_009", "password": "hunter2" }"#,
        )?;

        let loaded = store.load("CP-009")?.unwrap();
        assert_eq!(loaded.cp_id, "CP-009");
        assert_eq!(loaded.password, "hunter2");
        Ok(())
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        fs::write(store.path_for("CP-001"), "not json").unwrap();

        assert!(matches!(store.load("CP-001"), Err(CredentialError::Format(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("CP-001", "cp_001", "topsecret");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("cp_001"));
        assert!(!shown.contains("topsecret"));
    }
}
