//! Credential persistence
//!
//! `FileCredentialStore` keeps the credential as a single JSON file with an
//! in-memory cache; `MemoryCredentialStore` is the volatile equivalent.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{SessionCredential, StoreError};

/// Durable home of the installation's single session credential.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<SessionCredential>, StoreError>;

    fn save(&self, credential: &SessionCredential) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Record which sensor the stored credential is bound to. `None` leaves
    /// a field unchanged. Returns `false` when no credential is stored.
    fn update_bound_device(
        &self,
        device_id: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<bool, StoreError>;
}

fn apply_binding(
    credential: &mut SessionCredential,
    device_id: Option<&str>,
    device_name: Option<&str>,
) {
    if let Some(id) = device_id {
        credential.bound_device_id = Some(id.to_string());
    }
    if let Some(name) = device_name {
        credential.bound_device_name = Some(name.to_string());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Write a credential to `path` as pretty JSON, creating parent directories.
fn write_credential(path: &Path, credential: &SessionCredential) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::IoError(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(credential)
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| StoreError::IoError(e.to_string()))?;
    Ok(())
}

/// Credential stored as one JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
    cached: Mutex<Option<SessionCredential>>,
}

impl FileCredentialStore {
    /// Open the store at `path`, loading the credential if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cached = if path.exists() {
            let data = std::fs::read(&path).map_err(|e| StoreError::IoError(e.to_string()))?;
            let credential: SessionCredential = serde_json::from_slice(&data)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            Some(credential)
        } else {
            None
        };

        Ok(Self {
            path,
            cached: Mutex::new(cached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Result<Option<SessionCredential>, StoreError> {
        Ok(lock(&self.cached).clone())
    }

    fn save(&self, credential: &SessionCredential) -> Result<(), StoreError> {
        write_credential(&self.path, credential)?;
        *lock(&self.cached) = Some(credential.clone());
        log::info!("Credential saved to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::IoError(e.to_string())),
        }
        *lock(&self.cached) = None;
        log::info!("Credential cleared");
        Ok(())
    }

    fn update_bound_device(
        &self,
        device_id: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut cached = lock(&self.cached);
        let Some(credential) = cached.as_mut() else {
            return Ok(false);
        };
        let mut updated = credential.clone();
        apply_binding(&mut updated, device_id, device_name);
        write_credential(&self.path, &updated)?;
        *credential = updated;
        Ok(true)
    }
}

/// Volatile credential store with save/clear counters.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credential: Mutex<Option<SessionCredential>>,
    saves: AtomicUsize,
    clears: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `credential`.
    pub fn with_credential(credential: SessionCredential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
            ..Self::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<SessionCredential>, StoreError> {
        Ok(lock(&self.credential).clone())
    }

    fn save(&self, credential: &SessionCredential) -> Result<(), StoreError> {
        *lock(&self.credential) = Some(credential.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *lock(&self.credential) = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_bound_device(
        &self,
        device_id: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut guard = lock(&self.credential);
        match guard.as_mut() {
            Some(credential) => {
                apply_binding(credential, device_id, device_name);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_credential() -> SessionCredential {
        SessionCredential {
            session_token: "session-abc".into(),
            subject_id: 917,
            device_code: "K7Q2".into(),
            app_id: Some("coach".into()),
            issued_device_token: "device-token".into(),
            expires_at_epoch_seconds: 4_102_444_800,
            bound_device_id: None,
            bound_device_name: None,
        }
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth").join("credential.json");

        {
            let store = FileCredentialStore::open(&path).unwrap();
            assert!(store.get().unwrap().is_none());
            store.save(&make_credential()).unwrap();
        }

        let store = FileCredentialStore::open(&path).unwrap();
        assert_eq!(store.get().unwrap(), Some(make_credential()));
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");

        let store = FileCredentialStore::open(&path).unwrap();
        store.save(&make_credential()).unwrap();
        assert!(path.exists());

        store.clear().unwrap();
        assert!(!path.exists());
        assert!(store.get().unwrap().is_none());

        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn test_update_bound_device_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");

        {
            let store = FileCredentialStore::open(&path).unwrap();
            assert!(!store.update_bound_device(Some("B5C7A312"), None).unwrap());
            store.save(&make_credential()).unwrap();
            assert!(store
                .update_bound_device(Some("B5C7A312"), Some("Polar H10 B5C7A312"))
                .unwrap());
            assert!(store.update_bound_device(None, Some("renamed")).unwrap());
        }

        let stored = FileCredentialStore::open(&path).unwrap().get().unwrap().unwrap();
        assert_eq!(stored.bound_device_id.as_deref(), Some("B5C7A312"));
        assert_eq!(stored.bound_device_name.as_deref(), Some("renamed"));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result = FileCredentialStore::open(&path);
        assert!(matches!(result, Err(StoreError::DeserializationError(_))));
    }

    #[test]
    fn test_memory_store_counters() {
        let store = MemoryCredentialStore::new();
        assert!(!store.update_bound_device(Some("x"), None).unwrap());

        store.save(&make_credential()).unwrap();
        assert!(store.update_bound_device(Some("x"), Some("Sensor X")).unwrap());
        let stored = store.get().unwrap().unwrap();
        assert_eq!(stored.bound_device_id.as_deref(), Some("x"));

        store.clear().unwrap();
        assert!(store.get().unwrap().is_none());
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.clear_count(), 1);
    }
}
