use std::{
    collections::HashMap,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

pub const PREFS_NAMESPACE: &str = "ClientPrefs";
pub const CLIENT_ID_KEY: &str = "clientId";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u8);

impl ClientId {
    pub const MIN: i32 = 0;
    pub const MAX: i32 = 15;

    pub fn new(id: i32) -> Self {
        Self(id.clamp(Self::MIN, Self::MAX) as u8)
    }

    pub fn get(self) -> i32 {
        i32::from(self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-volatile key-value storage in the style of a preferences namespace.
pub trait PreferenceStore {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StorageError>;
    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError>;
}

#[derive(Debug)]
pub struct ClientIdentity<S> {
    store: S,
    client_id: ClientId,
}

impl<S: PreferenceStore> ClientIdentity<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            client_id: ClientId::default(),
        }
    }

    pub fn begin(&mut self) -> Result<ClientId, StorageError> {
        self.refresh()
    }

    pub fn get(&self) -> ClientId {
        self.client_id
    }

    pub fn set(&mut self, id: i32) -> Result<ClientId, StorageError> {
        let id = ClientId::new(id);
        self.store.set_i32(CLIENT_ID_KEY, id.get())?;
        self.client_id = id;
        log::info!("client id set to {id}");
        Ok(id)
    }

    pub fn refresh(&mut self) -> Result<ClientId, StorageError> {
        let stored = self.store.get_i32(CLIENT_ID_KEY)?.unwrap_or(0);
        self.client_id = ClientId::new(stored);
        Ok(self.client_id)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryPreferences {
    values: HashMap<String, i32>,
}

impl PreferenceStore for MemoryPreferences {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StorageError> {
        Ok(self.values.get(key).copied())
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON-file backed preferences for host builds. One file per namespace.
#[derive(Debug, Clone)]
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    pub fn new(dir: &Path, namespace: &str) -> Self {
        Self {
            path: dir.join(format!("{namespace}.prefs.json")),
        }
    }

    fn load(&self) -> Result<HashMap<String, i32>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl PreferenceStore for FilePreferences {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StorageError> {
        Ok(self.load()?.get(key).copied())
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError> {
        let mut values = self.load()?;
        values.insert(key.to_string(), value);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&values)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_into_range() {
        assert_eq!(ClientId::new(-3).get(), 0);
        assert_eq!(ClientId::new(9).get(), 9);
        assert_eq!(ClientId::new(200).get(), 15);
    }

    #[test]
    fn begin_defaults_to_zero() {
        let mut identity = ClientIdentity::new(MemoryPreferences::default());
        assert_eq!(identity.begin().unwrap(), ClientId::new(0));
    }

    #[test]
    fn begin_clamps_out_of_range_stored_value() {
        let mut prefs = MemoryPreferences::default();
        prefs.set_i32(CLIENT_ID_KEY, 42).unwrap();

        let mut identity = ClientIdentity::new(prefs);
        assert_eq!(identity.begin().unwrap().get(), 15);
    }

    #[test]
    fn set_persists_clamped_value() {
        let mut identity = ClientIdentity::new(MemoryPreferences::default());
        identity.begin().unwrap();

        assert_eq!(identity.set(16).unwrap().get(), 15);
        assert_eq!(identity.get().get(), 15);
        assert_eq!(identity.refresh().unwrap().get(), 15);
    }

    #[test]
    fn file_preferences_survive_reopen() {
        let dir = std::env::temp_dir().join(format!("sensornet-prefs-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut identity = ClientIdentity::new(FilePreferences::new(&dir, PREFS_NAMESPACE));
        identity.set(11).unwrap();

        let mut reopened = ClientIdentity::new(FilePreferences::new(&dir, PREFS_NAMESPACE));
        assert_eq!(reopened.begin().unwrap().get(), 11);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
