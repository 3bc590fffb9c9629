use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use crate::flags::flag_models::FlagRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("flag with key {0} already exists")]
    DuplicateKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out")]
    Timeout,
    #[error("failed to decode stored flag: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persistence for flag records. Keys are unique; the store enforces it.
#[async_trait]
pub trait FlagStore {
    async fn list(&self) -> Result<Vec<FlagRecord>, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<FlagRecord>, StoreError>;
    /// Fails with [`StoreError::DuplicateKey`] if the key is taken.
    async fn insert(&self, flag: FlagRecord) -> Result<FlagRecord, StoreError>;
    /// Overwrites an existing record. Returns `None` if there was nothing to overwrite.
    async fn replace(&self, flag: FlagRecord) -> Result<Option<FlagRecord>, StoreError>;
    async fn delete(&self, key: &str) -> Result<Option<FlagRecord>, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Keeps flags in process memory. Used for local development and tests.
#[derive(Default)]
pub struct MemoryFlagStore {
    flags: RwLock<BTreeMap<String, FlagRecord>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(flags: impl IntoIterator<Item = FlagRecord>) -> Self {
        let flags = flags.into_iter().map(|f| (f.key.clone(), f)).collect();
        MemoryFlagStore {
            flags: RwLock::new(flags),
        }
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn list(&self) -> Result<Vec<FlagRecord>, StoreError> {
        let flags = self.flags.read().map_err(poisoned)?;
        Ok(flags.values().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<FlagRecord>, StoreError> {
        let flags = self.flags.read().map_err(poisoned)?;
        Ok(flags.get(key).cloned())
    }

    async fn insert(&self, flag: FlagRecord) -> Result<FlagRecord, StoreError> {
        let mut flags = self.flags.write().map_err(poisoned)?;
        if flags.contains_key(&flag.key) {
            return Err(StoreError::DuplicateKey(flag.key));
        }
        flags.insert(flag.key.clone(), flag.clone());
        Ok(flag)
    }

    async fn replace(&self, flag: FlagRecord) -> Result<Option<FlagRecord>, StoreError> {
        let mut flags = self.flags.write().map_err(poisoned)?;
        match flags.get_mut(&flag.key) {
            Some(existing) => {
                *existing = flag.clone();
                Ok(Some(flag))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<Option<FlagRecord>, StoreError> {
        let mut flags = self.flags.write().map_err(poisoned)?;
        Ok(flags.remove(key))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        drop(self.flags.read().map_err(poisoned)?);
        Ok(())
    }
}
