//! Trimmed in-memory storage engine
//!
//! Scripts mutate the dataset through this engine. Only the string
//! operations the scripting command router needs are implemented; the
//! full data-type zoo belongs to the host server.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{CommandError, HematiteError, Result, StorageError};

/// Index of a logical database
pub type DatabaseIndex = usize;

type Database = RwLock<HashMap<Vec<u8>, Vec<u8>>>;

/// In-memory key/value engine shared by all script executions
pub struct StorageEngine {
    databases: Vec<Database>,
}

impl StorageEngine {
    /// Create an engine with the default database count
    pub fn new() -> Arc<Self> {
        Self::with_databases(16)
    }

    /// Create an engine with an explicit database count
    pub fn with_databases(count: usize) -> Arc<Self> {
        let mut databases = Vec::with_capacity(count);
        for _ in 0..count {
            databases.push(RwLock::new(HashMap::new()));
        }
        Arc::new(StorageEngine { databases })
    }

    fn db(&self, db: DatabaseIndex) -> Result<&Database> {
        self.databases
            .get(db)
            .ok_or(HematiteError::Storage(StorageError::InvalidDatabase))
    }

    /// Set a string value
    pub fn set_string(&self, db: DatabaseIndex, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let mut map = self.db(db)?.write().unwrap();
        map.insert(key, value);
        Ok(())
    }

    /// Get a string value
    pub fn get_string(&self, db: DatabaseIndex, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.db(db)?.read().unwrap();
        Ok(map.get(key).cloned())
    }

    /// Check whether a key exists
    pub fn exists(&self, db: DatabaseIndex, key: &[u8]) -> Result<bool> {
        let map = self.db(db)?.read().unwrap();
        Ok(map.contains_key(key))
    }

    /// Delete a key, returning whether it was present
    pub fn delete(&self, db: DatabaseIndex, key: &[u8]) -> Result<bool> {
        let mut map = self.db(db)?.write().unwrap();
        Ok(map.remove(key).is_some())
    }

    /// Increment the integer stored at key by `increment`
    pub fn incr_by(&self, db: DatabaseIndex, key: Vec<u8>, increment: i64) -> Result<i64> {
        let mut map = self.db(db)?.write().unwrap();
        let current = match map.get(&key) {
            Some(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(HematiteError::Command(CommandError::NotInteger))?,
            None => 0,
        };
        let new_value = current
            .checked_add(increment)
            .ok_or(HematiteError::Command(CommandError::NotInteger))?;
        map.insert(key, new_value.to_string().into_bytes());
        Ok(new_value)
    }

    /// Remove every key in the given database
    pub fn flush_db(&self, db: DatabaseIndex) -> Result<()> {
        let mut map = self.db(db)?.write().unwrap();
        map.clear();
        Ok(())
    }

    /// Number of keys in the given database
    pub fn key_count(&self, db: DatabaseIndex) -> Result<usize> {
        let map = self.db(db)?.read().unwrap();
        Ok(map.len())
    }

    /// Number of configured databases
    pub fn database_count(&self) -> usize {
        self.databases.len()
    }
}
