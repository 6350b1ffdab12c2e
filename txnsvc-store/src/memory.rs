//! In-process store.
//!
//! Holds records in a concurrent map. Used as a test double for the service
//! and the server; it also counts the statements it executes and can be told
//! to fail, standing in for an unreachable database.

use crate::error::StoreError;
use crate::schema::SchemaMode;
use crate::store::TransactionStore;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

/// Record store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<Uuid, i64>,
    statements: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of statements executed so far, failed ones included.
    pub fn statements_executed(&self) -> u64 {
        self.statements.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn execute(&self) -> Result<(), StoreError> {
        self.statements.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn prepare(&self, mode: SchemaMode) -> Result<(), StoreError> {
        self.execute()?;
        if mode.is_destructive() {
            self.records.clear();
        }
        Ok(())
    }

    async fn insert(&self, id: Uuid, balance: i64) -> Result<(), StoreError> {
        self.execute()?;
        match self.records.entry(id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey(id)),
            Entry::Vacant(slot) => {
                slot.insert(balance);
                Ok(())
            }
        }
    }

    async fn update_balance(&self, id: Uuid, balance: i64) -> Result<u64, StoreError> {
        self.execute()?;
        match self.records.get_mut(&id) {
            Some(mut entry) => {
                *entry = balance;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<u64, StoreError> {
        self.execute()?;
        Ok(u64::from(self.records.remove(&id).is_some()))
    }

    async fn fetch_balance(&self, id: Uuid) -> Result<Option<i64>, StoreError> {
        self.execute()?;
        Ok(self.records.get(&id).map(|entry| *entry))
    }
}
