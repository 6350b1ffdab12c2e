//! The persistence seam the transaction service is written against.

use crate::error::StoreError;
use crate::schema::SchemaMode;
use async_trait::async_trait;
use uuid::Uuid;

/// A store of transaction records keyed by UUID.
///
/// Every method maps to exactly one statement (or, for [`prepare`], one
/// database transaction). Implementations never retry.
///
/// [`prepare`]: TransactionStore::prepare
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Prepares the record table according to `mode`.
    async fn prepare(&self, mode: SchemaMode) -> Result<(), StoreError>;

    /// Inserts a new record.
    async fn insert(&self, id: Uuid, balance: i64) -> Result<(), StoreError>;

    /// Overwrites the balance of `id`, returning the number of rows affected.
    async fn update_balance(&self, id: Uuid, balance: i64) -> Result<u64, StoreError>;

    /// Removes `id`, returning the number of rows affected.
    async fn delete(&self, id: Uuid) -> Result<u64, StoreError>;

    /// Reads the balance of `id`, or `None` if no such record exists.
    async fn fetch_balance(&self, id: Uuid) -> Result<Option<i64>, StoreError>;

    /// Releases the underlying connection. The store must not be used after.
    async fn close(&self) {}
}
