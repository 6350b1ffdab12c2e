//! Transaction service.
//!
//! Translates typed requests into single store calls and store outcomes into
//! typed results or [`ServerError`]s:
//!
//! | Outcome | Create | Update | Get | Delete |
//! |---|---|---|---|---|
//! | malformed id | - | `INVALID_ARGUMENT` | `INVALID_ARGUMENT` | `INVALID_ARGUMENT` |
//! | no such record | - | `NOT_FOUND` | `NOT_FOUND` | `success: false` |
//! | store failure | `INTERNAL_ERROR` | `INTERNAL_ERROR` | `INTERNAL_ERROR` | `INTERNAL_ERROR` |
//!
//! Delete reports a missing record in its response body rather than as an
//! error, so deleting twice is not a failure.

use crate::error::ServerError;
use std::sync::Arc;
use txnsvc_protocol::message::{
    CreateTransactionParams, DeleteTransactionParams, DeleteTransactionResult,
    GetTransactionParams, GetTransactionResult, TransactionResult, UpdateTransactionParams,
};
use txnsvc_store::TransactionStore;
use uuid::Uuid;

/// The four record operations over an injected store.
#[derive(Clone)]
pub struct TransactionService {
    store: Arc<dyn TransactionStore>,
}

impl TransactionService {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    /// Inserts a record under a freshly generated id.
    pub async fn create_transaction(
        &self,
        params: CreateTransactionParams,
    ) -> Result<TransactionResult, ServerError> {
        let id = Uuid::new_v4();

        self.store
            .insert(id, i64::from(params.balance))
            .await
            .map_err(|e| {
                tracing::error!("Failed to create transaction: {}", e);
                ServerError::persistence("failed to create transaction", e)
            })?;

        tracing::debug!("Created transaction {} (balance {})", id, params.balance);
        Ok(TransactionResult {
            success: true,
            message: "Transaction created successfully".to_string(),
            balance: params.balance,
            transaction_id: id.to_string(),
        })
    }

    /// Overwrites the balance of an existing record.
    pub async fn update_transaction(
        &self,
        params: UpdateTransactionParams,
    ) -> Result<TransactionResult, ServerError> {
        let id = parse_transaction_id(&params.transaction_id)?;

        let rows = self
            .store
            .update_balance(id, i64::from(params.balance))
            .await
            .map_err(|e| {
                tracing::error!("Failed to update transaction {}: {}", id, e);
                ServerError::persistence("failed to update transaction", e)
            })?;
        if rows == 0 {
            return Err(ServerError::NotFound("Transaction not found"));
        }

        Ok(TransactionResult {
            success: true,
            message: "Transaction updated successfully".to_string(),
            balance: params.balance,
            transaction_id: params.transaction_id,
        })
    }

    /// Removes a record. A missing record yields `success: false`.
    pub async fn delete_transaction(
        &self,
        params: DeleteTransactionParams,
    ) -> Result<DeleteTransactionResult, ServerError> {
        let id = parse_transaction_id(&params.transaction_id)?;

        let rows = self.store.delete(id).await.map_err(|e| {
            tracing::error!("Failed to delete transaction {}: {}", id, e);
            ServerError::persistence("failed to delete transaction", e)
        })?;

        if rows == 0 {
            return Ok(DeleteTransactionResult {
                success: false,
                message: "Transaction not found".to_string(),
            });
        }

        Ok(DeleteTransactionResult {
            success: true,
            message: "Transaction deleted successfully".to_string(),
        })
    }

    /// Reads the balance of a record.
    pub async fn get_transaction(
        &self,
        params: GetTransactionParams,
    ) -> Result<GetTransactionResult, ServerError> {
        let id = parse_transaction_id(&params.transaction_id)?;

        let balance = self
            .store
            .fetch_balance(id)
            .await
            .map_err(|e| {
                tracing::error!("Failed to get transaction {}: {}", id, e);
                ServerError::persistence("failed to get transaction", e)
            })?
            .ok_or(ServerError::NotFound("failed to find transaction"))?;

        // The column is INT8 but only int32 values are ever written through
        // this service; anything wider was written by someone else.
        let balance = i32::try_from(balance).map_err(|_| {
            tracing::error!("Transaction {} balance {} exceeds int32", id, balance);
            ServerError::Internal(format!("stored balance {} does not fit in int32", balance))
        })?;

        Ok(GetTransactionResult {
            balance,
            transaction_id: params.transaction_id,
        })
    }
}

fn parse_transaction_id(raw: &str) -> Result<Uuid, ServerError> {
    Uuid::parse_str(raw).map_err(ServerError::InvalidTransactionId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use txnsvc_protocol::ErrorCode;
    use txnsvc_store::{MemoryStore, SchemaMode, StoreError};

    fn test_service() -> (Arc<MemoryStore>, TransactionService) {
        let store = Arc::new(MemoryStore::new());
        let service = TransactionService::new(store.clone());
        (store, service)
    }

    async fn create(service: &TransactionService, balance: i32) -> TransactionResult {
        service
            .create_transaction(CreateTransactionParams { balance })
            .await
            .unwrap()
    }

    async fn get(
        service: &TransactionService,
        id: &str,
    ) -> Result<GetTransactionResult, ServerError> {
        service
            .get_transaction(GetTransactionParams {
                transaction_id: id.to_string(),
            })
            .await
    }

    #[tokio::test]
    async fn test_create_echoes_balance_with_fresh_ids() {
        let (store, service) = test_service();
        let mut seen = HashSet::new();

        for balance in [0, 1, -1, 500, i32::MAX, i32::MIN] {
            let result = create(&service, balance).await;
            assert!(result.success);
            assert_eq!(result.balance, balance);
            assert_eq!(result.message, "Transaction created successfully");
            assert!(Uuid::parse_str(&result.transaction_id).is_ok());
            assert!(seen.insert(result.transaction_id));
        }
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_get_returns_last_written_balance() {
        let (_store, service) = test_service();
        let created = create(&service, 10).await;

        for balance in [20, -30, 40] {
            service
                .update_transaction(UpdateTransactionParams {
                    transaction_id: created.transaction_id.clone(),
                    balance,
                })
                .await
                .unwrap();
        }

        let fetched = get(&service, &created.transaction_id).await.unwrap();
        assert_eq!(fetched.balance, 40);
        assert_eq!(fetched.transaction_id, created.transaction_id);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (_store, service) = test_service();
        let err = service
            .update_transaction(UpdateTransactionParams {
                transaction_id: Uuid::new_v4().to_string(),
                balance: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NotFound);
        assert_eq!(err.to_string(), "Transaction not found");
    }

    #[tokio::test]
    async fn test_delete_missing_is_unsuccessful_response() {
        let (_store, service) = test_service();
        let result = service
            .delete_transaction(DeleteTransactionParams {
                transaction_id: Uuid::new_v4().to_string(),
            })
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "Transaction not found");
    }

    #[tokio::test]
    async fn test_malformed_ids_never_reach_the_store() {
        let (store, service) = test_service();

        for raw in ["", "123", "not-a-uuid", "0000000-0000-0000-0000-000000000000"] {
            let update = service
                .update_transaction(UpdateTransactionParams {
                    transaction_id: raw.to_string(),
                    balance: 1,
                })
                .await
                .unwrap_err();
            assert_eq!(update.error_code(), ErrorCode::InvalidArgument);

            let delete = service
                .delete_transaction(DeleteTransactionParams {
                    transaction_id: raw.to_string(),
                })
                .await
                .unwrap_err();
            assert_eq!(delete.error_code(), ErrorCode::InvalidArgument);

            let fetch = get(&service, raw).await.unwrap_err();
            assert_eq!(fetch.error_code(), ErrorCode::InvalidArgument);
        }

        assert_eq!(store.statements_executed(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_scenario() {
        let (_store, service) = test_service();

        let created = create(&service, 500).await;
        assert!(created.success);
        assert_eq!(created.balance, 500);
        let id = created.transaction_id;

        assert_eq!(get(&service, &id).await.unwrap().balance, 500);

        let updated = service
            .update_transaction(UpdateTransactionParams {
                transaction_id: id.clone(),
                balance: 700,
            })
            .await
            .unwrap();
        assert!(updated.success);
        assert_eq!(updated.balance, 700);
        assert_eq!(updated.transaction_id, id);

        assert_eq!(get(&service, &id).await.unwrap().balance, 700);

        let deleted = service
            .delete_transaction(DeleteTransactionParams {
                transaction_id: id.clone(),
            })
            .await
            .unwrap();
        assert!(deleted.success);
        assert_eq!(deleted.message, "Transaction deleted successfully");

        for _ in 0..3 {
            let err = get(&service, &id).await.unwrap_err();
            assert_eq!(err.error_code(), ErrorCode::NotFound);
        }
    }

    #[tokio::test]
    async fn test_store_failures_map_to_internal() {
        let (store, service) = test_service();
        let created = create(&service, 1).await;
        store.set_failing(true);

        let err = service
            .create_transaction(CreateTransactionParams { balance: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InternalError);
        assert!(err.to_string().starts_with("failed to create transaction: "));

        let err = get(&service, &created.transaction_id).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InternalError);

        let err = service
            .delete_transaction(DeleteTransactionParams {
                transaction_id: created.transaction_id.clone(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InternalError);
    }

    /// Store holding one record whose balance was written outside the service.
    struct WideBalanceStore(Uuid);

    #[async_trait]
    impl TransactionStore for WideBalanceStore {
        async fn prepare(&self, _mode: SchemaMode) -> Result<(), StoreError> {
            Ok(())
        }
        async fn insert(&self, _id: Uuid, _balance: i64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_balance(&self, _id: Uuid, _balance: i64) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn delete(&self, _id: Uuid) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn fetch_balance(&self, id: Uuid) -> Result<Option<i64>, StoreError> {
            Ok((id == self.0).then_some(i64::from(i32::MAX) + 1))
        }
    }

    #[tokio::test]
    async fn test_balance_wider_than_int32_is_internal() {
        let id = Uuid::new_v4();
        let service = TransactionService::new(Arc::new(WideBalanceStore(id)));

        let err = get(&service, &id.to_string()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InternalError);
    }

    /// Files every insert under one id, so the second create collides.
    struct SingleIdStore {
        inner: MemoryStore,
        id: Uuid,
    }

    #[async_trait]
    impl TransactionStore for SingleIdStore {
        async fn prepare(&self, mode: SchemaMode) -> Result<(), StoreError> {
            self.inner.prepare(mode).await
        }
        async fn insert(&self, _id: Uuid, balance: i64) -> Result<(), StoreError> {
            self.inner.insert(self.id, balance).await
        }
        async fn update_balance(&self, id: Uuid, balance: i64) -> Result<u64, StoreError> {
            self.inner.update_balance(id, balance).await
        }
        async fn delete(&self, id: Uuid) -> Result<u64, StoreError> {
            self.inner.delete(id).await
        }
        async fn fetch_balance(&self, id: Uuid) -> Result<Option<i64>, StoreError> {
            self.inner.fetch_balance(id).await
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_on_create_is_internal() {
        let id = Uuid::new_v4();
        let service = TransactionService::new(Arc::new(SingleIdStore {
            inner: MemoryStore::new(),
            id,
        }));

        create(&service, 1).await;
        let err = service
            .create_transaction(CreateTransactionParams { balance: 2 })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InternalError);
        assert!(err.to_string().starts_with("failed to create transaction: "));

        let stored = get(&service, &id.to_string()).await.unwrap();
        assert_eq!(stored.balance, 1);
    }
}
