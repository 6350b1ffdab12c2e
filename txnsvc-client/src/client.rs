//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use serde_json::{json, Value};
use std::sync::Arc;
use txnsvc_protocol::message::{
    DeleteTransactionResult, GetTransactionResult, HelloResult, Operation, TransactionResult,
};

/// High-level client for txnsvc.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Returns the server's answer to HELLO, once connected.
    pub async fn server_info(&self) -> Option<HelloResult> {
        self.conn.server_info().await
    }

    async fn request(&self, op: Operation, params: Value) -> Result<Value, ClientError> {
        let response = self.conn.request(op, params).await?;
        ClientError::check(response)
    }

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(Operation::Ping, json!({})).await?;
        Ok(())
    }

    /// Creates a record with the given balance; the server picks its id.
    pub async fn create_transaction(&self, balance: i32) -> Result<TransactionResult, ClientError> {
        let params = json!({
            "balance": balance,
        });

        let result = self.request(Operation::CreateTransaction, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Overwrites the balance of an existing record.
    pub async fn update_transaction(
        &self,
        transaction_id: &str,
        balance: i32,
    ) -> Result<TransactionResult, ClientError> {
        let params = json!({
            "transactionId": transaction_id,
            "balance": balance,
        });

        let result = self.request(Operation::UpdateTransaction, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Reads a record.
    pub async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<GetTransactionResult, ClientError> {
        let params = json!({
            "transactionId": transaction_id,
        });

        let result = self.request(Operation::GetTransaction, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Deletes a record. Deleting a missing record is not an error; the
    /// result then carries `success: false`.
    pub async fn delete_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<DeleteTransactionResult, ClientError> {
        let params = json!({
            "transactionId": transaction_id,
        });

        let result = self.request(Operation::DeleteTransaction, params).await?;
        Ok(serde_json::from_value(result)?)
    }
}
