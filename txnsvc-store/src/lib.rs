//! # txnsvc-store
//!
//! Persistence gateway for transaction records.
//!
//! This crate provides:
//! - The [`TransactionStore`] trait the service is written against
//! - [`PgStore`], backed by a PostgreSQL connection pool
//! - [`MemoryStore`], an in-process store for tests
//! - Table initialization in `ensure` or `reset` mode

pub mod error;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};
pub use schema::SchemaMode;
pub use store::TransactionStore;
