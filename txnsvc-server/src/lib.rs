//! # txnsvc-server
//!
//! TCP server for the transaction service.
//!
//! This crate provides:
//! - The transaction service: the four record operations and their error mapping
//! - Request dispatch with per-call deadlines
//! - TCP connection handling with one task per call
//! - Configuration from YAML and environment variables
//! - Prometheus metrics over HTTP

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod service;
pub mod session;

pub use config::{load_dotenv, Config, ConfigError, DatabaseConfig, MetricsConfig, NetworkConfig};
pub use error::ServerError;
pub use handler::{RequestHandler, ServerInfo};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
pub use service::TransactionService;
pub use session::{Session, SessionState};
