//! # txnsvc-client
//!
//! Client library for txnsvc.
//!
//! This crate provides:
//! - Async TCP client with concurrent, id-matched requests
//! - Typed calls for the four transaction operations
//! - Per-call deadlines carried to the server

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
