//! # txnsvc-protocol
//!
//! Wire protocol for the transaction service.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - JSON request/response envelopes
//! - Typed parameters and results for the transaction operations
//! - Stable error codes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Operation, Request, Response, ResponseError, ResponseMeta, ResponseStatus};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the transaction service.
pub const DEFAULT_PORT: u16 = 50051;

/// Maximum frame payload size (4 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;
