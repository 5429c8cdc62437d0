//! Error taxonomy shared by every layer of the service.
//!
//! Storage and pub/sub return typed enums; the capture filter and the API
//! routes map them onto HTTP status codes.

pub mod types;

pub use types::*;
