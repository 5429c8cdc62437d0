//! Capture pipeline
//!
//! Components:
//! - `capture`: the warp filter that records requests addressed to a session.
//! - `client_address`: proxy-aware client address resolution.
//! - `body`: size-capped body ingestion.

pub mod body;
pub mod capture;
pub mod client_address;

pub use capture::{capture_route, CaptureContext, CaptureSettings, CaptureTarget};
