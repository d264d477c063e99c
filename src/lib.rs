//! rtp-engine - An RTP/RTCP session engine built with Rust
//!
//! Implements RFC 3550 sessions: sequence validation, reception statistics,
//! RTCP compound packets with interval scheduling and an adaptive jitter
//! buffer, driven over UDP by a tokio endpoint.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::EngineError;
pub use domain::shared::result::Result;
