//! Shared kernel - error and result types used across the crate

pub mod error;
pub mod result;

pub use error::EngineError;
pub use result::Result;
