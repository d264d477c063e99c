//! Domain layer - error types shared by the engine and its adapters

pub mod shared;

pub use shared::{EngineError, Result};
