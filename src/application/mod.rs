//! Application layer
//!
//! Runs sessions over real sockets.

pub mod endpoint;

pub use endpoint::{clock, Endpoint, EndpointCommand, EndpointHandle};
