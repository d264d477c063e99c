//! Engine errors

use crate::infrastructure::media::rtp::{RtcpError, RtpError};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("No session for {remote} on local port {local_port}")]
    SessionNotFound { remote: IpAddr, local_port: u16 },

    #[error("Session for {remote} on local port {local_port} is inactive")]
    SessionInactive { remote: IpAddr, local_port: u16 },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Rtp(#[from] RtpError),

    #[error(transparent)]
    Rtcp(#[from] RtcpError),
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Configuration(e.to_string())
    }
}
