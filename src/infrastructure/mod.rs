//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - RTP/RTCP wire formats and session machinery
//! - Timer and datagram collaborators
//! - Prometheus metrics

pub mod media;
pub mod metrics;
