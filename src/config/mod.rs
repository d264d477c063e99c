//! Configuration management
//!
//! Loaded from an optional TOML file plus `RTP_ENGINE__*` environment
//! variables, e.g. `RTP_ENGINE__JITTER_BUFFER__ENABLED=true`.

use crate::domain::shared::{EngineError, Result};
use crate::infrastructure::media::rtp::JitterBufferConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RTP_ENGINE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub rtp: RtpConfig,
    #[serde(default)]
    pub jitter_buffer: JitterBufferSettings,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub sdes: SdesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpConfig {
    /// RTCP bandwidth share in bytes per second
    #[serde(default = "default_session_bandwidth")]
    pub session_bandwidth: f64,
    /// Collect and print per-session statistics on termination
    #[serde(default = "default_true")]
    pub statistics: bool,
    #[serde(default)]
    pub payload_type: u8,
    /// Packetization interval
    #[serde(default = "default_packetization_ms")]
    pub packetization_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterBufferSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_packets")]
    pub max_packets: usize,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_talkspurt_delay_ms")]
    pub talkspurt_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// RTP port; RTCP uses the next one
    #[serde(default = "default_rtp_port")]
    pub rtp_port: u16,
    /// Prometheus exporter address; no exporter when unset
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

/// Own SDES items. A random CNAME is generated when none is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdesConfig {
    pub cname: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub tool: Option<String>,
    pub note: Option<String>,
}

fn default_session_bandwidth() -> f64 {
    64000.0
}

fn default_true() -> bool {
    true
}

fn default_packetization_ms() -> u64 {
    20
}

fn default_max_packets() -> usize {
    100
}

fn default_max_delay_ms() -> u64 {
    10
}

fn default_talkspurt_delay_ms() -> u64 {
    10
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_rtp_port() -> u16 {
    5004
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            session_bandwidth: default_session_bandwidth(),
            statistics: true,
            payload_type: 0,
            packetization_ms: default_packetization_ms(),
        }
    }
}

impl Default for JitterBufferSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_packets: default_max_packets(),
            max_delay_ms: default_max_delay_ms(),
            talkspurt_delay_ms: default_talkspurt_delay_ms(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            rtp_port: default_rtp_port(),
            metrics_listen: None,
        }
    }
}

impl EngineConfig {
    /// Load from `path` (if given and present) and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document and validate it
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: EngineConfig =
            toml::from_str(text).map_err(|e| EngineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Replace out-of-range values with defaults and reject what cannot be fixed
    pub fn validate(&mut self) -> Result<()> {
        if self.rtp.session_bandwidth.is_nan() || self.rtp.session_bandwidth <= 0.0 {
            warn!(
                "session_bandwidth {} is not positive, using {}",
                self.rtp.session_bandwidth,
                default_session_bandwidth()
            );
            self.rtp.session_bandwidth = default_session_bandwidth();
        }
        if self.rtp.packetization_ms == 0 {
            warn!("packetization_ms is 0, using {}", default_packetization_ms());
            self.rtp.packetization_ms = default_packetization_ms();
        }
        if self.rtp.payload_type > 127 {
            return Err(EngineError::Configuration(format!(
                "payload_type {} does not fit in 7 bits",
                self.rtp.payload_type
            )));
        }
        if (72..=76).contains(&self.rtp.payload_type) {
            return Err(EngineError::Configuration(format!(
                "payload_type {} collides with RTCP packet types",
                self.rtp.payload_type
            )));
        }

        let jb = &mut self.jitter_buffer;
        if jb.max_packets == 0 {
            warn!("jitter_buffer.max_packets is 0, using {}", default_max_packets());
            jb.max_packets = default_max_packets();
        }
        if jb.max_delay_ms == 0 {
            warn!("jitter_buffer.max_delay_ms is 0, using {}", default_max_delay_ms());
            jb.max_delay_ms = default_max_delay_ms();
        }
        if jb.talkspurt_delay_ms == 0 {
            warn!(
                "jitter_buffer.talkspurt_delay_ms is 0, using {}",
                default_talkspurt_delay_ms()
            );
            jb.talkspurt_delay_ms = default_talkspurt_delay_ms();
        }

        if self.endpoint.rtp_port == u16::MAX {
            return Err(EngineError::Configuration(
                "rtp_port 65535 leaves no room for the RTCP port".to_string(),
            ));
        }
        Ok(())
    }

    pub fn packetization(&self) -> Duration {
        Duration::from_millis(self.rtp.packetization_ms)
    }

    /// Jitter buffer settings for a session, or `None` when disabled
    pub fn jitter_buffer_config(&self, packetization: Duration) -> Option<JitterBufferConfig> {
        let jb = &self.jitter_buffer;
        jb.enabled.then(|| JitterBufferConfig {
            max_packets: jb.max_packets,
            nominal_delay: packetization,
            max_delay: Duration::from_millis(jb.max_delay_ms),
            talkspurt_delay: Duration::from_millis(jb.talkspurt_delay_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.rtp.session_bandwidth, 64000.0);
        assert!(!config.jitter_buffer.enabled);
        assert_eq!(config.jitter_buffer.max_packets, 100);
        assert_eq!(config.jitter_buffer.max_delay_ms, 10);
        assert_eq!(config.jitter_buffer.talkspurt_delay_ms, 10);
        assert_eq!(config.endpoint.rtp_port, 5004);
        assert!(config.jitter_buffer_config(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [jitter_buffer]
            enabled = true
            max_packets = 50

            [endpoint]
            rtp_port = 6000
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.rtp_port, 6000);
        let jb = config.jitter_buffer_config(Duration::from_millis(30)).unwrap();
        assert_eq!(jb.max_packets, 50);
        assert_eq!(jb.nominal_delay, Duration::from_millis(30));
        assert_eq!(jb.max_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_non_positive_values_fall_back() {
        let mut config = EngineConfig::default();
        config.rtp.session_bandwidth = -5.0;
        config.jitter_buffer.max_packets = 0;
        config.jitter_buffer.max_delay_ms = 0;
        config.jitter_buffer.talkspurt_delay_ms = 0;

        config.validate().unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_rtcp_port_overflow_rejected() {
        let mut config = EngineConfig::default();
        config.endpoint.rtp_port = u16::MAX;
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_rtcp_colliding_payload_type_rejected() {
        let mut config = EngineConfig::default();
        config.rtp.payload_type = 72;
        assert!(config.validate().is_err());
        config.rtp.payload_type = 96;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = EngineConfig::default();
        config.sdes.cname = Some("alice@example.org".into());
        config.endpoint.metrics_listen = Some("127.0.0.1:9100".parse().unwrap());

        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_without_file() {
        let config = EngineConfig::load(None).unwrap();
        assert!(config.rtp.session_bandwidth > 0.0);
    }
}
