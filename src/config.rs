use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown speed profile: {0}")]
    UnknownProfile(String),
}

/// Protocol tunables. All intervals and timeouts are in milliseconds.
///
/// Peers are discovered dynamically, so the only per-deployment settings are
/// the multicast group and the timing profile. Every field has a default,
/// which lets a tunables file on disk override only what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub heartbeat_interval_ms: u64,
    pub fail_timeout_ms: u64,
    pub hello_timeout_ms: u64,
    pub bully_timeout_ms: u64,
    pub consensus_interval_ms: u64,
    pub round_query_timeout_ms: u64,
    pub value_process_delay_ms: u64,
    pub response_process_delay_ms: u64,
    pub leader_query_delay_ms: u64,
    pub leader_consensus_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(224, 1, 1, 1),
            multicast_port: 50_000,
            heartbeat_interval_ms: 200,
            fail_timeout_ms: 5_000,
            hello_timeout_ms: 2_000,
            bully_timeout_ms: 5_000,
            consensus_interval_ms: 15_000,
            round_query_timeout_ms: 6_000,
            value_process_delay_ms: 2_000,
            response_process_delay_ms: 2_000,
            leader_query_delay_ms: 3_000,
            leader_consensus_delay_ms: 3_000,
        }
    }
}

/// Named timing profiles. A companion tool rewrites the tunables file on
/// disk with one of these; the launcher also accepts them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedProfile {
    Slow,
    Normal,
    Fast,
}

impl FromStr for SpeedProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slow" => Ok(Self::Slow),
            "normal" => Ok(Self::Normal),
            "fast" => Ok(Self::Fast),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }
}

impl Config {
    pub fn for_profile(profile: SpeedProfile) -> Self {
        match profile {
            SpeedProfile::Normal => Self::default(),
            // Relaxed timings for demos and debugging: slower cadences,
            // longer windows, fewer spurious failure detections.
            SpeedProfile::Slow => Self {
                heartbeat_interval_ms: 500,
                fail_timeout_ms: 8_000,
                hello_timeout_ms: 4_000,
                bully_timeout_ms: 6_000,
                consensus_interval_ms: 20_000,
                round_query_timeout_ms: 8_000,
                value_process_delay_ms: 3_000,
                response_process_delay_ms: 3_000,
                leader_query_delay_ms: 4_000,
                leader_consensus_delay_ms: 4_000,
                ..Self::default()
            },
            SpeedProfile::Fast => Self {
                heartbeat_interval_ms: 100,
                fail_timeout_ms: 2_000,
                hello_timeout_ms: 1_000,
                bully_timeout_ms: 2_000,
                consensus_interval_ms: 8_000,
                round_query_timeout_ms: 3_000,
                value_process_delay_ms: 1_000,
                response_process_delay_ms: 1_000,
                leader_query_delay_ms: 1_500,
                leader_consensus_delay_ms: 1_500,
                ..Self::default()
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Write the tunables as pretty JSON, the same shape `load` reads back.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
