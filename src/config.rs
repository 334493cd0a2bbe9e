use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub tcp: TcpConfig,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub signatures: SignaturesConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Serialize the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config")
    }
}

/// Capture file settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// PCAP files to replay, processed in order
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// Session reassembly settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Half-open sessions kept before FIFO eviction
    pub max_pending: usize,
    /// Floor for the adaptive session duration cutoff, in milliseconds
    pub min_duration_ms: u64,
    /// Duration cutoff before any session has closed, in milliseconds
    pub initial_max_duration_ms: u64,
    /// EWMA weight for the mean session duration
    pub alpha: f64,
    /// EWMA weight for the duration deviation
    pub beta: f64,
    /// Deviations above the mean tolerated before a session is cut
    pub dev_multiplier: f64,
    /// Bound of the session channel between reassembly and parsing
    pub channel_capacity: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_pending: 300,
            min_duration_ms: 600_000,
            initial_max_duration_ms: 18_000_000,
            alpha: 0.5,
            beta: 0.25,
            dev_multiplier: 20.0,
            channel_capacity: 5000,
        }
    }
}

/// Dialogue reconstruction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Join message fragments split across segments into one message
    pub reassemble_messages: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            reassemble_messages: true,
        }
    }
}

/// Signature rule files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignaturesConfig {
    /// Signature files, compiled in order
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Optional macro file loaded before any signature file
    #[serde(default)]
    pub macro_file: Option<PathBuf>,
}

/// Where matched sessions are written
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Matched sessions as JSON lines; log only when unset
    #[serde(default)]
    pub results: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roundtrips_through_toml() {
        let config = Config::default();
        let toml_str = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.tcp.max_pending, 300);
        assert_eq!(parsed.tcp.min_duration_ms, 600_000);
        assert!(parsed.smtp.reassemble_messages);
        assert!(parsed.capture.files.is_empty());
        assert!(parsed.output.results.is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            "[tcp]\nmax_pending = 50\nmin_duration_ms = 1000\ninitial_max_duration_ms = 2000\nalpha = 0.5\nbeta = 0.25\ndev_multiplier = 10.0\nchannel_capacity = 100\n",
        )
        .unwrap();
        assert_eq!(config.tcp.max_pending, 50);
        assert!(config.smtp.reassemble_messages);
        assert!(config.signatures.files.is_empty());
    }
}
