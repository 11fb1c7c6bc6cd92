use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub hls: HlsConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// Seconds to wait after spawn before probing the IPC endpoint.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: f64,
    /// Per-command IPC response timeout in seconds.
    #[serde(default = "default_ipc_timeout_secs")]
    pub ipc_timeout_secs: f64,
    /// Extra flags appended to every mpv invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsConfig {
    /// Segment duration in seconds.
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u32,
    /// AAC bitrate passed to the encoder, e.g. "256k".
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    /// A session reports ready only once the segment count exceeds this.
    #[serde(default = "default_min_segments")]
    pub min_segments_for_ready: u64,
    /// Fallback poll interval in milliseconds.  The poller recounts segment
    /// files on disk in case filesystem events are dropped.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Root directory for per-session output directories.
    #[serde(default = "platform::hls_root")]
    pub output_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Instances idle longer than this are removed by the sweep.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Interval between sweeps.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            settle_secs: default_settle_secs(),
            ipc_timeout_secs: default_ipc_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_secs: default_segment_secs(),
            bitrate: default_bitrate(),
            min_segments_for_ready: default_min_segments(),
            poll_interval_ms: default_poll_interval_ms(),
            output_root: platform::hls_root(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            sweep_secs: default_sweep_secs(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8008
}

fn default_settle_secs() -> f64 {
    2.0
}

fn default_ipc_timeout_secs() -> f64 {
    10.0
}

fn default_segment_secs() -> u32 {
    6
}

fn default_bitrate() -> String {
    "256k".to_string()
}

fn default_min_segments() -> u64 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_idle_secs() -> u64 {
    5 * 60
}

fn default_sweep_secs() -> u64 {
    60
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http.port, 8008);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.hls.segment_secs, 6);
        assert_eq!(config.hls.min_segments_for_ready, 3);
        assert_eq!(config.reaper.idle_secs, 300);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[hls]\nbitrate = \"128k\"\n").unwrap();
        assert_eq!(config.hls.bitrate, "128k");
        assert_eq!(config.hls.segment_secs, 6);
        assert_eq!(config.mpv.ipc_timeout_secs, 10.0);
    }
}
