//! Frozen daemon configuration.
//!
//! Resolution order, most specific wins:
//!   1. CLI flag (handled by the `joblet` binary, not here)
//!   2. `JOBLET_CONFIG` environment variable naming a TOML file
//!   3. `$XDG_CONFIG_HOME/joblet/config.toml` / platform config dir
//!   4. built-in defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logpipeline::OverflowStrategy;

/// Everything a running daemon needs, fixed for its entire lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobletConfig {
    pub data_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub default_network: String,
    pub isolation_mode: IsolationModeConfig,
    pub log_pipeline: LogPipelineConfig,
    pub persist: PersistConfig,
    pub block_devices: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationModeConfig {
    Full,
    Bypass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogPipelineConfig {
    pub queue_capacity: usize,
    pub soft_memory_cap_bytes: u64,
    pub batch_max_chunks: usize,
    pub batch_flush_interval_ms: u64,
    pub overflow_strategy: OverflowStrategy,
    pub subscriber_buffer: usize,
    pub keepalive_interval_secs: u64,
}

impl Default for LogPipelineConfig {
    fn default() -> Self {
        LogPipelineConfig {
            queue_capacity: 100_000,
            soft_memory_cap_bytes: 1 << 30, // 1 GiB
            batch_max_chunks: 100,
            batch_flush_interval_ms: 100,
            overflow_strategy: OverflowStrategy::Compress,
            subscriber_buffer: crate::pubsub::DEFAULT_SUBSCRIBER_BUFFER,
            keepalive_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub socket_path: PathBuf,
    pub reconnect_backoff_min_secs: u64,
    pub reconnect_backoff_max_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub graceful_shutdown_secs: u64,
    pub log_retention_days: u32,
    pub log_rotate_bytes: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        PersistConfig {
            socket_path: PathBuf::from("/run/joblet/persist.sock"),
            reconnect_backoff_min_secs: 1,
            reconnect_backoff_max_secs: 30,
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
            graceful_shutdown_secs: 10,
            log_retention_days: 7,
            log_rotate_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for JobletConfig {
    fn default() -> Self {
        JobletConfig {
            data_root: default_data_root(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/joblet.slice/joblet.service"),
            default_network: "bridge0".to_string(),
            isolation_mode: IsolationModeConfig::Full,
            log_pipeline: LogPipelineConfig::default(),
            persist: PersistConfig::default(),
            block_devices: Vec::new(),
        }
    }
}

fn default_data_root() -> PathBuf {
    if let Some(base_dirs) = directories::BaseDirs::new() {
        base_dirs.home_dir().join(".local").join("share").join("joblet")
    } else {
        PathBuf::from("/var/lib/joblet")
    }
}

/// Resolve the config file path following the priority chain.
pub fn resolve_config_path(cli_path: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = cli_path {
        return Some(PathBuf::from(p));
    }
    if let Ok(p) = std::env::var("JOBLET_CONFIG") {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    if let Some(dirs) = directories::BaseDirs::new() {
        let candidate = dirs.config_dir().join("joblet").join("config.toml");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

impl JobletConfig {
    /// Load from a TOML file, falling back to built-in defaults for any
    /// field the file omits (`#[serde(default)]` on every sub-struct).
    pub fn load(cli_path: Option<&str>) -> anyhow::Result<Self> {
        match resolve_config_path(cli_path) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
                let cfg: JobletConfig = toml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
                Ok(cfg)
            }
            None => Ok(JobletConfig::default()),
        }
    }

    /// Discover block devices for `io.max` lines, by reading
    /// `/proc/partitions` and keeping only whole-disk entries (no trailing
    /// digit in the device name, e.g. "sda" not "sda1").
    pub fn discover_block_devices() -> Vec<String> {
        let Ok(text) = std::fs::read_to_string("/proc/partitions") else {
            return Vec::new();
        };
        text.lines()
            .skip(2) // header + blank line
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let major = fields.next()?;
                let minor = fields.next()?;
                let _blocks = fields.next()?;
                let name = fields.next()?;
                if name.chars().last().is_some_and(|c| c.is_ascii_digit()) {
                    return None; // partition, not a whole disk
                }
                Some(format!("{major}:{minor}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_budgets() {
        let cfg = JobletConfig::default();
        assert_eq!(cfg.log_pipeline.queue_capacity, 100_000);
        assert_eq!(cfg.persist.log_retention_days, 7);
        assert_eq!(cfg.persist.log_rotate_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn resolve_config_path_prefers_explicit_flag() {
        let path = resolve_config_path(Some("/tmp/custom.toml"));
        assert_eq!(path, Some(PathBuf::from("/tmp/custom.toml")));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let toml_text = r#"
            default_network = "custom0"
        "#;
        let cfg: JobletConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.default_network, "custom0");
        assert_eq!(cfg.log_pipeline.queue_capacity, 100_000);
    }
}
