use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Retry policy parameters (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per connection (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

/// How file space is reserved before transfers start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAllocation {
    /// No allocation; the file grows as ranges are written.
    None,
    /// Write zeros over the whole file in slices.
    #[default]
    Prealloc,
    /// `posix_fallocate` in slices; falls back to zero-fill where unsupported.
    Falloc,
}

/// Global configuration loaded from `~/.config/mdm/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdmConfig {
    /// Ceiling on simultaneously active download groups.
    pub max_concurrent_downloads: usize,
    /// Maximum connections per download group.
    pub split: usize,
    /// Segment granularity in bytes.
    pub segment_size: u64,
    /// A connection with no progress for this long takes its timeout path.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Optional retry policy; if missing, built-in defaults are used.
    pub retry: Option<RetryConfig>,
    /// Give up on a group after this many not-found responses (0 = no limit).
    pub max_file_not_found: u32,
    pub file_allocation: FileAllocation,
    /// Files smaller than this are never preallocated.
    pub no_file_allocation_limit: u64,
    /// Bytes allocated per scheduler step.
    pub allocation_chunk_bytes: u64,
    /// Bytes hashed per scheduler step.
    pub check_chunk_bytes: u64,
    /// Verify downloads that carry an expected digest.
    pub check_integrity: bool,
    /// Replace an existing target file instead of refusing to start.
    pub allow_overwrite: bool,
    /// Seconds between periodic control-file saves (0 = only on stop).
    pub auto_save_interval_secs: u64,
    /// Upper bound on one readiness poll, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Bytes per second across all downloads (0 = unlimited). While the
    /// aggregate speed is above it, no new transfer starts.
    pub max_overall_download_limit: u64,
    /// Let a connection with no free segment take over the segment of a
    /// much slower one.
    pub reassign_slow_segments: bool,
    /// A connection younger than this is never judged slow.
    pub startup_idle_time_secs: u64,
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 5,
            split: 5,
            segment_size: 1024 * 1024,
            timeout_secs: 60,
            connect_timeout_secs: 30,
            retry: None,
            max_file_not_found: 0,
            file_allocation: FileAllocation::Prealloc,
            no_file_allocation_limit: 5 * 1024 * 1024,
            allocation_chunk_bytes: 1024 * 1024,
            check_chunk_bytes: 1024 * 1024,
            check_integrity: true,
            allow_overwrite: false,
            auto_save_interval_secs: 60,
            poll_timeout_ms: 1000,
            max_overall_download_limit: 0,
            reassign_slow_segments: true,
            startup_idle_time_secs: 10,
        }
    }
}

impl MdmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
            .as_ref()
            .map(RetryPolicy::from_config)
            .unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn startup_idle_time(&self) -> Duration {
        Duration::from_secs(self.startup_idle_time_secs)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<MdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = MdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: MdmConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = MdmConfig::default();
        assert_eq!(cfg.max_concurrent_downloads, 5);
        assert_eq!(cfg.split, 5);
        assert_eq!(cfg.segment_size, 1 << 20);
        assert_eq!(cfg.file_allocation, FileAllocation::Prealloc);
        assert!(cfg.check_integrity);
        assert!(!cfg.allow_overwrite);
        assert_eq!(cfg.max_overall_download_limit, 0);
        assert!(cfg.reassign_slow_segments);
        assert_eq!(cfg.startup_idle_time(), Duration::from_secs(10));
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = MdmConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: MdmConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_concurrent_downloads, cfg.max_concurrent_downloads);
        assert_eq!(parsed.segment_size, cfg.segment_size);
        assert_eq!(parsed.poll_timeout_ms, cfg.poll_timeout_ms);
    }

    #[test]
    fn config_toml_partial_uses_defaults() {
        let toml = r#"
            max_concurrent_downloads = 2
            split = 8
            file_allocation = "falloc"
            max_overall_download_limit = 65536
        "#;
        let cfg: MdmConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_concurrent_downloads, 2);
        assert_eq!(cfg.split, 8);
        assert_eq!(cfg.file_allocation, FileAllocation::Falloc);
        assert_eq!(cfg.max_overall_download_limit, 65536);
        assert!(cfg.reassign_slow_segments);
        assert_eq!(cfg.timeout_secs, 60);
        assert!(cfg.retry.is_none());
    }

    #[test]
    fn config_toml_retry_section() {
        let toml = r#"
            file_allocation = "none"

            [retry]
            max_attempts = 3
            base_delay_secs = 0.5
            max_delay_secs = 15
        "#;
        let cfg: MdmConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.file_allocation, FileAllocation::None);
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(15));
    }
}
