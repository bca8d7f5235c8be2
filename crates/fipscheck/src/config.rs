use std::path::{Component, Path};
use std::time::Duration;

use anyhow::{Context, Result};
use fipscheck_contracts::FIPSCHECK_CONFIG_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 64 * 1024;
pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
pub const MAX_WORKERS: usize = 256;
pub const MIN_OUTPUT_CAP_BYTES: usize = 256;

/// Scan tuning. Every field is optional in the JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub schema_version: String,
    pub probe_timeout_ms: u64,
    pub output_cap_bytes: usize,
    pub workers: usize,
    /// Root-relative directories that are never descended into.
    pub prune: Vec<String>,
    pub follow_symlinks: bool,
    /// Global wall-clock budget for the whole scan.
    pub deadline_ms: Option<u64>,
    pub kill_grace_ms: u64,
    pub hash_binaries: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            schema_version: FIPSCHECK_CONFIG_SCHEMA_VERSION.to_string(),
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            workers: default_workers(),
            prune: Vec::new(),
            follow_symlinks: false,
            deadline_ms: None,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            hash_binaries: true,
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

impl ScanConfig {
    pub fn from_json_str(txt: &str) -> Result<ScanConfig> {
        let cfg: ScanConfig = serde_json::from_str(txt).context("parse config JSON")?;
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<ScanConfig> {
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json_str(&txt).with_context(|| format!("load config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version.trim() != FIPSCHECK_CONFIG_SCHEMA_VERSION {
            return Err(format!(
                "config.schema_version mismatch: expected {} got {:?}",
                FIPSCHECK_CONFIG_SCHEMA_VERSION, self.schema_version
            ));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(format!(
                "config.workers must be 1..{MAX_WORKERS} (got {})",
                self.workers
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err("config.probe_timeout_ms must be > 0".to_string());
        }
        if self.output_cap_bytes < MIN_OUTPUT_CAP_BYTES {
            return Err(format!(
                "config.output_cap_bytes must be >= {MIN_OUTPUT_CAP_BYTES} (got {})",
                self.output_cap_bytes
            ));
        }
        for p in &self.prune {
            let path = Path::new(p);
            if p.trim().is_empty() || path.is_absolute() {
                return Err(format!("config.prune entry must be a relative path: {p:?}"));
            }
            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(format!("config.prune entry must not contain '..': {p:?}"));
            }
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ScanConfig::default();
        cfg.validate().expect("default config");
        assert!(cfg.workers >= 1 && cfg.workers <= 8);
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.output_cap_bytes, 65536);
        assert_eq!(cfg.kill_grace(), Duration::from_secs(2));
        assert!(!cfg.follow_symlinks);
        assert!(cfg.hash_binaries);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = ScanConfig::from_json_str(
            r#"{"schema_version":"fipscheck.config@0.1.0","workers":3,"prune":["opt/vendor"]}"#,
        )
        .expect("parse");
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.prune, vec!["opt/vendor".to_string()]);
        assert_eq!(cfg.probe_timeout_ms, DEFAULT_PROBE_TIMEOUT_MS);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(ScanConfig::from_json_str(r#"{"bogus":1}"#).is_err());
        assert!(ScanConfig::from_json_str(r#"{"schema_version":"other@1"}"#).is_err());

        let bad = |f: fn(&mut ScanConfig)| {
            let mut cfg = ScanConfig::default();
            f(&mut cfg);
            cfg.validate().is_err()
        };
        assert!(bad(|c| c.workers = 0));
        assert!(bad(|c| c.workers = 257));
        assert!(bad(|c| c.probe_timeout_ms = 0));
        assert!(bad(|c| c.output_cap_bytes = 10));
        assert!(bad(|c| c.prune = vec!["/abs".to_string()]));
        assert!(bad(|c| c.prune = vec!["a/../b".to_string()]));
    }
}
