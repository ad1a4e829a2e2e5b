//! Runtime configuration.
//!
//! Defaults work out of the box; a `lockstep.toml` in the working directory
//! and `LOCKSTEP_*` environment variables override them. The risk block
//! threshold is deliberately configuration, not code: it is tuned per
//! deployment.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Default risk score at or above which the gate holds the run.
pub const DEFAULT_BLOCK_THRESHOLD: f64 = 0.8;

/// Default per-stage executor timeout.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Risk score in [0, 1] at or above which the gate holds.
    pub block_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { block_threshold: DEFAULT_BLOCK_THRESHOLD }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gate: GateConfig,
    /// Timeout applied to each stage executor invocation. A timeout is a
    /// stage failure, never a silent retry.
    pub stage_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            stage_timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        }
    }
}

/// On-disk shape of `lockstep.toml`. All fields optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    block_threshold: Option<f64>,
    stage_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration: defaults, then `lockstep.toml` (if present),
    /// then environment overrides.
    pub fn load(dir: &Path) -> Result<Config> {
        let mut config = Config::default();

        let file = dir.join("lockstep.toml");
        if file.exists() {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let parsed: FileConfig = toml::from_str(&raw)
                .with_context(|| format!("Invalid TOML in {}", file.display()))?;
            if let Some(threshold) = parsed.block_threshold {
                config.gate.block_threshold = threshold;
            }
            if let Some(secs) = parsed.stage_timeout_secs {
                config.stage_timeout = Duration::from_secs(secs);
            }
        }

        if let Ok(raw) = std::env::var("LOCKSTEP_RISK_THRESHOLD") {
            config.gate.block_threshold = raw
                .parse()
                .context("LOCKSTEP_RISK_THRESHOLD must be a float")?;
        }
        if let Ok(raw) = std::env::var("LOCKSTEP_STAGE_TIMEOUT_SECS") {
            let secs: u64 = raw
                .parse()
                .context("LOCKSTEP_STAGE_TIMEOUT_SECS must be an integer")?;
            config.stage_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.gate.block_threshold) {
            bail!(
                "block_threshold must be in [0.0, 1.0], got {}",
                self.gate.block_threshold
            );
        }
        if self.stage_timeout.is_zero() {
            bail!("stage_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gate.block_threshold, 0.8);
        assert_eq!(config.stage_timeout, Duration::from_secs(600));
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.gate.block_threshold, DEFAULT_BLOCK_THRESHOLD);
    }

    #[test]
    fn load_reads_toml_overrides() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("lockstep.toml"),
            "block_threshold = 0.6\nstage_timeout_secs = 120\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.gate.block_threshold, 0.6);
        assert_eq!(config.stage_timeout, Duration::from_secs(120));
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let config = Config {
            gate: GateConfig { block_threshold: 1.5 },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("lockstep.toml"), "block_threshold = \"high\"").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
