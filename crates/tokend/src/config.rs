//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use presence::{GeneratorConfig, LifecycleConfig, TokenWatchConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokendConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
    pub service_mode: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            service_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Bring the driver up at startup, as if the host started in the foreground
    #[serde(default = "LifecycleSettings::default_start_initialized")]
    pub start_initialized: bool,
    /// Bound on waiting for session tasks during finalize
    #[serde(default = "LifecycleSettings::default_drain_timeout")]
    pub session_drain_timeout_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            start_initialized: Self::default_start_initialized(),
            session_drain_timeout_ms: Self::default_drain_timeout(),
        }
    }
}

impl LifecycleSettings {
    fn default_start_initialized() -> bool {
        true
    }

    fn default_drain_timeout() -> u64 {
        2000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSettings {
    /// Pause after a failed slot event wait
    #[serde(default = "GeneratorSettings::default_error_backoff")]
    pub error_backoff_ms: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            error_backoff_ms: Self::default_error_backoff(),
        }
    }
}

impl GeneratorSettings {
    fn default_error_backoff() -> u64 {
        100
    }
}

/// Simulated token module driven by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Number of reader slots
    #[serde(default = "SimulationSettings::default_slots")]
    pub slots: u64,
    /// Make slot event waits time out after this long (0 = block until an event)
    #[serde(default)]
    pub poll_timeout_ms: u64,
    /// Interval between random insert/remove/swap actions (0 = no churn)
    #[serde(default = "SimulationSettings::default_churn_interval")]
    pub churn_interval_ms: u64,
    /// Prefix of generated token serial numbers
    #[serde(default = "SimulationSettings::default_serial_prefix")]
    pub serial_prefix: String,
    /// Seed for reproducible churn; random when unset
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            slots: Self::default_slots(),
            poll_timeout_ms: 0,
            churn_interval_ms: Self::default_churn_interval(),
            serial_prefix: Self::default_serial_prefix(),
            seed: None,
        }
    }
}

impl SimulationSettings {
    fn default_slots() -> u64 {
        2
    }

    fn default_churn_interval() -> u64 {
        5000
    }

    fn default_serial_prefix() -> String {
        "SIM".to_string()
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        (self.poll_timeout_ms > 0).then(|| Duration::from_millis(self.poll_timeout_ms))
    }

    pub fn churn_interval(&self) -> Option<Duration> {
        (self.churn_interval_ms > 0).then(|| Duration::from_millis(self.churn_interval_ms))
    }
}

impl TokendConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/tokenwatch/tokend.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: TokendConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tokenwatch").join("tokend.toml")
        } else {
            PathBuf::from(".config/tokenwatch/tokend.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.simulation.slots == 0 {
            return Err(anyhow!("Simulation needs at least one slot"));
        }

        if self.simulation.serial_prefix.trim().is_empty() {
            return Err(anyhow!("Empty serial_prefix in simulation settings"));
        }

        if self.lifecycle.session_drain_timeout_ms == 0 {
            return Err(anyhow!("session_drain_timeout_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Settings for the presence subsystem
    pub fn token_watch_config(&self) -> TokenWatchConfig {
        TokenWatchConfig {
            lifecycle: LifecycleConfig {
                session_drain_timeout: Duration::from_millis(
                    self.lifecycle.session_drain_timeout_ms,
                ),
            },
            generator: GeneratorConfig {
                error_backoff: Duration::from_millis(self.generator.error_backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = TokendConfig::default();
        assert_eq!(config.daemon.log_level, "info");
        assert!(!config.daemon.service_mode);
        assert!(config.lifecycle.start_initialized);
        assert_eq!(config.simulation.slots, 2);
        assert!(config.simulation.poll_timeout().is_none());
        assert_eq!(
            config.simulation.churn_interval(),
            Some(Duration::from_secs(5))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TokendConfig = toml::from_str(
            r#"
            [daemon]
            log_level = "debug"
            service_mode = true

            [simulation]
            slots = 4
            seed = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.simulation.slots, 4);
        assert_eq!(config.simulation.seed, Some(7));
        assert_eq!(config.simulation.serial_prefix, "SIM");
        assert_eq!(config.generator.error_backoff_ms, 100);
        assert_eq!(config.lifecycle.session_drain_timeout_ms, 2000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TokendConfig::default();
        config.daemon.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = TokendConfig::default();
        config.simulation.slots = 0;
        assert!(config.validate().is_err());

        let mut config = TokendConfig::default();
        config.simulation.serial_prefix = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = TokendConfig::default();
        config.lifecycle.session_drain_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("tokend.toml");

        let mut config = TokendConfig::default();
        config.simulation.slots = 3;
        config.simulation.poll_timeout_ms = 250;
        config.generator.error_backoff_ms = 50;
        config.save(&path).unwrap();

        let loaded = TokendConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.simulation.slots, 3);
        assert_eq!(
            loaded.simulation.poll_timeout(),
            Some(Duration::from_millis(250))
        );

        let watch = loaded.token_watch_config();
        assert_eq!(watch.generator.error_backoff, Duration::from_millis(50));
        assert_eq!(watch.lifecycle.session_drain_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokend.toml");
        fs::write(&path, "[simulation]\nslots = 0\n").unwrap();
        assert!(TokendConfig::load(Some(path)).is_err());

        let missing = dir.path().join("missing.toml");
        assert!(TokendConfig::load(Some(missing)).is_err());
    }
}
