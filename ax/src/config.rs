//! adexec configuration types and loading

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ads::{DisplayDefaults, LivenessConfig};
use crate::coordinator::CoordinatorConfig;
use crate::offer::BackoffConfig;

const LOCAL_CONFIG: &str = ".adexec.yml";

/// Main adexec configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin the tabs are served from
    pub origin: String,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Transport selection
    pub transport: TransportConfig,

    /// Coordinator tuning
    pub coordinator: CoordinatorConfig,

    /// Liveness loop timing
    pub liveness: LivenessConfig,

    /// Retry backoff for slot preparation
    pub backoff: BackoffConfig,

    /// Adspace defaults
    pub display: DisplayDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "https://localhost".to_string(),
            log_level: None,
            transport: TransportConfig::default(),
            coordinator: CoordinatorConfig::default(),
            liveness: LivenessConfig::default(),
            backoff: BackoffConfig::default(),
            display: DisplayDefaults::default(),
        }
    }
}

impl Config {
    /// Check values that would make the executor misbehave
    pub fn validate(&self) -> Result<()> {
        if self.origin.is_empty() {
            return Err(eyre!("origin must not be empty"));
        }
        if self.liveness.grace_ms >= self.liveness.ping_interval_ms {
            return Err(eyre!(
                "liveness grace-ms ({}) must be shorter than ping-interval-ms ({})",
                self.liveness.grace_ms,
                self.liveness.ping_interval_ms
            ));
        }
        if self.backoff.factor < 1.0 {
            return Err(eyre!("backoff factor must be at least 1.0, got {}", self.backoff.factor));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidates() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is set up
    ///
    /// Errors are swallowed: the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        #[derive(Deserialize)]
        struct LogLevelOnly {
            #[serde(rename = "log-level")]
            log_level: Option<String>,
        }

        let path = match config_path {
            Some(path) => path.clone(),
            None => Self::candidates().into_iter().find(|p| p.exists())?,
        };
        let content = fs::read_to_string(path).ok()?;
        serde_yaml::from_str::<LogLevelOnly>(&content).ok()?.log_level
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// `./.adexec.yml`, then `~/.config/adexec/adexec.yml`
    fn candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("adexec").join("adexec.yml"));
        }
        candidates
    }
}

/// Transport selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Never use the shared host; every tab runs its own coordinator instance
    #[serde(rename = "force-compat")]
    pub force_compat: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.origin, "https://localhost");
        assert!(!config.transport.force_compat);
        assert_eq!(config.liveness.ping_interval_ms, 10_000);
        assert_eq!(config.backoff.initial_ms, 1_500);
        assert_eq!(config.display.price_slot, "BTC1_000");
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
origin: https://news.example
log-level: debug

transport:
  force-compat: true

coordinator:
  election-window-ms: 50

liveness:
  ping-interval-ms: 2000
  grace-ms: 500
  exempt-new-slots: false

backoff:
  initial-ms: 100
  max-ms: 1000

display:
  app-key: site-key
  relays:
    - wss://relay.example
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.origin, "https://news.example");
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(config.transport.force_compat);
        assert_eq!(config.coordinator.election_window_ms, 50);
        assert!(!config.liveness.exempt_new_slots);
        assert_eq!(config.backoff.max_ms, 1000);
        assert_eq!(config.display.app_key, "site-key");
        assert_eq!(config.display.relays, vec!["wss://relay.example"]);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("origin: https://a.example\n").unwrap();

        assert_eq!(config.origin, "https://a.example");
        assert_eq!(config.coordinator, CoordinatorConfig::default());
        assert_eq!(config.liveness, LivenessConfig::default());
        assert_eq!(config.display.mime_types.len(), 4);
    }

    #[test]
    fn test_validate_rejects_grace_longer_than_interval() {
        let mut config = Config::default();
        config.liveness.grace_ms = config.liveness.ping_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "origin: https://file.example\nlog-level: WARN").unwrap();
        let path = file.path().to_path_buf();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.origin, "https://file.example");
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("WARN"));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
        assert!(Config::load_log_level(Some(&path)).is_none());
    }

    #[test]
    fn test_log_level_survives_invalid_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log-level: TRACE\nliveness: not-a-map").unwrap();
        let path = file.path().to_path_buf();

        assert!(Config::load(Some(&path)).is_err());
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("TRACE"));
    }
}
