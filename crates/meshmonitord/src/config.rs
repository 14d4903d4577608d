use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub vns: VnsSection,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub nodes: NodesConfig,
    #[serde(default)]
    pub traceroute: TracerouteConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
    #[serde(skip)]
    pub data_directory: PathBuf,
}

/// Physical radio address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4403,
        }
    }
}

/// Virtual node server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnsSection {
    pub enabled: bool,
    pub listen_port: u16,
    /// Disables the default-deny admin filter for connected clients.
    pub allow_admin_commands: bool,
    pub idle_timeout_secs: u64,
}

impl Default for VnsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 4403,
            allow_admin_commands: false,
            idle_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Node visibility and offline-signaling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    /// Age window for snapshots and the VNS NodeInfo replay set.
    pub max_node_age_hours: u32,
    pub inactive_node_threshold_hours: u32,
    pub inactive_node_check_interval_minutes: u32,
    pub inactive_node_cooldown_hours: u32,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            max_node_age_hours: 24,
            inactive_node_threshold_hours: 1,
            inactive_node_check_interval_minutes: 10,
            inactive_node_cooldown_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteConfig {
    pub enabled: bool,
    pub interval_minutes: u32,
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Telemetry kept for favorite nodes.
    pub favorite_telemetry_hours: u32,
    /// Telemetry kept for everyone else.
    pub telemetry_hours: u32,
    /// Newest raw (unknown-port) packets kept for inspection.
    pub raw_packets_keep: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            favorite_telemetry_hours: 7 * 24,
            telemetry_hours: 24,
            raw_packets_keep: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    pub version_check_disabled: bool,
    pub auto_upgrade_enabled: bool,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            version_check_disabled: false,
            auto_upgrade_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file (or defaults when absent), then apply
    /// environment overrides.
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        let mut config: Config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .context("Failed to read configuration file")?;
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?
        } else {
            serde_yaml::from_str("{}").expect("empty config must parse")
        };

        config.config_file_path = config_path;
        config.data_directory = data_dir;
        config.apply_env_overrides();

        fs::create_dir_all(&config.data_directory)?;

        Ok(config)
    }

    /// Write a default configuration file and create the data directory.
    pub fn create_default(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&data_dir)?;

        let mut config: Config = serde_yaml::from_str("{}").expect("empty config must parse");
        config.config_file_path = config_path.clone();
        config.data_directory = data_dir;

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)?;

        Ok(config)
    }

    /// Environment overrides for every documented option.
    fn apply_env_overrides(&mut self) {
        read_env("MESHMONITOR_RADIO_HOST", &mut self.radio.host);
        read_env("MESHMONITOR_RADIO_PORT", &mut self.radio.port);
        read_env("MESHMONITOR_LISTEN_PORT", &mut self.vns.listen_port);
        read_env(
            "MESHMONITOR_ALLOW_ADMIN_COMMANDS",
            &mut self.vns.allow_admin_commands,
        );
        read_env(
            "MESHMONITOR_MAX_NODE_AGE_HOURS",
            &mut self.nodes.max_node_age_hours,
        );
        read_env(
            "MESHMONITOR_INACTIVE_NODE_THRESHOLD_HOURS",
            &mut self.nodes.inactive_node_threshold_hours,
        );
        read_env(
            "MESHMONITOR_INACTIVE_NODE_CHECK_INTERVAL_MINUTES",
            &mut self.nodes.inactive_node_check_interval_minutes,
        );
        read_env(
            "MESHMONITOR_INACTIVE_NODE_COOLDOWN_HOURS",
            &mut self.nodes.inactive_node_cooldown_hours,
        );
        read_env(
            "MESHMONITOR_TRACEROUTE_INTERVAL_MINUTES",
            &mut self.traceroute.interval_minutes,
        );
        if std::env::var("MESHMONITOR_TRACEROUTE_INTERVAL_MINUTES").is_ok() {
            self.traceroute.enabled = true;
        }
        read_env(
            "MESHMONITOR_VERSION_CHECK_DISABLED",
            &mut self.updates.version_check_disabled,
        );
        read_env(
            "MESHMONITOR_AUTO_UPGRADE_ENABLED",
            &mut self.updates.auto_upgrade_enabled,
        );
        read_env("MESHMONITOR_API_BIND", &mut self.api.bind);
        read_env("MESHMONITOR_API_PORT", &mut self.api.port);
        read_env("MESHMONITOR_LOG_LEVEL", &mut self.logging.level);
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshmonitor")
            .join("config.yaml")
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshmonitor")
    }
}

fn read_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring unparsable {}={}", name, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(
            Some(dir.path().join("missing.yaml")),
            Some(dir.path().to_path_buf()),
        )
        .unwrap();

        assert_eq!(config.radio.port, 4403);
        assert_eq!(config.vns.listen_port, 4403);
        assert!(!config.vns.allow_admin_commands);
        assert_eq!(config.nodes.max_node_age_hours, 24);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "radio:\n  host: 10.0.0.7\n  port: 4404\n").unwrap();

        let config = Config::load(Some(path), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.radio.host, "10.0.0.7");
        assert_eq!(config.radio.port, 4404);
        // Untouched sections keep defaults.
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_create_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let created = Config::create_default(
            Some(path.clone()),
            Some(dir.path().join("data")),
        )
        .unwrap();
        assert!(path.exists());

        let loaded = Config::load(Some(path), Some(dir.path().join("data"))).unwrap();
        assert_eq!(loaded.radio.host, created.radio.host);
        assert_eq!(loaded.retention.telemetry_hours, 24);
    }
}
