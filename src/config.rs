//! # Configuration
//!
//! The bridge reads one TOML file:
//!
//! ```toml
//! debug = false
//! log_level = "info"
//!
//! [log]
//! path = "/var/log/mqttbridge.log"
//!
//! [mqtt]
//! host = "192.168.1.10"
//! base = "home/room/pc"
//!
//! [modules.exec]
//!
//! [modules.heartbeat]
//! interval_secs = 30
//! ```
//!
//! Module tables keep their declaration order, which is also the load order
//! and therefore decides which module wins when two declare the same topic.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, Level};

use crate::mqtt::MqttConfig;

const CONFIG_ENV: &str = "MQTTBRIDGE_CONFIG";
const CONFIG_DIR: &str = "mqttbridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    /// Forces debug logging and full error chains on module load failures
    pub debug: bool,
    pub log_level: Option<String>,
    pub log: LogConfig,
    pub mqtt: MqttConfig,
    pub modules: toml::Table,
}

/// `[log]` table
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Receives a copy of every log record, appended across runs
    pub path: Option<PathBuf>,
}

impl LogConfig {
    /// Opens the log file for appending, creating missing directories
    pub fn open(&self) -> Result<Option<File>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let open_error = |source| ConfigError::LogFile {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_error)?;
        Ok(Some(file))
    }
}

/// One `[modules.<name>]` entry
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSpec {
    pub name: String,
    pub enabled: bool,
    pub base: Option<String>,
    /// Module specific options, `enabled` and `base` included
    pub options: toml::Table,
}

impl ModuleSpec {
    fn from_entry(name: &str, value: &toml::Value) -> Self {
        let options = match value {
            toml::Value::Table(table) => table.clone(),
            _ => toml::Table::new(),
        };
        let enabled = options.get("enabled").map(is_truthy).unwrap_or(true);
        let base = options
            .get("base")
            .and_then(|v| v.as_str())
            .filter(|b| !b.is_empty())
            .map(str::to_string);

        Self {
            name: name.to_string(),
            enabled,
            base,
            options,
        }
    }
}

fn is_truthy(value: &toml::Value) -> bool {
    match value {
        toml::Value::Boolean(b) => *b,
        toml::Value::Integer(i) => *i != 0,
        toml::Value::Float(f) => *f != 0.0 && !f.is_nan(),
        toml::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

impl Config {
    /// `$MQTTBRIDGE_CONFIG`, else `<config dir>/mqttbridge/config.toml`
    pub fn resolve_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Every declared module, in declaration order
    pub fn module_specs(&self) -> Vec<ModuleSpec> {
        self.modules
            .iter()
            .map(|(name, value)| ModuleSpec::from_entry(name, value))
            .collect()
    }

    pub fn enabled_modules(&self) -> Vec<ModuleSpec> {
        self.module_specs()
            .into_iter()
            .filter(|spec| spec.enabled)
            .collect()
    }

    pub fn max_level(&self) -> Level {
        if self.debug {
            return Level::DEBUG;
        }
        match self.log_level.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("debug") => Level::DEBUG,
            Some("warn") => Level::WARN,
            Some("error") => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        log_level = "warn"

        [mqtt]
        host = "broker"
        base = "home/pc"

        [modules.zeta]
        [modules.audio]
        interval = 5
        [modules.tts]
        enabled = false
        [modules.exec]
        base = "custom/exec"
        enabled = 1
    "#;

    #[test]
    fn modules_keep_declaration_order() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let names: Vec<_> = config.module_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["zeta", "audio", "tts", "exec"]);
    }

    #[test]
    fn enabled_defaults_to_true_and_is_coerced() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let enabled: Vec<_> = config
            .enabled_modules()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(enabled, vec!["zeta", "audio", "exec"]);
    }

    #[test]
    fn explicit_base_is_kept() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let specs = config.module_specs();
        assert_eq!(specs[3].base.as_deref(), Some("custom/exec"));
        assert_eq!(specs[1].base, None);
        assert_eq!(specs[1].options.get("interval"), Some(&toml::Value::Integer(5)));
    }

    #[test]
    fn log_level_resolution() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.max_level(), Level::WARN);

        let debug = Config {
            debug: true,
            ..config
        };
        assert_eq!(debug.max_level(), Level::DEBUG);
        assert_eq!(Config::default().max_level(), Level::INFO);
    }

    #[test]
    fn log_file_is_optional() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.log.path, None);
        assert!(config.log.open().unwrap().is_none());
    }

    #[test]
    fn log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("bridge.log");
        let config = Config::from_toml_str(&format!(
            "[log]\npath = {:?}\n",
            path.display().to_string()
        ))
        .unwrap();
        assert_eq!(config.log.path.as_deref(), Some(path.as_path()));

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "first run\n").unwrap();
        let mut file = config.log.open().unwrap().unwrap();
        std::io::Write::write_all(&mut file, b"second run\n").unwrap();
        drop(file);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first run\nsecond run\n"
        );
    }

    #[test]
    fn log_file_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("bridge.log");
        let log = LogConfig {
            path: Some(path.clone()),
        };
        assert!(log.open().unwrap().is_some());
        assert!(path.exists());
    }

    #[test]
    fn log_file_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogConfig {
            path: Some(dir.path().to_path_buf()),
        };
        assert!(matches!(log.open(), Err(ConfigError::LogFile { .. })));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.mqtt.host, "broker");
        assert_eq!(config.mqtt.port, 1883);
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("missing.toml")).await;
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
