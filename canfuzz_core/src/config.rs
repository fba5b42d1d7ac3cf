use crate::bus::BusKind;
use crate::case_store::DEFAULT_STORE_PATH;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "canfuzz.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("Failed to parse TOML from config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BusSettings {
    #[serde(default)]
    pub kind: BusKind,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

pub fn default_channel() -> String {
    "vcan0".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    200
}

fn default_join_timeout_ms() -> u64 {
    1000
}

impl BusSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            channel: default_channel(),
            poll_timeout_ms: default_poll_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

/// How the supervisor launches workers. With no `program` the CLI runs itself.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub base_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExportSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("traces")
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CanfuzzConfig {
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub export: ExportSettings,
}

impl CanfuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: CanfuzzConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Like [`load_from_file`](Self::load_from_file), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn full_config_parses() {
        let file = write_config(
            r#"
[bus]
kind = "virtual"
channel = "vcan1"
poll-timeout-ms = 50

[supervisor]
program = "/usr/bin/python3"
base-args = ["-m", "fucyfuzz"]
working-dir = "/opt/tool"

[supervisor.env]
PYTHONUNBUFFERED = "1"

[store]
path = "/tmp/cases.json"

[export]
output-dir = "out"
"#,
        );
        let config = CanfuzzConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.bus.kind, BusKind::Virtual);
        assert_eq!(config.bus.channel, "vcan1");
        assert_eq!(config.bus.poll_timeout(), Duration::from_millis(50));
        assert_eq!(config.bus.join_timeout_ms, 1000);
        assert_eq!(config.supervisor.program, Some(PathBuf::from("/usr/bin/python3")));
        assert_eq!(config.supervisor.base_args, vec!["-m", "fucyfuzz"]);
        assert_eq!(config.supervisor.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(config.store.path, PathBuf::from("/tmp/cases.json"));
        assert_eq!(config.export.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let file = write_config("");
        let config = CanfuzzConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config, CanfuzzConfig::default());
        assert_eq!(config.bus.kind, BusKind::SocketCan);
        assert_eq!(config.bus.channel, "vcan0");
        assert_eq!(config.store.path, PathBuf::from(DEFAULT_STORE_PATH));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("[bus]\nbitrate = 500000\n");
        match CanfuzzConfig::load_from_file(file.path()) {
            Err(ConfigError::Parse { message, .. }) => assert!(message.contains("bitrate")),
            other => panic!("Expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_falls_back_only_in_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canfuzz.toml");
        assert!(matches!(
            CanfuzzConfig::load_from_file(&path),
            Err(ConfigError::Read { .. })
        ));
        assert_eq!(CanfuzzConfig::load_or_default(&path).unwrap(), CanfuzzConfig::default());
    }
}
