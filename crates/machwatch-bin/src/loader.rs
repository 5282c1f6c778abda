// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration file loading.
//!
//! Reads a YAML or TOML file (format from the extension), layers
//! `MACHWATCH__SECTION__KEY` environment overrides on top and validates the
//! result.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use tracing::debug;

use machwatch_opcua::{ConfigError, MonitorConfig};

/// Default prefix of environment overrides.
pub const ENV_PREFIX: &str = "MACHWATCH";

/// Separator between prefix, section and key in override names.
pub const ENV_SEPARATOR: &str = "__";

/// Loads and validates a monitor configuration.
pub fn load_config(path: &Path) -> Result<MonitorConfig, ConfigError> {
    ConfigLoader::new(path).load()
}

/// Builder-style configuration loader.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Creates a loader for `path` with the default override prefix.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_prefix: Some(ENV_PREFIX.to_string()),
        }
    }

    /// Sets the environment override prefix.
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Disables environment overrides.
    pub fn without_env(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    /// Reads, merges and validates the configuration.
    pub fn load(&self) -> Result<MonitorConfig, ConfigError> {
        let path = &self.path;
        if !path.is_file() {
            return Err(ConfigError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            ));
        }

        let mut builder =
            Config::builder().add_source(File::from(path.as_path()).format(file_format(path)?));

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let config: MonitorConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize::<MonitorConfig>())
            .map_err(|e| ConfigError::parse(path, e.to_string()))?;

        config.validate()?;
        debug!(path = %path.display(), endpoint = %config.connection.endpoint, "Configuration loaded");
        Ok(config)
    }
}

fn file_format(path: &Path) -> Result<FileFormat, ConfigError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
        Some("toml") => Ok(FileFormat::Toml),
        other => Err(ConfigError::parse(
            path,
            format!(
                "unsupported configuration format '{}', expected .yaml, .yml or .toml",
                other.unwrap_or("")
            ),
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use machwatch_opcua::{MachineState, NodeId, SecurityMode};
    use tempfile::NamedTempFile;

    use super::*;

    fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    const YAML: &str = r#"
connection:
  endpoint: "opc.tcp://press-07:4840"
  session_timeout: "30s"
  reconnect:
    initial_delay: "500ms"
    max_delay: "20s"
    max_retries: 4
machinery:
  machine_state_node: "ns=3;s=Press07.State"
  trigger_states: [out_of_service, not_available]
  error_read_timeout: "1s"
"#;

    #[test]
    fn test_load_yaml() {
        let file = write_config(".yaml", YAML);
        let config = ConfigLoader::new(file.path()).without_env().load().unwrap();

        assert_eq!(config.connection.endpoint, "opc.tcp://press-07:4840");
        assert_eq!(config.connection.session_timeout, Duration::from_secs(30));
        assert_eq!(config.connection.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(config.connection.reconnect.max_retries, 4);
        assert_eq!(config.connection.security_mode, SecurityMode::None);
        assert_eq!(
            config.machinery.machine_state_node,
            NodeId::string(3, "Press07.State")
        );
        assert_eq!(
            config.machinery.trigger_states,
            vec![MachineState::OutOfService, MachineState::NotAvailable]
        );
        assert_eq!(config.machinery.error_read_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_load_toml_with_defaults() {
        let file = write_config(
            ".toml",
            r#"
[connection]
endpoint = "opc.tcp://lathe-02:4840"

[subscription]
publishing_interval = "250ms"
"#,
        );
        let config = ConfigLoader::new(file.path()).without_env().load().unwrap();

        assert_eq!(config.connection.endpoint, "opc.tcp://lathe-02:4840");
        assert_eq!(
            config.subscription.publishing_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.connection.reconnect.max_retries, 10);
        assert_eq!(
            config.machinery.trigger_states,
            vec![MachineState::OutOfService]
        );
    }

    #[test]
    fn test_env_override() {
        let file = write_config(".yaml", YAML);
        std::env::set_var("MACHWATCH_LOADER_TEST__CONNECTION__ENDPOINT", "opc.tcp://override:4841");
        let config = ConfigLoader::new(file.path())
            .env_prefix("MACHWATCH_LOADER_TEST")
            .load()
            .unwrap();
        std::env::remove_var("MACHWATCH_LOADER_TEST__CONNECTION__ENDPOINT");

        assert_eq!(config.connection.endpoint, "opc.tcp://override:4841");
        assert_eq!(config.connection.reconnect.max_retries, 4);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/machwatch.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_config(".ini", "endpoint = x");
        let err = ConfigLoader::new(file.path()).without_env().load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config(
            ".yaml",
            r#"
connection:
  endpoint: "http://press-07:4840"
"#,
        );
        let err = ConfigLoader::new(file.path()).without_env().load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let file = write_config(
            ".yaml",
            r#"
machinery:
  machine_state_node: "Press07.State"
"#,
        );
        let err = ConfigLoader::new(file.path()).without_env().load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
