//! Configuration management for the policy-proxy application.
//!
//! This module handles loading, parsing and validating the YAML
//! configuration file. The loaded configuration is immutable and is
//! shared with the proxy as an `Arc<AppConfig>`.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Example configuration written when no config file exists yet.
pub const EXAMPLE_CONFIG: &str = r#"# Example config file
host: 127.0.0.1
port: 18888
geo: GeoLite2-Country.mmdb
allow-localhost: false # default: false
ssl-ports: [443]
proxies:
  fiddler: http://127.0.0.1:8888
  clash: http://127.0.0.1:33210
  default: DIRECT # DENY
rules:
  - name: "cn"
    type: "DOMAIN-SUFFIX"
    match: ".cn"
    proxy: "DIRECT"  # DENY
  - name: "google"
    type: "WILDCARD"
    match: "*.youtube.com"
    proxy: "fiddler"
  - name: "google"
    type: "REGEXP"
    match: ".*google.*"
    proxy: "clash"
  - name: "external"
    type: "GEOIP"
    match: "!CN"
    proxy: "clash"
logging:
  level: info
  output: stdout
  format: pretty
"#;

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

/// A single routing rule.
///
/// `kind` stays a plain string so that a config with a rule type this
/// build does not know still loads; such rules are skipped at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    /// Provenance label reported with decisions.
    pub name: String,

    /// One of DOMAIN-SUFFIX, WILDCARD, REGEXP, GEOIP.
    #[serde(rename = "type")]
    pub kind: String,

    /// `;`-separated alternatives, each optionally prefixed with `!`.
    #[serde(rename = "match")]
    pub pattern: String,

    /// Proxy label, or the literal DIRECT / DENY.
    pub proxy: String,
}

impl Rule {
    /// Convenience constructor, mostly for tests and embedding.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        pattern: impl Into<String>,
        proxy: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            pattern: pattern.into(),
            proxy: proxy.into(),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppConfig {
    /// Address to listen on.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Path to the MaxMind country database.
    pub geo: PathBuf,

    /// Permit DIRECT connections to loopback destinations.
    pub allow_localhost: bool,

    /// Ports CONNECT tunnels may target.
    pub ssl_ports: Vec<u16>,

    /// Proxy label to endpoint URL (or DIRECT / DENY).
    pub proxies: HashMap<String, String>,

    /// Ordered rule list, first match wins.
    pub rules: Vec<Rule>,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18888,
            geo: PathBuf::from("GeoLite2-Country.mmdb"),
            allow_localhost: false,
            ssl_ports: vec![443],
            proxies: HashMap::new(),
            rules: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// A loaded configuration and where it came from.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
    /// The file did not exist and was written from [`EXAMPLE_CONFIG`].
    pub created: bool,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Loads the config at `path`, or the default `config.yaml` next to
    /// the executable. An explicit path must exist.
    pub fn load_or_init(path: Option<&Path>) -> Result<LoadedConfig> {
        match path {
            Some(path) => Ok(LoadedConfig {
                config: Self::load(path)?,
                path: path.to_path_buf(),
                created: false,
            }),
            None => Self::load_or_create(&Self::default_path()),
        }
    }

    /// Loads `path`, first writing [`EXAMPLE_CONFIG`] there if it does not
    /// exist yet.
    pub fn load_or_create(path: &Path) -> Result<LoadedConfig> {
        let created = !path.exists();
        if created {
            fs::write(path, EXAMPLE_CONFIG)?;
        }

        Ok(LoadedConfig {
            config: Self::load(path)?,
            path: path.to_path_buf(),
            created,
        })
    }

    /// `config.yaml` in the directory of the running executable.
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.yaml")
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ProxyError::config_validation(
                "Listen host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(ProxyError::config_validation("Listen port cannot be 0"));
        }

        for rule in &self.rules {
            if rule.proxy.is_empty() {
                return Err(ProxyError::config_validation(format!(
                    "Rule '{}' has no proxy target",
                    rule.name
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// The `host:port` address the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
