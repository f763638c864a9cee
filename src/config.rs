//! Configuration management for CertWarden
//!
//! Two layers live here:
//!
//! - The bootstrap [`Config`], loaded once at startup with `figment` from
//!   built-in defaults, a `certwarden.toml` file, `CERTWARDEN_` environment
//!   variables and command-line flags.
//! - The [`MonitoringConfig`], the hot-reloadable operating parameters. It is
//!   seeded from the bootstrap layer, optionally overlaid with a local YAML
//!   document, and afterwards replaced wholesale by the
//!   [`ConfigWatcher`](crate::watcher::ConfigWatcher) whenever the remote
//!   document changes. Readers only ever see complete snapshots through a
//!   [`ConfigHandle`].

use crate::cli::Cli;
use crate::watcher::FetchError;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default location of the bootstrap file when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "certwarden.toml";

/// Log verbosity as carried by the remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    /// The `tracing` filter directive for this level. There is no fatal
    /// level in `tracing`, so it shares the error filter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Fatal => "error",
            other => other.as_str(),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(ConfigError::Validation(format!("unknown log_level '{}'", other))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to fetch configuration: {0}")]
    Fetch(#[from] FetchError),
    #[error("configuration is not valid YAML: {0}")]
    Parse(String),
    #[error("configuration document must be a mapping, found {0}")]
    Shape(&'static str),
    #[error("configuration rejected: {0}")]
    Validation(String),
}

// =============================================================================
// Monitoring configuration (hot-reloadable)
// =============================================================================

/// The operating parameters of the monitor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Domains to probe on port 443, in source order without duplicates.
    pub domains: Vec<String>,
    /// Seconds between the end of one check cycle and the start of the next.
    pub check_interval: u64,
    /// Seconds allowed for the TCP connect and, separately, the TLS handshake.
    pub connect_timeout: u64,
    /// Certificates with this many days left or fewer are logged as warnings.
    pub expire_warning_days: i64,
    pub max_concurrent_checks: usize,
    pub metrics_port: u16,
    pub log_level: LogLevel,
    /// Seconds between polls of the remote configuration store.
    pub nacos_poll_interval: u64,
    /// Certificates with this many days left or fewer count as expiring in
    /// the cycle summary.
    pub threshold_days: i64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            check_interval: 3600,
            connect_timeout: 10,
            expire_warning_days: 30,
            max_concurrent_checks: 10,
            metrics_port: 8080,
            log_level: LogLevel::Info,
            nacos_poll_interval: 30,
            threshold_days: 7,
        }
    }
}

impl MonitoringConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.nacos_poll_interval)
    }

    /// Checks the scalar invariants. Every interval, timeout and count must
    /// be positive and every domain a non-blank name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&str, i128); 7] = [
            ("check_interval", self.check_interval as i128),
            ("connect_timeout", self.connect_timeout as i128),
            ("expire_warning_days", self.expire_warning_days as i128),
            ("max_concurrent_checks", self.max_concurrent_checks as i128),
            ("metrics_port", self.metrics_port as i128),
            ("nacos_poll_interval", self.nacos_poll_interval as i128),
            ("threshold_days", self.threshold_days as i128),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be positive, got {}",
                    field, value
                )));
            }
        }
        if let Some(blank) = self.domains.iter().position(|d| d.trim().is_empty()) {
            return Err(ConfigError::Validation(format!("domain #{} is blank", blank + 1)));
        }
        Ok(())
    }

    /// Returns a new configuration with the fields present in `doc` applied
    /// on top of `self`. Absent fields keep their current value. The result
    /// is validated as a whole; on error `self` is the configuration to keep.
    pub fn merged_with(&self, doc: &RemoteDocument) -> Result<MonitoringConfig, ConfigError> {
        let mut next = self.clone();

        if let Some(domains) = &doc.domains {
            if domains.is_empty() {
                return Err(ConfigError::Validation(
                    "domains is present but lists no domain".to_string(),
                ));
            }
            next.domains = normalize_domains(domains)?;
        }

        if let Some(settings) = &doc.settings {
            if let Some(port) = settings.metrics_port {
                next.metrics_port = u16::try_from(port)
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| ConfigError::Validation(format!("metrics_port {} is out of range", port)))?;
            }
            if let Some(level) = &settings.log_level {
                next.log_level = level.parse()?;
            }
            if let Some(v) = settings.check_interval {
                next.check_interval = positive_u64("check_interval", v)?;
            }
            if let Some(v) = settings.connect_timeout {
                next.connect_timeout = positive_u64("connect_timeout", v)?;
            }
            if let Some(v) = settings.expire_warning_days {
                next.expire_warning_days = v;
            }
            if let Some(v) = settings.max_concurrent_checks {
                next.max_concurrent_checks = positive_u64("max_concurrent_checks", v)? as usize;
            }
            if let Some(v) = settings.nacos_poll_interval {
                next.nacos_poll_interval = positive_u64("nacos_poll_interval", v)?;
            }
            if let Some(v) = settings.threshold_days {
                next.threshold_days = v;
            }
        }

        next.validate()?;
        Ok(next)
    }
}

fn positive_u64(field: &str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::Validation(format!("{} must be positive, got {}", field, value)))
}

/// Trims each domain and drops later duplicates, keeping first-seen order.
fn normalize_domains(domains: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(domains.len());
    for (i, raw) in domains.iter().enumerate() {
        let domain = raw.trim();
        if domain.is_empty() {
            return Err(ConfigError::Validation(format!("domain #{} is blank", i + 1)));
        }
        if seen.insert(domain.to_ascii_lowercase()) {
            out.push(domain.to_string());
        }
    }
    Ok(out)
}

/// The YAML document served by the configuration store.
///
/// ```yaml
/// domains: [example.com]
/// settings:
///   check_interval: 3600
///   log_level: info
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteDocument {
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub settings: Option<RemoteSettings>,
}

/// Settings are kept loosely typed here so out-of-range values surface as
/// validation errors rather than parse errors.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub metrics_port: Option<i64>,
    pub log_level: Option<String>,
    pub check_interval: Option<i64>,
    pub connect_timeout: Option<i64>,
    pub expire_warning_days: Option<i64>,
    pub max_concurrent_checks: Option<i64>,
    pub nacos_poll_interval: Option<i64>,
    pub threshold_days: Option<i64>,
}

impl RemoteDocument {
    /// Parses a raw document. The top level must be a YAML mapping.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let value: serde_yml::Value =
            serde_yml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let kind = match &value {
            serde_yml::Value::Mapping(_) => None,
            serde_yml::Value::Null => Some("an empty document"),
            serde_yml::Value::Sequence(_) => Some("a sequence"),
            serde_yml::Value::String(_) => Some("a string"),
            serde_yml::Value::Number(_) => Some("a number"),
            serde_yml::Value::Bool(_) => Some("a boolean"),
            serde_yml::Value::Tagged(_) => Some("a tagged value"),
        };
        if let Some(kind) = kind {
            return Err(ConfigError::Shape(kind));
        }
        serde_yml::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Read-only access to the live [`MonitoringConfig`].
///
/// Every call to [`snapshot`](Self::snapshot) returns a complete, consistent
/// configuration; updates replace the whole value atomically.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<MonitoringConfig>>,
}

impl ConfigHandle {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<MonitoringConfig> {
        self.inner.load_full()
    }

    /// Replaces the live configuration. Only the watcher writes.
    pub(crate) fn store(&self, config: Arc<MonitoringConfig>) {
        self.inner.store(config);
    }
}

// =============================================================================
// Bootstrap configuration
// =============================================================================

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Initial operating parameters, before any remote document is applied.
    pub monitoring: MonitoringConfig,
    /// Optional local YAML document in the remote schema, applied at startup.
    pub domains_file: Option<PathBuf>,
    pub nacos: NacosConfig,
    pub local_certs: LocalCertsConfig,
    pub process: ProcessConfig,
}

/// Connection parameters for the remote configuration store.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NacosConfig {
    pub enabled: bool,
    /// Base address, e.g. `http://nacos:8848`.
    pub server_addr: String,
    pub path: String,
    pub data_id: String,
    pub group: String,
    /// Tenant / namespace identifier.
    pub namespace: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for NacosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_addr: "http://127.0.0.1:8848".to_string(),
            path: "/nacos/v1/cs/configs".to_string(),
            data_id: "certwarden.yaml".to_string(),
            group: "DEFAULT_GROUP".to_string(),
            namespace: None,
            username: None,
            password: None,
            request_timeout_seconds: 10,
        }
    }
}

/// Where local certificates are looked for.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalCertsConfig {
    pub enabled: bool,
    /// Preferred directory, used when it exists (container layout).
    pub container_dir: PathBuf,
    /// Used otherwise; relative paths resolve against the executable's directory.
    pub fallback_dir: PathBuf,
    pub cert_extension: String,
    pub key_extension: String,
}

impl Default for LocalCertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            container_dir: PathBuf::from("/app/ssl_certs"),
            fallback_dir: PathBuf::from("ssl_certs"),
            cert_extension: "crt".to_string(),
            key_extension: "key".to_string(),
        }
    }
}

/// How the serving process is asked to restart.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProcessConfig {
    pub restart_enabled: bool,
    pub pid_file: PathBuf,
    /// Signal name passed to `kill -s`.
    pub signal: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            restart_enabled: true,
            pid_file: PathBuf::from("/app/gunicorn.pid"),
            signal: "HUP".to_string(),
        }
    }
}

impl Config {
    /// Loads the bootstrap configuration by layering defaults, the TOML file,
    /// `CERTWARDEN_`-prefixed environment variables (`__` separates nested
    /// keys, e.g. `CERTWARDEN_NACOS__SERVER_ADDR`) and the CLI flags.
    pub fn load_from_cli(cli: Cli) -> Result<Self> {
        let path = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found at specified path: {}", path.display());
                }
                path.clone()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CERTWARDEN_").split("__"))
            .merge(cli)
            .extract()?;
        Ok(config)
    }

    /// Builds the configuration the monitor starts with: the `[monitoring]`
    /// section, overlaid with the local domains file when one is configured.
    /// The remote store, if enabled, is applied on top by the watcher.
    pub fn initial_monitoring_config(&self) -> Result<MonitoringConfig> {
        self.monitoring
            .validate()
            .context("invalid [monitoring] section")?;
        let monitoring = MonitoringConfig {
            domains: normalize_domains(&self.monitoring.domains).context("invalid [monitoring] section")?,
            ..self.monitoring.clone()
        };
        match &self.domains_file {
            Some(path) => load_domains_file(&monitoring, path),
            None => Ok(monitoring),
        }
    }
}

/// Applies a local YAML document in the remote schema on top of `base`.
pub fn load_domains_file(base: &MonitoringConfig, path: &Path) -> Result<MonitoringConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read domains file {}", path.display()))?;
    let doc = RemoteDocument::parse(&raw)
        .with_context(|| format!("failed to parse domains file {}", path.display()))?;
    let merged = base
        .merged_with(&doc)
        .with_context(|| format!("domains file {} rejected", path.display()))?;
    Ok(merged)
}
