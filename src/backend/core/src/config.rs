//! Configuration management.
//!
//! Values are layered: built-in defaults, then an optional file, then
//! environment variables prefixed `STACKER__` (`STACKER__HTTP__PORT=8081`).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{mysql::MySqlConnectOptions, postgres::PgConnectOptions, sqlite::SqliteConnectOptions};

use crate::error::{Result, StackerError};
use crate::listeners::ListenerDescriptor;

/// Write timeout applied to every listener while diagnostics are enabled.
pub const DIAGNOSTICS_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Minimum log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Main API listener
    #[serde(default)]
    pub http: HttpConfig,

    /// Prometheus metrics listener
    #[serde(default)]
    pub metrics: MetricsListenerConfig,

    /// Runtime diagnostics listener
    #[serde(default)]
    pub diagnostics: DiagnosticsListenerConfig,

    /// Application and scheduler databases
    #[serde(default)]
    pub storage: StorageConfig,

    /// Deadline shared by all listeners on shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            http: HttpConfig::default(),
            metrics: MetricsListenerConfig::default(),
            diagnostics: DiagnosticsListenerConfig::default(),
            storage: StorageConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Bind address of the main listener
    #[serde(default = "default_http_bind")]
    pub bind: String,

    /// Port of the main listener
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Peers whose `X-Real-IP` header is trusted: addresses or CIDR ranges
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// HTTP header read timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Request handling timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            port: default_http_port(),
            trusted_proxies: Vec::new(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsListenerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_local_bind")]
    pub bind: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_local_bind(),
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiagnosticsListenerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_local_bind")]
    pub bind: String,

    #[serde(default = "default_diagnostics_port")]
    pub port: u16,
}

impl Default for DiagnosticsListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_local_bind(),
            port: default_diagnostics_port(),
        }
    }
}

/// Supported relational backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Sqlite,
    Postgres,
    Mysql,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Check that `dsn` is a connection string this backend understands.
    pub fn parse_dsn(&self, dsn: &str) -> std::result::Result<(), sqlx::Error> {
        match self {
            Self::Sqlite => SqliteConnectOptions::from_str(dsn).map(|_| ()),
            Self::Postgres => PgConnectOptions::from_str(dsn).map(|_| ()),
            Self::Mysql => MySqlConnectOptions::from_str(dsn).map(|_| ()),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend used for both connection strings
    #[serde(default)]
    pub kind: StorageKind,

    /// Application database connection string
    #[serde(default = "default_dsn")]
    pub dsn_app: String,

    /// Scheduler database connection string
    #[serde(default = "default_dsn")]
    pub dsn_scheduler: String,

    /// Maximum number of pooled connections per database
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            dsn_app: default_dsn(),
            dsn_scheduler: default_dsn(),
            max_connections: default_max_connections(),
        }
    }
}

// Default value functions
fn default_http_bind() -> String { "[::]".to_string() }
fn default_http_port() -> u16 { 8080 }
fn default_local_bind() -> String { "127.0.0.1".to_string() }
fn default_metrics_port() -> u16 { 9000 }
fn default_diagnostics_port() -> u16 { 9999 }
fn default_timeout() -> Duration { Duration::from_secs(5) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(5) }
fn default_dsn() -> String { "sqlite::memory:".to_string() }
fn default_max_connections() -> u32 { 10 }

impl Config {
    /// Load configuration from the environment, optionally layered over a file.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("STACKER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("http.trusted_proxies")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the process cannot run with, naming the offending option.
    pub fn validate(&self) -> Result<()> {
        if self.http.bind.trim().is_empty() {
            return Err(StackerError::config_invalid("http.bind", "must not be empty"));
        }
        for proxy in &self.http.trusted_proxies {
            parse_trusted_proxy(proxy).ok_or_else(|| {
                StackerError::config_invalid(
                    "http.trusted_proxies",
                    format!("`{}` is neither an IP address nor a CIDR range", proxy),
                )
            })?;
        }
        if self.http.read_timeout.is_zero() {
            return Err(StackerError::config_invalid("http.read_timeout", "must be non-zero"));
        }
        if self.http.write_timeout.is_zero() {
            return Err(StackerError::config_invalid("http.write_timeout", "must be non-zero"));
        }
        if self.metrics.enabled && self.metrics.bind.trim().is_empty() {
            return Err(StackerError::config_invalid("metrics.bind", "must not be empty"));
        }
        if self.diagnostics.enabled && self.diagnostics.bind.trim().is_empty() {
            return Err(StackerError::config_invalid("diagnostics.bind", "must not be empty"));
        }

        for (option, dsn) in [
            ("storage.dsn_app", &self.storage.dsn_app),
            ("storage.dsn_scheduler", &self.storage.dsn_scheduler),
        ] {
            if dsn.trim().is_empty() {
                return Err(StackerError::config_invalid(option, "must not be empty"));
            }
            self.storage.kind.parse_dsn(dsn).map_err(|e| {
                StackerError::config_invalid(
                    option,
                    format!("not a valid {} connection string: {}", self.storage.kind, e),
                )
            })?;
        }
        if self.storage.max_connections == 0 {
            return Err(StackerError::config_invalid("storage.max_connections", "must be at least 1"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(StackerError::config_invalid("shutdown_timeout", "must be non-zero"));
        }

        let listeners = self.listener_descriptors();
        for (i, a) in listeners.iter().enumerate() {
            for b in listeners.iter().skip(i + 1) {
                if a.enabled && b.enabled && a.port != 0 && a.port == b.port && a.bind == b.bind {
                    return Err(StackerError::config_invalid(
                        &format!("{}.port", config_section(&b.name)),
                        format!("{}:{} is already used by the {} listener", b.bind, b.port, a.name),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Parsed trusted proxy ranges. Invalid entries were rejected by `validate`.
    pub fn trusted_proxies(&self) -> Vec<IpNet> {
        self.http
            .trusted_proxies
            .iter()
            .filter_map(|p| parse_trusted_proxy(p))
            .collect()
    }

    /// Write timeout every listener runs with.
    pub fn effective_write_timeout(&self) -> Duration {
        if self.diagnostics.enabled {
            DIAGNOSTICS_WRITE_TIMEOUT.max(self.http.write_timeout)
        } else {
            self.http.write_timeout
        }
    }

    /// Descriptors for the main, metrics and diagnostics listeners, in that order.
    pub fn listener_descriptors(&self) -> Vec<ListenerDescriptor> {
        let read_timeout = self.http.read_timeout;
        let write_timeout = self.effective_write_timeout();
        vec![
            ListenerDescriptor {
                name: "main".to_string(),
                bind: self.http.bind.clone(),
                port: self.http.port,
                enabled: true,
                read_timeout,
                write_timeout,
            },
            ListenerDescriptor {
                name: "metrics".to_string(),
                bind: self.metrics.bind.clone(),
                port: self.metrics.port,
                enabled: self.metrics.enabled,
                read_timeout,
                write_timeout,
            },
            ListenerDescriptor {
                name: "diagnostics".to_string(),
                bind: self.diagnostics.bind.clone(),
                port: self.diagnostics.port,
                enabled: self.diagnostics.enabled,
                read_timeout,
                write_timeout,
            },
        ]
    }

    /// A copy safe to expose over the diagnostics listener.
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        cfg.storage.dsn_app = redact_dsn(&cfg.storage.dsn_app);
        cfg.storage.dsn_scheduler = redact_dsn(&cfg.storage.dsn_scheduler);
        cfg
    }
}

fn config_section(listener: &str) -> &str {
    match listener {
        "main" => "http",
        other => other,
    }
}

/// A single address becomes a host-sized range; IPv4-mapped IPv6 addresses
/// are stored as plain IPv4.
fn parse_trusted_proxy(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net.trunc());
    }
    entry
        .parse::<IpAddr>()
        .ok()
        .map(|addr| IpNet::from(addr.to_canonical()))
}

/// `scheme://user:password@` prefix of a URL-style DSN.
static DSN_USERINFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*://)[^/?#]*@").expect("Invalid userinfo regex")
});

/// Credential-bearing query parameters accepted by the sqlx drivers.
static DSN_SECRET_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([?&;](?:user|username|password|passwd|pwd|sslpassword)=)[^&;#]*")
        .expect("Invalid query parameter regex")
});

/// Hide credentials in a connection string, keeping scheme, host and the
/// remaining options.
pub fn redact_dsn(dsn: &str) -> String {
    let masked = DSN_USERINFO.replace(dsn, "${1}***@");
    DSN_SECRET_PARAM.replace_all(&masked, "${1}***").into_owned()
}
