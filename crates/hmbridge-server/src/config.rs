//! Bridge configuration loading from file and environment variables.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

use crate::access::AccessGate;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Callback listener network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Monitored and state-tracked devices.
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Inbound call allow-list.
    #[serde(default)]
    pub access: AccessConfig,

    /// CCU endpoints and credentials.
    #[serde(default)]
    pub ccu: CcuConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Transition notification settings.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Service-manager liveness settings.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

/// Network configuration for the callback listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Default port to listen on. Interfaces may override it.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host name or address the CCU uses to reach this process. Required
    /// when `host` is unspecified (`0.0.0.0` / `::`).
    #[serde(default)]
    pub callback_host: Option<String>,
}

/// Device selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicesConfig {
    /// Base identifiers of the devices whose events are processed.
    #[serde(default)]
    pub monitored: Vec<String>,

    /// Devices whose every parameter is mirrored into the state cache.
    #[serde(default)]
    pub state_tracked: Vec<String>,

    /// Parameters mirrored into the state cache for any monitored device.
    /// Defaults to the built-in list when absent.
    #[serde(default)]
    pub tracked_params: Option<Vec<String>>,
}

/// Inbound access control.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    /// Addresses or CIDR networks allowed to call the listener. When empty,
    /// the literal IP hosts of the configured CCU interfaces plus loopback
    /// are allowed.
    #[serde(default)]
    pub allow: Vec<String>,
}

/// CCU connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CcuConfig {
    /// Basic-auth user name.
    #[serde(default)]
    pub username: String,

    /// Basic-auth password.
    #[serde(default)]
    pub password: Secret,

    /// Interfaces to register with.
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

/// One CCU interface (e.g. `HmIP-RF` on port 2010).
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name, used for logging and to name the callback listener.
    pub name: String,

    /// RPC endpoint of the interface, e.g. `http://192.168.1.10:2010`.
    pub url: String,

    /// Stable registration identifier. A random one is generated when absent.
    #[serde(default)]
    pub register_id: Option<String>,

    /// Listener port for this interface's callbacks. Defaults to `server.port`.
    #[serde(default)]
    pub callback_port: Option<u16>,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// Seconds before an unused pooled connection is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Outbound transition notification.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Whether notifications are sent at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Endpoint receiving the GET request.
    #[serde(default = "default_notifier_url")]
    pub url: String,

    /// Name of the query parameter carrying the device identifier.
    #[serde(default = "default_query_param")]
    pub query_param: String,

    /// Parameter whose changes trigger a notification.
    #[serde(default = "default_trigger_param")]
    pub trigger_param: String,

    /// Request timeout in seconds.
    #[serde(default = "default_notifier_timeout_secs")]
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "hmbridge_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Service-manager watchdog configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds between `WATCHDOG=1` pings. When absent, half of
    /// `WATCHDOG_USEC` is used, or 30 seconds.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// A string that is never printed by `Debug`.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "hmbridge.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    4
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_notifier_url() -> String {
    "http://localhost:82".to_string()
}

fn default_query_param() -> String {
    "window_state".to_string()
}

fn default_trigger_param() -> String {
    hmbridge_types::TRIGGER_PARAM.to_string()
}

fn default_notifier_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            callback_host: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_notifier_url(),
            query_param: default_query_param(),
            trigger_param: default_trigger_param(),
            timeout_secs: default_notifier_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required setting is absent.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A setting is present but unusable.
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl Config {
    /// Checks that every setting required to serve traffic is present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` or `ConfigError::Invalid` for the first
    /// problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.monitored.iter().all(|d| d.trim().is_empty()) {
            return Err(ConfigError::Missing("devices.monitored"));
        }
        if self.ccu.interfaces.is_empty() {
            return Err(ConfigError::Missing("ccu.interfaces"));
        }
        if self.ccu.username.is_empty() {
            return Err(ConfigError::Missing("ccu.username"));
        }
        if self.ccu.password.is_empty() {
            return Err(ConfigError::Missing("ccu.password"));
        }
        for interface in &self.ccu.interfaces {
            if let Err(e) = reqwest::Url::parse(&interface.url) {
                return Err(ConfigError::Invalid {
                    key: "ccu.interfaces.url",
                    reason: format!("{}: {e}", interface.url),
                });
            }
        }
        if self.server.host.is_unspecified() && self.server.callback_host.is_none() {
            return Err(ConfigError::Invalid {
                key: "server.callback_host",
                reason: format!(
                    "required when binding to the unspecified address {}",
                    self.server.host
                ),
            });
        }
        self.access_gate()?;
        Ok(())
    }

    /// Monitored device identifiers with surrounding whitespace removed.
    pub fn monitored_devices(&self) -> Vec<String> {
        clean_list(&self.devices.monitored)
    }

    /// Host advertised to the CCU in the registration call.
    pub fn callback_host(&self) -> String {
        self.server
            .callback_host
            .clone()
            .unwrap_or_else(|| self.server.host.to_string())
    }

    /// Builds the access gate from `access.allow`, falling back to the CCU
    /// hosts plus loopback when the list is empty.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if an entry is neither an address nor
    /// a CIDR network, or if no entry can be derived.
    pub fn access_gate(&self) -> Result<AccessGate, ConfigError> {
        let entries = if self.access.allow.is_empty() {
            let mut derived = vec!["127.0.0.1".to_string(), "::1".to_string()];
            derived.extend(
                self.ccu
                    .interfaces
                    .iter()
                    .filter_map(|i| reqwest::Url::parse(&i.url).ok())
                    .filter_map(|url| {
                        let host = url.host_str()?;
                        let ip: IpAddr = host
                            .trim_start_matches('[')
                            .trim_end_matches(']')
                            .parse()
                            .ok()?;
                        Some(ip.to_string())
                    }),
            );
            derived
        } else {
            clean_list(&self.access.allow)
        };

        AccessGate::from_entries(&entries).map_err(|e| ConfigError::Invalid {
            key: "access.allow",
            reason: e.to_string(),
        })
    }

    /// Groups interfaces by the listener port that receives their callbacks.
    pub fn interfaces_by_port(&self) -> BTreeMap<u16, Vec<InterfaceConfig>> {
        let mut groups: BTreeMap<u16, Vec<InterfaceConfig>> = BTreeMap::new();
        for interface in &self.ccu.interfaces {
            let port = interface.callback_port.unwrap_or(self.server.port);
            groups.entry(port).or_default().push(interface.clone());
        }
        groups
    }
}

fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `HMBRIDGE_HOST` overrides `server.host`
/// - `HMBRIDGE_PORT` overrides `server.port`
/// - `HMBRIDGE_CALLBACK_HOST` overrides `server.callback_host`
/// - `HMBRIDGE_DEVICES` overrides `devices.monitored` (comma-separated)
/// - `HMBRIDGE_CCU_USERNAME` / `HMBRIDGE_CCU_PASSWORD` override the CCU credentials
/// - `HMBRIDGE_DB_PATH` overrides `database.path`
/// - `HMBRIDGE_LOG_LEVEL` overrides `logging.level`
/// - `HMBRIDGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// The result is not validated; call [`Config::validate`] before use.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("HMBRIDGE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("HMBRIDGE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(callback_host) = var("HMBRIDGE_CALLBACK_HOST") {
        config.server.callback_host = Some(callback_host);
    }
    if let Some(devices) = var("HMBRIDGE_DEVICES") {
        config.devices.monitored = devices.split(',').map(str::to_string).collect();
    }
    if let Some(username) = var("HMBRIDGE_CCU_USERNAME") {
        config.ccu.username = username;
    }
    if let Some(password) = var("HMBRIDGE_CCU_PASSWORD") {
        config.ccu.password = Secret::new(password);
    }
    if let Some(db_path) = var("HMBRIDGE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("HMBRIDGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("HMBRIDGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        host = "0.0.0.0"
        port = 8701
        callback_host = "192.168.1.20"

        [devices]
        monitored = ["ABC123", " DEF456 "]
        state_tracked = ["DEF456"]

        [ccu]
        username = "admin"
        password = "hunter2"

        [[ccu.interfaces]]
        name = "HmIP-RF"
        url = "http://192.168.1.10:2010"

        [[ccu.interfaces]]
        name = "VirtualDevices"
        url = "http://192.168.1.10:9292/groups"
        register_id = "virtual"
        callback_port = 8702
    "#;

    fn sample() -> Config {
        toml::from_str(SAMPLE).expect("sample should parse")
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let config = sample();
        config.validate().expect("sample should be valid");
        assert_eq!(config.server.port, 8701);
        assert_eq!(config.monitored_devices(), vec!["ABC123", "DEF456"]);
        assert_eq!(config.callback_host(), "192.168.1.20");
        assert_eq!(config.database.path, "hmbridge.db");
        assert_eq!(config.notifier.trigger_param, "WINDOW_STATE");
        assert!(config.devices.tracked_params.is_none());
    }

    #[test]
    fn interfaces_group_by_callback_port() {
        let groups = sample().interfaces_by_port();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&8701][0].name, "HmIP-RF");
        assert_eq!(groups[&8702][0].register_id.as_deref(), Some("virtual"));
    }

    #[test]
    fn default_allow_list_covers_ccu_host_and_loopback() {
        let gate = sample().access_gate().expect("gate");
        assert!(gate.is_allowed("192.168.1.10".parse().expect("ip")));
        assert!(gate.is_allowed("127.0.0.1".parse().expect("ip")));
        assert!(!gate.is_allowed("192.168.1.11".parse().expect("ip")));
    }

    #[test]
    fn missing_required_settings_are_reported() {
        let err = Config::default().validate().expect_err("defaults are incomplete");
        assert!(matches!(err, ConfigError::Missing("devices.monitored")));

        let mut config = sample();
        config.ccu.password = Secret::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("ccu.password"))
        ));

        let mut config = sample();
        config.server.callback_host = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "server.callback_host",
                ..
            })
        ));
    }

    #[test]
    fn bad_allow_entry_is_invalid() {
        let mut config = sample();
        config.access.allow = vec!["10.0.0.0/33".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "access.allow",
                ..
            })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = sample();
        apply_env_overrides(&mut config, |key| match key {
            "HMBRIDGE_PORT" => Some("9000".to_string()),
            "HMBRIDGE_DEVICES" => Some("AAA,BBB".to_string()),
            "HMBRIDGE_CCU_PASSWORD" => Some("s3cret".to_string()),
            "HMBRIDGE_LOG_JSON" => Some("1".to_string()),
            "HMBRIDGE_PORT_TYPO" => Some("1".to_string()),
            _ => None,
        });
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.monitored_devices(), vec!["AAA", "BBB"]);
        assert_eq!(config.ccu.password.expose(), "s3cret");
        assert!(config.logging.json);
    }

    #[test]
    fn password_is_not_debug_printed() {
        let rendered = format!("{:?}", sample().ccu);
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some("/nonexistent/hmbridge.toml")).expect("defaults");
        assert_eq!(config.server.port, 8080);
    }
}
