//! Configuration system for the `huddle` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/huddle/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use huddle_proto::ids::UserId;

use crate::net::NetConfig;
use crate::sync::{NotificationPrefs, Session, SyncConfig};
use crate::transport::backoff::BackoffConfig;
use crate::transport::connection::ConnectionConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A required setting has no value in any layer.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A URL setting does not parse.
    #[error("invalid url in `{field}`: {source}")]
    InvalidUrl {
        /// Setting name.
        field: &'static str,
        /// Parse failure.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
    reconnect: ReconnectFileConfig,
    heartbeat: HeartbeatFileConfig,
    sync: SyncFileConfig,
    notifications: NotificationsFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    ws_url: Option<String>,
    api_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user_id: Option<i64>,
    username: Option<String>,
    token: Option<String>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_ms: Option<u64>,
    cap_secs: Option<u64>,
    jitter: Option<f64>,
    stable_after_secs: Option<u64>,
}

/// `[heartbeat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HeartbeatFileConfig {
    ping_interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    page_size: Option<u32>,
    echo_window_secs: Option<u64>,
    typing_expiry_secs: Option<u64>,
    typing_resend_secs: Option<u64>,
    tick_ms: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[notifications]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NotificationsFileConfig {
    toasts: Option<bool>,
    sound: Option<bool>,
    os_enabled: Option<bool>,
    os_permission: Option<bool>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// WebSocket URL of the realtime endpoint.
    pub ws_url: Option<String>,
    /// Base URL of the REST API.
    pub api_url: Option<String>,
    /// Timeout for REST requests.
    pub request_timeout: Duration,

    // -- Session --
    /// Authenticated user id.
    pub user_id: Option<i64>,
    /// Username for mention detection.
    pub username: Option<String>,
    /// Session token. Defaults to the user id.
    pub token: Option<String>,

    // -- Connection --
    /// Backoff, heartbeat and buffer settings.
    pub connection: ConnectionConfig,

    // -- Sync --
    /// Engine tunables, notification preferences included.
    pub sync: SyncConfig,
    /// Interval of the typing sweep tick.
    pub tick_interval: Duration,
    /// Capacity of command/event mpsc channels.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            api_url: None,
            request_timeout: Duration::from_secs(15),
            user_id: None,
            username: None,
            token: None,
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
            tick_interval: Duration::from_millis(500),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Intervals, timeouts, sizes and
    /// capacities of zero are raised to the smallest usable value.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let backoff = defaults.connection.backoff;
        let sync = defaults.sync;
        let prefs = sync.notifications;

        Self {
            ws_url: cli.ws_url.clone().or_else(|| file.server.ws_url.clone()),
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            request_timeout: file
                .server
                .request_timeout_secs
                .map_or(defaults.request_timeout, nonzero_secs),
            user_id: cli.user_id.or(file.session.user_id),
            username: cli
                .username
                .clone()
                .or_else(|| file.session.username.clone()),
            token: cli.token.clone().or_else(|| file.session.token.clone()),
            connection: ConnectionConfig {
                backoff: BackoffConfig {
                    base: file
                        .reconnect
                        .base_ms
                        .map_or(backoff.base, nonzero_millis),
                    cap: file
                        .reconnect
                        .cap_secs
                        .map_or(backoff.cap, nonzero_secs),
                    jitter: file.reconnect.jitter.unwrap_or(backoff.jitter),
                    stable_after: file
                        .reconnect
                        .stable_after_secs
                        .map_or(backoff.stable_after, Duration::from_secs),
                },
                ping_interval: file
                    .heartbeat
                    .ping_interval_secs
                    .map_or(defaults.connection.ping_interval, nonzero_secs),
                heartbeat_timeout: file
                    .heartbeat
                    .timeout_secs
                    .map_or(defaults.connection.heartbeat_timeout, nonzero_secs),
                connect_timeout: file
                    .server
                    .connect_timeout_secs
                    .map_or(defaults.connection.connect_timeout, nonzero_secs),
                ..defaults.connection
            },
            sync: SyncConfig {
                page_size: file.sync.page_size.unwrap_or(sync.page_size).max(1),
                echo_window: file
                    .sync
                    .echo_window_secs
                    .map_or(sync.echo_window, Duration::from_secs),
                typing_expiry: file
                    .sync
                    .typing_expiry_secs
                    .map_or(sync.typing_expiry, Duration::from_secs),
                typing_resend: file
                    .sync
                    .typing_resend_secs
                    .map_or(sync.typing_resend, Duration::from_secs),
                notifications: NotificationPrefs {
                    toasts: file.notifications.toasts.unwrap_or(prefs.toasts),
                    sound: !cli.mute_sound && file.notifications.sound.unwrap_or(prefs.sound),
                    os_enabled: file.notifications.os_enabled.unwrap_or(prefs.os_enabled),
                    os_permission: file
                        .notifications
                        .os_permission
                        .unwrap_or(prefs.os_permission),
                },
            },
            tick_interval: file
                .sync
                .tick_ms
                .map_or(defaults.tick_interval, nonzero_millis),
            channel_capacity: file
                .sync
                .channel_capacity
                .unwrap_or(defaults.channel_capacity)
                .max(1),
        }
    }

    /// Build a [`NetConfig`] from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if a server URL or the user id is
    /// absent, and [`ConfigError::InvalidUrl`] if a URL does not parse.
    pub fn to_net_config(&self) -> Result<NetConfig, ConfigError> {
        let ws_url = parse_url("ws_url", self.ws_url.as_deref())?;
        let api_url = parse_url("api_url", self.api_url.as_deref())?;
        let user_id = self.user_id.ok_or(ConfigError::Missing("user_id"))?;

        Ok(NetConfig {
            ws_url,
            api_url,
            token: self.token.clone().unwrap_or_else(|| user_id.to_string()),
            session: Session {
                user_id: UserId(user_id),
                username: self
                    .username
                    .clone()
                    .unwrap_or_else(|| format!("user{user_id}")),
            },
            connection: self.connection.clone(),
            sync: self.sync.clone(),
            request_timeout: self.request_timeout,
            tick_interval: self.tick_interval,
            channel_capacity: self.channel_capacity,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless realtime chat sync client")]
pub struct CliArgs {
    /// WebSocket URL of the realtime endpoint.
    #[arg(long, env = "HUDDLE_WS_URL")]
    pub ws_url: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "HUDDLE_API_URL")]
    pub api_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "HUDDLE_USER_ID")]
    pub user_id: Option<i64>,

    /// Your username (for @mentions).
    #[arg(long, env = "HUDDLE_USERNAME")]
    pub username: Option<String>,

    /// Session token (default: the user id).
    #[arg(long, env = "HUDDLE_TOKEN")]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/huddle/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Disable notification sounds.
    #[arg(long)]
    pub mute_sound: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HUDDLE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/huddle.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn parse_url(field: &'static str, value: Option<&str>) -> Result<Url, ConfigError> {
    let raw = value.ok_or(ConfigError::Missing(field))?;
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { field, source })
}

fn nonzero_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

fn nonzero_millis(millis: u64) -> Duration {
    Duration::from_millis(millis.max(1))
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("huddle").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
