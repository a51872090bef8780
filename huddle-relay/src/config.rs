//! Configuration for the `Huddle` development server.
//!
//! Layered like the client: CLI flags (and their environment variables)
//! beat `~/.config/huddle-relay/config.toml`, which beats the defaults.

use std::path::{Path, PathBuf};

/// Errors that can occur when loading relay configuration.
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

    /// The demo seed names no users.
    #[error("demo seed needs at least one username")]
    EmptyDemo,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerSection,
    demo: DemoSection,
}

/// `[server]`
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    max_page_size: Option<u32>,
}

/// `[demo]`
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DemoSection {
    enabled: Option<bool>,
    usernames: Option<Vec<String>>,
    group_name: Option<String>,
    direct_channel_base: Option<i64>,
}

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Huddle development server")]
pub struct RelayCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "HUDDLE_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/huddle-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seed demo users and channels on startup.
    #[arg(long)]
    pub demo: bool,

    /// Largest history page served, whatever the client asks for.
    #[arg(long, env = "HUDDLE_RELAY_MAX_PAGE")]
    pub max_page_size: Option<u32>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HUDDLE_RELAY_LOG")]
    pub log_level: String,
}

/// What `--demo` seeds: one group channel with every user, and a direct
/// channel between the first user and each other one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSeed {
    /// Usernames; user ids are assigned from 1 in order.
    pub usernames: Vec<String>,
    /// Name of the group channel (id 1).
    pub group_name: String,
    /// Direct channel with user `n` gets id `direct_channel_base + n`.
    pub direct_channel_base: i64,
}

impl Default for DemoSeed {
    fn default() -> Self {
        Self {
            usernames: ["alice", "bob", "carol"].map(String::from).to_vec(),
            group_name: "general".to_owned(),
            direct_channel_base: 100,
        }
    }
}

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Cap on the `limit` of history requests.
    pub max_page_size: u32,
    /// Demo data to seed, if enabled.
    pub demo: Option<DemoSeed>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_owned(),
            max_page_size: 200,
            demo: None,
            log_level: "info".to_owned(),
        }
    }
}

impl RelayConfig {
    /// Loads the config file (if any) and applies CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file cannot be read or
    /// parsed, or if the demo seed is enabled without usernames.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, file)
    }

    fn resolve(cli: &RelayCliArgs, file: RelayConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let seed = DemoSeed::default();

        let demo = if cli.demo || file.demo.enabled.unwrap_or(false) {
            let usernames = file.demo.usernames.unwrap_or(seed.usernames);
            if usernames.is_empty() {
                return Err(ConfigError::EmptyDemo);
            }
            Some(DemoSeed {
                usernames,
                group_name: file.demo.group_name.unwrap_or(seed.group_name),
                direct_channel_base: file
                    .demo
                    .direct_channel_base
                    .unwrap_or(seed.direct_channel_base),
            })
        } else {
            None
        };

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            max_page_size: cli
                .max_page_size
                .or(file.server.max_page_size)
                .unwrap_or(defaults.max_page_size)
                .max(1),
            demo,
            log_level: cli.log_level.clone(),
        })
    }
}

/// Reads `explicit_path`, or the default location if `None`. Only an
/// explicit path has to exist.
fn load_config_file(explicit_path: Option<&Path>) -> Result<RelayConfigFile, ConfigError> {
    let (path, required) = match explicit_path {
        Some(p) => (p.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("huddle-relay").join("config.toml"), false),
            None => return Ok(RelayConfigFile::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(RelayConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
