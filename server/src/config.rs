use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the chat server (default).
    Serve,
    /// Register a user and print a bearer token for it.
    AddUser {
        username: String,
        #[arg(long)]
        display_name: Option<String>,
    },
}

/// Tunables of the delivery core.
#[derive(Clone, Debug)]
pub struct ChatSettings {
    /// Delay before a user with no connections is declared offline.
    pub presence_grace: Duration,
    /// Minimum gap between re-broadcast typing signals per user and chat.
    pub typing_throttle: Duration,
    pub max_content_len: usize,
    /// Outbound frames buffered per live connection.
    pub connection_queue: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            presence_grace: Duration::from_millis(default_presence_grace_ms()),
            typing_throttle: Duration::from_millis(default_typing_throttle_ms()),
            max_content_len: default_max_content_len(),
            connection_queue: 256,
        }
    }
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the database, uploads and the signing secret.
    pub data_dir: PathBuf,
    /// Maximum upload size in megabytes.
    pub max_upload_mb: u64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Explicit JWT secret; generated and persisted in `data_dir` when absent.
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: i64,
    pub chat: ChatSettings,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    chat: FileChat,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
    #[serde(default = "default_token_ttl_hours")]
    token_ttl_hours: i64,
}

#[derive(Deserialize)]
struct FileChat {
    #[serde(default = "default_presence_grace_ms")]
    presence_grace_ms: u64,
    #[serde(default = "default_typing_throttle_ms")]
    typing_throttle_ms: u64,
    #[serde(default = "default_max_content_len")]
    max_content_len: usize,
}

fn default_port() -> u16 {
    5000
}

fn default_logging() -> bool {
    true
}

fn default_token_ttl_hours() -> i64 {
    24
}

fn default_presence_grace_ms() -> u64 {
    5000
}

fn default_typing_throttle_ms() -> u64 {
    1000
}

fn default_max_content_len() -> usize {
    5000
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileAuth {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

impl Default for FileChat {
    fn default() -> Self {
        Self {
            presence_grace_ms: default_presence_grace_ms(),
            typing_throttle_ms: default_typing_throttle_ms(),
            max_content_len: default_max_content_len(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Defaults rooted at a data directory; used by embedders and tests.
    pub fn with_data_dir(bind: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: bind.into(),
            data_dir: data_dir.into(),
            max_upload_mb: 10,
            logging_enabled: default_logging(),
            jwt_secret: None,
            token_ttl_hours: default_token_ttl_hours(),
            chat: ChatSettings::default(),
        }
    }

    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("MINGLE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/mingle.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut jwt_secret = file_cfg.auth.jwt_secret;
        let mut token_ttl_hours = file_cfg.auth.token_ttl_hours;
        let mut presence_grace_ms = file_cfg.chat.presence_grace_ms;

        // environment overrides
        if let Some(p) = env_parse::<u16>("MINGLE_PORT") {
            port = p;
        }
        if let Some(l) = env_parse::<bool>("MINGLE_LOGGING") {
            logging = l;
        }
        if let Ok(s) = std::env::var("MINGLE_JWT_SECRET") {
            jwt_secret = Some(s);
        }
        if let Some(h) = env_parse::<i64>("MINGLE_TOKEN_TTL_HOURS") {
            token_ttl_hours = h;
        }
        if let Some(ms) = env_parse::<u64>("MINGLE_PRESENCE_GRACE_MS") {
            presence_grace_ms = ms;
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if jwt_secret.as_deref().map(str::is_empty).unwrap_or(false) {
            anyhow::bail!("empty_jwt_secret");
        }
        if token_ttl_hours <= 0 {
            anyhow::bail!("invalid_token_ttl");
        }
        if file_cfg.chat.max_content_len == 0 {
            anyhow::bail!("invalid_max_content_len");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let max_upload_mb = env_parse("MAX_UPLOAD_MB").unwrap_or(10);

        Ok(Self {
            bind,
            data_dir,
            max_upload_mb,
            logging_enabled: logging,
            jwt_secret,
            token_ttl_hours,
            chat: ChatSettings {
                presence_grace: Duration::from_millis(presence_grace_ms),
                typing_throttle: Duration::from_millis(file_cfg.chat.typing_throttle_ms),
                max_content_len: file_cfg.chat.max_content_len,
                ..ChatSettings::default()
            },
        })
    }

    /// Helper to return the upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

/// Determine the default data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/mingle");
        p
    } else {
        PathBuf::from("./mingle_data")
    }
}
