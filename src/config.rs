//! Configuration module for errlimits.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::DialOptions;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "errlimits")]
#[command(version)]
#[command(about = "Probe RPC behavior when error responses approach size limits", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve error responses of the requested sizes
    Serve(ServeArgs),
    /// Send requests for errors of one size and report what comes back
    Probe(ProbeArgs),
    /// Repeatedly call whichever of several servers is reachable
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to (e.g., localhost:8001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Time to sleep before responding, in milliseconds
    #[arg(long)]
    pub response_sleep_ms: Option<u64>,

    /// Largest error message the server agrees to generate
    #[arg(long)]
    pub max_error_length: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Server address
    #[arg(short, long)]
    pub addr: Option<String>,

    /// Error message length to request
    #[arg(short, long)]
    pub err_length: Option<usize>,

    /// Number of requests to make
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Time to sleep between requests, in milliseconds
    #[arg(long)]
    pub inter_request_sleep_ms: Option<u64>,

    /// Time to keep the connection open after the last request, in milliseconds
    #[arg(long)]
    pub linger_ms: Option<u64>,

    #[command(flatten)]
    pub dial: DialArgs,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Comma-separated list of server addresses
    #[arg(long, value_delimiter = ',')]
    pub addrs: Vec<String>,

    /// Error message length to request
    #[arg(short, long)]
    pub err_length: Option<usize>,

    /// Time between requests, in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Number of requests to make (0 = run forever)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Time allowed for a first connection to each address, in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    #[command(flatten)]
    pub dial: DialArgs,
}

/// Connection options shared by the client subcommands
#[derive(Args, Debug)]
pub struct DialArgs {
    /// Limit on an error response's header line plus message (0 = default)
    #[arg(long)]
    pub max_header_size: Option<usize>,

    /// Enable TCP keepalive with this idle time, in milliseconds (0 = off)
    #[arg(long)]
    pub keepalive_time_ms: Option<u64>,

    /// Connect lazily on the first request instead of while dialing
    #[arg(long)]
    pub no_block: bool,

    /// Timeout for establishing a connection, in milliseconds (0 = none)
    #[arg(long)]
    pub dial_timeout_ms: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Time to sleep before responding, in milliseconds
    #[serde(default)]
    pub response_sleep_ms: u64,
    /// Largest error message the server agrees to generate
    #[serde(default = "default_max_error_length")]
    pub max_error_length: usize,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            response_sleep_ms: 0,
            max_error_length: default_max_error_length(),
            max_connections: default_max_connections(),
        }
    }
}

/// Probe client configuration, also supplies dial options to `watch`
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_err_length")]
    pub err_length: usize,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub inter_request_sleep_ms: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default)]
    pub max_header_size: usize,
    #[serde(default)]
    pub keepalive_time_ms: u64,
    #[serde(default = "default_with_block")]
    pub with_block: bool,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            err_length: default_err_length(),
            count: default_count(),
            inter_request_sleep_ms: 0,
            linger_ms: default_linger_ms(),
            max_header_size: 0,
            keepalive_time_ms: 0,
            with_block: default_with_block(),
            dial_timeout_ms: default_dial_timeout_ms(),
        }
    }
}

/// Multi-address watch configuration
#[derive(Debug, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_addrs")]
    pub addrs: Vec<String>,
    #[serde(default = "default_watch_err_length")]
    pub err_length: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Number of requests (0 = run forever)
    #[serde(default)]
    pub count: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            addrs: default_addrs(),
            err_length: default_watch_err_length(),
            interval_ms: default_interval_ms(),
            count: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "localhost:8001".to_string()
}

fn default_max_error_length() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_max_connections() -> usize {
    10000
}

fn default_addr() -> String {
    "localhost:8001".to_string()
}

fn default_err_length() -> usize {
    128
}

fn default_count() -> usize {
    1
}

fn default_linger_ms() -> u64 {
    1000
}

fn default_with_block() -> bool {
    true
}

fn default_dial_timeout_ms() -> u64 {
    60_000 // 1 minute
}

fn default_addrs() -> Vec<String> {
    vec![default_addr()]
}

fn default_watch_err_length() -> usize {
    1
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved settings for `serve`
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub response_sleep: Duration,
    pub max_error_length: usize,
    pub max_connections: usize,
}

/// Resolved settings for `probe`
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub addr: String,
    pub err_length: usize,
    pub count: usize,
    pub inter_request_sleep: Duration,
    pub linger: Duration,
    pub dial: DialOptions,
}

/// Resolved settings for `watch`
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub addrs: Vec<String>,
    pub err_length: usize,
    pub interval: Duration,
    /// `None` runs forever
    pub count: Option<usize>,
    pub connect_timeout: Duration,
    pub dial: DialOptions,
}

/// What the process was asked to do
#[derive(Debug, Clone)]
pub enum Mode {
    Serve(ServerSettings),
    Probe(ProbeSettings),
    Watch(WatchSettings),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let mode = match cli.command {
            Command::Serve(args) => {
                let server = toml_config.server;
                let max_connections = args.max_connections.unwrap_or(server.max_connections);
                if max_connections == 0 || max_connections > Semaphore::MAX_PERMITS {
                    return Err(ConfigError::Invalid(format!(
                        "max_connections must be between 1 and {}, got {}",
                        Semaphore::MAX_PERMITS,
                        max_connections
                    )));
                }
                Mode::Serve(ServerSettings {
                    listen: args.listen.unwrap_or(server.listen),
                    response_sleep: Duration::from_millis(
                        args.response_sleep_ms.unwrap_or(server.response_sleep_ms),
                    ),
                    max_error_length: args.max_error_length.unwrap_or(server.max_error_length),
                    max_connections,
                })
            }
            Command::Probe(args) => {
                let client = toml_config.client;
                Mode::Probe(ProbeSettings {
                    dial: dial_options(&args.dial, &client),
                    addr: args.addr.unwrap_or(client.addr),
                    err_length: args.err_length.unwrap_or(client.err_length),
                    count: args.count.unwrap_or(client.count),
                    inter_request_sleep: Duration::from_millis(
                        args.inter_request_sleep_ms
                            .unwrap_or(client.inter_request_sleep_ms),
                    ),
                    linger: Duration::from_millis(args.linger_ms.unwrap_or(client.linger_ms)),
                })
            }
            Command::Watch(args) => {
                let watch = toml_config.watch;
                let count = args.count.unwrap_or(watch.count);
                Mode::Watch(WatchSettings {
                    dial: dial_options(&args.dial, &toml_config.client),
                    addrs: if args.addrs.is_empty() {
                        watch.addrs
                    } else {
                        args.addrs
                    },
                    err_length: args.err_length.unwrap_or(watch.err_length),
                    interval: Duration::from_millis(args.interval_ms.unwrap_or(watch.interval_ms)),
                    count: (count > 0).then_some(count),
                    connect_timeout: Duration::from_millis(
                        args.connect_timeout_ms.unwrap_or(watch.connect_timeout_ms),
                    ),
                })
            }
        };

        Ok(Config { log_level, mode })
    }
}

fn dial_options(args: &DialArgs, client: &ClientConfig) -> DialOptions {
    let max_header_size = args.max_header_size.unwrap_or(client.max_header_size);
    let keepalive_time_ms = args.keepalive_time_ms.unwrap_or(client.keepalive_time_ms);
    let dial_timeout_ms = args.dial_timeout_ms.unwrap_or(client.dial_timeout_ms);

    DialOptions {
        with_block: !args.no_block && client.with_block,
        dial_timeout: nonzero_millis(dial_timeout_ms),
        keepalive_time: nonzero_millis(keepalive_time_ms),
        max_header_list_size: (max_header_size > 0).then_some(max_header_size),
    }
}

fn nonzero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
