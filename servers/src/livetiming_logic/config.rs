use anyhow::{Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::core::{ExecutionMode, SchedulerConfig};
use lib_common::ingestors::negotiate::{DEFAULT_CLIENT_PROTOCOL, DEFAULT_HUB, DEFAULT_UPSTREAM_URL};
use lib_common::ingestors::{LiveTimingConfig, NegotiatorConfig, default_topics};

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "server_livetiming.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Live timing relay: one upstream stream, many downstream subscribers", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "LIVETIMING_WS_PORT", help = "Port subscribers connect to.")]
    pub ws_port: Option<u16>,

    #[clap(long, env = "LIVETIMING_BIND_ADDRESS", help = "Address the subscriber listener binds to.")]
    pub bind_address: Option<IpAddr>,

    #[clap(long, env = "LIVETIMING_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LIVETIMING_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LIVETIMING_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LIVETIMING_MODE", help = "Execution mode (development, production). Production gates broadcasts until warm-up.")]
    pub mode: Option<ExecutionMode>,

    #[clap(long, env = "LIVETIMING_UPSTREAM_URL", help = "Base URL of the upstream hub.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "LIVETIMING_HUB", help = "Upstream hub name.")]
    pub hub: Option<String>,

    #[clap(long, env = "LIVETIMING_CLIENT_PROTOCOL", help = "Protocol version announced to the hub.")]
    pub client_protocol: Option<String>,

    #[clap(long, env = "LIVETIMING_TOPICS", value_delimiter = ',', help = "Comma separated topics to subscribe to.")]
    pub topics: Option<Vec<String>>,

    #[clap(long, env = "LIVETIMING_BROADCAST_INTERVAL_MS", help = "Milliseconds between broadcasts.")]
    pub broadcast_interval_ms: Option<u64>,

    #[clap(long, env = "LIVETIMING_WARMUP_THRESHOLD", help = "Update units to exceed before production mode shows real state.")]
    pub warmup_threshold: Option<u64>,

    #[clap(long, env = "LIVETIMING_NEGOTIATE_TIMEOUT_MS", help = "Timeout in milliseconds for the negotiate request.")]
    pub negotiate_timeout_ms: Option<u64>,

    #[clap(long, env = "LIVETIMING_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "LIVETIMING_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "LIVETIMING_INACTIVITY_TIMEOUT_SECONDS", help = "Seconds of upstream silence before the link is considered lost.")]
    pub inactivity_timeout_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            ws_port: other.ws_port.or(self.ws_port),
            bind_address: other.bind_address.or(self.bind_address),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            mode: other.mode.or(self.mode),
            upstream_url: other.upstream_url.or(self.upstream_url),
            hub: other.hub.or(self.hub),
            client_protocol: other.client_protocol.or(self.client_protocol),
            topics: other.topics.or(self.topics),
            broadcast_interval_ms: other.broadcast_interval_ms.or(self.broadcast_interval_ms),
            warmup_threshold: other.warmup_threshold.or(self.warmup_threshold),
            negotiate_timeout_ms: other.negotiate_timeout_ms.or(self.negotiate_timeout_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            inactivity_timeout_seconds: other.inactivity_timeout_seconds.or(self.inactivity_timeout_seconds),
        }
    }

    fn defaults() -> Config {
        Config {
            ws_port: Some(3001),
            bind_address: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            mode: Some(ExecutionMode::Development),
            upstream_url: Some(DEFAULT_UPSTREAM_URL.to_string()),
            hub: Some(DEFAULT_HUB.to_string()),
            client_protocol: Some(DEFAULT_CLIENT_PROTOCOL.to_string()),
            topics: Some(default_topics()),
            broadcast_interval_ms: Some(500),
            warmup_threshold: Some(5),
            negotiate_timeout_ms: Some(10_000),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60_000),
            inactivity_timeout_seconds: Some(60),
            ..Default::default()
        }
    }
}

/// What happened with the config file. Reported once logging is up.
#[derive(Debug, Clone, PartialEq)]
pub enum FileStatus {
    Loaded(PathBuf),
    NotFound(PathBuf),
    Ignored { path: PathBuf, reason: String },
}

impl FileStatus {
    pub fn log(&self) {
        match self {
            FileStatus::Loaded(path) => log::info!("Loaded config file {}", path.display()),
            FileStatus::NotFound(path) => log::info!(
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                path.display()
            ),
            FileStatus::Ignored { path, reason } => log::warn!(
                "Ignoring config file {}: {}. Falling back to other sources.",
                path.display(),
                reason
            ),
        }
    }
}

/// Fully resolved and validated settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ws_port: u16,
    pub bind_address: IpAddr,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub mode: ExecutionMode,
    pub upstream_url: String,
    pub hub: String,
    pub client_protocol: String,
    pub topics: Vec<String>,
    pub broadcast_interval: Duration,
    pub warmup_threshold: u64,
    pub negotiate_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub inactivity_timeout: Duration,
    pub file: FileStatus,
}

impl Settings {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.ws_port)
    }

    pub fn live_timing_config(&self) -> LiveTimingConfig {
        LiveTimingConfig {
            negotiator: NegotiatorConfig {
                base_url: self.upstream_url.clone(),
                hub: self.hub.clone(),
                client_protocol: self.client_protocol.clone(),
                timeout: self.negotiate_timeout,
            },
            topics: self.topics.clone(),
            reconnect_base_delay: self.reconnect_base_delay,
            reconnect_max_delay: self.reconnect_max_delay,
            inactivity_timeout: self.inactivity_timeout,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.broadcast_interval,
            mode: self.mode,
            warmup_threshold: self.warmup_threshold,
        }
    }

    fn from_config(config: Config, file: FileStatus) -> Result<Settings> {
        // Every field is populated by `Config::defaults`.
        let defaults = Config::defaults();
        let config = defaults.merge(config);

        let topics: Vec<String> = config
            .topics
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if topics.is_empty() {
            bail!("at least one topic must be configured");
        }

        let broadcast_interval_ms = config.broadcast_interval_ms.unwrap_or_default();
        let negotiate_timeout_ms = config.negotiate_timeout_ms.unwrap_or_default();
        let base_ms = config.reconnect_base_delay_ms.unwrap_or_default();
        let max_ms = config.reconnect_max_delay_ms.unwrap_or_default();
        let inactivity_secs = config.inactivity_timeout_seconds.unwrap_or_default();

        if broadcast_interval_ms == 0 {
            bail!("broadcastIntervalMs must be greater than zero");
        }
        if negotiate_timeout_ms == 0 {
            bail!("negotiateTimeoutMs must be greater than zero");
        }
        if base_ms == 0 || max_ms == 0 {
            bail!("reconnect delays must be greater than zero");
        }
        if base_ms > max_ms {
            bail!("reconnectBaseDelayMs ({}) exceeds reconnectMaxDelayMs ({})", base_ms, max_ms);
        }
        if inactivity_secs == 0 {
            bail!("inactivityTimeoutSeconds must be greater than zero");
        }

        let upstream_url = config.upstream_url.unwrap_or_default();
        if !(upstream_url.starts_with("http://") || upstream_url.starts_with("https://")) {
            bail!("upstreamUrl must be an http(s) URL, got '{}'", upstream_url);
        }

        Ok(Settings {
            ws_port: config.ws_port.unwrap_or_default(),
            bind_address: config.bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            log_dir: config.log_dir.unwrap_or_default(),
            log_level: config.log_level.unwrap_or_default(),
            mode: config.mode.unwrap_or_default(),
            upstream_url,
            hub: config.hub.unwrap_or_default(),
            client_protocol: config.client_protocol.unwrap_or_default(),
            topics,
            broadcast_interval: Duration::from_millis(broadcast_interval_ms),
            warmup_threshold: config.warmup_threshold.unwrap_or_default(),
            negotiate_timeout: Duration::from_millis(negotiate_timeout_ms),
            reconnect_base_delay: Duration::from_millis(base_ms),
            reconnect_max_delay: Duration::from_millis(max_ms),
            inactivity_timeout: Duration::from_secs(inactivity_secs),
            file,
        })
    }
}

fn read_config_file(path: &Path) -> (Option<Config>, FileStatus) {
    if !path.exists() {
        return (None, FileStatus::NotFound(path.to_path_buf()));
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            return (None, FileStatus::Ignored { path: path.to_path_buf(), reason: e.to_string() });
        }
    };
    match serde_json::from_str::<Config>(&text) {
        Ok(config) => (Some(config), FileStatus::Loaded(path.to_path_buf())),
        Err(e) => (None, FileStatus::Ignored { path: path.to_path_buf(), reason: e.to_string() }),
    }
}

/// Layers defaults, the config file and `cli` (which already carries env vars).
pub fn resolve(cli: Config) -> Result<Settings> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let (file_config, status) = read_config_file(&config_file_path);
    let layered = match file_config {
        Some(file_config) => file_config.merge(cli),
        None => cli,
    };
    Settings::from_config(layered, status)
}

pub fn load_config() -> Result<Settings> {
    resolve(Config::parse())
}
