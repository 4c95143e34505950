use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tether_core::DEFAULT_MAX_ENVELOPE_BYTES;
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8765";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddr { addr: String, reason: String },
    #[error("listen address must be loopback: {0}")]
    NonLoopback(SocketAddr),
    #[error("worker pool size must be at least 1")]
    ZeroWorkers,
    #[error("unknown tts implementation: {0}")]
    UnknownTts(String),
    #[error("tts implementation 'command' requires --tts-command or TETHER_TTS_COMMAND")]
    MissingTtsCommand,
    #[error("invalid value for {key}: {value}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TtsSelection {
    None,
    Command { program: String, args: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: SocketAddr,
    pub workers: usize,
    pub tts: TtsSelection,
    pub output_dir: PathBuf,
    pub dedup_window: Duration,
    pub request_timeout: Duration,
    pub synthesis_timeout: Duration,
    /// Zero disables the stale reaper.
    pub stale_after: Duration,
    /// Zero disables protocol pings.
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub probe_timeout: Duration,
    pub conversation_ttl: Duration,
    pub max_envelope_bytes: usize,
    pub log_dir: String,
    pub debug: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            workers: 2,
            tts: TtsSelection::None,
            output_dir: PathBuf::from(".tether/audio"),
            dedup_window: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(5_000),
            synthesis_timeout: Duration::from_millis(8_000),
            stale_after: Duration::from_secs(60),
            ping_interval: Duration::from_secs(15),
            write_timeout: Duration::from_millis(2_000),
            queue_capacity: 256,
            probe_timeout: Duration::from_millis(1_000),
            conversation_ttl: Duration::from_secs(30),
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            log_dir: String::new(),
            debug: false,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tether-hub", about = "Message hub for editor, hook, avatar and command clients")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value = "")]
    tts: String,
    #[arg(long, default_value = "")]
    tts_command: String,
    #[arg(long, default_value = "")]
    output_dir: String,
    #[arg(long)]
    dedup_window_ms: Option<u64>,
    #[arg(long)]
    request_timeout_ms: Option<u64>,
    #[arg(long)]
    synthesis_timeout_ms: Option<u64>,
    #[arg(long)]
    stale_seconds: Option<u64>,
    #[arg(long)]
    ping_interval: Option<u64>,
    #[arg(long)]
    write_timeout_ms: Option<u64>,
    #[arg(long)]
    queue_capacity: Option<usize>,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

pub fn load_config() -> Result<HubConfig, ConfigError> {
    config_from_args(Args::parse())
}

pub fn config_from_args(args: Args) -> Result<HubConfig, ConfigError> {
    config_from_sources(args, &|key| std::env::var(key).ok())
}

/// Flag values win over `TETHER_*` variables, which win over defaults.
/// Blank flags and blank variables count as unset.
struct Layered<'a> {
    env: &'a dyn Fn(&str) -> Option<String>,
}

impl Layered<'_> {
    fn env(&self, key: &str) -> Option<String> {
        (self.env)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn text(&self, flag: &str, key: &str, default: &str) -> String {
        let flag = flag.trim();
        if !flag.is_empty() {
            return flag.to_string();
        }
        self.env(key).unwrap_or_else(|| default.to_string())
    }

    fn number<T: std::str::FromStr>(
        &self,
        flag: Option<T>,
        key: &'static str,
        default: T,
    ) -> Result<T, ConfigError> {
        if let Some(value) = flag {
            return Ok(value);
        }
        match self.env(key) {
            Some(value) => value
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { key, value }),
            None => Ok(default),
        }
    }

    fn millis(
        &self,
        flag: Option<u64>,
        key: &'static str,
        default: Duration,
    ) -> Result<Duration, ConfigError> {
        self.number(flag, key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn seconds(
        &self,
        flag: Option<u64>,
        key: &'static str,
        default: Duration,
    ) -> Result<Duration, ConfigError> {
        self.number(flag, key, default.as_secs()).map(Duration::from_secs)
    }

    fn switch(&self, flag: bool, key: &str) -> bool {
        flag || self.env(key).is_some_and(|value| {
            matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }
}

fn config_from_sources(
    args: Args,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<HubConfig, ConfigError> {
    let defaults = HubConfig::default();
    let layered = Layered { env };

    let addr_raw = layered.text(&args.addr, "TETHER_HUB_ADDR", DEFAULT_ADDR);
    let addr: SocketAddr = addr_raw.parse().map_err(|err: std::net::AddrParseError| {
        ConfigError::InvalidAddr {
            addr: addr_raw.clone(),
            reason: err.to_string(),
        }
    })?;
    if !addr.ip().is_loopback() {
        return Err(ConfigError::NonLoopback(addr));
    }

    let workers = layered.number(args.workers, "TETHER_WORKERS", defaults.workers)?;
    if workers == 0 {
        return Err(ConfigError::ZeroWorkers);
    }

    let tts = resolve_tts(
        &layered.text(&args.tts, "TETHER_TTS", "none"),
        &layered.text(&args.tts_command, "TETHER_TTS_COMMAND", ""),
    )?;
    let output_dir = PathBuf::from(layered.text(
        &args.output_dir,
        "TETHER_OUTPUT_DIR",
        ".tether/audio",
    ));

    Ok(HubConfig {
        addr,
        workers,
        tts,
        output_dir,
        dedup_window: layered.millis(
            args.dedup_window_ms,
            "TETHER_DEDUP_WINDOW_MS",
            defaults.dedup_window,
        )?,
        request_timeout: layered.millis(
            args.request_timeout_ms,
            "TETHER_REQUEST_TIMEOUT_MS",
            defaults.request_timeout,
        )?,
        synthesis_timeout: layered.millis(
            args.synthesis_timeout_ms,
            "TETHER_SYNTHESIS_TIMEOUT_MS",
            defaults.synthesis_timeout,
        )?,
        stale_after: layered.seconds(
            args.stale_seconds,
            "TETHER_STALE_SECONDS",
            defaults.stale_after,
        )?,
        ping_interval: layered.seconds(
            args.ping_interval,
            "TETHER_PING_INTERVAL",
            defaults.ping_interval,
        )?,
        write_timeout: layered.millis(
            args.write_timeout_ms,
            "TETHER_WRITE_TIMEOUT_MS",
            defaults.write_timeout,
        )?,
        queue_capacity: layered
            .number(
                args.queue_capacity,
                "TETHER_QUEUE_CAPACITY",
                defaults.queue_capacity,
            )?
            .max(1),
        log_dir: layered.text(&args.log_dir, "TETHER_LOG_DIR", ""),
        debug: layered.switch(args.debug, "TETHER_HUB_DEBUG"),
        ..defaults
    })
}

fn resolve_tts(kind: &str, command: &str) -> Result<TtsSelection, ConfigError> {
    match kind.trim().to_lowercase().as_str() {
        "" | "none" | "off" => Ok(TtsSelection::None),
        "command" => {
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts.next().ok_or(ConfigError::MissingTtsCommand)?;
            Ok(TtsSelection::Command {
                program,
                args: parts.collect(),
            })
        }
        other => Err(ConfigError::UnknownTts(other.to_string())),
    }
}
