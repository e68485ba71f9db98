//! Environment-driven application configuration.
//!
//! Every knob has a default that works for a local deployment; `XG2G_*`
//! environment variables override individual fields. The config is built once
//! at the composition root and passed down by reference.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Canonical `Retry-After` value (seconds) for every 503 and `LEASE_BUSY`
/// response. Clients do not invent their own timing.
pub const RETRY_AFTER_SECS: u64 = 10;

/// API authentication tokens, one per scope.
///
/// The adapter fails closed: a scope with no configured token rejects every
/// request that requires it.
#[derive(Debug, Clone, Default)]
pub struct ApiTokens {
    pub read: Option<String>,
    pub write: Option<String>,
    pub admin: Option<String>,
}

impl ApiTokens {
    pub fn from_env() -> Self {
        Self {
            read: env_string("XG2G_API_TOKEN_READ"),
            write: env_string("XG2G_API_TOKEN_WRITE"),
            admin: env_string("XG2G_API_TOKEN_ADMIN"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP bind address.
    pub bind_address: String,
    /// HTTP port.
    pub port: u16,
    /// SQLite database URL.
    pub database_url: String,
    /// Root directory for per-session HLS artifacts.
    pub hls_root: PathBuf,
    /// Directory holding finished/ongoing recording files.
    pub recordings_dir: PathBuf,
    /// Base URL prefixed to playback URLs; empty means relative URLs.
    pub public_base_url: String,
    /// OpenWebIF upstream base URL.
    pub openwebif_url: String,

    /// Number of tuner slots available for live leases.
    pub tuner_slots: usize,
    /// Lease TTL granted on acquire/renew.
    pub lease_ttl: Duration,
    /// Client heartbeat interval; the deadline is twice this.
    pub heartbeat_interval: Duration,
    /// Hard cap on a session's total lifetime.
    pub session_ttl: Duration,
    /// Budget for a session to reach READY after `stream.start`.
    pub startup_budget: Duration,
    /// Grace given to a pipeline on stop before it is killed.
    pub stop_grace: Duration,
    /// Grace for the whole engine on shutdown.
    pub shutdown_grace: Duration,
    /// Age a terminal session's HLS directory must reach before eviction.
    pub evict_grace: Duration,
    /// Idempotency record TTL.
    pub idempotency_ttl: Duration,

    /// Duration probe budget.
    pub probe_budget: Duration,
    /// Minimum age after last write before a recording may be scanned.
    pub stable_window: Duration,
    /// Non-final duration updates smaller than this are ignored.
    pub min_duration_delta: Duration,
    /// Whether INDEX-sourced durations may set `durationFinal`.
    pub index_duration_final: bool,

    /// HMAC secret for playback decision tokens.
    pub token_secret: String,
    /// Freshness window for decision tokens.
    pub token_freshness: Duration,

    /// FFmpeg binary path for the production pipeline backend.
    pub ffmpeg_path: String,
    /// FFprobe binary path for duration probing.
    pub ffprobe_path: String,

    /// API tokens per scope.
    pub api_tokens: ApiTokens,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8088,
            database_url: "sqlite:xg2g.db?mode=rwc".to_string(),
            hls_root: PathBuf::from("hls"),
            recordings_dir: PathBuf::from("recordings"),
            public_base_url: String::new(),
            openwebif_url: "http://127.0.0.1:80".to_string(),
            tuner_slots: 2,
            lease_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            session_ttl: Duration::from_secs(4 * 3600),
            startup_budget: Duration::from_secs(15),
            stop_grace: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            evict_grace: Duration::from_secs(120),
            idempotency_ttl: Duration::from_secs(600),
            probe_budget: Duration::from_secs(10),
            stable_window: Duration::from_secs(60),
            min_duration_delta: Duration::from_secs(2),
            index_duration_final: false,
            token_secret: String::new(),
            token_freshness: Duration::from_secs(60),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            api_tokens: ApiTokens::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env_or_default() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_string("XG2G_BIND_ADDRESS") {
            config.bind_address = addr;
        }
        if let Some(port) = env_parsed::<u16>("XG2G_PORT")? {
            config.port = port;
        }
        if let Some(url) = env_string("XG2G_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = env_string("XG2G_HLS_ROOT") {
            config.hls_root = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("XG2G_RECORDINGS_DIR") {
            config.recordings_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_string("XG2G_PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = env_string("XG2G_OPENWEBIF_URL") {
            config.openwebif_url = url;
        }

        if let Some(slots) = env_parsed::<usize>("XG2G_TUNER_SLOTS")? {
            if slots == 0 {
                return Err(Error::config("XG2G_TUNER_SLOTS must be at least 1"));
            }
            config.tuner_slots = slots;
        }

        env_duration("XG2G_LEASE_TTL_SECS", &mut config.lease_ttl)?;
        env_duration("XG2G_HEARTBEAT_INTERVAL_SECS", &mut config.heartbeat_interval)?;
        env_duration("XG2G_SESSION_TTL_SECS", &mut config.session_ttl)?;
        env_duration("XG2G_STARTUP_BUDGET_SECS", &mut config.startup_budget)?;
        env_duration("XG2G_STOP_GRACE_SECS", &mut config.stop_grace)?;
        env_duration("XG2G_SHUTDOWN_GRACE_SECS", &mut config.shutdown_grace)?;
        env_duration("XG2G_EVICT_GRACE_SECS", &mut config.evict_grace)?;
        env_duration("XG2G_IDEMPOTENCY_TTL_SECS", &mut config.idempotency_ttl)?;
        env_duration("XG2G_PROBE_BUDGET_SECS", &mut config.probe_budget)?;
        env_duration("XG2G_STABLE_WINDOW_SECS", &mut config.stable_window)?;
        env_duration("XG2G_MIN_DURATION_DELTA_SECS", &mut config.min_duration_delta)?;
        env_duration("XG2G_TOKEN_FRESHNESS_SECS", &mut config.token_freshness)?;

        if let Some(flag) = env_parsed::<bool>("XG2G_DURATION_INDEX_FINAL")? {
            config.index_duration_final = flag;
        }
        if let Some(secret) = env_string("XG2G_TOKEN_SECRET") {
            config.token_secret = secret;
        }
        if let Some(path) = env_string("XG2G_FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(path) = env_string("XG2G_FFPROBE_PATH") {
            config.ffprobe_path = path;
        }
        config.api_tokens = ApiTokens::from_env();

        Ok(config)
    }

    /// Heartbeat deadline extension applied on create and on every heartbeat.
    pub fn heartbeat_deadline_window(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

fn env_duration(var: &str, field: &mut Duration) -> Result<()> {
    if let Some(secs) = env_parsed::<u64>(var)? {
        *field = Duration::from_secs(secs);
    }
    Ok(())
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(var: &str) -> Result<Option<T>> {
    match env_string(var) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("invalid value for {var}: {raw:?}"))),
    }
}
