//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    CliArgs, Command, EngineOverrides, PurgeArgs, RenderArgs, ServeArgs, ServeOverrides,
    StoreOverrides,
};

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::{
    cache::Rendition,
    domain::render::{ImageFormat, WidthBounds},
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "stave";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_STORAGE_ROOT: &str = "data";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_SIGNING_TTL_SECS: u64 = 120;
const MIN_SECRET_BYTES: usize = 16;
const GENERATED_SECRET_BYTES: usize = 32;
const DEFAULT_ENGINE_PROGRAM: &str = "stave-harness";
const DEFAULT_ENGINE_WORK_DIR: &str = "/tmp/stave-engine";
const DEFAULT_RENDER_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BASE_UNIT: u32 = 612;
const DEFAULT_MAX_SESSIONS: u64 = 4;
const DEFAULT_MAX_IDLE: usize = 2;
const DEFAULT_PDFJS_URL: &str = "https://cdn.jsdelivr.net/npm/pdfjs-dist@4.4.168/build/pdf.min.mjs";
const DEFAULT_PDFJS_WORKER_URL: &str =
    "https://cdn.jsdelivr.net/npm/pdfjs-dist@4.4.168/build/pdf.worker.min.mjs";
const DEFAULT_CANONICAL_WIDTH: u32 = 1200;
const DEFAULT_CANONICAL_QUALITY: u8 = 85;
const DEFAULT_THUMBNAIL_WIDTH: u32 = 300;
const DEFAULT_THUMBNAIL_QUALITY: u8 = 70;
const DEFAULT_RETRY_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 4_000;
const DEFAULT_RETRY_JITTER_MS: u64 = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 30;
const DEFAULT_RATE_LIMIT_MAX_PENALTY: u64 = 8;
const DEFAULT_RATE_LIMIT_BAN_SECS: u64 = 300;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub signing: SigningSettings,
    pub engine: EngineSettings,
    pub render: RenderSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub root: PathBuf,
}

#[derive(Clone)]
pub struct SigningSettings {
    pub secret: Vec<u8>,
    /// Set when no secret was configured and a process-local one was drawn.
    pub secret_generated: bool,
    pub public_base_url: Url,
    pub ttl: Duration,
}

impl std::fmt::Debug for SigningSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSettings")
            .field("secret", &"<redacted>")
            .field("secret_generated", &self.secret_generated)
            .field("public_base_url", &self.public_base_url.as_str())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub enabled: bool,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub render_timeout: Duration,
    pub command_timeout: Duration,
    pub base_unit: NonZeroU32,
    pub max_sessions: NonZeroUsize,
    pub max_idle: usize,
    pub pdfjs_url: String,
    pub pdfjs_worker_url: String,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub bounds: WidthBounds,
    pub canonical: Rendition,
    pub thumbnail: Rendition,
    pub placeholder_when_disabled: bool,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: NonZeroU32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: NonZeroU32,
    pub max_penalty: NonZeroU32,
    pub ban: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("STAVE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("engine.args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => {
            raw.apply_store_overrides(&args.store);
            raw.apply_engine_overrides(&args.engine);
        }
        Some(Command::Purge(args)) => raw.apply_store_overrides(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    storage: RawStorageSettings,
    signing: RawSigningSettings,
    engine: RawEngineSettings,
    render: RawRenderSettings,
    retry: RawRetrySettings,
    rate_limit: RawRateLimitSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.public_base_url.as_ref() {
            self.signing.public_base_url = Some(url.clone());
        }
        if let Some(window) = overrides.rate_limit_window_seconds {
            self.rate_limit.window_seconds = Some(window);
        }
        if let Some(max) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = Some(max);
        }

        self.apply_store_overrides(&overrides.store);
        self.apply_engine_overrides(&overrides.engine);
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(root) = overrides.storage_root.as_ref() {
            self.storage.root = Some(root.clone());
        }
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(enabled) = overrides.engine_enabled {
            self.engine.enabled = Some(enabled);
        }
        if let Some(program) = overrides.engine_program.as_ref() {
            self.engine.program = Some(program.clone());
        }
        if let Some(timeout) = overrides.engine_render_timeout_ms {
            self.engine.render_timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            storage,
            signing,
            engine,
            render,
            retry,
            rate_limit,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let storage = build_storage_settings(storage)?;
        let engine = build_engine_settings(engine)?;
        let signing = build_signing_settings(signing, &engine)?;
        let render = build_render_settings(render)?;
        let retry = build_retry_settings(retry)?;
        let rate_limit = build_rate_limit_settings(rate_limit)?;

        Ok(Self {
            server,
            logging,
            database,
            storage,
            signing,
            engine,
            render,
            retry,
            rate_limit,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let root = storage
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("storage.root", "path must not be empty"));
    }
    Ok(StorageSettings { root })
}

fn build_signing_settings(
    signing: RawSigningSettings,
    engine: &EngineSettings,
) -> Result<SigningSettings, LoadError> {
    let (secret, secret_generated) = match non_blank(signing.secret) {
        Some(secret) if secret.len() < MIN_SECRET_BYTES => {
            return Err(LoadError::invalid(
                "signing.secret",
                format!("must be at least {MIN_SECRET_BYTES} bytes"),
            ));
        }
        Some(secret) => (secret.into_bytes(), false),
        None => (
            (0..GENERATED_SECRET_BYTES)
                .map(|_| rand::random::<u8>())
                .collect(),
            true,
        ),
    };

    let raw_url = signing
        .public_base_url
        .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
    let public_base_url = Url::parse(raw_url.trim()).map_err(|err| {
        LoadError::invalid("signing.public_base_url", format!("invalid url: {err}"))
    })?;
    if !matches!(public_base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "signing.public_base_url",
            "scheme must be http or https",
        ));
    }

    let ttl_secs = signing.ttl_seconds.unwrap_or(DEFAULT_SIGNING_TTL_SECS);
    let ttl = Duration::from_secs(ttl_secs);
    let floor = engine.render_timeout + engine.command_timeout * 2;
    if ttl < floor {
        return Err(LoadError::invalid(
            "signing.ttl_seconds",
            format!(
                "must cover the render timeout plus two command timeouts ({}s)",
                floor.as_secs_f64().ceil()
            ),
        ));
    }

    Ok(SigningSettings {
        secret,
        secret_generated,
        public_base_url,
        ttl,
    })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let program = engine
        .program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_PROGRAM));
    if program.as_os_str().is_empty() {
        return Err(LoadError::invalid("engine.program", "path must not be empty"));
    }

    let work_dir = engine
        .work_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_WORK_DIR));
    if work_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid("engine.work_dir", "path must not be empty"));
    }

    let render_timeout = positive_millis(
        engine.render_timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS),
        "engine.render_timeout_ms",
    )?;
    let command_timeout = positive_millis(
        engine
            .command_timeout_ms
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
        "engine.command_timeout_ms",
    )?;

    let base_unit = non_zero_u32(
        engine.base_unit.unwrap_or(DEFAULT_BASE_UNIT).into(),
        "engine.base_unit",
    )?;

    let max_sessions_value = engine.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS);
    let max_sessions = usize::try_from(max_sessions_value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| LoadError::invalid("engine.max_sessions", "must be greater than zero"))?;

    let max_idle = engine.max_idle.unwrap_or(DEFAULT_MAX_IDLE);
    if max_idle > max_sessions.get() {
        return Err(LoadError::invalid(
            "engine.max_idle",
            "must not exceed engine.max_sessions",
        ));
    }

    let pdfjs_url = non_blank(engine.pdfjs_url).unwrap_or_else(|| DEFAULT_PDFJS_URL.to_string());
    let pdfjs_worker_url = non_blank(engine.pdfjs_worker_url)
        .unwrap_or_else(|| DEFAULT_PDFJS_WORKER_URL.to_string());

    Ok(EngineSettings {
        enabled: engine.enabled.unwrap_or(false),
        program,
        args: engine.args.unwrap_or_default(),
        work_dir,
        render_timeout,
        command_timeout,
        base_unit,
        max_sessions,
        max_idle,
        pdfjs_url,
        pdfjs_worker_url,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let defaults = WidthBounds::default();
    let bounds = WidthBounds {
        min: render.min_width.unwrap_or(defaults.min),
        max: render.max_width.unwrap_or(defaults.max),
    };
    if bounds.min == 0 || bounds.min > bounds.max {
        return Err(LoadError::invalid(
            "render.min_width",
            "must be positive and not exceed render.max_width",
        ));
    }

    let canonical = build_rendition(
        &bounds,
        render.canonical_width.unwrap_or(DEFAULT_CANONICAL_WIDTH),
        render.canonical_quality.unwrap_or(DEFAULT_CANONICAL_QUALITY),
        render.canonical_format.as_deref(),
        ("render.canonical_width", "render.canonical_quality", "render.canonical_format"),
    )?;
    let thumbnail = build_rendition(
        &bounds,
        render.thumbnail_width.unwrap_or(DEFAULT_THUMBNAIL_WIDTH),
        render.thumbnail_quality.unwrap_or(DEFAULT_THUMBNAIL_QUALITY),
        render.thumbnail_format.as_deref(),
        ("render.thumbnail_width", "render.thumbnail_quality", "render.thumbnail_format"),
    )?;

    Ok(RenderSettings {
        bounds,
        canonical,
        thumbnail,
        placeholder_when_disabled: render.placeholder_when_disabled.unwrap_or(true),
    })
}

fn build_rendition(
    bounds: &WidthBounds,
    width: u32,
    quality: u8,
    format: Option<&str>,
    keys: (&'static str, &'static str, &'static str),
) -> Result<Rendition, LoadError> {
    let (width_key, quality_key, format_key) = keys;
    if width < bounds.min || width > bounds.max {
        return Err(LoadError::invalid(
            width_key,
            format!("must be within {}..={}", bounds.min, bounds.max),
        ));
    }
    if !(1..=100).contains(&quality) {
        return Err(LoadError::invalid(quality_key, "must be within 1..=100"));
    }
    let format = match format {
        Some(raw) => ImageFormat::from_str(raw.trim())
            .map_err(|err| LoadError::invalid(format_key, err.to_string()))?,
        None => ImageFormat::Webp,
    };
    Ok(Rendition {
        width,
        quality,
        format,
    })
}

fn build_retry_settings(retry: RawRetrySettings) -> Result<RetrySettings, LoadError> {
    let max_attempts = non_zero_u32(
        retry.max_attempts.unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
        "retry.max_attempts",
    )?;
    let base_delay =
        Duration::from_millis(retry.base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS));
    let max_delay = Duration::from_millis(retry.max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS));
    if max_delay < base_delay {
        return Err(LoadError::invalid(
            "retry.max_delay_ms",
            "must not be shorter than retry.base_delay_ms",
        ));
    }
    let jitter = Duration::from_millis(retry.jitter_ms.unwrap_or(DEFAULT_RETRY_JITTER_MS));

    Ok(RetrySettings {
        max_attempts,
        base_delay,
        max_delay,
        jitter,
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let window_secs = rate_limit
        .window_seconds
        .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);
    if window_secs == 0 {
        return Err(LoadError::invalid(
            "rate_limit.window_seconds",
            "must be greater than zero",
        ));
    }

    let max_requests = non_zero_u32(
        rate_limit
            .max_requests
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS),
        "rate_limit.max_requests",
    )?;
    let max_penalty = non_zero_u32(
        rate_limit
            .max_penalty
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_PENALTY),
        "rate_limit.max_penalty",
    )?;
    let ban = Duration::from_secs(rate_limit.ban_seconds.unwrap_or(DEFAULT_RATE_LIMIT_BAN_SECS));

    Ok(RateLimitSettings {
        window: Duration::from_secs(window_secs),
        max_requests,
        max_penalty,
        ban,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSigningSettings {
    secret: Option<String>,
    public_base_url: Option<String>,
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    enabled: Option<bool>,
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    work_dir: Option<PathBuf>,
    render_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
    base_unit: Option<u32>,
    max_sessions: Option<u64>,
    max_idle: Option<usize>,
    pdfjs_url: Option<String>,
    pdfjs_worker_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    min_width: Option<u32>,
    max_width: Option<u32>,
    canonical_width: Option<u32>,
    canonical_quality: Option<u8>,
    canonical_format: Option<String>,
    thumbnail_width: Option<u32>,
    thumbnail_quality: Option<u8>,
    thumbnail_format: Option<String>,
    placeholder_when_disabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetrySettings {
    max_attempts: Option<u64>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    window_seconds: Option<u64>,
    max_requests: Option<u64>,
    max_penalty: Option<u64>,
    ban_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
