use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the Stave binary.
#[derive(Debug, Parser)]
#[command(name = "stave", version, about = "Stave document page renderer")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STAVE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the Stave HTTP service.
    Serve(Box<ServeArgs>),
    /// Render one page of a document to a file.
    Render(RenderArgs),
    /// Delete every cached artifact of a document.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the object storage root directory.
    #[arg(long = "storage-root", value_name = "PATH")]
    pub storage_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Toggle the render engine; when disabled, placeholders may be served.
    #[arg(
        long = "engine-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub engine_enabled: Option<bool>,

    /// Override the render harness executable.
    #[arg(long = "engine-program", value_name = "PATH")]
    pub engine_program: Option<PathBuf>,

    /// Override the per-attempt render timeout.
    #[arg(long = "engine-render-timeout-ms", value_name = "MILLIS")]
    pub engine_render_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverrides,

    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the public base URL used in signed source links.
    #[arg(long = "signing-public-base-url", value_name = "URL")]
    pub public_base_url: Option<String>,

    /// Override the rate limit window size.
    #[arg(long = "rate-limit-window-seconds", value_name = "SECONDS")]
    pub rate_limit_window_seconds: Option<u64>,

    /// Override the rate limit request ceiling.
    #[arg(long = "rate-limit-max-requests", value_name = "COUNT")]
    pub rate_limit_max_requests: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub store: StoreOverrides,

    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Document identifier.
    #[arg(value_name = "DOCUMENT")]
    pub document: String,

    /// Page number, starting at 1.
    #[arg(long, default_value_t = 1)]
    pub page: i64,

    /// Output width in pixels; defaults to the canonical width.
    #[arg(long)]
    pub width: Option<i64>,

    /// Output format (png|jpeg|webp); defaults to the canonical format.
    #[arg(long)]
    pub format: Option<String>,

    /// Output quality (1-100); defaults to the canonical quality.
    #[arg(long)]
    pub quality: Option<i64>,

    /// File to write the rendered image to.
    #[arg(long, short = 'o', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Document identifier.
    #[arg(value_name = "DOCUMENT")]
    pub document: String,
}
