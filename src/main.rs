use std::{process, sync::Arc, time::Duration};

use stave::{
    application::{
        error::AppError,
        rate_limit::{RateLimitPolicy, RateLimiter},
        render::{
            EngineMode, EngineOptions, HarnessAssets, RenderCoordinator, RenderDefaults,
            RenderEngine, RetryPolicy, SessionPool,
        },
        repos::{CounterStore, DocumentResolver, ObjectStore},
        signer::UrlSigner,
    },
    cache::CacheStore,
    config,
    infra::{
        counters::MemoryCounterStore,
        db::PostgresRepositories,
        documents::StorageDocumentResolver,
        engine::{ProcessCapability, ProcessEngineConfig},
        error::InfraError,
        http::{self, AppState},
        storage::FsObjectStore,
        telemetry,
    },
};
use tokio::net::TcpListener;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

const COUNTER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    if settings.signing.secret_generated {
        warn!(
            target = "stave::config",
            "No signing secret configured; generated a process-local secret. Signed URLs will not survive a restart"
        );
    }

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
    }
}

/// Backends shared by every command.
struct Backends {
    objects: Arc<dyn ObjectStore>,
    documents: Arc<dyn DocumentResolver>,
    counters: Arc<dyn CounterStore>,
    memory_counters: Option<Arc<MemoryCounterStore>>,
}

async fn init_backends(settings: &config::Settings) -> Result<Backends, AppError> {
    let storage = FsObjectStore::new(settings.storage.root.clone());
    storage
        .ensure_root()
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let objects: Arc<dyn ObjectStore> = Arc::new(storage);

    let Some(database_url) = settings.database.url.as_ref() else {
        info!(
            target = "stave::bootstrap",
            root = %settings.storage.root.display(),
            "No database configured; resolving documents from storage"
        );
        let memory = Arc::new(MemoryCounterStore::new());
        return Ok(Backends {
            documents: Arc::new(StorageDocumentResolver::new(objects.clone())),
            counters: memory.clone(),
            memory_counters: Some(memory),
            objects,
        });
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    let repositories = Arc::new(PostgresRepositories::new(pool));
    Ok(Backends {
        objects,
        documents: repositories.clone(),
        counters: repositories,
        memory_counters: None,
    })
}

fn build_engine_mode(settings: &config::Settings) -> EngineMode {
    let engine = &settings.engine;
    if !engine.enabled {
        return EngineMode::Disabled {
            placeholders: settings.render.placeholder_when_disabled,
        };
    }

    let capability = ProcessCapability::new(ProcessEngineConfig {
        program: engine.program.clone(),
        args: engine.args.clone(),
        work_dir: engine.work_dir.clone(),
        command_timeout: engine.command_timeout,
    });
    let pool = SessionPool::new(
        Arc::new(capability),
        engine.max_sessions.get(),
        engine.max_idle,
        engine.command_timeout,
    );
    let options = EngineOptions {
        render_timeout: engine.render_timeout,
        base_unit: engine.base_unit.get(),
        assets: HarnessAssets {
            pdfjs_url: engine.pdfjs_url.clone(),
            worker_url: engine.pdfjs_worker_url.clone(),
        },
    };
    EngineMode::Configured(Arc::new(RenderEngine::new(pool, options)))
}

fn build_coordinator(
    settings: &config::Settings,
    backends: &Backends,
    engine: EngineMode,
    public_base_url: Url,
) -> RenderCoordinator {
    let limiter = RateLimiter::new(
        backends.counters.clone(),
        RateLimitPolicy {
            window: settings.rate_limit.window,
            max_requests: settings.rate_limit.max_requests.get(),
            max_penalty: settings.rate_limit.max_penalty.get(),
            ban: settings.rate_limit.ban,
        },
    );
    let signer = UrlSigner::new(
        settings.signing.secret.clone(),
        public_base_url,
        settings.signing.ttl,
    );
    let retry = RetryPolicy {
        max_attempts: settings.retry.max_attempts.get(),
        base_delay: settings.retry.base_delay,
        max_delay: settings.retry.max_delay,
        jitter: settings.retry.jitter,
    };
    let defaults = RenderDefaults {
        bounds: settings.render.bounds,
        canonical: settings.render.canonical,
        thumbnail: settings.render.thumbnail,
    };

    RenderCoordinator::new(
        CacheStore::new(backends.objects.clone()),
        limiter,
        backends.documents.clone(),
        signer,
        engine,
        retry,
        defaults,
    )
}

async fn shutdown_engine(engine: &EngineMode) {
    if let EngineMode::Configured(engine) = engine {
        engine.pool().shutdown().await;
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let backends = init_backends(&settings).await?;
    let engine = build_engine_mode(&settings);
    let coordinator = Arc::new(build_coordinator(
        &settings,
        &backends,
        engine.clone(),
        settings.signing.public_base_url.clone(),
    ));

    let sweep_handle = backends.memory_counters.clone().map(|counters| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(COUNTER_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                counters.sweep();
            }
        })
    });

    let state = AppState {
        coordinator,
        objects: backends.objects.clone(),
    };
    let result = serve_http(&settings, state).await;

    if let Some(handle) = sweep_handle {
        handle.abort();
        let _ = handle.await;
    }
    shutdown_engine(&engine).await;

    result
}

async fn serve_http(settings: &config::Settings, state: AppState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "stave::serve",
        addr = %settings.server.addr,
        "Listening"
    );

    let grace = settings.server.graceful_shutdown;
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(
                    target = "stave::serve",
                    error = %err,
                    "Failed to listen for shutdown signal"
                );
                std::future::pending::<()>().await;
            }
            info!(target = "stave::serve", "Shutdown requested");
        });

    // The grace period starts once the server stops accepting connections.
    let server = server.into_future();
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
        }
        _ = wait_for_grace(grace) => {
            warn!(
                target = "stave::serve",
                grace_secs = grace.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}

async fn wait_for_grace(grace: Duration) {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}

/// One-shot render. Sources are served to the harness from an ephemeral
/// loopback listener so signed URLs resolve without a running server.
async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let backends = init_backends(&settings).await?;
    let engine = build_engine_mode(&settings);

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let base_url = Url::parse(&format!("http://{local_addr}"))
        .map_err(|err| AppError::unexpected(format!("invalid loopback url: {err}")))?;

    let coordinator = Arc::new(build_coordinator(
        &settings,
        &backends,
        engine.clone(),
        base_url,
    ));
    let router = http::build_router(AppState {
        coordinator: coordinator.clone(),
        objects: backends.objects.clone(),
    });
    let server = tokio::spawn(async move { axum::serve(listener, router.into_make_service()).await });

    let canonical = coordinator.defaults().canonical;
    let result = coordinator
        .render_page(
            &args.document,
            args.page,
            args.width.unwrap_or(i64::from(canonical.width)),
            args.format.as_deref().unwrap_or(canonical.format.as_str()),
            args.quality.unwrap_or(i64::from(canonical.quality)),
        )
        .await;

    server.abort();
    let _ = server.await;
    shutdown_engine(&engine).await;

    let image = result?;
    tokio::fs::write(&args.output, &image.bytes)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "stave::render",
        document = %args.document,
        page = args.page,
        output = %args.output.display(),
        bytes = image.bytes.len(),
        cache = image.cache_status.as_header(),
        degraded = image.degraded,
        "Rendered page"
    );
    Ok(())
}

async fn run_purge(settings: config::Settings, args: config::PurgeArgs) -> Result<(), AppError> {
    let backends = init_backends(&settings).await?;
    let coordinator = build_coordinator(
        &settings,
        &backends,
        EngineMode::Disabled {
            placeholders: false,
        },
        settings.signing.public_base_url.clone(),
    );

    let removed = coordinator.invalidate_document(&args.document).await?;
    info!(
        target = "stave::purge",
        document = %args.document,
        removed,
        "Purged cached artifacts"
    );
    Ok(())
}
