use anyhow::Result;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cpd_platform::{
    api::{create_router, AppState},
    config::{Config, LoggingConfig},
    continuation_policy::ContinuationPolicy,
    log_system_event, CompletionService, Database,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let _guard = setup_logging(&config.logging)?;
    config.validate()?;

    log_system_event!(startup, component = "server", "CPD platform starting");

    let db = Database::new(&config.database.url).await?;
    log_system_event!(
        startup,
        component = "database",
        "Database connected and migrations applied"
    );

    let policy = ContinuationPolicy::from_config(&config.policy);
    let completion_service = CompletionService::new(db, policy);
    let state = AppState::new(completion_service);

    let app = create_router(state).layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log_system_event!(
        startup,
        component = "server",
        format!("Listening on {addr}")
    );

    axum::serve(listener, app).await?;

    log_system_event!(shutdown, component = "server", "CPD platform stopped");
    Ok(())
}

/// Console plus daily-rotated file logging. The returned guard must
/// stay alive for the process lifetime or buffered file output is
/// dropped on shutdown.
fn setup_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = config.console_enabled.then(|| {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true)
    });

    let mut guard = None;
    let file_layer = if config.file_enabled {
        std::fs::create_dir_all(&config.log_directory).unwrap_or_else(|e| {
            eprintln!("Warning: Could not create log directory: {e}");
        });
        let file_appender =
            tracing_appender::rolling::daily(&config.log_directory, "cpd-platform.log");
        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking_file),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
