use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use axum::{Extension, Router};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sublarr::app_state::AppState;
use sublarr::config::{self, AppResources, ConfigFile, APP_RESOURCES, CONFIG};
use sublarr::db::Db;
use sublarr::events::{EventBus, EventDispatcher};
use sublarr::health::{dedup::DedupEngine, HealthEngine};
use sublarr::providers::ProviderRegistry;
use sublarr::scheduler::{self, BackupTask, CleanupTask, Scheduler, StandaloneScanTask};
use sublarr::standalone::{watcher, StandaloneSource};
use sublarr::tracing::init_tracer;
use sublarr::translation::{memory::TranslationMemory, openai::OpenAiBackend, Translator};
use sublarr::wanted::{scanner::WantedScanner, searcher::WantedSearcher};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_MIGRATION: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "sublarr", version, about = "Subtitle management service")]
struct Args {
    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the service
    Serve,
    /// Apply pending schema migrations and exit
    Migrate,
    /// Write a backup archive of the database and configuration
    Backup,
    /// Restore database and configuration from a backup archive
    Restore { path: PathBuf },
    /// Run one library scan cycle and exit
    ScanOnce,
    /// Run one wanted-search batch and exit
    SearchOnce,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = AppResources::initiate() {
        eprintln!("Could not initiate app resources: {err}");
        std::process::exit(EXIT_CONFIG);
    }
    let log_level: config::LogLevel = CONFIG.get_value();
    let level = Level::from_str(&log_level.0).unwrap_or(Level::INFO);
    let log_channel = init_tracer(level);

    if let Ok(path) = dotenv() {
        tracing::info!("Loaded env variables from: {}", path.display());
    }
    match ConfigFile::open_and_read().await {
        Ok(toml) => CONFIG.apply_toml_settings(toml),
        Err(err) => tracing::warn!("Could not read config file: {err}"),
    }
    if let Some(port) = args.port {
        CONFIG.apply_cli_value(config::Port(port));
    }

    let db = match Db::connect(&APP_RESOURCES.database_path).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open database: {e}");
            std::process::exit(EXIT_RUNTIME);
        }
    };
    let db: &'static Db = Box::leak(Box::new(db));

    let code = match args.command.unwrap_or(Command::Serve) {
        Command::Migrate => match db.migrate().await {
            Ok(()) => {
                tracing::info!("Schema is up to date");
                EXIT_OK
            }
            Err(e) => {
                tracing::error!("Migration failed: {e}");
                EXIT_RUNTIME
            }
        },
        Command::Backup => match sublarr::backup::create_backup().await {
            Ok(path) => {
                tracing::info!("Backup written to {}", path.display());
                EXIT_OK
            }
            Err(e) => {
                tracing::error!("Backup failed: {e}");
                EXIT_RUNTIME
            }
        },
        Command::Restore { path } => match sublarr::backup::restore_backup(&path).await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                tracing::error!("Restore failed: {e}");
                EXIT_RUNTIME
            }
        },
        Command::ScanOnce => match require_current_schema(db).await {
            Ok(()) => scan_once(db).await,
            Err(code) => code,
        },
        Command::SearchOnce => match require_current_schema(db).await {
            Ok(()) => search_once(db).await,
            Err(code) => code,
        },
        Command::Serve => serve(db, log_channel).await,
    };
    std::process::exit(code);
}

/// One-shot commands refuse to run against a stale schema; only `serve`
/// and `migrate` apply migrations.
async fn require_current_schema(db: &'static Db) -> Result<(), i32> {
    match db.needs_migration().await {
        Ok(false) => Ok(()),
        Ok(true) => {
            tracing::error!("Database schema is behind, run `sublarr migrate` first");
            Err(EXIT_MIGRATION)
        }
        Err(e) => {
            tracing::error!("Failed to read schema version: {e}");
            Err(EXIT_RUNTIME)
        }
    }
}

struct Components {
    state: AppState,
    dispatcher: EventDispatcher,
    tracker: TaskTracker,
}

/// Construct and wire every long-lived component once. References are
/// leaked; the component graph lives for the whole process.
fn build_components(db: &'static Db, cancellation_token: CancellationToken) -> Components {
    let (events, events_rx) = EventBus::channel();
    let tracker = TaskTracker::new();

    let translation_memory: &'static TranslationMemory =
        Box::leak(Box::new(TranslationMemory::new(db)));
    let translator: &'static Translator = {
        let translator = Translator::new(translation_memory);
        translator.register(Arc::new(OpenAiBackend::new()));
        Box::leak(Box::new(translator))
    };
    let providers: &'static ProviderRegistry = Box::leak(Box::new(ProviderRegistry::new()));
    let scanner: &'static WantedScanner =
        Box::leak(Box::new(WantedScanner::new(db, events.clone())));
    let searcher: &'static WantedSearcher = Box::leak(Box::new(WantedSearcher::new(
        db,
        providers,
        translator,
        events.clone(),
    )));
    let standalone: &'static StandaloneSource =
        Box::leak(Box::new(StandaloneSource::new(db, events.clone())));
    let health: &'static HealthEngine = Box::leak(Box::new(HealthEngine::new(db, events.clone())));
    let dedup: &'static DedupEngine = Box::leak(Box::new(DedupEngine::new(db, events.clone())));

    let scheduler: &'static Scheduler = Box::leak(Box::new(Scheduler::new(
        cancellation_token.clone(),
        tracker.clone(),
    )));
    scheduler.register(scanner, scheduler::interval_fn::<config::ScanIntervalSeconds>());
    scheduler.register(
        Box::leak(Box::new(StandaloneScanTask {
            standalone,
            scanner,
        })),
        scheduler::interval_fn::<config::ScanIntervalSeconds>(),
    );
    scheduler.register(
        searcher,
        scheduler::interval_fn::<config::SearchIntervalSeconds>(),
    );
    scheduler.register(
        health,
        scheduler::interval_fn::<config::HealthIntervalSeconds>(),
    );
    scheduler.register(dedup, scheduler::interval_fn::<config::DedupIntervalSeconds>());
    scheduler.register(
        Box::leak(Box::new(CleanupTask {
            db,
            dedup,
            events: events.clone(),
        })),
        scheduler::interval_fn::<config::CleanupIntervalSeconds>(),
    );
    scheduler.register(
        Box::leak(Box::new(BackupTask {
            events: events.clone(),
        })),
        scheduler::interval_fn::<config::BackupIntervalSeconds>(),
    );

    let events: &'static EventBus = Box::leak(Box::new(events));
    let dispatcher = EventDispatcher::new(events_rx, db, Vec::new());

    let state = AppState {
        db,
        providers,
        translator,
        translation_memory,
        events,
        scanner,
        searcher,
        standalone,
        health,
        dedup,
        scheduler,
        cancellation_token,
    };
    Components {
        state,
        dispatcher,
        tracker,
    }
}

async fn serve(db: &'static Db, log_channel: sublarr::tracing::LogChannel) -> i32 {
    // migrations run at every service start
    if let Err(e) = db.migrate().await {
        tracing::error!("Schema migration failed: {e}");
        return EXIT_MIGRATION;
    }

    let cancellation_token = CancellationToken::new();
    let components = build_components(db, cancellation_token.clone());
    let Components {
        state,
        dispatcher,
        tracker,
    } = components;

    {
        let cancellation_token = cancellation_token.clone();
        let tracker_handle = tracker.clone();
        tracker.spawn(dispatcher.run(cancellation_token, tracker_handle));
    }
    tracker.spawn(state.scheduler.run());
    {
        let standalone = state.standalone;
        let scanner = state.scanner;
        let cancellation_token = cancellation_token.clone();
        let tracker_handle = tracker.clone();
        tracker.spawn(async move {
            watcher::run(standalone, scanner, cancellation_token, tracker_handle).await;
        });
    }

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api/v1", sublarr::server::api_router())
        .layer(Extension(log_channel))
        .layer(cors)
        .with_state(state.clone());

    let port: config::Port = CONFIG.get_value();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port.0);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind port {}: {e}", port.0);
            return EXIT_CONFIG;
        }
    };
    tracing::info!("Starting server on port {}", port.0);

    {
        let cancellation_token = cancellation_token.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancellation_token.cancelled_owned())
                .await
            {
                tracing::error!("Server error: {e}");
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            cancellation_token.cancel();
        }
        _ = cancellation_token.cancelled() => {}
    }
    tracing::trace!("Waiting for all tasks to finish");
    tracker.close();
    tracker.wait().await;
    tracing::info!("Gracefully shut down");
    EXIT_OK
}

async fn scan_once(db: &'static Db) -> i32 {
    let cancellation_token = CancellationToken::new();
    let components = build_components(db, cancellation_token.clone());
    let scanner = components.state.scanner;
    let standalone = components.state.standalone;

    let standalone_result = standalone.scan(scanner, cancellation_token.clone()).await;
    let library_result = scanner.full_scan(cancellation_token).await;
    match (standalone_result, library_result) {
        (Ok(standalone_stats), Ok(library_stats)) => {
            tracing::info!(
                "Scan complete: {} files, {} items created",
                standalone_stats.files + library_stats.files,
                standalone_stats.created + library_stats.created
            );
            EXIT_OK
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Scan failed: {e}");
            EXIT_RUNTIME
        }
    }
}

async fn search_once(db: &'static Db) -> i32 {
    let cancellation_token = CancellationToken::new();
    let components = build_components(db, cancellation_token.clone());
    match components.state.searcher.search_batch(cancellation_token).await {
        Ok(stats) => {
            tracing::info!(
                "Search complete: {} items, {} succeeded, {} failed",
                stats.total,
                stats.succeeded,
                stats.failed
            );
            EXIT_OK
        }
        Err(e) => {
            tracing::error!("Search failed: {e}");
            EXIT_RUNTIME
        }
    }
}
