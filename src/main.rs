mod config;
mod dispatch;
mod heartbeat;
mod ingest;
mod logging;
mod server;
mod shutdown;
mod storage;
mod utils;
mod wire;

use std::net::TcpListener;
use std::process;
use std::sync::Arc;

use config::AppConfig;
use dispatch::DispatchRegistry;
use dispatch::recovery::spawn_recovery;
use heartbeat::Heartbeat;
use ingest::{IngestState, spawn_http_server, topic_signature};
use logging::{LogLevel, Logger, LoggerConfig};
use serde_json::json;
use server::WorkerServer;
use shutdown::ShutdownHooks;
use storage::StorageFacade;
use utils::startup_banner::print_startup_banner;
use wire::session::{SessionContext, SessionTimeouts};

fn main() {
    ensure_posix_or_exit();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("sign") {
        print_topic_signature_or_exit(&args[1..]);
        return;
    }

    print_startup_banner();

    let app_config = load_config_or_exit(args);
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });
    let storage = Arc::new(
        StorageFacade::initialize(&app_config.storage, &logger).unwrap_or_else(|error| {
            eprintln!("storage initialization error: {error}");
            process::exit(2);
        }),
    );
    let registry = Arc::new(DispatchRegistry::new(app_config.dispatch.topic_capacity));
    logger.log(
        LogLevel::Info,
        Some("main::storage"),
        "Job storage and dispatch registry ready",
        Some(json!({
            "data_path": storage.data_path().display().to_string(),
            "topic_capacity": registry.capacity(),
            "remove_on_ack": app_config.storage.remove_on_ack
        })),
    );

    let session_context = Arc::new(SessionContext {
        registry: Arc::clone(&registry),
        storage: Arc::clone(&storage),
        logger: logger.clone(),
        timeouts: SessionTimeouts::from_config(&app_config.server),
        remove_on_ack: app_config.storage.remove_on_ack,
    });
    let server = WorkerServer::bind(&app_config.server, session_context).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let worker_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} accepting workers",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": worker_addr.to_string(),
            "protocol": wire::PROTOCOL_VERSION,
            "max_workers": app_config.server.max_workers,
            "dispatch_deadline_ms": app_config.server.dispatch_deadline_ms,
            "pong_extension_ms": app_config.server.pong_extension_ms
        })),
    );

    // The store scan must finish before the ingestion endpoint accepts jobs.
    let recovery = spawn_recovery(&storage, Arc::clone(&registry), logger.clone())
        .unwrap_or_else(|error| {
            eprintln!("recovery startup error: {error}");
            process::exit(2);
        });

    let http_address = format!("{}:{}", app_config.ingest.host, app_config.ingest.port);
    let http_listener = TcpListener::bind(&http_address).unwrap_or_else(|error| {
        eprintln!("ingestion startup error: failed to bind {http_address}: {error}");
        process::exit(2);
    });

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let ingest_state = Arc::new(IngestState {
        storage: Arc::clone(&storage),
        registry: Arc::clone(&registry),
        logger: logger.clone(),
        config: app_config.ingest.clone(),
    });
    let http_server = spawn_http_server(http_listener, ingest_state, shutdown_hooks.signal())
        .unwrap_or_else(|error| {
            eprintln!("ingestion startup error: {error}");
            process::exit(2);
        });
    logger.log(
        LogLevel::Info,
        Some("main::ingest"),
        "HTTP ingestion endpoint started",
        Some(json!({
            "bind_address": http_address,
            "prefix": app_config.ingest.prefix,
            "health_path": app_config.ingest.health_path
        })),
    );

    let mut heartbeat = Heartbeat::new(Arc::clone(&registry), logger.clone(), app_config.heartbeat)
        .unwrap_or_else(|error| {
            eprintln!("heartbeat configuration error: {error}");
            process::exit(2);
        });
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat initialized",
        Some(heartbeat.initial_metadata_payload()),
    );
    if let Err(error) = heartbeat.start() {
        eprintln!("heartbeat startup error: {error}");
        process::exit(2);
    }

    server.serve_until(&shutdown_hooks.signal());

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    registry.close();
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Closing worker sessions",
        Some(json!({ "active_sessions": server.active_sessions() })),
    );
    server.shutdown_all_sessions();
    if let Err(error) = heartbeat.stop() {
        logger.warn(Some("main::shutdown"), &error.to_string());
    }

    match http_server.join() {
        Ok(Ok(())) => logger.info(Some("main::shutdown"), "HTTP ingestion endpoint stopped"),
        Ok(Err(error)) => logger.error(
            Some("main::shutdown"),
            &format!("HTTP ingestion endpoint failed: {error}"),
        ),
        Err(_) => logger.error(Some("main::shutdown"), "HTTP ingestion thread panicked"),
    }
    if recovery.join().is_err() {
        logger.error(Some("main::shutdown"), "recovery thread panicked");
    }

    if let Err(error) = storage.flush() {
        eprintln!("storage flush error during shutdown: {error}");
        process::exit(2);
    }
    logger.info(
        Some("main::shutdown"),
        "Worker server stopped and shutdown completed",
    );
}

fn load_config_or_exit(args: Vec<String>) -> AppConfig {
    match AppConfig::load_with_discovery(args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: hfast-queue is intended for POSIX systems");
        process::exit(2);
    }
}

/// `hfast-queue sign <secret> <topic>` prints the hash callers put in the
/// ingestion path.
fn print_topic_signature_or_exit(args: &[String]) {
    let [secret, topic] = args else {
        eprintln!("usage: {} sign <secret> <topic>", env!("CARGO_PKG_NAME"));
        process::exit(2);
    };

    match topic_signature(secret, topic) {
        Ok(hash) => println!("{hash}"),
        Err(error) => {
            eprintln!("signature error: {error}");
            process::exit(2);
        }
    }
}
