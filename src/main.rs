use std::process;
use std::sync::Arc;
use std::time::Duration;

use obelisk::config::AppConfig;
use obelisk::logging::{LogLevel, Logger, LoggerConfig};
use obelisk::shutdown::ShutdownHooks;
use obelisk::utils::runtime::ensure_posix_or_exit;
use obelisk::utils::startup_banner::print_startup_banner;
use obelisk::{IncomingMessage, OutgoingMessage, QueueSendCallback, RequestWorker, WorkerConfig};
use serde_json::json;

const SHUTDOWN_POLL_INTERVAL_MS: u64 = 100;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::from_app_config(&app_config).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let worker_config = WorkerConfig::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("worker configuration error: {error}");
        process::exit(2);
    });

    let mut worker = RequestWorker::new(Arc::clone(&logger));
    attach_builtin_commands(&mut worker);

    if let Err(error) = worker.start(&worker_config) {
        eprintln!("worker startup error: {error}");
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::worker"),
        &format!(
            "{} v{} serving requests",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": worker.local_addr().map(|addr| addr.to_string()),
            "heartbeat_address": worker.heartbeat_addr().map(|addr| addr.to_string()),
            "auth_enabled": app_config.auth.enabled,
            "max_frame_size_bytes": worker_config.codec.max_frame_size_bytes()
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM/SIGQUIT",
    );

    shutdown_hooks.wait(Duration::from_millis(SHUTDOWN_POLL_INTERVAL_MS));

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, stopping request worker",
    );
    if let Err(error) = worker.stop() {
        eprintln!("worker shutdown error: {error}");
        process::exit(2);
    }
    logger.info(Some("main::shutdown"), "Shutdown completed");
}

fn attach_builtin_commands(worker: &mut RequestWorker) {
    let attached = worker
        .attach("ping", |request: &IncomingMessage, send: QueueSendCallback| {
            send(OutgoingMessage::reply_to(request, b"pong".to_vec()));
        })
        .and_then(|()| {
            worker.attach("echo", |request: &IncomingMessage, send: QueueSendCallback| {
                send(OutgoingMessage::reply_to(request, request.payload.clone()));
            })
        });

    if let Err(error) = attached {
        eprintln!("failed to register built-in commands: {error}");
        process::exit(2);
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("config load error: {error}");
            process::exit(2);
        }
    }
}
