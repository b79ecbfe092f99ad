//! # Companion Voice Backend - Main Application Entry Point
//!
//! Backend for a children's wearable voice assistant. Devices stream a spoken
//! utterance, the server transcribes it, asks a language model for a short
//! structured reply, stores the exchange and answers with an emotion tag,
//! reply text and/or synthesized speech.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **trait objects**: The hosted services sit behind traits so tests can swap them out
//!
//! ## Application Architecture:
//! - **config**: Configuration (TOML file + environment variables)
//! - **state**: Shared application state, metrics and the conversation pipeline
//! - **audio**: Utterance buffering, the device session protocol, WAV wrapping
//! - **conversation**: Validation, storage and the end-to-end pipeline
//! - **transcription / llm / tts**: Hosted speech-to-text, chat and text-to-speech clients
//! - **reply**: Structured reply validation with a fixed fallback
//! - **websocket**: The `/ws/conversation` actor
//! - **handlers / health / middleware**: HTTP surface
//! - **error**: HTTP error responses

mod audio;
mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod llm;
mod middleware;
mod reply;
mod state;
mod transcription;
mod tts;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::conversation::{ConversationPipeline, ConversationStore};
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Opens the conversation database** and creates the schema if needed
/// 4. **Wires the pipeline** to the hosted speech and language services
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Starting companion-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.services.transcription.api_key.is_none() || config.services.llm.api_key.is_none() {
        warn!("GROQ_API_KEY is not set, utterances will fail until it is configured");
    }

    let store = ConversationStore::open(&config.storage.database_path)?;
    info!("Conversation store ready at {}", store.path().display());

    let pipeline = ConversationPipeline::from_config(&config, store)?;
    info!(
        synthesis = pipeline.synthesis_enabled(),
        reuse_window_minutes = config.conversation.reuse_window_minutes,
        "Conversation pipeline ready"
    );

    let app_state = AppState::new(config.clone(), Arc::new(pipeline));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let max_request_bytes = config.performance.max_request_bytes;

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::PayloadConfig::new(max_request_bytes))
            // base64 inflates the PCM by a third
            .app_data(web::JsonConfig::default().limit(max_request_bytes / 3 * 4 + 1024))
            // Middleware executes in reverse order for requests
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/conversation", web::post().to(handlers::converse)),
            )
            .route("/ws/conversation", web::get().to(websocket::conversation_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g. "debug", "companion_voice_backend=trace")
/// - If not set, defaults to "companion_voice_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "companion_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and set the shutdown flag on either.
///
/// If a handler can't be installed the error is logged and the server keeps
/// running; it can still be stopped by the process manager.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
