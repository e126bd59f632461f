//! AELIIA companion (terminal host)
//!
//! Reads commands and messages from stdin. Chat goes through the gated controller; live
//! voice needs a signed-in premium user and the default audio devices.

mod app;

use std::sync::Arc;

use aeliia_core::{
    env_bool, CoreConfig, Dialer, EmergencyProtocol, GeminiService, GenerationService, LogDialer, MockService,
    ProfileStore, SystemDialer,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::Companion;

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[aeliia-companion] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match CoreConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration could not be loaded");
            std::process::exit(2);
        }
    };
    let store = match ProfileStore::open_path(config.storage_dir().join("aeliia_store")) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, path = %config.storage_path, "store could not be opened");
            std::process::exit(2);
        }
    };

    // Real dialing only when asked for; otherwise intents are logged.
    let dialer: Arc<dyn Dialer> = if env_bool("AELIIA_DIAL", false) {
        Arc::new(SystemDialer)
    } else {
        Arc::new(LogDialer::new())
    };
    let emergency = EmergencyProtocol::from_config(dialer, &config);

    let service: Arc<dyn GenerationService> = if config.is_mock() {
        Arc::new(MockService::mirror())
    } else {
        match GeminiService::from_config(&config) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                // Chat stays gated off; the controller reports the missing credential.
                tracing::warn!(error = %e, "generation service unavailable, falling back to mock replies");
                Arc::new(MockService::mirror())
            }
        }
    };

    tracing::info!(
        mode = %config.llm_mode,
        service = service.name(),
        storage_path = %config.storage_path,
        "AELIIA companion started"
    );

    let mut app = Companion::new(config, store, service, emergency);
    app.greet();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !app.handle_line(&line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            },
            signal = app.next_signal() => app.on_signal(signal).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    app.shutdown().await;
}
