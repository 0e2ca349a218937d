use dotenvy::dotenv;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ytdlp_blob_bot::config::Settings;
use ytdlp_blob_bot::logging::{init_logging, RedactionPatterns};
use ytdlp_blob_bot::runner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);

    init_logging(patterns);

    info!("Starting ytdlp-blob-bot...");

    let Some(settings) = init_settings() else {
        return Ok(());
    };

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    if let Err(e) = runner::run_bot(settings, shutdown).await {
        error!("{e:#}");
    }

    Ok(())
}

fn init_settings() -> Option<Arc<Settings>> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Some(Arc::new(s))
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {e}");
            }
            return;
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for Ctrl+C: {e}");
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {e}");
    }
}
