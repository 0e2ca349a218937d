//! Startup sequence and the Telegram receive loop.

use crate::bot::command::IncomingMessage;
use crate::bot::handlers::DownloadPipeline;
use crate::bot::transport::TelegramTransport;
use crate::config::Settings;
use crate::downloader::YtDlp;
use crate::storage::{S3ObjectStore, StorageUploader};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::AllowedUpdate;
use teloxide::update_listeners::Polling;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between stop requests while the dispatcher is still starting.
const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Run the bot until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if storage cannot be prepared or the bot identity
/// cannot be fetched. Nothing after startup is fatal. Cancelling `shutdown`
/// during startup returns `Ok(())` at once.
pub async fn run_bot(settings: Arc<Settings>, shutdown: CancellationToken) -> Result<()> {
    let bot = Bot::new(settings.bot_token.clone());

    let Some(pipeline) = shutdown
        .run_until_cancelled(start_services(&settings, &bot))
        .await
        .transpose()?
    else {
        info!("Bot has been stopped");
        return Ok(());
    };

    let listener = Polling::builder(bot.clone())
        .allowed_updates(vec![AllowedUpdate::Message])
        .build();

    let mut dispatcher = Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![pipeline, shutdown.clone()])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.kind);
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "An error has occurred in the dispatcher",
        ))
        .build();

    let shutdown_token = dispatcher.shutdown_token();
    let watcher = tokio::spawn(stop_when_cancelled(shutdown.clone(), move || {
        shutdown_token.shutdown().is_ok()
    }));

    dispatcher
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    watcher.abort();
    info!("Bot has been stopped");
    Ok(())
}

async fn start_services(settings: &Settings, bot: &Bot) -> Result<Arc<DownloadPipeline>> {
    let downloader = init_downloader(settings).await;
    let uploader = init_storage(settings).await?;

    let pipeline = Arc::new(DownloadPipeline::new(
        Arc::new(TelegramTransport::new(bot.clone())),
        Arc::new(downloader),
        uploader,
    ));

    let me = bot.get_me().await.context("Failed to fetch bot identity")?;
    info!("✅ Bot @{} is up and running.", me.username());
    Ok(pipeline)
}

/// Wait for `shutdown`, then call `request_stop` until the dispatcher
/// accepts. A dispatcher that has not started running yet refuses.
async fn stop_when_cancelled(shutdown: CancellationToken, mut request_stop: impl FnMut() -> bool) {
    shutdown.cancelled().await;
    info!("Shutdown requested, stopping the receive loop...");
    while !request_stop() {
        debug!("Dispatcher not running yet, retrying stop");
        tokio::time::sleep(STOP_RETRY_INTERVAL).await;
    }
}

async fn init_downloader(settings: &Settings) -> YtDlp {
    let downloader = YtDlp::from_settings(settings);
    match downloader.version().await {
        Ok(version) => info!(
            binary = %downloader.binary().display(),
            "yt-dlp {version} ready"
        ),
        Err(e) => warn!(
            binary = %downloader.binary().display(),
            "yt-dlp version check failed: {e}"
        ),
    }
    downloader
}

async fn init_storage(settings: &Settings) -> Result<Arc<StorageUploader>> {
    let store = S3ObjectStore::connect(
        &settings.storage_connection_string,
        &settings.storage_container,
    )
    .await
    .context("Failed to configure object storage")?;

    let uploader = StorageUploader::new(Arc::new(store))
        .await
        .context("Failed to prepare storage container")?;
    info!(container = %uploader.container(), "Storage initialized.");
    Ok(Arc::new(uploader))
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message().endpoint(handle_message)
}

/// Hand the message to its own task so a long download never holds up
/// the dispatcher's per-chat queue.
async fn handle_message(
    msg: Message,
    pipeline: Arc<DownloadPipeline>,
    shutdown: CancellationToken,
) -> Result<(), teloxide::RequestError> {
    let incoming = IncomingMessage::from_telegram(&msg);
    let cancellation_token = shutdown.child_token();

    tokio::spawn(async move {
        let chat_id = incoming.chat_id;
        let outcome = pipeline.handle(incoming, cancellation_token).await;
        debug!(chat_id = %chat_id, outcome = ?outcome, "Message handled");
    });

    respond(())
}
