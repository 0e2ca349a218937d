//! The `/download` pipeline: acknowledge, download, upload, reply, clean up.
//!
//! Every inbound message runs through [`DownloadPipeline::handle`] in its own
//! task. Failures never leave that call: downloader and storage errors become
//! chat replies, transport errors become log lines.

use crate::bot::command::{DownloadRequest, IncomingMessage};
use crate::bot::transport::ChatTransport;
use crate::downloader::{DownloadError, MediaDownloader};
use crate::storage::{StorageError, StorageUploader};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teloxide::types::ChatId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Acknowledgment sent before the download starts.
pub const ACK_TEXT: &str = "⏳ Downloading...";

/// Telegram caps messages at 4096 characters; keep a margin.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

/// How a single message was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not a download command; nothing was sent
    Ignored,
    /// The file was uploaded and the link sent
    Delivered {
        /// Public URL sent to the chat
        url: String,
    },
    /// The downloader failed; its error was sent to the chat
    DownloadFailed,
    /// The upload failed; the error was sent to the chat
    UploadFailed,
    /// Shutdown interrupted the pipeline
    Cancelled,
    /// A reply could not be delivered; logged only
    Aborted,
}

/// Services shared by all handler invocations. Immutable after construction.
pub struct DownloadPipeline {
    transport: Arc<dyn ChatTransport>,
    downloader: Arc<dyn MediaDownloader>,
    uploader: Arc<StorageUploader>,
}

impl DownloadPipeline {
    /// Bundle the services a handler needs.
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        downloader: Arc<dyn MediaDownloader>,
        uploader: Arc<StorageUploader>,
    ) -> Self {
        Self {
            transport,
            downloader,
            uploader,
        }
    }

    /// Handle one inbound message end to end.
    pub async fn handle(
        &self,
        incoming: IncomingMessage,
        cancellation_token: CancellationToken,
    ) -> Outcome {
        let Some(text) = incoming.text.as_deref() else {
            debug!(chat_id = %incoming.chat_id, "Ignoring non-text message");
            return Outcome::Ignored;
        };

        info!(
            chat_id = %incoming.chat_id,
            sender = %incoming.sender(),
            "Received message: '{text}'"
        );

        let Some(request) = DownloadRequest::parse(text) else {
            debug!(chat_id = %incoming.chat_id, "Ignoring message that's not a download command");
            return Outcome::Ignored;
        };

        match self
            .process(incoming.chat_id, &request, &cancellation_token)
            .await
        {
            Ok(outcome) => outcome,
            Err(_) if cancellation_token.is_cancelled() => {
                info!(chat_id = %incoming.chat_id, "Request interrupted by shutdown");
                Outcome::Cancelled
            }
            Err(e) => {
                error!(chat_id = %incoming.chat_id, url = %request.url, "Request failed: {e:#}");
                Outcome::Aborted
            }
        }
    }

    async fn process(
        &self,
        chat_id: ChatId,
        request: &DownloadRequest,
        cancellation_token: &CancellationToken,
    ) -> Result<Outcome> {
        info!(chat_id = %chat_id, url = %request.url, "Processing download request");
        self.reply(chat_id, ACK_TEXT.to_string(), cancellation_token)
            .await?;

        let path = match self
            .downloader
            .download(&request.url, cancellation_token)
            .await
        {
            Ok(path) => path,
            Err(DownloadError::Cancelled) => return Ok(Outcome::Cancelled),
            Err(e) => {
                warn!(chat_id = %chat_id, url = %request.url, "❌ Download failed: {e}");
                self.reply(chat_id, download_failed_text(&e), cancellation_token)
                    .await?;
                return Ok(Outcome::DownloadFailed);
            }
        };

        // Removed on every exit path from here on
        let file = DownloadedFile::new(path);
        info!(path = %file.path().display(), "✅ Download completed");

        let blob_name = blob_name(file.path(), Utc::now(), &short_token());
        match self
            .uploader
            .upload(file.path(), &blob_name, cancellation_token)
            .await
        {
            Ok(asset) => {
                info!(blob_name = %asset.blob_name, url = %asset.public_url, "Upload complete");
                self.reply(chat_id, delivered_text(&asset.public_url), cancellation_token)
                    .await?;
                Ok(Outcome::Delivered {
                    url: asset.public_url,
                })
            }
            Err(StorageError::Cancelled) => Ok(Outcome::Cancelled),
            Err(e) => {
                error!(chat_id = %chat_id, blob_name = %blob_name, "Upload failed: {e}");
                self.reply(chat_id, format!("❌ Upload failed: {e}"), cancellation_token)
                    .await?;
                Ok(Outcome::UploadFailed)
            }
        }
    }

    async fn reply(
        &self,
        chat_id: ChatId,
        text: String,
        cancellation_token: &CancellationToken,
    ) -> Result<()> {
        cancellation_token
            .run_until_cancelled(self.transport.send_text(chat_id, text))
            .await
            .ok_or_else(|| anyhow!("reply cancelled"))?
    }
}

/// Local download, deleted when dropped.
///
/// Deletion failures are logged and otherwise ignored.
struct DownloadedFile {
    path: PathBuf,
}

impl DownloadedFile {
    const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DownloadedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Local file deleted"),
            Err(e) => warn!(path = %self.path.display(), "Failed to delete local file: {e}"),
        }
    }
}

/// Object name for an upload: `<YYYYMMDDHHMMSS>-<token><ext>`.
///
/// The token keeps two uploads within the same second apart.
#[must_use]
pub fn blob_name(path: &Path, now: DateTime<Utc>, token: &str) -> String {
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    format!("{}-{token}{extension}", now.format("%Y%m%d%H%M%S"))
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string().chars().take(6).collect()
}

fn download_failed_text(err: &DownloadError) -> String {
    truncate_chars(&format!("❌ Download failed:\n{err}"), TELEGRAM_MESSAGE_LIMIT)
}

fn delivered_text(url: &str) -> String {
    format!("✅ Here's your video: {url}")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
