//! Inbound message model and `/download` command parsing.

use teloxide::types::{ChatId, Message};

/// The only recognised command, including its separating space.
pub const DOWNLOAD_PREFIX: &str = "/download ";

/// Transport-independent view of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Chat the message came from
    pub chat_id: ChatId,
    /// Sender username or first name, if known
    pub sender_name: Option<String>,
    /// Message text; `None` for non-text messages
    pub text: Option<String>,
}

impl IncomingMessage {
    /// Build from a Telegram message.
    #[must_use]
    pub fn from_telegram(msg: &Message) -> Self {
        let sender_name = msg.from.as_ref().and_then(|user| {
            user.username
                .clone()
                .or_else(|| (!user.first_name.is_empty()).then(|| user.first_name.clone()))
        });

        Self {
            chat_id: msg.chat.id,
            sender_name,
            text: msg.text().map(str::to_string),
        }
    }

    /// Sender name for logs.
    #[must_use]
    pub fn sender(&self) -> &str {
        self.sender_name.as_deref().unwrap_or("unknown")
    }
}

/// A validated `/download` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Target URL, passed to the downloader as-is
    pub url: String,
}

impl DownloadRequest {
    /// Parse message text into a request.
    ///
    /// Returns `None` unless the text starts with [`DOWNLOAD_PREFIX`] and
    /// something non-blank follows it. The URL itself is not validated.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let url = text.strip_prefix(DOWNLOAD_PREFIX)?.trim();
        if url.is_empty() {
            return None;
        }
        Some(Self {
            url: url.to_string(),
        })
    }
}
