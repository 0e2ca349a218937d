//! Configuration and settings management
//!
//! Loads settings from optional config files, a local `.env` file and
//! environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default location of the yt-dlp binary.
pub const DEFAULT_YTDLP_PATH: &str = "/usr/local/bin/yt-dlp";
/// Default location of the ffmpeg binary.
pub const DEFAULT_FFMPEG_PATH: &str = "/usr/local/bin/ffmpeg";
/// Default storage container name.
pub const DEFAULT_STORAGE_CONTAINER: &str = "videos";

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    #[serde(default)]
    pub bot_token: String,

    /// Path to the yt-dlp executable
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,

    /// Path to the ffmpeg executable used by yt-dlp for merging streams
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Object storage connection string, see [`crate::storage::StorageConnection`]
    #[serde(default)]
    pub storage_connection_string: String,

    /// Name of the public container uploads go to
    #[serde(default = "default_storage_container")]
    pub storage_container: String,

    /// Directory yt-dlp writes into. Defaults to the working directory.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

fn default_ytdlp_path() -> String {
    DEFAULT_YTDLP_PATH.to_string()
}

fn default_ffmpeg_path() -> String {
    DEFAULT_FFMPEG_PATH.to_string()
}

fn default_storage_container() -> String {
    DEFAULT_STORAGE_CONTAINER.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            ytdlp_path: default_ytdlp_path(),
            ffmpeg_path: default_ffmpeg_path(),
            storage_connection_string: String::new(),
            storage_container: default_storage_container(),
            download_dir: None,
        }
    }
}

/// Build the layered configuration source.
///
/// Files are optional; environment variables win over file values.
///
/// # Errors
///
/// Returns a `ConfigError` if a present file cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Local overrides, not checked into git
        .add_source(File::with_name("config/local").required(false))
        // UPPER_SNAKE_CASE env vars map onto snake_case keys
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Load settings from files and environment and validate them.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or `BOT_TOKEN` is not set.
    pub fn new() -> Result<Self, ConfigError> {
        let settings: Self = build_config()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check required values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NotFound` when the bot token is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_token.trim().is_empty() {
            return Err(ConfigError::NotFound(
                "BOT_TOKEN is not set. Please configure it in .env or environment variables."
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Directory for downloaded files.
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
