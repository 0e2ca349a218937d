#![deny(missing_docs)]
//! Telegram bot that fetches media with yt-dlp and publishes it to object storage.
//!
//! A `/download <url>` message runs the downloader, uploads the produced file
//! to a public container and replies with the resulting link.

/// Telegram-facing command parsing, transport and message handling.
pub mod bot;
/// Configuration and settings management.
pub mod config;
/// yt-dlp process wrapper.
pub mod downloader;
/// Log output setup with secret redaction.
pub mod logging;
/// Bot startup, dispatch and shutdown.
pub mod runner;
/// Object storage layer (S3 compatible).
pub mod storage;
