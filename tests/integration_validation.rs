use anyhow::{anyhow, Result};
use chrono::Utc;
use dotenvy::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};
use ytdlp_blob_bot::bot::handlers::blob_name;
use ytdlp_blob_bot::config::Settings;
use ytdlp_blob_bot::storage::{S3ObjectStore, StorageUploader};

#[tokio::test]
#[ignore = "Requires real credentials"]
async fn test_storage_round_trip() -> Result<()> {
    load_dotenv();
    init_tracing();

    info!("Starting integration test for storage credentials...");
    let settings = Settings::new()?;
    if settings.storage_connection_string.trim().is_empty() {
        return Err(anyhow!("STORAGE_CONNECTION_STRING missing"));
    }
    validate_telegram_token(&settings.bot_token);

    let store = S3ObjectStore::connect(
        &settings.storage_connection_string,
        &settings.storage_container,
    )
    .await?;
    let uploader = StorageUploader::new(Arc::new(store)).await?;
    // Second bootstrap must be a no-op
    uploader.ensure_container().await?;

    let path = std::env::temp_dir().join("ytdlp-blob-bot-integration.mp4");
    tokio::fs::write(&path, b"integration test payload").await?;

    let name = blob_name(&path, Utc::now(), "itest0");
    let asset = uploader
        .upload(&path, &name, &CancellationToken::new())
        .await;
    tokio::fs::remove_file(&path).await?;
    let asset = asset?;

    info!(url = %asset.public_url, "Uploaded test object");
    assert!(asset.public_url.ends_with(&name));
    assert_eq!(asset.blob_name, name);

    info!("Storage validation passed successfully.");
    Ok(())
}

fn load_dotenv() {
    let env_path = Path::new("../.env");
    if env_path.exists() {
        let _ = dotenvy::from_path(env_path);
    } else {
        dotenv().ok();
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn validate_telegram_token(token: &str) {
    let Some((id, secret)) = token.split_once(':') else {
        panic!("BOT_TOKEN must look like <id>:<secret>");
    };
    assert!(id.chars().all(|c| c.is_ascii_digit()), "bot id is not numeric");
    assert!(!secret.is_empty(), "bot secret is empty");
    info!("BOT_TOKEN format looks valid");
}
