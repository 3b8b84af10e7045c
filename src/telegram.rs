//! Delivery transport: uploads merged artifacts to a Telegram chat through
//! the Bot API (`POST /bot<token>/sendVideo`).

use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Uploads of large files get far more time than playlist requests.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Every variant is retryable from the caller's point of view.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Server returned an unsuccessful status code: {status} {body}")]
    Unsuccessful { status: StatusCode, body: String },
}

/// Delivery surface the tracker drives.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload_file(&self, path: &Path, caption: &str) -> Result<(), UploadError>;
}

/// Telegram Bot API target.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot API root, `https://api.telegram.org` unless a local server is used.
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
}

pub struct TelegramUploader {
    config: TelegramConfig,
    client: Client,
}

impl TelegramUploader {
    pub fn new(config: TelegramConfig) -> Result<Self, UploadError> {
        let client = Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendVideo",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }
}

#[async_trait]
impl Uploader for TelegramUploader {
    async fn upload_file(&self, path: &Path, caption: &str) -> Result<(), UploadError> {
        let data = tokio::fs::read(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| caption.to_string());
        debug!("Uploading {} ({} bytes) to chat {}", file_name, data.len(), self.config.chat_id);

        let video = Part::bytes(data).file_name(file_name).mime_str("video/mp4")?;
        let form = Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .text("caption", caption.to_string())
            .text("supports_streaming", "true")
            .part("video", video);

        // the request URL carries the bot token; keep it out of error messages
        let response = self
            .client
            .post(self.endpoint())
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Network(e.without_url()))?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Unsuccessful { status, body })
    }
}
