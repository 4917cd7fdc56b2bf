//! Inbound media storage.
//!
//! Downloaded media lands in a local directory keyed by
//! `{session_id}_{unix_ts}_{message_id}.{ext}` and is exposed through a
//! time-limited URL. The HTTP front-end enforces the expiry; the core only
//! produces the filename and the deadline.

use crate::config::MediaConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// A stored media file plus its expiring URL.
#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub file: String,
    pub url: String,
    pub expires_at: i64,
}

pub struct MediaStore {
    dir: PathBuf,
    url_ttl: Duration,
}

impl MediaStore {
    pub fn new(config: &MediaConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)
            .with_context(|| format!("failed to create media dir {}", config.directory.display()))?;
        Ok(Self {
            dir: config.directory.clone(),
            url_ttl: Duration::from_secs(config.url_ttl_minutes * 60),
        })
    }

    /// Write inbound media bytes and return the expiring URL for it.
    pub async fn store_inbound(
        &self,
        session_id: &str,
        message_id: &str,
        mimetype: &str,
        bytes: &[u8],
    ) -> Result<StoredMedia> {
        let now = chrono::Utc::now().timestamp();
        let file = media_filename(session_id, now, message_id, mimetype);
        let path = self.dir.join(&file);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write media file {}", path.display()))?;

        let expires_at = now + self.url_ttl.as_secs() as i64;
        Ok(StoredMedia {
            url: temp_url(&file, expires_at),
            file,
            expires_at,
        })
    }

    pub fn path_for(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

/// `/api/media/temp/{file}?expires={unix}`
pub fn temp_url(file: &str, expires_at: i64) -> String {
    format!("/api/media/temp/{file}?expires={expires_at}")
}

/// `{session_id}_{unix_ts}_{message_id}.{ext}` with the message id reduced
/// to filesystem-safe characters.
pub fn media_filename(session_id: &str, unix_ts: i64, message_id: &str, mimetype: &str) -> String {
    let safe_id: String = message_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!(
        "{session_id}_{unix_ts}_{safe_id}.{}",
        ext_for_mimetype(mimetype)
    )
}

fn ext_for_mimetype(mimetype: &str) -> &'static str {
    match mimetype.split(';').next().unwrap_or(mimetype).trim() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "audio/ogg" | "audio/ogg; codecs=opus" => "ogg",
        "audio/mpeg" => "mp3",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}
