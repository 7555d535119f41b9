//! Streaming payload download with progress reporting and incremental
//! digest verification.
//!
//! The digest is fed chunk-by-chunk while streaming, so verification costs
//! no second pass over the file. On a mismatch the destination file is
//! removed; nothing outside the staging area is ever touched here.

use std::path::Path;

use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use modwright_schema::{ChecksumSpec, ModId, ModVersion};

use crate::io::verify::Hasher;
use crate::reporter::Reporter;

/// Errors raised while fetching a payload.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Transport or HTTP status failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The streamed bytes do not match the manifest digest.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Digest the manifest promised.
        expected: String,
        /// Digest actually computed.
        actual: String,
    },
}

/// A single download operation.
#[derive(Debug)]
pub struct DownloadRequest<'a> {
    /// HTTP client (connection pool shared across the session).
    pub client: &'a Client,
    /// Mod the payload belongs to, for progress attribution.
    pub id: &'a ModId,
    /// Version being fetched.
    pub version: &'a ModVersion,
    /// Source URL.
    pub url: &'a str,
    /// Destination file inside the staging area.
    pub dest: &'a Path,
    /// Expected digest; `None` skips verification.
    pub checksum: Option<&'a ChecksumSpec>,
}

impl DownloadRequest<'_> {
    /// Stream the payload to `dest`, reporting fractional progress.
    ///
    /// Returns the computed hex digest when a checksum was requested.
    ///
    /// # Errors
    ///
    /// [`DownloadError::Http`] or [`DownloadError::Io`] on transport and
    /// filesystem failures; [`DownloadError::HashMismatch`] when the
    /// digest differs (the destination file is removed first).
    pub async fn execute(self, reporter: &dyn Reporter) -> Result<Option<String>, DownloadError> {
        let response = self
            .client
            .get(self.url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(self.dest).await?;
        let mut stream = response.bytes_stream();
        let mut hasher = self.checksum.map(|spec| Hasher::new(spec.algorithm));
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            downloaded += chunk.len() as u64;
            let fraction = if total > 0 {
                (downloaded as f64 / total as f64).min(1.0)
            } else {
                0.0
            };
            reporter.progress(self.id, self.version, "downloading", fraction);
        }
        file.flush().await?;
        reporter.progress(self.id, self.version, "downloading", 1.0);

        match (hasher, self.checksum) {
            (Some(hasher), Some(spec)) => {
                let actual = hasher.finalize_hex();
                if spec.matches(&actual) {
                    Ok(Some(actual))
                } else {
                    reporter.failed(self.id, self.version, "checksum mismatch");
                    tokio::fs::remove_file(self.dest).await.ok();
                    Err(DownloadError::HashMismatch {
                        expected: spec.digest.clone(),
                        actual,
                    })
                }
            }
            _ => Ok(None),
        }
    }
}
