use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::io::StreamReader;

use crate::download::copy::{idle_timeout_copy, CopyOptions, ProgressFn};
use crate::error::CoreError;
use crate::models::syncing_file::open_sparse_file;

/// Abstract source of bytes-from-URL (design document section 4.1). A
/// trait object so the mock variant can stand in for deterministic tests
/// without touching the network, the way the teacher crate keeps transport
/// concerns behind a registry/handler boundary rather than hard-wiring a
/// single implementation.
#[async_trait]
pub trait DownloadHandler: Send + Sync {
    /// Issues a HEAD request. Returns `-1` if the server omits
    /// `Content-Length`. Fails on any non-200 response or transport error.
    async fn size_of_url(&self, url: &str) -> Result<i64, CoreError>;

    /// Issues a GET, streams through the idle-timeout copy pump into
    /// `path`, and truncates to the exact number of bytes written.
    async fn download_to_file(
        &self,
        url: &str,
        path: &Path,
        size_hint: u64,
        idle_timeout: Duration,
        buffer_size: usize,
        progress: Option<ProgressFn>,
    ) -> Result<u64, CoreError>;
}

/// Real HTTP-backed handler. Strips the `Referer` header across redirects
/// (needed for CDN-fronted origins per design document section 4.1).
pub struct HttpDownloadHandler {
    client: reqwest::Client,
    head_timeout: Duration,
}

impl HttpDownloadHandler {
    pub fn new(head_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            // Disables the auto-Referer-on-redirect behavior (design
            // document section 4.1 — needed for CDN-fronted origins that
            // reject a stale Referer from the original request).
            .referer(false)
            .build()
            .expect("failed to build reqwest client");
        Self { client, head_timeout }
    }
}

#[async_trait]
impl DownloadHandler for HttpDownloadHandler {
    async fn size_of_url(&self, url: &str) -> Result<i64, CoreError> {
        let resp = tokio::time::timeout(self.head_timeout, self.client.head(url).send())
            .await
            .map_err(|_| CoreError::SourceError(format!("HEAD {url} timed out")))?
            .map_err(|e| CoreError::SourceError(format!("HEAD {url} failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::SourceError(format!(
                "HEAD {url} returned {}",
                resp.status()
            )));
        }

        Ok(resp
            .content_length()
            .map(|l| l as i64)
            .unwrap_or(-1))
    }

    async fn download_to_file(
        &self,
        url: &str,
        path: &Path,
        size_hint: u64,
        idle_timeout: Duration,
        buffer_size: usize,
        progress: Option<ProgressFn>,
    ) -> Result<u64, CoreError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::SourceError(format!("GET {url} failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::SourceError(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }

        let stream = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let mut reader = StreamReader::new(stream);

        let mut file = open_sparse_file(path, size_hint).await?;
        let opts = CopyOptions {
            buffer_size,
            idle_timeout,
            write_zero: false,
        };
        let written = idle_timeout_copy(&mut reader, &mut file, &opts, progress.as_ref()).await?;
        file.set_len(written).await?;
        Ok(written)
    }
}

/// Deterministic test double: produces a fixed-size file of zero bytes with
/// synthetic progress ticks spaced 50ms apart, regardless of `url`.
pub struct MockDownloadHandler {
    pub size: u64,
}

#[async_trait]
impl DownloadHandler for MockDownloadHandler {
    async fn size_of_url(&self, _url: &str) -> Result<i64, CoreError> {
        Ok(self.size as i64)
    }

    async fn download_to_file(
        &self,
        _url: &str,
        path: &Path,
        _size_hint: u64,
        _idle_timeout: Duration,
        buffer_size: usize,
        progress: Option<ProgressFn>,
    ) -> Result<u64, CoreError> {
        let mut file = open_sparse_file(path, self.size).await?;
        let mut written: u64 = 0;
        let chunk = buffer_size.min(self.size as usize).max(1);
        let zeros = vec![0u8; chunk];
        use tokio::io::AsyncWriteExt;
        while written < self.size {
            let n = (self.size - written).min(chunk as u64) as usize;
            file.write_all(&zeros[..n]).await?;
            written += n as u64;
            if let Some(cb) = &progress {
                cb(written);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        file.flush().await?;
        Ok(written)
    }
}
