//! Single-file network-to-disk transfer.
//!
//! The body is streamed into `<destination>.part` and renamed into place
//! only after the last byte is flushed. Any failure removes the part file,
//! so the canonical path is either absent or complete.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, LAST_MODIFIED};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    /// The destination already existed; nothing was downloaded.
    pub skipped: bool,
}

/// Result of a best-effort HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub size_bytes: Option<u64>,
    pub last_modified: Option<String>,
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    progress_interval: Duration,
}

impl Fetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Build a client with a connect timeout; falls back to the default
    /// client if the builder fails.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("fetcher: falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self::new(client)
    }

    /// Download `remote_url` to `destination`.
    ///
    /// `on_progress` receives fractions in `0.0..=1.0`, throttled to the
    /// configured interval. Without a usable `Content-Length` only the
    /// terminal `1.0` is reported.
    pub async fn fetch<F>(
        &self,
        remote_url: &str,
        destination: &Path,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError>
    where
        F: FnMut(f32) + Send,
    {
        if tokio::fs::try_exists(destination).await.unwrap_or(false) {
            debug!("fetcher: {} already present, skipping", destination.display());
            on_progress(1.0);
            return Ok(FetchOutcome {
                bytes_written: 0,
                skipped: true,
            });
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(FetchError::from_io)?;
        }

        let part = part_path(destination);
        let result = self
            .stream_to_part(remote_url, &part, &mut on_progress, cancel)
            .await;

        let bytes_written = match result {
            Ok(n) => n,
            Err(e) => {
                discard_part(&part).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&part, destination).await {
            discard_part(&part).await;
            return Err(FetchError::from_io(e));
        }

        on_progress(1.0);
        info!(
            "fetcher: {} -> {} ({} bytes)",
            remote_url,
            destination.display(),
            bytes_written
        );
        Ok(FetchOutcome {
            bytes_written,
            skipped: false,
        })
    }

    async fn stream_to_part<F>(
        &self,
        remote_url: &str,
        part: &Path,
        on_progress: &mut F,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError>
    where
        F: FnMut(f32) + Send,
    {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            r = self.client.get(remote_url).send() => r?,
        };

        let status = response.status();
        if !status.is_success() {
            warn!("fetcher: {} returned {}", remote_url, status);
            return Err(FetchError::RemoteNotFound {
                url: remote_url.to_string(),
                status: status.as_u16(),
            });
        }

        let expected = response.content_length().filter(|&n| n > 0);
        debug!(
            "fetcher: GET {} ok, content-length={:?}",
            remote_url, expected
        );

        let file = tokio::fs::File::create(part)
            .await
            .map_err(FetchError::from_io)?;
        let mut writer = tokio::io::BufWriter::with_capacity(64 * 1024, file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut last_report = Instant::now();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(FetchError::from_io)?;
            written += chunk.len() as u64;

            if let Some(total) = expected {
                if last_report.elapsed() >= self.progress_interval {
                    last_report = Instant::now();
                    on_progress((written as f64 / total as f64).min(1.0) as f32);
                }
            }
        }

        writer.flush().await.map_err(FetchError::from_io)?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(FetchError::from_io)?;

        if let Some(total) = expected {
            if written < total {
                return Err(FetchError::NetworkUnavailable(format!(
                    "body ended after {} of {} bytes",
                    written, total
                )));
            }
        }
        Ok(written)
    }

    /// Best-effort HEAD. `None` on any failure or non-2xx; that says nothing
    /// about whether a GET would succeed.
    pub async fn probe(&self, remote_url: &str) -> Option<RemoteInfo> {
        let response = match self.client.head(remote_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("fetcher: HEAD {} failed: {}", remote_url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("fetcher: HEAD {} returned {}", remote_url, response.status());
            return None;
        }
        let headers = response.headers();
        let size_bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Some(RemoteInfo {
            size_bytes,
            last_modified,
        })
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

/// `<destination>.part`, next to the destination so the final rename never
/// crosses a filesystem boundary.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

async fn discard_part(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => debug!("fetcher: removed partial file {}", part.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "fetcher: failed to remove partial file {}: {}",
            part.display(),
            e
        ),
    }
}
