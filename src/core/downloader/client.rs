use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, RANGE};
use reqwest::{Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::config::{EngineConfig, RetryPolicy};
use crate::core::error::{LauncherError, LauncherResult};
use crate::core::progress::{format_speed, ProgressSink, Stage, TransferStats};

const PART_SUFFIX: &str = ".part";

/// Resumable, retrying single-file downloader.
///
/// Data lands in `<dest>.part` and is renamed over `dest` only once the
/// transfer completed. Checksums are a separate step, see [`verify_sha256`].
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    retry: RetryPolicy,
    progress_interval: Duration,
}

impl Downloader {
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            retry: config.download_retry.clone(),
            progress_interval: config.progress_interval(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    // ── Single file download ────────────────────────────

    /// Download `url` to `dest`, resuming a previous `.part` when the server
    /// allows it and retrying transient failures with backoff.
    #[instrument(skip(self, progress, cancel), fields(dest = %dest.display()))]
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        stage: Stage,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LauncherError::io(parent, source))?;
        }

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let delay = self.retry.delay_for(attempt);
            if !delay.is_zero() {
                progress.report(
                    stage,
                    0.0,
                    &format!("Retrying download ({attempt}/{max_attempts})..."),
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self
                .attempt(url, dest, &file_name, stage, progress, cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(LauncherError::Cancelled) => return Err(LauncherError::Cancelled),
                Err(err) if err.is_transient() => {
                    warn!(
                        "Download of {} failed (attempt {}/{}): {}",
                        url, attempt, max_attempts, err
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error
            .unwrap_or_else(|| LauncherError::Other(format!("download of {url} never started"))))
    }

    /// Reuse `dest` if it already hashes to `expected_sha256`, otherwise
    /// download it and verify.
    pub async fn download_verified(
        &self,
        url: &str,
        dest: &Path,
        expected_sha256: &str,
        stage: Stage,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<()> {
        if dest.exists() {
            match verify_sha256(dest, expected_sha256).await {
                Ok(()) => {
                    progress.report(stage, 100.0, "Using cached file");
                    return Ok(());
                }
                Err(LauncherError::Sha256Mismatch { .. }) => {
                    info!("Cached {:?} is stale, downloading again", dest);
                }
                Err(err) => return Err(err),
            }
        }
        self.download(url, dest, stage, progress, cancel).await?;
        verify_sha256(dest, expected_sha256).await
    }

    async fn attempt(
        &self,
        url: &str,
        dest: &Path,
        file_name: &str,
        stage: Stage,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<()> {
        let part = part_path(dest);
        let mut resume_from = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut response = self.send(url, resume_from, cancel).await?;
        debug!(
            "status={} resume={} length={:?} accept-ranges={:?}",
            response.status(),
            resume_from,
            response.content_length(),
            response.headers().get(ACCEPT_RANGES)
        );

        if resume_from > 0 {
            let status = response.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                debug!("Server rejected range for {}, restarting", url);
                discard_partial(&part).await?;
                resume_from = 0;
                response = self.send(url, 0, cancel).await?;
            } else if status.is_success() && !resume_trusted(&response) {
                debug!("Server did not honor range for {}, restarting", url);
                discard_partial(&part).await?;
                resume_from = 0;
                if status == StatusCode::PARTIAL_CONTENT {
                    // Fragment of unknown provenance; fetch the whole file.
                    response = self.send(url, 0, cancel).await?;
                }
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(LauncherError::DownloadFailed {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = if resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&part)
                .await
        } else {
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&part)
                .await
        }
        .map_err(|source| LauncherError::io(&part, source))?;

        let total = response.content_length().map(|len| len + resume_from);
        let mut stream = response.bytes_stream();
        let mut downloaded = resume_from;
        let mut tick_at = Instant::now();
        let mut tick_bytes = downloaded;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Keep what we have so the next call can resume.
                    let _ = file.flush().await;
                    return Err(LauncherError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = file.flush().await;
                    return Err(err.into());
                }
            };

            file.write_all(&chunk)
                .await
                .map_err(|source| LauncherError::io(&part, source))?;
            downloaded += chunk.len() as u64;

            let elapsed = tick_at.elapsed();
            if elapsed >= self.progress_interval {
                let bytes_per_sec = (downloaded - tick_bytes) as f64 / elapsed.as_secs_f64();
                progress.report_download(
                    stage,
                    total.map(|t| percent_of(downloaded, t)),
                    "Downloading...",
                    TransferStats {
                        current_file: file_name.to_string(),
                        bytes_per_sec,
                        speed: format_speed(bytes_per_sec),
                        downloaded_bytes: downloaded,
                        total_bytes: total,
                    },
                );
                tick_at = Instant::now();
                tick_bytes = downloaded;
            }
        }

        file.flush()
            .await
            .map_err(|source| LauncherError::io(&part, source))?;

        if let Some(expected) = total {
            if downloaded < expected {
                return Err(LauncherError::TruncatedBody {
                    url: url.to_string(),
                    received: downloaded,
                    expected,
                });
            }
        }

        file.sync_all()
            .await
            .map_err(|source| LauncherError::io(&part, source))?;
        drop(file);

        finalize(&part, dest).await?;

        progress.report_download(
            stage,
            Some(100.0),
            "Download complete",
            TransferStats {
                current_file: file_name.to_string(),
                downloaded_bytes: downloaded,
                total_bytes: total.or(Some(downloaded)),
                ..TransferStats::default()
            },
        );
        debug!("Downloaded: {} -> {:?} ({} bytes)", url, dest, downloaded);
        Ok(())
    }

    async fn send(
        &self,
        url: &str,
        resume_from: u64,
        cancel: &CancellationToken,
    ) -> LauncherResult<Response> {
        let mut request = self.client.get(url);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(LauncherError::Cancelled),
            response = request.send() => Ok(response?),
        }
    }
}

/// Path of the in-progress sibling of `dest`.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn resume_trusted(response: &Response) -> bool {
    response.status() == StatusCode::PARTIAL_CONTENT
        && response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false)
}

fn percent_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

async fn discard_partial(part: &Path) -> LauncherResult<()> {
    match tokio::fs::remove_file(part).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LauncherError::io(part, source)),
    }
}

async fn finalize(part: &Path, dest: &Path) -> LauncherResult<()> {
    // Windows refuses to rename over an existing file.
    if cfg!(windows) && dest.exists() {
        tokio::fs::remove_file(dest)
            .await
            .map_err(|source| LauncherError::io(dest, source))?;
    }
    tokio::fs::rename(part, dest)
        .await
        .map_err(|source| LauncherError::io(dest, source))
}

// ── Integrity ───────────────────────────────────────────

/// Hex SHA-256 of a file, hashed off the async runtime.
pub async fn sha256_file(path: &Path) -> LauncherResult<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> LauncherResult<String> {
        use std::io::Read;
        let mut file =
            std::fs::File::open(&owned).map_err(|source| LauncherError::io(&owned, source))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|source| LauncherError::io(&owned, source))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| LauncherError::Other(format!("Task join error: {e}")))?
}

/// Compare a file against its expected digest. A mismatching file is
/// deleted so it can never be mistaken for a cached download.
pub async fn verify_sha256(path: &Path, expected: &str) -> LauncherResult<()> {
    let actual = sha256_file(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        return Ok(());
    }
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!("Failed to delete corrupted file {:?}: {}", path, err);
    }
    Err(LauncherError::Sha256Mismatch {
        path: path.to_path_buf(),
        expected: expected.trim().to_string(),
        actual,
    })
}
