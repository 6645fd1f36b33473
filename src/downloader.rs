//! Range-based transfer with whole-transfer retries.
//!
//! A transfer walks the resource in fixed-size byte ranges, pushing every
//! chunk through a [`CountingWriter`] so the status record can follow along.
//! It ends when the server answers `416 Range Not Satisfiable` or when the
//! known length has been reached. Any failure restarts the transfer from the
//! first byte, up to the retry ceiling.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::artifact::{facts, ArtifactKind};
use crate::branch::Branch;
use crate::config::Config;
use crate::error::TaskError;
use crate::progress::{self, CountingWriter, Progress};
use crate::session::SessionContext;
use crate::thumbnail;

const PROBE_PAUSE: Duration = Duration::from_millis(3);

/// Parameters of one artifact download.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub source: String,
    pub destination: PathBuf,
    pub kind: ArtifactKind,
    /// Shown on the status record.
    pub label: String,
}

pub struct ChunkedDownloader {
    client: Client,
    chunk_size: u64,
    retry_ceiling: u32,
    retry_delay: Duration,
    probe_attempts: u32,
}

impl ChunkedDownloader {
    pub fn new(config: &Config) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            chunk_size: config.chunk_size.max(1),
            retry_ceiling: config.retry_ceiling,
            retry_delay: config.retry_delay,
            probe_attempts: config.probe_attempts.max(1),
        }
    }

    /// Best-effort length discovery. Zero means unknown.
    pub async fn probe_length(&self, url: &str, branch: &Branch) -> u64 {
        for attempt in 1..=self.probe_attempts {
            if branch.is_cancelled() {
                return 0;
            }
            match self.client.head(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let len = header_u64(resp.headers(), CONTENT_LENGTH).filter(|&l| l > 0);
                    if let Some(len) = len {
                        return len;
                    }
                }
                Ok(resp) => debug!(url, attempt, status = %resp.status(), "length probe refused"),
                Err(e) => debug!(url, attempt, "length probe failed: {e}"),
            }
            tokio::time::sleep(PROBE_PAUSE).await;
        }
        0
    }

    /// One pass over the resource. Returns the number of bytes written.
    async fn transfer<W: AsyncWrite + Unpin>(
        &self,
        url: &str,
        writer: &mut W,
        progress: &Progress,
        branch: &Branch,
    ) -> Result<u64, TaskError> {
        let mut offset = 0u64;
        let mut total = progress.total();
        loop {
            if branch.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            if total > 0 && offset >= total {
                break;
            }

            let end = offset + self.chunk_size - 1;
            let mut resp = self
                .client
                .get(url)
                .header(RANGE, format!("bytes={offset}-{end}"))
                .send()
                .await?;

            match resp.status() {
                StatusCode::RANGE_NOT_SATISFIABLE => break,
                StatusCode::PARTIAL_CONTENT => {
                    if total == 0 {
                        if let Some(len) = content_range_total(resp.headers()) {
                            total = len;
                            progress.set_total(len);
                        }
                    }
                    let n = copy_body(&mut resp, writer, branch).await?;
                    if n == 0 {
                        return Err(TaskError::network("fetching range", "empty range response"));
                    }
                    offset += n;
                }
                // The server ignored the range and sent everything.
                status if status.is_success() && offset == 0 => {
                    offset = copy_body(&mut resp, writer, branch).await?;
                    break;
                }
                status if status.is_success() => {
                    return Err(TaskError::network(
                        "fetching range",
                        format!("server stopped honouring ranges at byte {offset}"),
                    ))
                }
                status => return Err(TaskError::from_status(status, url)),
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| TaskError::io(url, e))?;
        Ok(offset)
    }

    /// Run the transfer into a fresh writer from `open` until it succeeds,
    /// fails permanently, is cancelled or exhausts the retry ceiling.
    pub async fn fetch<W, Open, OpenFut>(
        &self,
        url: &str,
        branch: &Branch,
        progress: &Arc<Progress>,
        open: Open,
    ) -> Result<(W, u64), TaskError>
    where
        W: AsyncWrite + Unpin,
        Open: Fn() -> OpenFut,
        OpenFut: Future<Output = Result<W, TaskError>>,
    {
        if progress.total() == 0 {
            progress.set_total(self.probe_length(url, branch).await);
        }

        let mut attempt = 0;
        loop {
            if branch.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            progress.reset();
            let mut writer = CountingWriter::new(open().await?, progress.clone());

            let err = match self.transfer(url, &mut writer, progress, branch).await {
                Ok(written) => return Ok((writer.into_inner(), written)),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= self.retry_ceiling {
                return Err(err);
            }
            attempt += 1;
            warn!(url, attempt, max = self.retry_ceiling, "restarting transfer: {err}");
            tokio::select! {
                _ = branch.cancelled() => return Err(TaskError::Cancelled),
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Download one artifact of a session and publish whether it is usable.
    ///
    /// Thumbnails are decoded and cropped before being stored; if they do not
    /// decode a placeholder is stored instead, so an image always exists
    /// unless the transfer itself failed.
    #[tracing::instrument(skip_all, fields(session = %ctx.id, path = %job.destination.display()))]
    pub async fn download(&self, ctx: &SessionContext, job: DownloadJob) -> bool {
        if ctx.branch.is_cancelled() {
            return false;
        }
        let started = Instant::now();
        let progress = Arc::new(Progress::default());
        let record = status_record(&job);
        let status = progress::spawn_status(
            ctx.services.messages.clone(),
            ctx.branch.clone(),
            ctx.id.clone(),
            record.clone(),
            format!("{} {}", job.label, job.kind),
            progress.clone(),
            ctx.config.status_interval,
        );

        let result = match job.kind {
            ArtifactKind::Image => self.download_image(ctx, &job, &progress).await,
            _ => self.download_file(ctx, &job, &progress).await,
        };
        progress.finish();
        status.abort();
        let _ = status.await;
        ctx.services.messages.delete(&ctx.id, &record);

        let ready = match result {
            Ok(written) => {
                info!(bytes = written, "downloaded");
                true
            }
            Err(TaskError::Cancelled) => {
                debug!("download cancelled");
                false
            }
            Err(e) => {
                warn!("download failed: {e}");
                false
            }
        };
        if ctx.config.debug {
            debug!(elapsed = ?started.elapsed(), "download finished");
        }
        ctx.branch.put(&ctx.id, &facts::ready(&job.destination), ready);
        ctx.branch.put(&ctx.id, &facts::done(&job.destination), true);
        ready
    }

    async fn download_file(
        &self,
        ctx: &SessionContext,
        job: &DownloadJob,
        progress: &Arc<Progress>,
    ) -> Result<u64, TaskError> {
        let dest = job.destination.clone();
        let (_, written) = self
            .fetch(&job.source, &ctx.branch, progress, || {
                let dest = dest.clone();
                async move {
                    let file = tokio::fs::File::create(&dest)
                        .await
                        .map_err(|e| TaskError::io(&dest, e))?;
                    Ok(BufWriter::new(file))
                }
            })
            .await?;
        Ok(written)
    }

    async fn download_image(
        &self,
        ctx: &SessionContext,
        job: &DownloadJob,
        progress: &Arc<Progress>,
    ) -> Result<u64, TaskError> {
        let bytes = match self
            .fetch(&job.source, &ctx.branch, progress, || async {
                Ok(Vec::<u8>::new())
            })
            .await
        {
            Ok((bytes, _)) => bytes,
            Err(TaskError::PermanentContent { reason, .. }) => {
                debug!("thumbnail unavailable ({reason}), using placeholder");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let (jpeg, substituted) = thumbnail::process(&bytes)?;
        if substituted {
            info!("thumbnail did not decode, stored placeholder");
        }
        tokio::fs::write(&job.destination, &jpeg)
            .await
            .map_err(|e| TaskError::io(&job.destination, e))?;
        Ok(jpeg.len() as u64)
    }
}

fn status_record(job: &DownloadJob) -> String {
    job.destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| job.label.clone())
}

async fn copy_body<W: AsyncWrite + Unpin>(
    resp: &mut reqwest::Response,
    writer: &mut W,
    branch: &Branch,
) -> Result<u64, TaskError> {
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        if branch.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TaskError::io("<download sink>", e))?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Total size from `Content-Range: bytes 0-99/1234`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
