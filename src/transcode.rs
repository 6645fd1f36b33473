use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::artifact::{facts, ArtifactKind, Item};
use crate::config::Config;
use crate::error::TaskError;
use crate::services::{self, ProcessRunner};
use crate::session::SessionContext;

/// Inputs of one audio extraction.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub video: PathBuf,
    pub image: PathBuf,
    pub destination: PathBuf,
    pub title: String,
    pub artist: String,
    pub id: String,
}

impl TranscodeJob {
    pub fn for_item(item: &Item) -> Self {
        Self {
            video: item.path(ArtifactKind::Video),
            image: item.path(ArtifactKind::Image),
            destination: item.path(ArtifactKind::Audio),
            title: item.title.clone(),
            artist: item.artist.clone(),
            id: item.id.clone(),
        }
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into()];
        args.extend(["-i".into(), self.video.clone().into_os_string()]);
        args.extend(["-i".into(), self.image.clone().into_os_string()]);

        #[rustfmt::skip]
        args.extend([
            "-map", "0",
            "-map", "1",
        ].map(OsString::from));

        args.extend([
            "-metadata".into(),
            format!("title={}", self.title).into(),
            "-metadata".into(),
            format!("artist={}", self.artist).into(),
            "-metadata".into(),
            format!("track={}", self.id).into(),
        ]);
        args.push(self.destination.clone().into_os_string());
        args
    }
}

/// Muxes a downloaded video's audio with its cover image.
pub struct TranscodePipeline {
    ffmpeg: PathBuf,
    retry_ceiling: u32,
    runner: Arc<dyn ProcessRunner>,
}

impl TranscodePipeline {
    pub fn new(config: &Config, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            retry_ceiling: config.retry_ceiling,
            runner,
        }
    }

    /// Attempt the tool up to the retry ceiling. Cancelling the session stops
    /// a running attempt.
    async fn attempt(&self, ctx: &SessionContext, job: &TranscodeJob) -> Result<u32, TaskError> {
        let args = job.args();
        let mut attempt = 0;
        loop {
            if ctx.branch.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let runner = self.runner.as_ref();
            let run = services::run_cancellable(runner, &ctx.branch, &self.ffmpeg, &args);
            let err = match run.await {
                Ok(out) if out.success => return Ok(attempt + 1),
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Ok(out) => TaskError::tool(
                    self.ffmpeg.display().to_string(),
                    out.stderr.lines().last().unwrap_or("non-zero exit").to_string(),
                ),
                Err(e) => e,
            };
            if attempt >= self.retry_ceiling {
                return Err(err);
            }
            attempt += 1;
            warn!(attempt, max = self.retry_ceiling, "transcode failed, retrying: {err}");
        }
    }

    /// Wait for the video and the image, produce the audio artifact and
    /// publish the outcome. "done" is published even on failure so nothing
    /// downstream waits for the full rendezvous ceiling.
    #[tracing::instrument(skip_all, fields(session = %ctx.id, path = %job.destination.display()))]
    pub async fn run(&self, ctx: &SessionContext, job: TranscodeJob) -> bool {
        let video_ready: bool = ctx.branch.get(&ctx.id, &facts::ready(&job.video)).await;
        let image_ready: bool = ctx.branch.get(&ctx.id, &facts::ready(&job.image)).await;
        if ctx.branch.is_cancelled() {
            return false;
        }

        let ok = if !(video_ready && image_ready && job.video.exists() && job.image.exists()) {
            warn!(video_ready, image_ready, "inputs missing, skipping transcode");
            false
        } else {
            if job.destination.exists() {
                if let Err(e) = tokio::fs::remove_file(&job.destination).await {
                    debug!("could not remove stale output: {e}");
                }
            }
            let started = Instant::now();
            match self.attempt(ctx, &job).await {
                Ok(attempts) => {
                    info!(attempts, "transcoded");
                    if ctx.config.debug {
                        debug!(elapsed = ?started.elapsed(), "transcode finished");
                    }
                    true
                }
                Err(TaskError::Cancelled) => return false,
                Err(e) => {
                    warn!("giving up on transcode: {e}");
                    false
                }
            }
        };

        ctx.branch.put(&ctx.id, &facts::ready(&job.destination), ok);
        ctx.branch.put(&ctx.id, &facts::done(&job.destination), true);
        ok
    }
}
