//! Cutting oversized artifacts into upload-sized parts.
//!
//! The part count is `ceil(size / limit)` and each part gets an equal share
//! of the probed duration. The segmenter stream-copies, so parts are cut on
//! keyframes and only approximate the target.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::artifact::{facts, ArtifactKind, Item};
use crate::branch::Branch;
use crate::config::Config;
use crate::error::TaskError;
use crate::fsutil;
use crate::services::{self, ProcessRunner};
use crate::session::SessionContext;

pub fn needs_split(size: u64, limit: u64) -> bool {
    limit > 0 && size > limit
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitPlan {
    pub parts: u64,
    pub segment: Duration,
}

impl SplitPlan {
    pub fn new(size: u64, limit: u64, duration: Duration) -> Self {
        let parts = size.div_ceil(limit.max(1)).max(1);
        let segment = duration.div_f64(parts as f64);
        Self { parts, segment }
    }

    /// `-segment_time` value, seconds with millisecond precision.
    pub fn segment_time(&self) -> String {
        format!("{:.3}", self.segment.as_secs_f64())
    }
}

/// Inputs of one split.
#[derive(Debug, Clone)]
pub struct SplitJob {
    pub item: Item,
    pub kind: ArtifactKind,
    pub limit: u64,
}

impl SplitJob {
    pub fn source(&self) -> PathBuf {
        self.item.path(self.kind)
    }
}

pub struct SplitPipeline {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    retry_ceiling: u32,
    runner: Arc<dyn ProcessRunner>,
}

impl SplitPipeline {
    pub fn new(config: &Config, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            retry_ceiling: config.retry_ceiling,
            runner,
        }
    }

    pub async fn probe_duration(
        &self,
        source: &std::path::Path,
        branch: &Branch,
    ) -> Result<Duration, TaskError> {
        #[rustfmt::skip]
        let mut args: Vec<OsString> = [
            "-v", "error",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
        ].map(OsString::from).to_vec();
        args.push(source.as_os_str().to_owned());

        let tool = self.ffprobe.display().to_string();
        let out =
            services::run_cancellable(self.runner.as_ref(), branch, &self.ffprobe, &args).await?;
        if !out.success {
            return Err(TaskError::tool(tool, out.stderr.trim().to_string()));
        }
        let raw = out.stdout.trim();
        let secs: f64 = raw
            .parse()
            .map_err(|e| TaskError::tool(&tool, format!("unreadable duration {raw:?}: {e}")))?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(TaskError::tool(tool, format!("nonsensical duration {secs}")));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    fn segment_args(&self, job: &SplitJob, plan: &SplitPlan) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), job.source().into_os_string()];

        #[rustfmt::skip]
        args.extend([
            "-c", "copy",
            "-map", "0",
        ].map(OsString::from));

        args.extend(["-segment_time".into(), plan.segment_time().into()]);

        #[rustfmt::skip]
        args.extend([
            "-f", "segment",
            "-reset_timestamps", "1",
        ].map(OsString::from));

        args.push(job.item.segment_pattern(job.kind).into_os_string());
        args
    }

    async fn split_once(&self, job: &SplitJob, branch: &Branch) -> Result<SplitPlan, TaskError> {
        let source = job.source();
        let size = tokio::fs::metadata(&source)
            .await
            .map_err(|e| TaskError::io(&source, e))?
            .len();
        let duration = self.probe_duration(&source, branch).await?;
        let plan = SplitPlan::new(size, job.limit, duration);
        debug!(parts = plan.parts, segment = ?plan.segment, "splitting");

        let args = self.segment_args(job, &plan);
        let out =
            services::run_cancellable(self.runner.as_ref(), branch, &self.ffmpeg, &args).await?;
        if !out.success {
            return Err(TaskError::tool(
                self.ffmpeg.display().to_string(),
                out.stderr.lines().last().unwrap_or("non-zero exit").to_string(),
            ));
        }
        Ok(plan)
    }

    /// Split the artifact and return its parts in order, each published as
    /// ready. An empty list means the split did not happen. On success the
    /// unsplit artifact is queued for removal.
    #[tracing::instrument(skip_all, fields(session = %ctx.id, path = %job.source().display()))]
    pub async fn run(&self, ctx: &Arc<SessionContext>, job: SplitJob) -> Vec<PathBuf> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            if ctx.branch.is_cancelled() {
                return Vec::new();
            }
            match self.split_once(&job, &ctx.branch).await {
                Ok(plan) => {
                    info!(parts = plan.parts, "split");
                    break;
                }
                Err(TaskError::Cancelled) => return Vec::new(),
                Err(e) if attempt < self.retry_ceiling => {
                    attempt += 1;
                    warn!(attempt, max = self.retry_ceiling, "split failed, retrying: {e}");
                }
                Err(e) => {
                    warn!("giving up on split: {e}");
                    return Vec::new();
                }
            }
        }
        if ctx.config.debug {
            debug!(elapsed = ?started.elapsed(), "split finished");
        }

        let parts = fsutil::matching_files(
            &ctx.dir,
            &job.item.segment_prefix(),
            job.kind.extension(),
        );
        for part in &parts {
            ctx.branch.put(&ctx.id, &facts::ready(part), true);
        }

        if !ctx.config.debug && !parts.is_empty() {
            let mut doomed = vec![job.source()];
            if !ctx.settings.image {
                doomed.push(job.item.path(ArtifactKind::Image));
            }
            let unit_ctx = ctx.clone();
            ctx.scheduler
                .submit(&ctx.branch, "cleanup", doomed, move |doomed| async move {
                    cleanup(&unit_ctx, doomed).await
                })
                .await;
        }
        parts
    }
}

/// Remove artifacts made redundant by a split, retrying while something
/// still holds them.
async fn cleanup(ctx: &SessionContext, doomed: Vec<PathBuf>) {
    for path in doomed {
        let removed = fsutil::remove_with_retry(
            &path,
            ctx.config.delete_interval,
            ctx.config.delete_timeout,
            Some(&ctx.branch),
        )
        .await;
        debug!(path = %path.display(), removed, "cleanup");
    }
}
