//! Sessions: one user job, its working directory, branch and scheduler.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::{sanitize, ArtifactKind, Item};
use crate::branch::Branch;
use crate::config::Config;
use crate::downloader::ChunkedDownloader;
use crate::error::TaskError;
use crate::fsutil;
use crate::pipeline;
use crate::scheduler::Scheduler;
use crate::services::{Services, UserSettings};
use crate::split::SplitPipeline;
use crate::transcode::TranscodePipeline;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn dir_name(&self) -> String {
        sanitize(&self.0.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(&s.replace('_', "-")).map(Self)
    }
}

/// What a user asked for.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user: String,
    /// Playlist or item identifiers, looked up in order.
    pub identifiers: Vec<String>,
}

/// Shared state of a running session, handed to every unit.
pub struct SessionContext {
    pub id: SessionId,
    pub user: String,
    pub dir: PathBuf,
    pub branch: Branch,
    pub scheduler: Scheduler,
    pub config: Arc<Config>,
    pub services: Services,
    pub settings: UserSettings,
    pub downloader: Arc<ChunkedDownloader>,
    pub transcoder: TranscodePipeline,
    pub splitter: SplitPipeline,
    results: Mutex<Vec<Item>>,
    delivered: Mutex<Vec<PathBuf>>,
}

impl SessionContext {
    /// Record an item unless an identical one is already part of the session.
    pub fn add_result(&self, item: &Item) -> bool {
        let mut results = self.results.lock();
        if results.iter().any(|known| known.same_as(item)) {
            debug!(id = %item.id, "duplicate item skipped");
            return false;
        }
        results.push(item.clone());
        true
    }

    pub fn record_delivery(&self, path: &Path) {
        self.delivered.lock().push(path.to_path_buf());
    }
}

/// One line of the session manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub num: usize,
    pub id: String,
    pub artist: String,
    pub song: String,
}

/// Results sorted by artist and title, numbered from one.
pub fn manifest(items: &[Item]) -> Vec<ManifestEntry> {
    let mut sorted: Vec<&Item> = items.iter().collect();
    sorted.sort_by(|a, b| (&a.artist, &a.title).cmp(&(&b.artist, &b.title)));
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, item)| ManifestEntry {
            num: i + 1,
            id: item.id.clone(),
            artist: item.artist.clone(),
            song: item.title.clone(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub manifest: Vec<ManifestEntry>,
    pub delivered: Vec<PathBuf>,
    pub cancelled: bool,
}

/// Creates sessions and keeps track of the running ones so they can be
/// cancelled from outside.
pub struct Harvester {
    config: Arc<Config>,
    services: Services,
    downloader: Arc<ChunkedDownloader>,
    root: Branch,
    active: Mutex<HashMap<SessionId, Branch>>,
}

impl Harvester {
    pub fn new(config: Config, services: Services) -> Self {
        let downloader = Arc::new(ChunkedDownloader::new(&config));
        Self::with_downloader(config, services, downloader)
    }

    pub fn with_downloader(
        config: Config,
        services: Services,
        downloader: Arc<ChunkedDownloader>,
    ) -> Self {
        let root = Branch::new(config.rendezvous_timeout);
        Self {
            config: Arc::new(config),
            services,
            downloader,
            root,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn active(&self) -> Vec<SessionId> {
        self.active.lock().keys().cloned().collect()
    }

    /// Cancel one running session. Its `run` call tears it down.
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.active.lock().get(id) {
            Some(branch) => {
                info!(session = %id, "cancelling session");
                branch.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session, running or future.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Run a session to completion with a fresh id.
    pub async fn run(&self, request: SessionRequest) -> Result<SessionReport, TaskError> {
        self.run_as(SessionId::new(), request).await
    }

    /// Run a session under a caller-chosen id, so it can be cancelled while
    /// this call is still pending.
    #[tracing::instrument(skip_all, fields(session = %id, user = %request.user))]
    pub async fn run_as(
        &self,
        id: SessionId,
        request: SessionRequest,
    ) -> Result<SessionReport, TaskError> {
        let started = Instant::now();
        let dir = self.config.work_dir.join(id.dir_name());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TaskError::io(&dir, e))?;

        let branch = self.root.child();
        self.active.lock().insert(id.clone(), branch.clone());

        let settings = UserSettings::load(self.services.preferences.as_ref(), &request.user);
        let ctx = Arc::new(SessionContext {
            id: id.clone(),
            user: request.user.clone(),
            dir: dir.clone(),
            branch: branch.clone(),
            scheduler: Scheduler::new(self.config.max_concurrency, self.config.queue_capacity),
            config: self.config.clone(),
            services: self.services.clone(),
            settings,
            downloader: self.downloader.clone(),
            transcoder: TranscodePipeline::new(&self.config, self.services.processes.clone()),
            splitter: SplitPipeline::new(&self.config, self.services.processes.clone()),
            results: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        });
        info!(dir = %dir.display(), ?settings, "session started");

        for identifier in request.identifiers {
            let unit_ctx = ctx.clone();
            ctx.scheduler
                .submit(&branch, "lookup", identifier, move |identifier| async move {
                    pipeline::lookup(unit_ctx, identifier).await
                })
                .await;
        }
        ctx.scheduler.wait().await;

        let cancelled = branch.is_cancelled();
        let entries = manifest(&ctx.results.lock());
        if !cancelled {
            finish_manifest(&ctx, &entries).await;
        }

        branch.cancel();
        ctx.scheduler.close();
        branch.forget(&id);
        self.active.lock().remove(&id);

        if cancelled || !self.config.debug {
            fsutil::remove_with_retry(
                &dir,
                self.config.delete_interval,
                self.config.delete_timeout,
                None,
            )
            .await;
        }

        let delivered = ctx.delivered.lock().clone();
        let elapsed = std::time::Duration::from_secs(started.elapsed().as_secs());
        info!(
            items = entries.len(),
            delivered = delivered.len(),
            cancelled,
            elapsed = %humantime::format_duration(elapsed),
            "session finished"
        );
        Ok(SessionReport {
            id,
            manifest: entries,
            delivered,
            cancelled,
        })
    }
}

/// Write the manifest into the session directory and hand it over when the
/// user asked for it.
async fn finish_manifest(ctx: &SessionContext, entries: &[ManifestEntry]) {
    let path = ctx
        .dir
        .join(format!("{}{}", sanitize(&ctx.user), ArtifactKind::Log.extension()));
    let json = match serde_json::to_vec_pretty(entries) {
        Ok(json) => json,
        Err(e) => {
            warn!("could not encode manifest: {e}");
            return;
        }
    };
    if let Err(e) = tokio::fs::write(&path, json).await {
        warn!(path = %path.display(), "could not write manifest: {e}");
        return;
    }
    if ctx.settings.manifest {
        match ctx.services.artifacts.deliver(&ctx.id, &path, "LOGS").await {
            Ok(()) => ctx.record_delivery(&path),
            Err(e) => warn!("manifest delivery failed: {e}"),
        }
    }
}
