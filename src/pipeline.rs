//! The units a session is made of and how they fan out.
//!
//! ```text
//! lookup ─┬─ item ─┬─ image download ── (deliver image)
//!         │        └─ video download ─┬─ transcode ── deliver audio (split?)
//!         │                           └─ deliver video (split?)
//!         └─ item ...
//! ```
//!
//! Units are queued in that order, and a unit only ever waits on facts
//! produced by units queued before it, so waiting units cannot starve the
//! producers they depend on.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::artifact::{facts, ArtifactKind, Item};
use crate::downloader::DownloadJob;
use crate::session::SessionContext;
use crate::split::{self, SplitJob};
use crate::transcode::TranscodeJob;

/// Page through a catalog lookup, queueing every new item.
#[tracing::instrument(skip_all, fields(session = %ctx.id, identifier = %identifier))]
pub async fn lookup(ctx: Arc<SessionContext>, identifier: String) {
    let mut page_token: Option<String> = None;
    let mut seen = 0usize;
    loop {
        if ctx.branch.is_cancelled() {
            return;
        }
        let page = match ctx
            .services
            .metadata
            .resolve(&identifier, page_token.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("lookup failed: {e}");
                return;
            }
        };
        debug!(items = page.items.len(), total = ?page.total, "page resolved");

        for descriptor in page.items {
            seen += 1;
            let item = Item::new(descriptor, &ctx.dir);
            if !ctx.add_result(&item) {
                continue;
            }
            let unit_ctx = ctx.clone();
            ctx.scheduler
                .submit(&ctx.branch, "item", item, move |item| async move {
                    process_item(unit_ctx, item).await
                })
                .await;
        }

        match page.next_page {
            Some(next) if !next.is_empty() => page_token = Some(next),
            _ => break,
        }
    }
    info!(items = seen, "lookup complete");
}

/// Mark an artifact left over from an earlier run as ready.
fn reuse(ctx: &SessionContext, path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    debug!(path = %path.display(), "re-using existing artifact");
    ctx.branch.put(&ctx.id, &facts::ready(path), true);
    ctx.branch.put(&ctx.id, &facts::done(path), true);
    true
}

#[tracing::instrument(skip_all, fields(session = %ctx.id, item = %item.id))]
async fn process_item(ctx: Arc<SessionContext>, item: Item) {
    let settings = ctx.settings;
    if settings.links_only() {
        ctx.services.messages.post_or_edit(
            &ctx.id,
            &item.id,
            &format!("{}: {}", item.caption(), item.media_url),
        );
        return;
    }

    let item = Arc::new(item);
    let audio = item.path(ArtifactKind::Audio);
    if settings.audio && reuse(&ctx, &audio) {
        deliver(&ctx, &item, ArtifactKind::Audio).await;
        if !settings.video {
            return;
        }
    }

    let audio_pending = settings.audio && !audio.is_file();
    let wants_image = settings.image || audio_pending;
    if wants_image && !reuse(&ctx, &item.path(ArtifactKind::Image)) {
        let unit_ctx = ctx.clone();
        ctx.scheduler
            .submit(&ctx.branch, "image", item.clone(), move |item| async move {
                fetch_image(unit_ctx, item).await
            })
            .await;
    } else if settings.image {
        deliver(&ctx, &item, ArtifactKind::Image).await;
    }

    if !(settings.video || audio_pending) {
        return;
    }
    let unit_ctx = ctx.clone();
    ctx.scheduler
        .submit(&ctx.branch, "video", item, move |item| async move {
            fetch_video(unit_ctx, item).await
        })
        .await;
}

async fn fetch_image(ctx: Arc<SessionContext>, item: Arc<Item>) {
    let job = DownloadJob {
        source: item.thumbnail_url.clone(),
        destination: item.path(ArtifactKind::Image),
        kind: ArtifactKind::Image,
        label: item.caption(),
    };
    if ctx.downloader.download(&ctx, job).await && ctx.settings.image {
        deliver(&ctx, &item, ArtifactKind::Image).await;
    }
}

async fn fetch_video(ctx: Arc<SessionContext>, item: Arc<Item>) {
    let settings = ctx.settings;
    let video = item.path(ArtifactKind::Video);
    let audio_pending = settings.audio && !item.path(ArtifactKind::Audio).is_file();

    let ready = reuse(&ctx, &video)
        || ctx
            .downloader
            .download(
                &ctx,
                DownloadJob {
                    source: item.media_url.clone(),
                    destination: video.clone(),
                    kind: ArtifactKind::Video,
                    label: item.caption(),
                },
            )
            .await;
    if !ready {
        return;
    }

    if audio_pending {
        let unit_ctx = ctx.clone();
        ctx.scheduler
            .submit(&ctx.branch, "transcode", item.clone(), move |item| async move {
                transcode(unit_ctx, item).await
            })
            .await;
    }
    if settings.video {
        let unit_ctx = ctx.clone();
        ctx.scheduler
            .submit(&ctx.branch, "deliver-video", item, move |item| async move {
                // A split removes the unsplit video, so let the transcode
                // finish with it first.
                if audio_pending {
                    let audio = item.path(ArtifactKind::Audio);
                    let _: bool = unit_ctx.branch.get(&unit_ctx.id, &facts::done(&audio)).await;
                }
                deliver(&unit_ctx, &item, ArtifactKind::Video).await;
            })
            .await;
    }
}

async fn transcode(ctx: Arc<SessionContext>, item: Arc<Item>) {
    if ctx.transcoder.run(&ctx, TranscodeJob::for_item(&item)).await {
        deliver(&ctx, &item, ArtifactKind::Audio).await;
    }
}

/// Hand a ready artifact to the artifact sink, splitting it first when it is
/// above the upload ceiling. Artifacts that are not ready are skipped.
async fn deliver(ctx: &Arc<SessionContext>, item: &Item, kind: ArtifactKind) {
    let path = item.path(kind);
    let ready = ctx
        .branch
        .peek::<bool>(&ctx.id, &facts::ready(&path))
        .unwrap_or(false);
    if !ready || ctx.branch.is_cancelled() {
        debug!(path = %path.display(), ready, "nothing to deliver");
        return;
    }
    let size = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(path = %path.display(), "artifact vanished before delivery: {e}");
            return;
        }
    };

    let limit = ctx.config.upload_limit;
    if kind.splittable() && split::needs_split(size, limit) {
        let job = SplitJob {
            item: item.clone(),
            kind,
            limit,
        };
        let parts = ctx.splitter.run(ctx, job).await;
        for (n, part) in parts.iter().enumerate() {
            let caption = format!("{}) {}", n + 1, item.caption());
            send(ctx, part, &caption).await;
        }
    } else {
        send(ctx, &path, &item.caption()).await;
    }
}

async fn send(ctx: &SessionContext, path: &Path, caption: &str) {
    if ctx.branch.is_cancelled() {
        return;
    }
    match ctx.services.artifacts.deliver(&ctx.id, path, caption).await {
        Ok(()) => ctx.record_delivery(path),
        Err(e) => warn!(path = %path.display(), "delivery failed: {e}"),
    }
}
