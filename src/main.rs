use anyhow::{Context, Result};
use async_trait::async_trait;
use bytesize::ByteSize;
use clap::Parser;
use harvest::fsutil;
use harvest::services::{
    DirectorySink, MemoryPreferences, MessageSink, MetadataQuery, Page, PreferenceStore,
    TokioProcessRunner, PARAMETERS,
};
use harvest::{Config, Harvester, ItemDescriptor, Services, SessionId, SessionRequest, TaskError};
use indicatif::ProgressStyle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::{info, info_span, warn, Span};
use tracing_indicatif::{span_ext::IndicatifSpanExt, IndicatifLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Items per catalog page.
const PAGE_SIZE: usize = 50;

#[derive(Parser)]
#[command(version, about = "Download, transcode and split media listed in a catalog")]
struct Args {
    /// JSON catalog mapping identifiers to item lists.
    #[arg(long, env = "HARVEST_CATALOG")]
    catalog: String,
    /// Where session directories are created.
    #[arg(long, env = "HARVEST_WORK_DIR", default_value = ".")]
    work_dir: String,
    /// Where delivered artifacts are copied.
    #[arg(long, env = "HARVEST_OUTPUT", default_value = "delivered")]
    output: String,
    #[arg(long, env = "HARVEST_USER", default_value = "local")]
    user: String,
    /// Keep session directories and log timings.
    #[arg(long, env = "HARVEST_DEBUG")]
    debug: bool,
    #[arg(long, env = "HARVEST_WORKERS")]
    workers: Option<usize>,
    #[arg(long, env = "HARVEST_QUEUE", default_value_t = 512)]
    queue: usize,
    #[arg(long, default_value = "2MB")]
    chunk_size: ByteSize,
    #[arg(long, env = "HARVEST_UPLOAD_LIMIT", default_value = "45MB")]
    upload_limit: ByteSize,
    #[arg(long, default_value_t = 2)]
    retries: u32,
    #[arg(long, default_value = "10m")]
    rendezvous_timeout: humantime::Duration,
    #[arg(long, default_value = "30m")]
    tool_timeout: humantime::Duration,
    #[arg(long, default_value = "6h")]
    stale_age: humantime::Duration,
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg: String,
    #[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
    ffprobe: String,
    #[arg(long)]
    no_audio: bool,
    #[arg(long)]
    no_video: bool,
    /// Also deliver cover images.
    #[arg(long)]
    image: bool,
    /// Also deliver the session manifest.
    #[arg(long)]
    manifest: bool,
    /// Only report media links, download nothing.
    #[arg(long)]
    links_only: bool,
    /// Catalog identifiers to harvest.
    #[arg(required = true)]
    identifiers: Vec<String>,
}

fn expand(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::path::full(Path::new(path))
        .with_context(|| format!("expand path '{path}'"))?;
    Ok(expanded.into_owned())
}

impl Args {
    fn config(&self) -> Result<Config> {
        let defaults = Config::default();
        Ok(Config {
            debug: self.debug,
            work_dir: expand(&self.work_dir)?,
            max_concurrency: self.workers.unwrap_or(defaults.max_concurrency).max(1),
            queue_capacity: self.queue.max(1),
            chunk_size: self.chunk_size.as_u64(),
            retry_ceiling: self.retries,
            upload_limit: self.upload_limit.as_u64(),
            rendezvous_timeout: self.rendezvous_timeout.into(),
            tool_timeout: self.tool_timeout.into(),
            stale_age: self.stale_age.into(),
            ffmpeg: expand(&self.ffmpeg)?,
            ffprobe: expand(&self.ffprobe)?,
            ..defaults
        })
    }

    fn preferences(&self) -> MemoryPreferences {
        let store = MemoryPreferences::default();
        let flag = |on: bool| if on { "+" } else { "-" };
        store.set_value(&self.user, PARAMETERS, "mp3", flag(!self.no_audio));
        store.set_value(&self.user, PARAMETERS, "mp4", flag(!self.no_video));
        store.set_value(&self.user, PARAMETERS, "jpg", flag(self.image));
        store.set_value(&self.user, PARAMETERS, "logs", flag(self.manifest));
        store.set_value(&self.user, PARAMETERS, "linkonly", flag(self.links_only));
        store
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    human_panic::setup_panic!();
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    let config = args.config()?;
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("create work dir '{}'", config.work_dir.display()))?;

    let root = config.work_dir.clone();
    let stale_age = config.stale_age;
    let swept = spawn_blocking(move || fsutil::sweep_stale_sessions(&root, stale_age)).await?;
    if swept > 0 {
        info!("Removed {swept} stale session directories");
    }

    let catalog = Catalog::load(&expand(&args.catalog)?).await?;
    let services = Services {
        preferences: Arc::new(args.preferences()),
        metadata: Arc::new(catalog),
        processes: Arc::new(TokioProcessRunner::new(config.tool_timeout)),
        messages: Arc::new(SpanSink::default()),
        artifacts: Arc::new(DirectorySink::new(expand(&args.output)?)),
    };

    info!(
        workers = config.max_concurrency,
        upload_limit = %ByteSize::b(config.upload_limit),
        "Starting harvest of {} identifiers",
        args.identifiers.len()
    );
    let harvester = Arc::new(Harvester::new(config, services));

    let on_interrupt = harvester.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.shutdown();
        }
    });

    let report = harvester
        .run(SessionRequest {
            user: args.user.clone(),
            identifiers: args.identifiers.clone(),
        })
        .await
        .context("run session")?;

    for entry in &report.manifest {
        info!("{:>3}. {} [{}] ({})", entry.num, entry.artist, entry.song, entry.id);
    }
    if report.cancelled {
        anyhow::bail!("session {} was cancelled", report.id);
    }
    info!(
        "Delivered {} artifacts for {} items",
        report.delivered.len(),
        report.manifest.len()
    );
    Ok(())
}

/// Catalog read from a JSON file: `{ "<identifier>": [ItemDescriptor, ...] }`.
struct Catalog(HashMap<String, Vec<ItemDescriptor>>);

impl Catalog {
    async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("read catalog '{}'", path.display()))?;
        let entries = serde_json::from_slice(&raw).context("parse catalog")?;
        Ok(Self(entries))
    }
}

#[async_trait]
impl MetadataQuery for Catalog {
    async fn resolve(&self, identifier: &str, page_token: Option<&str>) -> Result<Page, TaskError> {
        let Some(items) = self.0.get(identifier.trim()) else {
            return Err(TaskError::content(identifier, "not in catalog"));
        };
        let start: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| TaskError::content(identifier, format!("bad page token '{token}'")))?,
            None => 0,
        };
        let end = (start + PAGE_SIZE).min(items.len());
        Ok(Page {
            items: items.get(start..end).unwrap_or_default().to_vec(),
            total: Some(items.len()),
            next_page: (end < items.len()).then(|| end.to_string()),
        })
    }
}

/// Status records rendered as spinner lines under the log output.
#[derive(Default)]
struct SpanSink {
    spans: Mutex<HashMap<(SessionId, String), Span>>,
}

impl MessageSink for SpanSink {
    fn post_or_edit(&self, session: &SessionId, record: &str, text: &str) {
        let mut spans = self.spans.lock();
        let span = spans
            .entry((session.clone(), record.to_string()))
            .or_insert_with(|| {
                let span = info_span!(parent: None, "status", record);
                span.pb_set_style(
                    &ProgressStyle::with_template("{spinner} {wide_msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                span.in_scope(|| {});
                span
            });
        span.pb_set_message(text);
    }

    fn delete(&self, session: &SessionId, record: &str) {
        self.spans.lock().remove(&(session.clone(), record.to_string()));
    }
}
