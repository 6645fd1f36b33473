#![allow(dead_code)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest::services::{
    ArtifactSink, LogSink, MemoryPreferences, MetadataQuery, Page, PreferenceStore, ProcessRunner,
    ToolOutput, PARAMETERS,
};
use harvest::{Config, ItemDescriptor, Services, SessionId, TaskError};
use parking_lot::Mutex;
use wiremock::{Request, Respond, ResponseTemplate};

/// Answers 503 to the `nth` request (counting from one) and passes every
/// other request on to a [`Ranged`].
pub struct FailOnce {
    pub inner: Ranged,
    pub nth: usize,
}

impl Respond for FailOnce {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        if self.inner.hits.load(Ordering::SeqCst) + 1 == self.nth {
            self.inner.hits.fetch_add(1, Ordering::SeqCst);
            return ResponseTemplate::new(503);
        }
        self.inner.respond(req)
    }
}

/// Serves `body` honouring `Range: bytes=a-b`, counting every request.
pub struct Ranged {
    pub body: Vec<u8>,
    pub hits: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl Ranged {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            hits: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn parse_range(header: &str) -> Option<(usize, usize)> {
    let (start, end) = header.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl Respond for Ranged {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let len = self.body.len();
        let range = req
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        let Some((start, end)) = range else {
            return ResponseTemplate::new(200)
                .set_body_bytes(self.body.clone())
                .set_delay(self.delay);
        };
        if start >= len {
            return ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{len}"));
        }
        let end = end.min(len - 1);
        ResponseTemplate::new(206)
            .insert_header("content-range", format!("bytes {start}-{end}/{len}"))
            .set_body_bytes(self.body[start..=end].to_vec())
            .set_delay(self.delay)
    }
}

pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_config(work_dir: &Path) -> Config {
    Config {
        work_dir: work_dir.to_path_buf(),
        max_concurrency: 4,
        chunk_size: 1000,
        retry_delay: Duration::from_millis(10),
        probe_attempts: 1,
        rendezvous_timeout: Duration::from_secs(10),
        status_interval: Duration::from_millis(50),
        delete_interval: Duration::from_millis(10),
        delete_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Catalog with a single page per identifier.
pub struct FixedCatalog(pub Vec<ItemDescriptor>);

#[async_trait]
impl MetadataQuery for FixedCatalog {
    async fn resolve(&self, _: &str, _: Option<&str>) -> Result<Page, TaskError> {
        Ok(Page {
            items: self.0.clone(),
            total: Some(self.0.len()),
            next_page: None,
        })
    }
}

pub fn descriptor(server: &str, id: &str, title: &str) -> ItemDescriptor {
    ItemDescriptor {
        id: id.into(),
        title: title.into(),
        artist: "Audio Library - Topic".into(),
        thumbnail_url: format!("{server}/thumb/{id}"),
        media_url: format!("{server}/media/{id}"),
    }
}

/// Stands in for ffmpeg and ffprobe: writes whatever output file the
/// arguments name.
#[derive(Default)]
pub struct FakeTools {
    pub transcodes: AtomicUsize,
    pub probes: AtomicUsize,
    pub segments: AtomicUsize,
    pub fail_transcode: bool,
    /// Seconds reported by the duration probe.
    pub duration: f64,
}

fn arg(args: &[OsString], i: usize) -> String {
    args.get(i).map(|a| a.to_string_lossy().into_owned()).unwrap_or_default()
}

fn failed(stderr: &str) -> ToolOutput {
    ToolOutput {
        success: false,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

#[async_trait]
impl ProcessRunner for FakeTools {
    async fn run(&self, tool: &Path, args: &[OsString]) -> Result<ToolOutput, TaskError> {
        if tool.ends_with("ffprobe") {
            self.probes.fetch_add(1, Ordering::SeqCst);
            return Ok(ToolOutput {
                success: true,
                stdout: format!("{}\n", self.duration),
                stderr: String::new(),
            });
        }
        let last = PathBuf::from(arg(args, args.len() - 1));
        if args.iter().any(|a| a == "segment") {
            self.segments.fetch_add(1, Ordering::SeqCst);
            let at = args.iter().position(|a| a == "-segment_time").unwrap_or(0);
            let segment: f64 = arg(args, at + 1).parse().unwrap_or(self.duration);
            let parts = (self.duration / segment).ceil() as usize;
            let pattern = last.to_string_lossy().into_owned();
            for n in 0..parts {
                std::fs::write(pattern.replace("%04d", &format!("{n:04}")), b"part").unwrap();
            }
            return Ok(ToolOutput {
                success: true,
                ..ToolOutput::default()
            });
        }
        self.transcodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_transcode {
            return Ok(failed("Conversion failed!"));
        }
        std::fs::write(&last, b"ID3audio").unwrap();
        Ok(ToolOutput {
            success: true,
            ..ToolOutput::default()
        })
    }
}

/// Records deliveries along with the file size at hand-over time. When the
/// manifest arrives it also lists what is left in the session directory.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(String, String, u64)>>,
    pub left_over: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn captions(&self) -> Vec<String> {
        let mut captions: Vec<_> = self.delivered.lock().iter().map(|d| d.1.clone()).collect();
        captions.sort();
        captions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.delivered.lock().iter().map(|d| d.0.clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn deliver(&self, _: &SessionId, path: &Path, caption: &str) -> Result<(), TaskError> {
        let size = std::fs::metadata(path).map_err(|e| TaskError::io(path, e))?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if caption == "LOGS" {
            if let Some(dir) = path.parent() {
                let mut names: Vec<String> = std::fs::read_dir(dir)
                    .map_err(|e| TaskError::io(dir, e))?
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                *self.left_over.lock() = names;
            }
        }
        self.delivered.lock().push((name, caption.to_string(), size));
        Ok(())
    }
}

pub fn services(
    user: &str,
    flags: &[(&str, &str)],
    catalog: FixedCatalog,
    tools: Arc<FakeTools>,
    sink: Arc<RecordingSink>,
) -> Services {
    let preferences = MemoryPreferences::default();
    for (key, value) in flags {
        preferences.set_value(user, PARAMETERS, key, value);
    }
    Services {
        preferences: Arc::new(preferences),
        metadata: Arc::new(catalog),
        processes: tools,
        messages: Arc::new(LogSink),
        artifacts: sink,
    }
}
