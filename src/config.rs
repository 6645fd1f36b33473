use std::path::PathBuf;
use std::time::Duration;

/// Every tunable of the pipeline, passed explicitly to whatever needs it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Keep artifacts and session directories, log stage timings.
    pub debug: bool,
    /// Root under which session directories are created.
    pub work_dir: PathBuf,
    /// Units allowed to run at once in a session's scheduler.
    pub max_concurrency: usize,
    /// Pending units buffered before `submit` starts waiting.
    pub queue_capacity: usize,
    /// Bytes requested per range request.
    pub chunk_size: u64,
    /// Extra attempts after the first one for downloads and tool runs.
    pub retry_ceiling: u32,
    /// Pause between whole-transfer retries.
    pub retry_delay: Duration,
    /// Attempts made to discover a resource's length before giving up.
    pub probe_attempts: u32,
    /// Artifacts above this size are split before delivery.
    pub upload_limit: u64,
    /// Longest a rendezvous read waits for its fact.
    pub rendezvous_timeout: Duration,
    /// How often download status records are refreshed.
    pub status_interval: Duration,
    /// Upper bound on retrying the removal of files and directories.
    pub delete_timeout: Duration,
    /// Pause between removal attempts.
    pub delete_interval: Duration,
    /// Hard limit on a single external tool invocation.
    pub tool_timeout: Duration,
    /// Session directories older than this are swept at start-up.
    pub stale_age: Duration,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            work_dir: PathBuf::from("."),
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 512,
            chunk_size: 2_000_000,
            retry_ceiling: 2,
            retry_delay: Duration::from_millis(500),
            probe_attempts: 50,
            upload_limit: 45_000_000,
            rendezvous_timeout: Duration::from_secs(10 * 60),
            status_interval: Duration::from_secs(3),
            delete_timeout: Duration::from_secs(10 * 60),
            delete_interval: Duration::from_secs(1),
            tool_timeout: Duration::from_secs(30 * 60),
            stale_age: Duration::from_secs(6 * 60 * 60),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}
