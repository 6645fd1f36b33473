//! Collaborators the pipeline talks to but does not own.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::artifact::ItemDescriptor;
use crate::branch::Branch;
use crate::error::TaskError;
use crate::session::SessionId;

/// Opaque per-user key/value settings.
pub trait PreferenceStore: Send + Sync {
    fn get_value(&self, user: &str, namespace: &str, key: &str) -> Option<String>;
    fn set_value(&self, user: &str, namespace: &str, key: &str, value: &str);
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<(String, String, String), String>>,
}

impl PreferenceStore for MemoryPreferences {
    fn get_value(&self, user: &str, namespace: &str, key: &str) -> Option<String> {
        self.values
            .read()
            .get(&(user.to_string(), namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn set_value(&self, user: &str, namespace: &str, key: &str, value: &str) {
        self.values.write().insert(
            (user.to_string(), namespace.to_string(), key.to_string()),
            value.to_string(),
        );
    }
}

/// One page of a catalog lookup.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<ItemDescriptor>,
    /// How many items the whole lookup yields, when the catalog says so.
    pub total: Option<usize>,
    pub next_page: Option<String>,
}

#[async_trait]
pub trait MetadataQuery: Send + Sync {
    async fn resolve(&self, identifier: &str, page_token: Option<&str>) -> Result<Page, TaskError>;
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, tool: &Path, args: &[OsString]) -> Result<ToolOutput, TaskError>;
}

/// Run a tool until it exits or `branch` is cancelled. Dropping the pending
/// run is what stops the tool, so runners should kill their child on drop.
pub async fn run_cancellable(
    runner: &dyn ProcessRunner,
    branch: &Branch,
    tool: &Path,
    args: &[OsString],
) -> Result<ToolOutput, TaskError> {
    tokio::select! {
        out = runner.run(tool, args) => out,
        _ = branch.cancelled() => Err(TaskError::Cancelled),
    }
}

/// Runs tools as child processes, killing any that outlive `timeout` or
/// whose run is dropped.
pub struct TokioProcessRunner {
    timeout: Duration,
}

impl TokioProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, tool: &Path, args: &[OsString]) -> Result<ToolOutput, TaskError> {
        let tool_name = tool.display().to_string();
        let mut cmd = Command::new(tool);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(tool = %tool_name, ?args, "running");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TaskError::tool(tool_name, format!("spawn: {e}"))),
            Err(_) => {
                return Err(TaskError::tool(
                    tool_name,
                    format!("timed out after {}", humantime::format_duration(self.timeout)),
                ))
            }
        };

        Ok(ToolOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Fire-and-forget status display. `record` names one status line within a
/// session.
pub trait MessageSink: Send + Sync {
    fn post_or_edit(&self, session: &SessionId, record: &str, text: &str);
    fn delete(&self, session: &SessionId, record: &str);
}

/// Status sink that only logs.
pub struct LogSink;

impl MessageSink for LogSink {
    fn post_or_edit(&self, session: &SessionId, record: &str, text: &str) {
        info!(%session, record, "{text}");
    }

    fn delete(&self, session: &SessionId, record: &str) {
        debug!(%session, record, "status cleared");
    }
}

/// Receives finished artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(
        &self,
        session: &SessionId,
        path: &Path,
        caption: &str,
    ) -> Result<(), TaskError>;
}

/// Copies delivered artifacts into a directory.
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn deliver(
        &self,
        session: &SessionId,
        path: &Path,
        caption: &str,
    ) -> Result<(), TaskError> {
        let Some(name) = path.file_name() else {
            warn!(%session, path = %path.display(), "refusing to deliver a nameless path");
            return Ok(());
        };
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| TaskError::io(&self.root, e))?;
        let dest = self.root.join(name);
        tokio::fs::copy(path, &dest)
            .await
            .map_err(|e| TaskError::io(path, e))?;
        info!(%session, caption, dest = %dest.display(), "delivered");
        Ok(())
    }
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct Services {
    pub preferences: Arc<dyn PreferenceStore>,
    pub metadata: Arc<dyn MetadataQuery>,
    pub processes: Arc<dyn ProcessRunner>,
    pub messages: Arc<dyn MessageSink>,
    pub artifacts: Arc<dyn ArtifactSink>,
}

pub const PARAMETERS: &str = "parameters";

/// Read a stored flag. Accepts the `+`/`-` spelling the settings menu writes.
fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some("+") | Some("true") | Some("1") | Some("on") => true,
        Some("-") | Some("false") | Some("0") | Some("off") => false,
        _ => default,
    }
}

/// What a user wants out of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSettings {
    pub audio: bool,
    pub video: bool,
    pub image: bool,
    pub manifest: bool,
    pub link_only: bool,
}

impl UserSettings {
    pub fn load(store: &dyn PreferenceStore, user: &str) -> Self {
        let get = |key: &str| store.get_value(user, PARAMETERS, key);
        Self {
            audio: flag(get("mp3"), true),
            video: flag(get("mp4"), true),
            image: flag(get("jpg"), false),
            manifest: flag(get("logs"), false),
            link_only: flag(get("linkonly"), false),
        }
    }

    /// Nothing is produced on disk; the session only reports stream links.
    pub fn links_only(&self) -> bool {
        self.link_only || (!self.audio && !self.video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let store = MemoryPreferences::default();
        let s = UserSettings::load(&store, "alice");
        assert!(s.audio && s.video);
        assert!(!s.image && !s.manifest && !s.link_only);
        assert!(!s.links_only());
    }

    #[test]
    fn settings_read_stored_flags() {
        let store = MemoryPreferences::default();
        store.set_value("bob", PARAMETERS, "mp3", "-");
        store.set_value("bob", PARAMETERS, "mp4", "false");
        store.set_value("bob", PARAMETERS, "jpg", "+");
        store.set_value("alice", PARAMETERS, "jpg", "-");
        let s = UserSettings::load(&store, "bob");
        assert!(!s.audio && !s.video && s.image);
        assert!(s.links_only());
        assert!(!UserSettings::load(&store, "alice").image);
    }

    #[tokio::test]
    async fn directory_sink_copies() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let file = src.path().join("a.mp3");
        std::fs::write(&file, b"abc").unwrap();

        DirectorySink::new(out.path().join("nested"))
            .deliver(&SessionId::new(), &file, "a")
            .await
            .unwrap();
        assert_eq!(std::fs::read(out.path().join("nested/a.mp3")).unwrap(), b"abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_reports_exit_status() {
        let runner = TokioProcessRunner::new(Duration::from_secs(10));
        let ok = runner
            .run(Path::new("sh"), &["-c".into(), "echo 12.5".into()])
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "12.5");

        let failed = runner
            .run(Path::new("sh"), &["-c".into(), "exit 3".into()])
            .await
            .unwrap();
        assert!(!failed.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_branch_abandons_tool() {
        let runner = TokioProcessRunner::new(Duration::from_secs(10));
        let branch = Branch::new(Duration::from_secs(10));
        let stopper = branch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        let started = std::time::Instant::now();
        let args = ["-c".into(), "sleep 5".into()];
        let err = run_cancellable(&runner, &branch, Path::new("sh"), &args)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_enforces_timeout() {
        let runner = TokioProcessRunner::new(Duration::from_millis(100));
        let err = runner
            .run(Path::new("sh"), &["-c".into(), "sleep 5".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ToolFailure { .. }));
    }
}
