//! Isolated execution of the target project's test command.
//!
//! Each run works on a private filtered copy of the project tree in a
//! temporary directory, so mutations and candidate tests never touch the
//! user's working tree. Runs are bounded by a wall-clock limit and can be
//! cancelled mid-flight when the session budget runs out.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Exit code reported when the command could not be launched at all
/// (shell missing, spawn failure). Mirrors the shell's own convention
/// for "command not found".
pub const LAUNCH_FAILURE_CODE: i32 = 127;

/// Directory names never copied into the sandbox tree.
const SKIP_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "target",
    "dist",
    "build",
];

const SKIP_SUFFIXES: &[&str] = &[".pyc", ".pyo"];

/// A file written into the sandbox copy before the command runs.
/// The path is relative to the project root.
#[derive(Debug, Clone)]
pub struct FileOverlay {
    pub path: PathBuf,
    pub contents: String,
}

/// One request to run a command in isolation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Shell command, run via `sh -c` from the copied project root
    pub command: String,
    /// The project tree to copy
    pub working_tree: PathBuf,
    /// Files to write over the copy before running
    pub overlays: Vec<FileOverlay>,
    /// Wall-clock limit for the run
    pub time_limit: Duration,
}

/// The observable result of one sandbox run. Launch failures are reported
/// through the same shape (exit code [`LAUNCH_FAILURE_CODE`]) rather than
/// as errors, so callers classify every run uniformly.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// True when the run was stopped by the time limit or cancellation
    pub limit_exceeded: bool,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.limit_exceeded
    }

    pub fn launch_failed(&self) -> bool {
        self.exit_code == LAUNCH_FAILURE_CODE
    }
}

/// Sandbox executor. Cheap to clone; each worker holds its own copy.
#[derive(Clone)]
pub struct Sandbox {
    max_output_bytes: usize,
    cancel: watch::Receiver<bool>,
}

impl Sandbox {
    pub fn new(max_output_bytes: usize, cancel: watch::Receiver<bool>) -> Self {
        Self {
            max_output_bytes,
            cancel,
        }
    }

    /// Run one command against a private copy of the project tree.
    ///
    /// The copy, the overlays, and the child process are all discarded when
    /// this returns; nothing in the original tree changes.
    pub async fn run(&self, request: SandboxRequest) -> ExecutionOutcome {
        let start = Instant::now();

        let temp_dir = match copy_tree_to_temp(&request.working_tree).await {
            Ok(dir) => dir,
            Err(e) => {
                return ExecutionOutcome {
                    command: request.command,
                    exit_code: LAUNCH_FAILURE_CODE,
                    stdout: String::new(),
                    stderr: format!("failed to prepare sandbox copy: {}", e),
                    duration: start.elapsed(),
                    limit_exceeded: false,
                };
            }
        };

        for overlay in &request.overlays {
            let target = temp_dir.path().join(&overlay.path);
            if let Some(parent) = target.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return self.overlay_failure(&request, e, start);
                }
            }
            if let Err(e) = tokio::fs::write(&target, &overlay.contents).await {
                return self.overlay_failure(&request, e, start);
            }
        }

        self.run_in_dir(&request.command, temp_dir.path(), request.time_limit, start)
            .await
    }

    fn overlay_failure(
        &self,
        request: &SandboxRequest,
        e: std::io::Error,
        start: Instant,
    ) -> ExecutionOutcome {
        ExecutionOutcome {
            command: request.command.clone(),
            exit_code: LAUNCH_FAILURE_CODE,
            stdout: String::new(),
            stderr: format!("failed to apply overlay: {}", e),
            duration: start.elapsed(),
            limit_exceeded: false,
        }
    }

    async fn run_in_dir(
        &self,
        command: &str,
        working_dir: &Path,
        time_limit: Duration,
        start: Instant,
    ) -> ExecutionOutcome {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                return ExecutionOutcome {
                    command: command.to_string(),
                    exit_code: LAUNCH_FAILURE_CODE,
                    stdout: String::new(),
                    stderr: format!("failed to spawn command: {}", e),
                    duration: start.elapsed(),
                    limit_exceeded: false,
                };
            }
        };

        let mut cancel = self.cancel.clone();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let (output, limit_exceeded) = tokio::select! {
            result = &mut wait => (result, false),
            _ = tokio::time::sleep(time_limit) => {
                tracing::debug!("sandbox run exceeded {:?}: {}", time_limit, command);
                (Err(std::io::Error::other("time limit exceeded")), true)
            }
            _ = cancel.changed() => {
                tracing::debug!("sandbox run cancelled: {}", command);
                (Err(std::io::Error::other("cancelled")), true)
            }
        };

        let duration = start.elapsed();

        match output {
            Ok(output) => ExecutionOutcome {
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout: truncate_output(
                    &String::from_utf8_lossy(&output.stdout),
                    self.max_output_bytes,
                ),
                stderr: truncate_output(
                    &String::from_utf8_lossy(&output.stderr),
                    self.max_output_bytes,
                ),
                duration,
                limit_exceeded: false,
            },
            // Dropping the pinned future kills the child (kill_on_drop)
            Err(e) => ExecutionOutcome {
                command: command.to_string(),
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                duration,
                limit_exceeded,
            },
        }
    }
}

/// Copy the project tree into a fresh temp directory, skipping VCS metadata,
/// virtualenvs, and caches. Symlinks are not followed.
async fn copy_tree_to_temp(tree: &Path) -> Result<tempfile::TempDir> {
    let tree = tree.to_path_buf();

    // The copy is synchronous filesystem work
    let temp_dir = tokio::task::spawn_blocking(move || -> Result<tempfile::TempDir> {
        let temp_dir = tempfile::TempDir::with_prefix("testforge-")?;
        copy_dir_filtered(&tree, temp_dir.path())?;
        Ok(temp_dir)
    })
    .await??;

    Ok(temp_dir)
}

fn should_skip(name: &str) -> bool {
    SKIP_NAMES.iter().any(|s| *s == name) || SKIP_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn copy_dir_filtered(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if should_skip(&name_str) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_dir_filtered(&src_path, &dst_path)?;
        } else if ft.is_file() {
            std::fs::copy(&src_path, &dst_path)?;
        }
        // Symlinks and other special files are skipped
    }
    Ok(())
}

fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (output truncated)", &text[..end])
}
