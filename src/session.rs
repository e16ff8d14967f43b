/// Child process lifecycle: spawn the command as the leader of a new process
/// group, forward its output to the log, and report how it ended.
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Errors that prevent a timed run from producing an exit status.
///
/// Timeouts and signal deaths are not errors; they come back as negative
/// statuses.
#[derive(Debug)]
pub enum RunError {
    /// The argument vector was empty.
    EmptyCommand,
    /// The deadline was zero, negative, or not finite.
    InvalidDeadline { secs: f64 },
    /// Failed to spawn the child process.
    Spawn {
        program: String,
        work_dir: PathBuf,
        source: std::io::Error,
    },
    /// Failed while waiting on the child process.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::EmptyCommand => write!(f, "command is empty"),
            RunError::InvalidDeadline { secs } => {
                write!(f, "deadline must be a positive number of seconds, got {secs}")
            }
            RunError::Spawn {
                program,
                work_dir,
                source,
            } => write!(
                f,
                "failed to spawn {} in {}: {}",
                program,
                work_dir.display(),
                source
            ),
            RunError::Wait { source } => write!(f, "failed to wait for process: {}", source),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Spawn { source, .. } => Some(source),
            RunError::Wait { source } => Some(source),
            RunError::EmptyCommand | RunError::InvalidDeadline { .. } => None,
        }
    }
}

/// How a drained and reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    /// Exit code, or the negated signal number if killed by a signal.
    pub status: i32,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
}

/// A child process that leads its own process group.
pub struct GroupChild {
    child: Child,
    pid: Pid,
}

/// Spawn `command` (no shell) in `work_dir` as the leader of a new process group.
pub fn spawn_in_group(command: &[String], work_dir: &Path) -> Result<GroupChild, RunError> {
    let (program, args) = command.split_first().ok_or(RunError::EmptyCommand)?;
    let spawn_err = |source| RunError::Spawn {
        program: program.clone(),
        work_dir: work_dir.to_path_buf(),
        source,
    };

    let child = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_err)?;

    let pid = child
        .id()
        .ok_or_else(|| spawn_err(std::io::Error::other("child was reaped before its pid was read")))?;

    Ok(GroupChild {
        child,
        pid: Pid::from_raw(pid as i32),
    })
}

impl GroupChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The child's process group. Always equal to its pid: it leads the group.
    pub fn pgid(&self) -> Pid {
        self.pid
    }

    /// Drain stdout and stderr to the log and reap the child.
    ///
    /// `on_reaped` runs as soon as the child itself has been reaped, which
    /// may be before its output reaches EOF if grandchildren hold the pipes.
    pub async fn drain_and_wait(&mut self, on_reaped: impl FnOnce()) -> Result<Finished, RunError> {
        let pid = self.pid.as_raw();
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();

        let (stdout_lines, stderr_lines, status) = tokio::join!(
            forward_lines(stdout, "stdout", pid),
            forward_lines(stderr, "stderr", pid),
            async move {
                let status = self.child.wait().await;
                on_reaped();
                status
            },
        );
        let status = status.map_err(|e| RunError::Wait { source: e })?;

        Ok(Finished {
            status: exit_status_code(status),
            stdout_lines,
            stderr_lines,
        })
    }
}

/// Forward output to the log line by line until EOF. Bytes are decoded
/// lossily; the pipe must stay open until EOF or the child gets SIGPIPE.
async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>, stream: &'static str, pid: i32) -> u64 {
    let Some(reader) = reader else {
        return 0;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                count += 1;
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!(pid, stream, "{}", line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                tracing::warn!(pid, stream, error = %e, "stopped reading child output");
                break;
            }
        }
    }
    count
}

/// Map an OS exit status to the signed convention: exit code, or `-signal`.
pub fn exit_status_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exit_status_code_maps_exit_and_signal() {
        assert_eq!(exit_status_code(std::process::ExitStatus::from_raw(0)), 0);
        // Wait status encodes the exit code in the second byte.
        assert_eq!(exit_status_code(std::process::ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_status_code(std::process::ExitStatus::from_raw(15)), -15);
        assert_eq!(exit_status_code(std::process::ExitStatus::from_raw(9)), -9);
    }

    #[test]
    fn test_spawn_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn_in_group(&[], dir.path()).err().unwrap();
        assert!(matches!(err, RunError::EmptyCommand));
        assert_eq!(err.to_string(), "command is empty");
    }

    #[tokio::test]
    async fn test_spawn_failure_names_program_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn_in_group(&argv(&["nonexistent-binary-xyz"]), dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Spawn { .. }));
        let msg = err.to_string();
        assert!(msg.contains("nonexistent-binary-xyz"));
        assert!(msg.contains(&dir.path().display().to_string()));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_spawn_in_missing_work_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("tools");
        let err = spawn_in_group(&argv(&["true"]), &missing).err().unwrap();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_child_leads_its_own_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_in_group(&argv(&["sleep", "0.1"]), dir.path()).unwrap();
        let pgid = nix::unistd::getpgid(Some(child.pid())).unwrap();
        assert_eq!(pgid, child.pgid());
        assert_ne!(pgid, nix::unistd::getpgrp());
        child.drain_and_wait(|| {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_counts_lines_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_in_group(
            &argv(&["sh", "-c", "echo one; echo two; echo oops >&2; exit 42"]),
            dir.path(),
        )
        .unwrap();
        let finished = child.drain_and_wait(|| {}).await.unwrap();
        assert_eq!(
            finished,
            Finished {
                status: 42,
                stdout_lines: 2,
                stderr_lines: 1
            }
        );
    }

    #[tokio::test]
    async fn test_runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_in_group(&argv(&["touch", "marker"]), dir.path()).unwrap();
        assert_eq!(child.drain_and_wait(|| {}).await.unwrap().status, 0);
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_draining() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_in_group(
            &argv(&["sh", "-c", "printf '\\377\\n'; sleep 0.2; exec seq 1 200000"]),
            dir.path(),
        )
        .unwrap();
        let finished = child.drain_and_wait(|| {}).await.unwrap();
        assert_eq!(finished.status, 0);
        assert_eq!(finished.stdout_lines, 200_001);
    }

    #[tokio::test]
    async fn test_on_reaped_runs_once_child_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_in_group(&argv(&["true"]), dir.path()).unwrap();
        let mut reaped = false;
        child.drain_and_wait(|| reaped = true).await.unwrap();
        assert!(reaped);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_in_group(&argv(&["printf", "a\\nb"]), dir.path()).unwrap();
        assert_eq!(child.drain_and_wait(|| {}).await.unwrap().stdout_lines, 2);
    }
}
