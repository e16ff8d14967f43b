/// Run outcomes and the report handed back by `TimedProcessRunner::run_detailed`.
///
/// None of these are errors: the caller decides which outcomes count as
/// failure. The CLI maps them to its own exit code.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Exit code the CLI uses for a deadline kill (same as coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How a timed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The process exited on its own.
    NormalExit { code: i32 },
    /// The deadline elapsed and the process group was signaled.
    TimeoutKill { signal: i32 },
    /// Killed by a signal the deadline did not send.
    Signaled { signal: i32 },
    /// The process group still had live members after the wait.
    ZombieAnomaly { status: i32 },
}

impl RunOutcome {
    /// Classify a finished run from its signed status.
    pub fn classify(status: i32, deadline_fired: bool, group_alive: bool) -> Self {
        if group_alive {
            RunOutcome::ZombieAnomaly { status }
        } else if status >= 0 {
            RunOutcome::NormalExit { code: status }
        } else if deadline_fired {
            RunOutcome::TimeoutKill { signal: -status }
        } else {
            RunOutcome::Signaled { signal: -status }
        }
    }

    /// Process exit code a wrapping CLI should report for this outcome.
    pub fn shell_exit_code(&self) -> i32 {
        match *self {
            RunOutcome::NormalExit { code } => code,
            RunOutcome::TimeoutKill { .. } => TIMEOUT_EXIT_CODE,
            RunOutcome::Signaled { signal } => 128 + signal,
            RunOutcome::ZombieAnomaly { status } if status >= 0 => status,
            RunOutcome::ZombieAnomaly { status } => 128 - status,
        }
    }
}

/// Everything known about one timed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub command: Vec<String>,
    pub work_dir: PathBuf,
    pub pid: i32,
    pub pgid: i32,
    /// Exit code, or the negated signal number if killed by a signal.
    pub status: i32,
    pub outcome: RunOutcome,
    pub deadline_secs: f64,
    pub deadline_fired: bool,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, RunOutcome::TimeoutKill { .. })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
