/// Timed process runner: launch a tool in its own process group, kill the
/// group if it outlives its deadline, and tick a progress observer meanwhile.
use crate::config::{ConfigError, RunnerConfig};
use crate::data_dir::InstallDir;
use crate::progress::{ProgressObserver, ProgressTicker};
use crate::session::{spawn_in_group, RunError};
use crate::signals::{GroupSignaller, KillPg};
use crate::status::{RunOutcome, RunReport};
use crate::watchdog::DeadlineTimer;
use chrono::Utc;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Default progress tick: 60 Hz.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 60);

/// Runs one command at a time per call under a deadline; see [`run`](Self::run).
///
/// Holds no per-run state, so a single runner can serve concurrent calls.
pub struct TimedProcessRunner {
    work_dir: PathBuf,
    kill_signal: Signal,
    tick_interval: Duration,
    signaller: Arc<dyn GroupSignaller>,
}

/// Background activities armed for the duration of one run.
///
/// `disarm` is the normal release; if the run future is dropped or unwinds
/// instead, dropping the fields aborts both tasks.
struct ArmedActivities {
    deadline: DeadlineTimer,
    ticker: ProgressTicker,
}

impl ArmedActivities {
    /// Cancel both activities and wait for them. Returns whether the deadline fired.
    async fn disarm(self) -> bool {
        let fired = self.deadline.cancel().await;
        self.ticker.stop().await;
        fired
    }
}

impl TimedProcessRunner {
    /// Runner launching tools in `work_dir`, with `SIGTERM` on timeout and a 60 Hz tick.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            kill_signal: Signal::SIGTERM,
            tick_interval: DEFAULT_TICK_INTERVAL,
            signaller: Arc::new(KillPg),
        }
    }

    /// Runner rooted at the installation's tools directory.
    pub fn from_config(install: &InstallDir, runner: &RunnerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(install.tools_dir(runner))
            .with_kill_signal(runner.kill_signal()?)
            .with_tick_interval(runner.tick_interval()))
    }

    /// Launch tools in `work_dir` instead.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Signal sent to the process group when the deadline elapses.
    pub fn with_kill_signal(mut self, signal: Signal) -> Self {
        self.kill_signal = signal;
        self
    }

    /// Interval between progress ticks.
    pub fn with_tick_interval(mut self, every: Duration) -> Self {
        self.tick_interval = every;
        self
    }

    /// Replace the process-group signaller.
    pub fn with_signaller(mut self, signaller: Arc<dyn GroupSignaller>) -> Self {
        self.signaller = signaller;
        self
    }

    /// Directory launched tools run in.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run `command` with a deadline and return its signed exit status.
    ///
    /// A negative status means the process was killed by that signal, most
    /// often the deadline's. Timeouts are not errors.
    pub async fn run(
        &self,
        command: &[String],
        deadline_secs: f64,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<i32, RunError> {
        self.run_detailed(command, deadline_secs, observer)
            .await
            .map(|report| report.status)
    }

    /// Like [`run`](Self::run), returning the full classified report.
    pub async fn run_detailed(
        &self,
        command: &[String],
        deadline_secs: f64,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<RunReport, RunError> {
        let program = command.first().ok_or(RunError::EmptyCommand)?;
        let deadline = deadline_duration(deadline_secs)?;

        let span = tracing::info_span!("timed_run", program = %program);
        self.run_inner(command, deadline_secs, deadline, observer)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        command: &[String],
        deadline_secs: f64,
        deadline: Duration,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<RunReport, RunError> {
        tracing::info!(
            command = ?command,
            work_dir = %self.work_dir.display(),
            deadline_secs,
            "starting timed process"
        );

        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = spawn_in_group(command, &self.work_dir)?;
        let pid = child.pid();
        let pgid = child.pgid();
        tracing::info!(pid = pid.as_raw(), "process started in its own group");

        let deadline = DeadlineTimer::arm(
            pgid,
            deadline,
            self.kill_signal,
            Arc::clone(&self.signaller),
        );
        observer.set_progress(0.0, deadline_secs);
        let armed = ArmedActivities {
            deadline,
            ticker: ProgressTicker::start(Arc::clone(&observer), self.tick_interval),
        };

        // Once the leader is reaped, its pgid is only ours while other group
        // members remain; those still need the deadline to reclaim them.
        let signaller = &self.signaller;
        let waited = child
            .drain_and_wait(|| {
                armed.deadline.disarm_unless(|| signaller.group_alive(pgid));
            })
            .await;
        let deadline_fired = armed.disarm().await;
        observer.set_progress(deadline_secs, deadline_secs);

        let finished = match waited {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!(pid = pid.as_raw(), error = %e, "timed process could not be waited on");
                return Err(e);
            }
        };

        let elapsed = start.elapsed();
        let status = finished.status;
        tracing::info!(
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "timed process finished"
        );
        if status < 0 {
            tracing::info!(status, deadline_fired, "timeout occurred");
        }

        let group_alive = self.signaller.group_alive(pgid);
        if group_alive {
            tracing::error!(
                pid = pid.as_raw(),
                pgid = pgid.as_raw(),
                "process still running"
            );
        }

        Ok(RunReport {
            command: command.to_vec(),
            work_dir: self.work_dir.clone(),
            pid: pid.as_raw(),
            pgid: pgid.as_raw(),
            status,
            outcome: RunOutcome::classify(status, deadline_fired, group_alive),
            deadline_secs,
            deadline_fired,
            stdout_lines: finished.stdout_lines,
            stderr_lines: finished.stderr_lines,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }
}

/// Validate a deadline in seconds and convert it, before anything is spawned.
fn deadline_duration(secs: f64) -> Result<Duration, RunError> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(RunError::InvalidDeadline { secs });
    }
    Duration::try_from_secs_f64(secs).map_err(|_| RunError::InvalidDeadline { secs })
}
