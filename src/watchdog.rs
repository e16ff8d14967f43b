/// One-shot deadline timer for a running process group.
///
/// Runs alongside the child process. If the deadline elapses before the timer
/// is cancelled, the configured signal is sent to the child's whole process
/// group so that any grandchildren it spawned go down with it.
use crate::signals::GroupSignaller;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct TimerState {
    disarmed: bool,
    fired: bool,
}

/// Handle to an armed deadline. Dropping it aborts the timer task.
pub struct DeadlineTimer {
    handle: Option<JoinHandle<()>>,
    state: Arc<Mutex<TimerState>>,
}

fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeadlineTimer {
    /// Arm the timer. Must be called from within a tokio runtime.
    pub fn arm(
        pgid: Pid,
        after: Duration,
        signal: Signal,
        signaller: Arc<dyn GroupSignaller>,
    ) -> Self {
        let state = Arc::new(Mutex::new(TimerState::default()));
        let shared = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Held across the signal so a concurrent disarm either wins
            // outright or waits until the signal has gone out.
            let mut state = lock(&shared);
            if state.disarmed {
                return;
            }
            state.fired = true;
            match signaller.signal_group(pgid, signal) {
                Ok(()) => tracing::info!(
                    pgid = pgid.as_raw(),
                    signal = signal.as_str(),
                    deadline_ms = after.as_millis() as u64,
                    "deadline elapsed, signaled process group"
                ),
                // ESRCH here just means the group exited on its own in the meantime.
                Err(e) => tracing::warn!(
                    pgid = pgid.as_raw(),
                    signal = signal.as_str(),
                    error = %e,
                    "deadline elapsed but process group could not be signaled"
                ),
            }
        });

        Self {
            handle: Some(handle),
            state,
        }
    }

    /// Whether the deadline elapsed and the signal was attempted.
    pub fn fired(&self) -> bool {
        lock(&self.state).fired
    }

    /// Disarm immediately, without waiting for the task. After this returns
    /// the signal can no longer be sent.
    pub fn disarm(&self) {
        lock(&self.state).disarmed = true;
    }

    /// Disarm unless `keep_armed` says otherwise. `keep_armed` runs under the
    /// timer's lock, so the deadline cannot fire while it decides. Returns
    /// whether the timer is now disarmed.
    pub fn disarm_unless(&self, keep_armed: impl FnOnce() -> bool) -> bool {
        let mut state = lock(&self.state);
        if !state.disarmed && !state.fired && !keep_armed() {
            state.disarmed = true;
        }
        state.disarmed
    }

    /// Disarm the timer and wait until its task has finished.
    ///
    /// No-op if the deadline already fired. Returns `fired()`.
    pub async fn cancel(mut self) -> bool {
        self.disarm();
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.fired()
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::testing::SpySignaller;
    use std::os::unix::process::ExitStatusExt;
    use tokio::process::Command;

    fn spawn_sleeper(secs: &str) -> tokio::process::Child {
        Command::new("sleep")
            .arg(secs)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fires_and_signals_group() {
        let mut child = spawn_sleeper("5");
        let pgid = Pid::from_raw(child.id().unwrap() as i32);
        let spy = Arc::new(SpySignaller::default());

        let timer = DeadlineTimer::arm(
            pgid,
            Duration::from_millis(100),
            Signal::SIGTERM,
            spy.clone(),
        );

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        assert!(timer.cancel().await);
        assert_eq!(spy.sent(), vec![(pgid, Signal::SIGTERM)]);
    }

    #[tokio::test]
    async fn test_cancel_before_deadline_never_signals() {
        let mut child = spawn_sleeper("0.05");
        let pgid = Pid::from_raw(child.id().unwrap() as i32);
        let spy = Arc::new(SpySignaller::default());

        let timer = DeadlineTimer::arm(pgid, Duration::from_secs(5), Signal::SIGTERM, spy.clone());
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(0));

        assert!(!timer.cancel().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(spy.sent().is_empty());
    }

    #[tokio::test]
    async fn test_drop_disarms() {
        let spy = Arc::new(SpySignaller::default());
        let timer = DeadlineTimer::arm(
            Pid::from_raw(0x7fff_fff0),
            Duration::from_millis(30),
            Signal::SIGTERM,
            spy.clone(),
        );
        drop(timer);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(spy.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_group_is_not_fatal() {
        let spy = Arc::new(SpySignaller::default());
        let timer = DeadlineTimer::arm(
            Pid::from_raw(0x7fff_fff0),
            Duration::from_millis(10),
            Signal::SIGTERM,
            spy.clone(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(timer.fired());
        assert!(timer.cancel().await);
        assert_eq!(spy.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_disarm_stops_a_pending_deadline() {
        let spy = Arc::new(SpySignaller::default());
        let timer = DeadlineTimer::arm(
            Pid::from_raw(0x7fff_fff0),
            Duration::from_millis(30),
            Signal::SIGTERM,
            spy.clone(),
        );
        timer.disarm();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!timer.fired());
        assert!(spy.sent().is_empty());
        assert!(!timer.cancel().await);
    }

    #[tokio::test]
    async fn test_disarm_unless_keeps_timer_when_asked() {
        let spy = Arc::new(SpySignaller::default());
        let timer = DeadlineTimer::arm(
            Pid::from_raw(0x7fff_fff0),
            Duration::from_millis(30),
            Signal::SIGTERM,
            spy.clone(),
        );
        assert!(!timer.disarm_unless(|| true));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(timer.fired());
        assert_eq!(spy.sent().len(), 1);

        // Once fired, there is nothing left to disarm.
        assert!(!timer.disarm_unless(|| false));
    }
}
