/// Progress feedback for a timed run.
///
/// The runner only talks to a caller-owned [`ProgressObserver`]; the
/// observer decides how (or whether) to render. [`ProgressTicker`] is the
/// fixed-rate task that advances the observer while a process runs. It is
/// cosmetic and has no influence on process lifetime.
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A bounded counter: `value` in `[0, max]`, both in seconds for timed runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub value: f64,
    pub max: f64,
}

impl Progress {
    pub fn new(value: f64, max: f64) -> Self {
        Self { value, max }
    }

    /// Advance by `dt`, clamped to `max`.
    pub fn advanced(self, dt: f64) -> Self {
        Self {
            value: (self.value + dt).min(self.max),
            max: self.max,
        }
    }

    /// Completed fraction in `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        if self.max <= 0.0 {
            return 0.0;
        }
        (self.value / self.max).clamp(0.0, 1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.value >= self.max
    }
}

/// Caller-owned progress sink.
pub trait ProgressObserver: Send + Sync {
    fn get_progress(&self) -> Progress;
    fn set_progress(&self, value: f64, max: f64);
}

/// In-memory observer for callers that only want to read the final state.
#[derive(Debug)]
pub struct SharedProgress {
    state: Mutex<Progress>,
    updates: AtomicU64,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Progress::new(0.0, 0.0)),
            updates: AtomicU64::new(0),
        }
    }

    /// Number of `set_progress` calls seen so far.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for SharedProgress {
    fn get_progress(&self) -> Progress {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_progress(&self, value: f64, max: f64) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Progress::new(value, max);
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}

const BAR_WIDTH: usize = 30;

struct BarState<W> {
    progress: Progress,
    last_percent: Option<u32>,
    out: W,
}

/// Renders a single-line progress bar, redrawing only when the percentage
/// changes. Write errors are ignored: the bar is decoration.
pub struct TerminalProgress<W: Write + Send> {
    label: String,
    state: Mutex<BarState<W>>,
}

impl TerminalProgress<std::io::Stderr> {
    pub fn stderr(label: impl Into<String>) -> Self {
        Self::new(label, std::io::stderr())
    }
}

impl<W: Write + Send> TerminalProgress<W> {
    pub fn new(label: impl Into<String>, out: W) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(BarState {
                progress: Progress::new(0.0, 0.0),
                last_percent: None,
                out,
            }),
        }
    }

    /// Terminate the bar line.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.last_percent.is_some() {
            let _ = writeln!(state.out);
            let _ = state.out.flush();
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.state.into_inner().unwrap_or_else(|e| e.into_inner()).out
    }
}

fn render_bar(label: &str, progress: Progress) -> String {
    let filled = (progress.fraction() * BAR_WIDTH as f64).round() as usize;
    let percent = (progress.fraction() * 100.0).round() as u32;
    format!(
        "\r[{}{}] {:>3}% {}",
        "#".repeat(filled),
        ".".repeat(BAR_WIDTH - filled),
        percent,
        label
    )
}

impl<W: Write + Send> ProgressObserver for TerminalProgress<W> {
    fn get_progress(&self) -> Progress {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).progress
    }

    fn set_progress(&self, value: f64, max: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.progress = Progress::new(value, max);
        let percent = (state.progress.fraction() * 100.0).round() as u32;
        if state.last_percent == Some(percent) {
            return;
        }
        state.last_percent = Some(percent);
        let line = render_bar(&self.label, state.progress);
        let _ = state.out.write_all(line.as_bytes());
        let _ = state.out.flush();
    }
}

/// Floor for tick intervals; `tokio::time::interval` rejects zero.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed-rate task advancing an observer by the real time between ticks.
pub struct ProgressTicker {
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    /// Start ticking every `every`. Must be called from within a tokio runtime.
    pub fn start(observer: Arc<dyn ProgressObserver>, every: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(MIN_TICK_INTERVAL));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            let mut last = Instant::now();
            loop {
                interval.tick().await;
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f64();
                last = now;
                let next = observer.get_progress().advanced(dt);
                observer.set_progress(next.value, next.max);
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stop ticking and wait for the task to wind down, so no further
    /// `set_progress` calls happen after this returns.
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
