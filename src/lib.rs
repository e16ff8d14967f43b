//! Run an external tool under a deadline.
//!
//! The tool is started in its own process group inside the installation's
//! `tools/` directory. If it outlives its deadline the whole group is
//! signaled, and a caller-supplied [`progress::ProgressObserver`] is ticked
//! while it runs. See [`runner::TimedProcessRunner`].

pub mod config;
pub mod data_dir;
pub mod progress;
pub mod runner;
pub mod session;
pub mod signals;
pub mod status;
pub mod watchdog;

pub use runner::TimedProcessRunner;
pub use session::RunError;
pub use status::{RunOutcome, RunReport};
