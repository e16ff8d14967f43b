/// Process-group signalling.
///
/// The runner never signals a bare pid: every child leads its own process
/// group, and termination goes to the whole group so grandchildren are
/// reclaimed too. `GroupSignaller` is the seam tests use to observe that.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::str::FromStr;

/// Delivers signals to a process group.
pub trait GroupSignaller: Send + Sync + 'static {
    /// Send `signal` to every process in group `pgid`.
    fn signal_group(&self, pgid: Pid, signal: Signal) -> nix::Result<()>;

    /// Whether any process in group `pgid` still exists.
    fn group_alive(&self, pgid: Pid) -> bool;
}

/// Production signaller backed by `killpg(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KillPg;

impl GroupSignaller for KillPg {
    fn signal_group(&self, pgid: Pid, signal: Signal) -> nix::Result<()> {
        killpg(pgid, signal)
    }

    fn group_alive(&self, pgid: Pid) -> bool {
        // Signal 0 performs the permission and existence checks only.
        match killpg(pgid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Parse a signal name such as `SIGTERM`, `TERM` or `term`.
pub fn parse_signal(name: &str) -> Result<Signal, String> {
    let upper = name.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return Err("signal name is empty".to_string());
    }
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| format!("unknown signal name '{}'", name.trim()))
}
