use crate::config::RunnerConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the detected installation root.
pub const ROOT_ENV: &str = "FLASHER_ROOT";

/// The flasher installation layout.
///
/// Launched tools run in a directory fixed relative to this root, never
/// relative to the caller's current directory:
///
/// ```text
/// <root>/bin/flasher-run
/// <root>/flasher.toml
/// <root>/tools/
/// ```
#[derive(Debug, Clone)]
pub struct InstallDir {
    root: PathBuf,
}

impl InstallDir {
    /// Create an InstallDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate the root from `FLASHER_ROOT`, or from the running executable.
    pub fn from_current_exe() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        Self::resolve(std::env::var_os(ROOT_ENV), &exe)
    }

    pub(crate) fn resolve(env_root: Option<OsString>, exe: &Path) -> std::io::Result<Self> {
        if let Some(root) = env_root.filter(|r| !r.is_empty()) {
            return Ok(Self::new(root));
        }
        // Follow symlinks so a linked binary still finds its own tools.
        let exe = exe.canonicalize()?;
        let bin_dir = exe.parent().unwrap_or_else(|| Path::new("/"));
        let root = bin_dir.parent().unwrap_or(bin_dir);
        Ok(Self::new(root))
    }

    /// The root directory (e.g. `/opt/flasher`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the config file (e.g. `/opt/flasher/flasher.toml`).
    pub fn config(&self) -> PathBuf {
        self.root.join("flasher.toml")
    }

    /// Working directory for launched tools. Absolute `tools_dir` values are
    /// used as-is; relative ones hang off the root.
    pub fn tools_dir(&self, runner: &RunnerConfig) -> PathBuf {
        self.root.join(&runner.tools_dir)
    }
}
