use clap::Parser;
use flasher_run::progress::{ProgressObserver, SharedProgress, TerminalProgress};
use flasher_run::{config, data_dir, RunError, TimedProcessRunner};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit code for bad arguments or configuration.
const USAGE_EXIT_CODE: u8 = 2;

/// Run a flashing tool from the installation's tools directory, killing its
/// whole process group if it outlives the timeout.
#[derive(Parser, Debug)]
#[command(name = "flasher-run", version, about)]
pub struct Cli {
    /// Timeout in seconds (default: from config)
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Config file path (default: <install-root>/flasher.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Working directory for the tool (overrides config)
    #[arg(long)]
    tools_dir: Option<PathBuf>,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Don't draw the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Extra logging (tool output, timer decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Tool and its arguments, run without a shell
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_env("FLASHER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(cli.default_log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn error_exit_code(err: &RunError) -> u8 {
    match err {
        RunError::EmptyCommand | RunError::InvalidDeadline { .. } => USAGE_EXIT_CODE,
        RunError::Spawn { .. } | RunError::Wait { .. } => 1,
    }
}

fn shell_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");
    ExitCode::from(run_cli(cli).await)
}

async fn run_cli(cli: Cli) -> u8 {
    let install = match data_dir::InstallDir::from_current_exe() {
        Ok(install) => install,
        Err(e) => {
            eprintln!("flasher-run: cannot locate installation root: {e}");
            return USAGE_EXIT_CODE;
        }
    };
    let config_path = cli.config.clone().unwrap_or_else(|| install.config());
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("flasher-run: {e}");
            return USAGE_EXIT_CODE;
        }
    };
    let mut runner = match TimedProcessRunner::from_config(&install, &config.runner) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("flasher-run: {e}");
            return USAGE_EXIT_CODE;
        }
    };
    if let Some(dir) = &cli.tools_dir {
        runner = runner.with_work_dir(dir);
    }

    let deadline_secs = cli.timeout.unwrap_or(config.runner.default_timeout_secs);
    let bar = (!cli.no_progress).then(|| Arc::new(TerminalProgress::stderr(cli.command[0].clone())));
    let observer: Arc<dyn ProgressObserver> = match &bar {
        Some(bar) => Arc::clone(bar) as Arc<dyn ProgressObserver>,
        None => Arc::new(SharedProgress::new()),
    };

    let result = runner
        .run_detailed(&cli.command, deadline_secs, observer)
        .await;
    if let Some(bar) = &bar {
        bar.finish();
    }

    match result {
        Ok(report) => {
            if cli.json {
                match report.to_json() {
                    Ok(json) => println!("{json}"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize run report"),
                }
            }
            shell_exit_code(report.outcome.shell_exit_code())
        }
        Err(e) => {
            eprintln!("flasher-run: {e}");
            error_exit_code(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_takes_trailing_command_verbatim() {
        let cli = Cli::try_parse_from(["flasher-run", "-t", "3.5", "--", "esptool", "-p", "/dev/ttyUSB0"])
            .unwrap();
        assert_eq!(cli.timeout, Some(3.5));
        assert_eq!(cli.command, vec!["esptool", "-p", "/dev/ttyUSB0"]);
        assert_eq!(cli.default_log_level(), "info");
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["flasher-run", "--json"]).is_err());
    }

    #[test]
    fn test_cli_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["flasher-run", "-v", "-q", "true"]).is_err());
        let cli = Cli::try_parse_from(["flasher-run", "-q", "true"]).unwrap();
        assert_eq!(cli.default_log_level(), "error");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(error_exit_code(&RunError::EmptyCommand), 2);
        assert_eq!(error_exit_code(&RunError::InvalidDeadline { secs: 0.0 }), 2);
        let spawn = RunError::Spawn {
            program: "x".to_string(),
            work_dir: PathBuf::from("/tmp"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(error_exit_code(&spawn), 1);
    }

    #[test]
    fn test_shell_exit_code_clamps_out_of_range() {
        assert_eq!(shell_exit_code(0), 0);
        assert_eq!(shell_exit_code(124), 124);
        assert_eq!(shell_exit_code(300), 1);
        assert_eq!(shell_exit_code(-1), 1);
    }
}
