//! usagebar CLI: the command-line entry point.
//!
//! # Usage
//!
//! ```text
//! usagebar once
//! usagebar start --detach
//! usagebar status
//! usagebar stop
//! ```

mod logging;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use usagebar_core::clock::now_ms;
use usagebar_core::control::{resolve_config_dir, Control, StopOutcome};
use usagebar_core::daemon::{Daemon, DaemonOptions};
use usagebar_core::refresh::CycleOutcome;
use usagebar_core::Error;


#[derive(Debug, Parser)]
#[command(name = "usagebar", version, about = "Usage metrics for the tmux status line")]
struct Cli {
    /// Configuration directory (default: $USAGEBAR_CONFIG_DIR or ~/.config/usagebar)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run one refresh cycle in this process
    Once,
    /// Run the worker (foreground unless --detach)
    Start {
        /// Refresh interval in milliseconds
        interval_ms: Option<u64>,
        /// Spawn in the background and wait until it is healthy
        #[arg(long)]
        detach: bool,
    },
    /// Stop the worker
    Stop,
    /// Print the reliability report, published values and worker counters
    Status,
    /// Remove published values and reset the worker's cache
    Clear,
    /// Run one auto-recovery pass
    Heal,
    /// Supervise the worker from this process
    Monitor {
        /// Check interval in milliseconds
        interval_ms: Option<u64>,
    },
}


fn main() {
    let cli = Cli::parse();
    logging::init(logging::Verbosity::from_flags(cli.verbose, cli.quiet));
    let config_dir = resolve_config_dir(cli.config_dir.as_deref());

    match cli.command {
        Cmd::Once => {
            let (outcome, published) = Control::new(&config_dir, None).run_once();
            print_yaml(&published);
            match outcome {
                CycleOutcome::Failed { kind } => fail(&format!("refresh failed: {}", kind.guidance())),
                other => eprintln!("usagebar: {:?}", other),
            }
        }

        Cmd::Start { interval_ms, detach: true } => {
            match Control::new(&config_dir, interval_ms).start_detached() {
                Ok(pid) => println!("usagebar started (pid {})", pid),
                Err(e) => fail_start(e),
            }
        }

        Cmd::Start { interval_ms, detach: false } => {
            let options = DaemonOptions {
                interval_ms,
                ..DaemonOptions::default()
            };
            if let Err(e) = Daemon::new(&config_dir, options).run() {
                fail_start(e);
            }
        }

        Cmd::Stop => match Control::new(&config_dir, None).stop() {
            Ok(StopOutcome::Stopped { pid }) => println!("usagebar stopped (pid {})", pid),
            Ok(StopOutcome::NotRunning) => println!("usagebar was not running; cleaned up"),
            Err(e) => fail(&e.to_string()),
        },

        Cmd::Status => {
            let status = Control::new(&config_dir, None).status(now_ms());
            print_yaml(&status);
        }

        Cmd::Clear => match Control::new(&config_dir, None).clear() {
            Ok(out) => {
                println!("removed {} published values", out.removed);
                if let Some(pid) = out.signalled {
                    println!("worker {} told to drop its cache", pid);
                }
            }
            Err(e) => fail(&e.to_string()),
        },

        Cmd::Heal => {
            let outcome = Control::new(&config_dir, None).heal(now_ms());
            print_yaml(&outcome);
            if !outcome.success {
                process::exit(1);
            }
        }

        Cmd::Monitor { interval_ms } => {
            let control = Control::new(&config_dir, None);
            let interval = interval_ms.unwrap_or(control.settings().reliability.monitor_interval_ms);
            let _timer = match control.monitor(Duration::from_millis(interval.max(1))) {
                Ok(t) => t,
                Err(e) => fail(&e.to_string()),
            };
            tracing::info!(interval_ms = interval, "monitoring worker; Ctrl-C to stop");
            loop {
                std::thread::park();
            }
        }
    }
}


fn print_yaml<T: Serialize>(value: &T) {
    match serde_yaml::to_string(value) {
        Ok(text) => print!("{}", text),
        Err(e) => fail(&format!("cannot render output: {}", e)),
    }
}

fn fail_start(e: Error) -> ! {
    match e {
        Error::LockHeld { pid, .. } => fail(&format!("already running (pid {})", pid)),
        other => fail(&other.to_string()),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("usagebar: {}", message);
    process::exit(1);
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn start_takes_interval_and_detach() {
        let cli = Cli::parse_from(["usagebar", "start", "5000", "--detach"]);
        match cli.command {
            Cmd::Start { interval_ms, detach } => {
                assert_eq!(interval_ms, Some(5_000));
                assert!(detach);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["usagebar", "status", "--config-dir", "/tmp/ub", "-v"]);
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/ub")));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Cmd::Status));
    }

    #[test]
    fn monitor_interval_is_optional() {
        let cli = Cli::parse_from(["usagebar", "monitor"]);
        assert!(matches!(cli.command, Cmd::Monitor { interval_ms: None }));
    }
}
