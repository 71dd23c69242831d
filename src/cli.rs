//! Command-line interface for relaunch.
use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::{config::Options, signals::RestartSignal};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// An `EVENT=COMMAND` binding given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventBinding {
    /// Event name.
    pub event: String,
    /// Shell command run when the event is published.
    pub command: String,
}

impl FromStr for EventBinding {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (event, command) = value
            .split_once('=')
            .ok_or_else(|| format!("expected EVENT=COMMAND, got '{value}'"))?;
        let event = event.trim();
        if event.is_empty() || command.trim().is_empty() {
            return Err(format!("expected EVENT=COMMAND, got '{value}'"));
        }
        Ok(Self {
            event: event.to_string(),
            command: command.trim().to_string(),
        })
    }
}

/// Command-line interface for relaunch.
#[derive(Parser, Debug)]
#[command(name = "relaunch", version, author)]
#[command(about = "Run a command and restart it on demand", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,

    /// Path to the configuration file (defaults to `relaunch.yaml` if present).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Signal used to request restarts (SIGUSR2 or SIGHUP). The other one restarts
    /// this supervisor's child.
    #[arg(long, value_name = "SIGNAL")]
    pub signal: Option<RestartSignal>,

    /// Token that restarts the child when typed on stdin.
    #[arg(long, value_name = "TOKEN", conflicts_with = "no_restartable")]
    pub restartable: Option<String>,

    /// Disable the restart token and read raw keystrokes instead.
    #[arg(long)]
    pub no_restartable: bool,

    /// Do not read stdin at all.
    #[arg(long)]
    pub no_stdin: bool,

    /// Pipe the child's output instead of inheriting it.
    #[arg(long)]
    pub no_stdout: bool,

    /// Upper bound on the wait for the child to die during a reset (e.g. "500ms", "10s").
    #[arg(long, value_name = "DURATION")]
    pub kill_timeout: Option<String>,

    /// Run COMMAND whenever EVENT is published. May be repeated.
    #[arg(long = "on", value_name = "EVENT=COMMAND")]
    pub on: Vec<EventBinding>,

    /// Print the resolved options and exit.
    #[arg(long)]
    pub dump: bool,

    /// Command and arguments to supervise.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Overlays the flags given on the command line onto `options`.
    pub fn apply(&self, options: &mut Options) {
        if let Some(signal) = self.signal {
            options.signal = signal;
        }
        if let Some(token) = &self.restartable {
            options.restartable = Some(token.clone());
        }
        if self.no_restartable {
            options.restartable = None;
        }
        if self.no_stdin {
            options.stdin = false;
        }
        if self.no_stdout {
            options.stdout = false;
        }
        if let Some(timeout) = &self.kill_timeout {
            options.kill_timeout = Some(timeout.clone());
        }
        for binding in &self.on {
            options
                .events
                .insert(binding.event.clone(), binding.command.clone());
        }
        if !self.command.is_empty() {
            options.exec = Some(self.command.join(" "));
        }
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
