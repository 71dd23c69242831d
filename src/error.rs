//! Error handling for relaunch.
use std::time::Duration;

use thiserror::Error;

/// Defines all errors raised while wiring and driving the supervisor.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A configuration value could not be interpreted.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured restart signal is neither SIGUSR2 nor SIGHUP.
    #[error("Unsupported restart signal '{0}' (expected SIGUSR2 or SIGHUP)")]
    UnsupportedSignal(String),

    /// A `${VAR}` reference in the config file has no value in the environment.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// No command was supplied for the supervised process.
    #[error("No command configured for the supervised process")]
    MissingCommand,

    /// Error spawning the supervised process.
    #[error("Failed to start '{command}': {source}")]
    ProcessStartError {
        /// The command line that failed to start.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping the supervised process.
    #[error("Failed to stop process {pid}: {source}")]
    ProcessStopError {
        /// The PID that could not be signalled.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The previous child did not exit in time, so no replacement was started.
    #[error("Process {pid} did not exit within {timeout:?}")]
    ExitTimeout {
        /// The PID that was asked to stop.
        pid: u32,
        /// The configured bound.
        timeout: Duration,
    },

    /// Installing an OS signal listener failed.
    #[error("Failed to register handler for {signal}: {source}")]
    SignalRegistration {
        /// Name of the signal.
        signal: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Terminal mode changes or writes failed.
    #[error("Terminal error: {0}")]
    Terminal(std::io::Error),
}

/// Outcome handed to a reset continuation when the cycle could not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResetError {
    /// The process collaborator did not confirm the kill in time.
    #[error("Kill confirmation not received within {0:?}")]
    KillTimeout(Duration),

    /// The process collaborator dropped its confirmation without firing it.
    #[error("Kill confirmation was abandoned by the process collaborator")]
    KillAbandoned,

    /// Another reset cycle was already running.
    #[error("A reset is already in progress")]
    InProgress,
}
