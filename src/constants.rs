//! Defaults and fixed values used throughout relaunch.

use std::time::Duration;

/// Config file looked up when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "relaunch.yaml";

/// Upper bound on how long a reset waits for the process collaborator to confirm a kill.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL for a non-forced kill.
pub const TERM_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Interval between liveness probes while waiting for a child to exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on how long an event command may run before it is killed.
pub const EVENT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Literal typed on stdin in raw mode to quit the supervisor.
pub const EXIT_COMMAND: &str = ".exit";

/// Environment variable carrying the event name into bound commands.
pub const EVENT_ENV_VAR: &str = "RELAUNCH_EVENT";

/// Environment variable carrying the payload into bound commands.
pub const ARGS_ENV_VAR: &str = "RELAUNCH_ARGS";

/// Control bytes recognised by the stdin interpreter.
pub mod keys {
    /// Ctrl-C.
    pub const CTRL_C: u8 = 3;
    /// Ctrl-D.
    pub const CTRL_D: u8 = 4;
    /// Line feed.
    pub const LINE_FEED: u8 = 10;
    /// Ctrl-L (form feed).
    pub const CTRL_L: u8 = 12;
    /// Carriage return.
    pub const CARRIAGE_RETURN: u8 = 13;
}
