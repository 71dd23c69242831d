//! Event names and the payloads that travel with them on the bus.
use std::{
    fmt,
    process::{ChildStderr, ChildStdout},
    str::FromStr,
    sync::{Arc, Mutex},
};

use strum_macros::EnumString;

use crate::error::ResetError;

/// Names of the events exchanged over the bus.
///
/// The built-in lifecycle names form a closed set; anything else (for example names
/// bound through the `events` section of the config) parses to [`Event::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Event {
    /// The supervisor is booting, before the first reset.
    Boot,
    /// The supervised process has been spawned.
    Start,
    /// A restart of the supervised process was requested.
    Restart,
    /// A reset cycle was requested; carries a [`ResetRequest`].
    Reset,
    /// The supervised process exited cleanly.
    Exit,
    /// The supervised process exited with a failure.
    Crash,
    /// The supervisor is shutting down.
    Quit,
    /// The child's output streams are available to consumers.
    Readable,
    /// Something failed; carries a message.
    Error,
    /// A user-defined event name.
    #[strum(default)]
    Custom(String),
}

impl Event {
    /// Wire name of the event, as used in config files and logs.
    pub fn as_str(&self) -> &str {
        match self {
            Event::Boot => "boot",
            Event::Start => "start",
            Event::Restart => "restart",
            Event::Reset => "reset",
            Event::Exit => "exit",
            Event::Crash => "crash",
            Event::Quit => "quit",
            Event::Readable => "readable",
            Event::Error => "error",
            Event::Custom(name) => name,
        }
    }

    /// Parses an event name, mapping unknown names to [`Event::Custom`].
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        Event::from_str(name).unwrap_or_else(|_| Event::Custom(name.to_string()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Continuation run once a reset cycle has finished.
pub type ResetDone = Box<dyn FnOnce(Result<(), ResetError>) + Send + 'static>;

/// A pending reset continuation travelling with [`Event::Reset`].
///
/// The continuation can be taken exactly once; later calls to [`ResetRequest::take`]
/// return `None`.
#[derive(Default)]
pub struct ResetRequest {
    done: Mutex<Option<ResetDone>>,
}

impl ResetRequest {
    /// Wraps an optional continuation.
    pub fn new(done: Option<ResetDone>) -> Self {
        Self {
            done: Mutex::new(done),
        }
    }

    /// Removes the continuation, leaving the request empty.
    pub fn take(&self) -> Option<ResetDone> {
        self.done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Runs the continuation with `outcome` if it has not been consumed yet.
    pub fn complete(&self, outcome: Result<(), ResetError>) {
        if let Some(done) = self.take() {
            done(outcome);
        }
    }
}

impl fmt::Debug for ResetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .done
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        f.debug_struct("ResetRequest")
            .field("pending", &pending)
            .finish()
    }
}

/// Piped output streams of the child, handed out with [`Event::Readable`].
///
/// The first handler to call [`ChildOutput::take`] owns the streams and must keep
/// reading them; a child writing to a full pipe blocks.
///
/// Clones share the same streams.
#[derive(Clone, Default)]
pub struct ChildOutput {
    streams: Arc<Mutex<Option<(ChildStdout, ChildStderr)>>>,
}

impl ChildOutput {
    pub fn new(stdout: ChildStdout, stderr: ChildStderr) -> Self {
        Self {
            streams: Arc::new(Mutex::new(Some((stdout, stderr)))),
        }
    }

    /// Removes the streams, leaving the payload empty.
    pub fn take(&self) -> Option<(ChildStdout, ChildStderr)> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl fmt::Debug for ChildOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let available = self
            .streams
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        f.debug_struct("ChildOutput")
            .field("available", &available)
            .finish()
    }
}

/// Arguments carried by a publish and handed to every handler unchanged.
#[derive(Debug, Default)]
pub enum Payload {
    /// No arguments.
    #[default]
    None,
    /// Exit code of the supervised process, if it exited normally.
    Exit(Option<i32>),
    /// A free-form message (for example an error description).
    Message(String),
    /// Positional string arguments.
    Args(Vec<String>),
    /// Reset continuation.
    Reset(ResetRequest),
    /// Child output streams.
    Output(ChildOutput),
}

impl Payload {
    /// Flattens the payload into strings, as exported to bound shell commands.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Payload::None | Payload::Reset(_) | Payload::Output(_) => Vec::new(),
            Payload::Exit(Some(code)) => vec![code.to_string()],
            Payload::Exit(None) => Vec::new(),
            Payload::Message(message) => vec![message.clone()],
            Payload::Args(args) => args.clone(),
        }
    }
}
