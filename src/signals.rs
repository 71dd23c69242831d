//! Restart signal bridge.
//!
//! The supervisor sends one of `SIGUSR2`/`SIGHUP` to its child to ask it to restart.
//! The bridge listens for the *other* one and turns it into a restart, so a process
//! playing both roles never triggers itself.
use std::{
    fmt,
    str::FromStr,
    thread::{self, JoinHandle},
};

use serde::{Deserialize, Serialize};
use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, info};

use crate::{control::Control, error::ControlError};

/// The pair of signals used for restart requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum RestartSignal {
    /// `SIGUSR2`, the default outbound signal.
    #[default]
    #[serde(rename = "SIGUSR2")]
    SigUsr2,
    /// `SIGHUP`.
    #[serde(rename = "SIGHUP")]
    SigHup,
}

impl RestartSignal {
    /// Conventional signal name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartSignal::SigUsr2 => "SIGUSR2",
            RestartSignal::SigHup => "SIGHUP",
        }
    }

    /// Raw signal number.
    pub fn raw(&self) -> i32 {
        match self {
            RestartSignal::SigUsr2 => libc::SIGUSR2,
            RestartSignal::SigHup => libc::SIGHUP,
        }
    }

    /// The signal the bridge listens for when `self` is the outbound signal.
    pub fn inbound(&self) -> RestartSignal {
        match self {
            RestartSignal::SigUsr2 => RestartSignal::SigHup,
            RestartSignal::SigHup => RestartSignal::SigUsr2,
        }
    }

    /// Whether receiving `raw` should restart when `self` is the outbound signal.
    pub fn triggers_restart(&self, raw: i32) -> bool {
        raw == self.inbound().raw()
    }
}

impl fmt::Display for RestartSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RestartSignal {
    type Err = ControlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_ascii_uppercase();
        match upper.trim_start_matches("SIG") {
            "USR2" => Ok(RestartSignal::SigUsr2),
            "HUP" => Ok(RestartSignal::SigHup),
            _ => Err(ControlError::UnsupportedSignal(value.trim().to_string())),
        }
    }
}

/// Background listener translating the inbound restart signal into
/// [`Control::restart`].
pub struct SignalBridge {
    inbound: RestartSignal,
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalBridge {
    /// Starts listening for the counterpart of `outbound`.
    pub fn spawn(control: Control, outbound: RestartSignal) -> Result<Self, ControlError> {
        let inbound = outbound.inbound();
        let mut signals = Signals::new([inbound.raw()]).map_err(|source| {
            ControlError::SignalRegistration {
                signal: inbound.to_string(),
                source,
            }
        })?;
        let handle = signals.handle();

        let thread = thread::spawn(move || {
            for raw in signals.forever() {
                if outbound.triggers_restart(raw) {
                    info!("Received {inbound}; restarting");
                    control.restart();
                }
            }
            debug!("Signal bridge for {inbound} stopped");
        });

        info!("Send {inbound} to {} to restart", std::process::id());
        Ok(Self {
            inbound,
            handle,
            thread: Some(thread),
        })
    }

    /// Signal this bridge listens for.
    pub fn inbound(&self) -> RestartSignal {
        self.inbound
    }

    /// Stops the listener thread and waits for it to exit.
    pub fn close(mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.handle.close();
    }
}

impl fmt::Debug for SignalBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBridge")
            .field("inbound", &self.inbound)
            .finish()
    }
}
