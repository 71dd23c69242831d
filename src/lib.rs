//! Relaunch is the control plane of a small process supervisor. It watches a running
//! child process and coordinates its restart: an event bus ties together a listener
//! registry, a reset coordinator that serializes teardown before reinitialisation,
//! a stdin interpreter for restart/exit keystrokes and a bridge from an OS signal to
//! a restart.

/// Event bus.
pub mod bus;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Defaults shared across modules.
pub mod constants;

/// Chainable facade over the bus, registry and reset coordinator.
pub mod control;

/// Error handling.
pub mod error;

/// Event names and payloads.
pub mod event;

/// Shell commands bound to bus events.
pub mod hooks;

/// Supervised child process collaborator.
pub mod process;

/// Listener tracking with bulk removal.
pub mod registry;

/// Reset cycle coordination.
pub mod reset;

/// Restart signal bridge.
pub mod signals;

/// Keystroke interpreter for terminal input.
pub mod stdin;

/// Helpers shared by unit and integration tests.
#[doc(hidden)]
pub mod test_utils;
