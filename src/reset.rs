//! Reset cycle coordination.
//!
//! A reset detaches every listener registered through the facade, asks the process
//! collaborator for a forced kill, waits for the kill to be confirmed, clears shared
//! state and finally runs the caller's continuation. The steps never interleave:
//!
//! ```text
//! Idle ─► ListenersCleared ─► KillRequested ─► KillConfirmed ─► StateCleared ─► Done
//! ```
//!
//! The wait for confirmation is bounded. On timeout the cycle stops at
//! `KillRequested`, publishes [`Event::Error`] and hands
//! [`ResetError::KillTimeout`] to the continuation. A reset requested while another
//! one is running is rejected with [`ResetError::InProgress`].
use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    time::Duration,
};

use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{
    bus::SubscriptionHandle,
    error::ResetError,
    event::{Event, Payload},
    process::{KillConfirmation, ProcessControl},
    registry::Registry,
};

/// Shared state owned by a collaborator that must be cleared on every reset.
pub trait Resettable: Send + Sync {
    /// Drops any cached state.
    fn reset(&self);
}

/// Progress of the current (or last) reset cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ResetPhase {
    /// No reset has run yet.
    Idle,
    /// Facade listeners have been removed.
    ListenersCleared,
    /// A forced kill was requested; waiting for confirmation.
    KillRequested,
    /// The process collaborator confirmed the kill.
    KillConfirmed,
    /// Collaborator state was cleared and the running flag lowered.
    StateCleared,
    /// The continuation has been run.
    Done,
}

struct CoordinatorInner {
    registry: Registry,
    process: Arc<dyn ProcessControl>,
    hooks: Vec<Arc<dyn Resettable>>,
    running: Arc<AtomicBool>,
    in_progress: AtomicBool,
    kill_timeout: Mutex<Duration>,
    phase: Mutex<ResetPhase>,
}

/// Drives reset cycles in response to [`Event::Reset`].
#[derive(Clone)]
pub struct ResetCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ResetCoordinator {
    /// Creates a coordinator. `running` is lowered at the end of every cycle.
    pub fn new(
        registry: Registry,
        process: Arc<dyn ProcessControl>,
        hooks: Vec<Arc<dyn Resettable>>,
        running: Arc<AtomicBool>,
        kill_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                process,
                hooks,
                running,
                in_progress: AtomicBool::new(false),
                kill_timeout: Mutex::new(kill_timeout),
                phase: Mutex::new(ResetPhase::Idle),
            }),
        }
    }

    /// Subscribes the coordinator to [`Event::Reset`] directly on the bus, outside
    /// the registry, so that its own listener survives the cycles it runs.
    pub fn attach(&self) -> SubscriptionHandle {
        let coordinator = self.clone();
        self.inner
            .registry
            .bus()
            .subscribe(Event::Reset, move |payload| {
                let request = match payload {
                    Payload::Reset(request) => Some(request),
                    _ => None,
                };
                let outcome = coordinator.run_cycle();
                if let Some(request) = request {
                    request.complete(outcome);
                }
                if coordinator.phase() == ResetPhase::StateCleared {
                    coordinator.set_phase(ResetPhase::Done);
                }
            })
    }

    /// Current phase of the running or most recent cycle.
    pub fn phase(&self) -> ResetPhase {
        *self
            .inner
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bound on the wait for kill confirmation.
    pub fn kill_timeout(&self) -> Duration {
        *self
            .inner
            .kill_timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Changes the bound used by later cycles.
    pub fn set_kill_timeout(&self, timeout: Duration) {
        *self
            .inner
            .kill_timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = timeout;
    }

    /// Whether a cycle is currently running.
    pub fn in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ResetPhase) {
        debug!("reset phase: {}", phase.as_ref());
        *self
            .inner
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    /// Runs one full cycle on the calling thread.
    pub fn run_cycle(&self) -> Result<(), ResetError> {
        if self.inner.in_progress.swap(true, Ordering::SeqCst) {
            warn!("Reset requested while another reset is running; rejecting");
            return Err(ResetError::InProgress);
        }

        let outcome = self.drive();
        self.inner.in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    fn drive(&self) -> Result<(), ResetError> {
        let inner = &self.inner;
        self.set_phase(ResetPhase::Idle);

        let removed = inner.registry.remove_all(None);
        debug!("Detached {removed} listener(s) before reset");
        self.set_phase(ResetPhase::ListenersCleared);

        let (confirmation, confirmed) = KillConfirmation::channel();
        self.set_phase(ResetPhase::KillRequested);
        inner.process.kill(true, confirmation);

        let kill_timeout = self.kill_timeout();
        match confirmed.recv_timeout(kill_timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                let err = ResetError::KillTimeout(kill_timeout);
                error!("Reset aborted: {err}");
                inner
                    .registry
                    .bus()
                    .publish(&Event::Error, Payload::Message(err.to_string()));
                return Err(err);
            }
            Err(RecvTimeoutError::Disconnected) => {
                let err = ResetError::KillAbandoned;
                error!("Reset aborted: {err}");
                inner
                    .registry
                    .bus()
                    .publish(&Event::Error, Payload::Message(err.to_string()));
                return Err(err);
            }
        }
        self.set_phase(ResetPhase::KillConfirmed);

        for hook in &inner.hooks {
            hook.reset();
        }
        inner.running.store(false, Ordering::SeqCst);
        self.set_phase(ResetPhase::StateCleared);

        info!("Reset complete");
        Ok(())
    }
}

impl fmt::Debug for ResetCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetCoordinator")
            .field("phase", &self.phase())
            .field("in_progress", &self.in_progress())
            .field("kill_timeout", &self.kill_timeout())
            .finish()
    }
}
