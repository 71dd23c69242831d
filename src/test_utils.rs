use std::{
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    config::Options,
    error::ControlError,
    process::{KillConfirmation, ProcessControl},
    reset::Resettable,
};

/// Global lock for environment variable modifications in tests.
/// All tests that modify environment variables should acquire this lock
/// to prevent race conditions between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How [`FakeProcess`] answers kill requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillBehaviour {
    /// Confirm synchronously inside `kill`.
    Confirm,
    /// Confirm from another thread after a delay.
    ConfirmAfter(Duration),
    /// Keep the confirmation without ever firing it.
    Never,
    /// Drop the confirmation without firing it.
    Abandon,
}

type KillProbe = Arc<dyn Fn() + Send + Sync>;

/// Process collaborator that records calls instead of touching real processes.
pub struct FakeProcess {
    behaviour: KillBehaviour,
    kills: Mutex<Vec<bool>>,
    runs: AtomicUsize,
    parked: Mutex<Vec<KillConfirmation>>,
    probe: Mutex<Option<KillProbe>>,
}

impl FakeProcess {
    pub fn new(behaviour: KillBehaviour) -> Self {
        Self {
            behaviour,
            kills: Mutex::new(Vec::new()),
            runs: AtomicUsize::new(0),
            parked: Mutex::new(Vec::new()),
            probe: Mutex::new(None),
        }
    }

    /// Runs `probe` at the start of every kill request, before confirming.
    pub fn on_kill(&self, probe: impl Fn() + Send + Sync + 'static) {
        *self.probe.lock().unwrap() = Some(Arc::new(probe));
    }

    /// `force` flag of every kill request so far.
    pub fn kills(&self) -> Vec<bool> {
        self.kills.lock().unwrap().clone()
    }

    /// Number of `run` calls so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl ProcessControl for FakeProcess {
    fn run(&self, _options: &Options) -> Result<(), ControlError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&self, force: bool, confirmation: KillConfirmation) {
        self.kills.lock().unwrap().push(force);
        let probe = self.probe.lock().unwrap().clone();
        if let Some(probe) = probe {
            probe();
        }

        match self.behaviour {
            KillBehaviour::Confirm => confirmation.confirm(),
            KillBehaviour::ConfirmAfter(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    confirmation.confirm();
                });
            }
            KillBehaviour::Never => self.parked.lock().unwrap().push(confirmation),
            KillBehaviour::Abandon => drop(confirmation),
        }
    }
}

/// Reset hook that counts how often it was cleared.
#[derive(Debug, Default)]
pub struct CountingHook {
    resets: AtomicUsize,
}

impl CountingHook {
    pub fn count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Resettable for CountingHook {
    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
