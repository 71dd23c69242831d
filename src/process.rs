//! Supervised child process collaborator.
//!
//! The control plane never spawns or kills anything itself; it talks to a
//! [`ProcessControl`] implementation. [`ChildProcess`] is the stock implementation
//! used by the binary: it runs the configured command through `sh -c` in its own
//! process group and reports lifecycle events back onto the bus.
use std::{
    io,
    os::unix::process::CommandExt,
    process::{Child, ChildStderr, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    bus::Bus,
    config::Options,
    constants::{DEFAULT_KILL_TIMEOUT, EXIT_POLL_INTERVAL, TERM_GRACE_PERIOD},
    error::ControlError,
    event::{Event, Payload},
};

/// One-shot acknowledgement that a kill request has finished.
#[derive(Debug)]
pub struct KillConfirmation {
    tx: SyncSender<()>,
}

impl KillConfirmation {
    /// Creates a confirmation and the receiver that observes it.
    pub fn channel() -> (Self, Receiver<()>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Self { tx }, rx)
    }

    /// Reports that the process is gone.
    pub fn confirm(self) {
        let _ = self.tx.send(());
    }
}

/// Interface to whatever spawns and terminates the supervised process.
pub trait ProcessControl: Send + Sync {
    /// Starts the supervised process described by `options`.
    fn run(&self, options: &Options) -> Result<(), ControlError>;

    /// Terminates the supervised process and then fires `confirmation`.
    ///
    /// `force` skips any grace period. Implementations may confirm from another
    /// thread; dropping the confirmation without firing it signals failure. Restart
    /// requests arriving after a kill must not bring the process back until the
    /// next [`ProcessControl::run`].
    fn kill(&self, force: bool, confirmation: KillConfirmation);

    /// Takes the piped output of the current child, if it was started without
    /// inherited stdout.
    fn take_output(&self) -> Option<(ChildStdout, ChildStderr)> {
        None
    }
}

struct Running {
    child: Child,
    generation: u64,
}

struct ChildState {
    /// Armed by `run`, disarmed by `kill`. Restarts are ignored while unset.
    command: Option<String>,
    inherit_stdout: bool,
    kill_timeout: Duration,
    running: Option<Running>,
    output: Option<(ChildStdout, ChildStderr)>,
}

struct ChildInner {
    bus: Bus,
    state: Mutex<ChildState>,
    /// Held across a whole restart or kill so the two never interleave.
    lifecycle: Mutex<()>,
    generation: AtomicU64,
}

/// Runs the configured command as a child process.
#[derive(Clone)]
pub struct ChildProcess {
    inner: Arc<ChildInner>,
}

impl ChildProcess {
    /// Creates the collaborator and subscribes it to [`Event::Restart`].
    ///
    /// The subscription is made directly on the bus so it is not detached by resets.
    pub fn new(bus: Bus) -> Self {
        let process = Self {
            inner: Arc::new(ChildInner {
                bus: bus.clone(),
                state: Mutex::new(ChildState {
                    command: None,
                    inherit_stdout: true,
                    kill_timeout: DEFAULT_KILL_TIMEOUT,
                    running: None,
                    output: None,
                }),
                lifecycle: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        };

        let restarter = process.clone();
        bus.subscribe(Event::Restart, move |_| {
            if let Err(err) = restarter.restart() {
                error!("Failed to restart child process: {err}");
                restarter
                    .inner
                    .bus
                    .publish(&Event::Error, Payload::Message(err.to_string()));
            }
        });
        process
    }

    fn state(&self) -> MutexGuard<'_, ChildState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// PID of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.state().running.as_ref().map(|running| running.child.id())
    }

    /// Spawns the armed command. The caller holds the lifecycle lock.
    fn spawn(&self) -> Result<u32, ControlError> {
        let mut state = self.state();
        let command_line = state.command.clone().ok_or(ControlError::MissingCommand)?;

        let mut command = Command::new("sh");
        command.arg("-c").arg(&command_line).process_group(0);
        if !state.inherit_stdout {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .map_err(|source| ControlError::ProcessStartError {
                command: command_line.clone(),
                source,
            })?;

        let pid = child.id();
        state.output = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => Some((stdout, stderr)),
            _ => None,
        };
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        state.running = Some(Running { child, generation });
        drop(state);

        info!("Starting `{command_line}` (PID {pid})");
        self.spawn_monitor(generation);
        Ok(pid)
    }

    /// Publishes `start` once no lock is held, so handlers may restart or reset.
    fn announce(&self, pid: u32) {
        self.inner
            .bus
            .publish(&Event::Start, Payload::Args(vec![pid.to_string()]));
    }

    /// Watches one generation of the child and reports how it ended.
    fn spawn_monitor(&self, generation: u64) {
        let process = self.clone();
        thread::spawn(move || {
            loop {
                thread::sleep(EXIT_POLL_INTERVAL);

                let exited = {
                    let mut state = process.state();
                    let Some(running) = state.running.as_mut() else {
                        return;
                    };
                    if running.generation != generation {
                        return;
                    }
                    match running.child.try_wait() {
                        Ok(Some(status)) => {
                            state.running = None;
                            status
                        }
                        Ok(None) => continue,
                        Err(err) => {
                            error!("Failed to check status of child process: {err}");
                            state.running = None;
                            return;
                        }
                    }
                };

                if exited.success() {
                    info!("Child process exited cleanly; waiting for restart");
                    process
                        .inner
                        .bus
                        .publish(&Event::Exit, Payload::Exit(exited.code()));
                } else {
                    warn!("Child process crashed ({exited}); waiting for restart");
                    process
                        .inner
                        .bus
                        .publish(&Event::Crash, Payload::Exit(exited.code()));
                }
                return;
            }
        });
    }

    /// Stops the current child, if any, and starts a fresh one.
    ///
    /// Ignored after a kill until the next `run`. Fails without spawning when the
    /// old child does not exit within the configured kill timeout.
    pub fn restart(&self) -> Result<(), ControlError> {
        let pid = {
            let _lifecycle = self.lifecycle();
            let (previous, timeout) = {
                let mut state = self.state();
                if state.command.is_none() {
                    debug!("Restart requested while no command is armed; ignoring");
                    return Ok(());
                }
                state.output = None;
                (state.running.take(), state.kill_timeout)
            };

            if let Some(previous) = previous {
                let pid = previous.child.id();
                let (confirmation, confirmed) = KillConfirmation::channel();
                stop(previous, false, confirmation);
                if confirmed.recv_timeout(timeout).is_err() {
                    return Err(ControlError::ExitTimeout { pid, timeout });
                }
            }
            self.spawn()?
        };

        self.announce(pid);
        Ok(())
    }
}

impl ProcessControl for ChildProcess {
    fn run(&self, options: &Options) -> Result<(), ControlError> {
        let command = options
            .exec
            .clone()
            .filter(|exec| !exec.trim().is_empty())
            .ok_or(ControlError::MissingCommand)?;
        let kill_timeout = options.kill_timeout()?;

        let pid = {
            let _lifecycle = self.lifecycle();
            {
                let mut state = self.state();
                state.command = Some(command);
                state.inherit_stdout = options.stdout;
                state.kill_timeout = kill_timeout;
            }
            self.spawn()?
        };

        self.announce(pid);
        Ok(())
    }

    fn kill(&self, force: bool, confirmation: KillConfirmation) {
        let _lifecycle = self.lifecycle();
        let running = {
            let mut state = self.state();
            state.command = None;
            state.output = None;
            state.running.take()
        };

        match running {
            Some(running) => stop(running, force, confirmation),
            None => {
                debug!("No child process running; nothing to kill");
                confirmation.confirm();
            }
        }
    }

    fn take_output(&self) -> Option<(ChildStdout, ChildStderr)> {
        self.state().output.take()
    }
}

/// Terminates and reaps `running` on a background thread, then confirms.
fn stop(running: Running, force: bool, confirmation: KillConfirmation) {
    thread::spawn(move || {
        let mut child = running.child;
        if let Err(err) = terminate(&mut child, force) {
            error!("{err}");
        }
        if let Err(err) = child.wait() {
            warn!("Failed to reap child process: {err}");
        }
        confirmation.confirm();
    });
}

/// Sends SIGTERM (or SIGKILL when forced) to the child's process group and
/// escalates to SIGKILL if it outlives the grace period.
fn terminate(child: &mut Child, force: bool) -> Result<(), ControlError> {
    fn stop_error(pid: u32, err: Errno) -> ControlError {
        ControlError::ProcessStopError {
            pid,
            source: io::Error::from_raw_os_error(err as i32),
        }
    }

    let pid = child.id();
    let target = Pid::from_raw(pid as i32);
    let first = if force { Signal::SIGKILL } else { Signal::SIGTERM };

    debug!("Sending {} to process group {pid}", first.as_str());
    match signal::killpg(target, first) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(Errno::EPERM) => {
            warn!("Cannot signal process group {pid}; signalling the process directly");
            match signal::kill(target, first) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => return Err(stop_error(pid, err)),
            }
        }
        Err(err) => return Err(stop_error(pid, err)),
    }

    if force {
        return Ok(());
    }

    let deadline = Instant::now() + TERM_GRACE_PERIOD;
    while Instant::now() < deadline {
        let exited = child
            .try_wait()
            .map_err(|source| ControlError::ProcessStopError { pid, source })?;
        if exited.is_some() {
            return Ok(());
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }

    warn!("PID {pid} did not exit after SIGTERM; sending SIGKILL");
    match signal::killpg(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(stop_error(pid, err)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn options(exec: &str) -> Options {
        Options {
            exec: Some(exec.to_string()),
            ..Options::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn run_requires_a_command() {
        let process = ChildProcess::new(Bus::new());
        let err = process.run(&Options::default()).unwrap_err();
        assert!(matches!(err, ControlError::MissingCommand));
    }

    #[test]
    fn kill_without_child_confirms_immediately() {
        let process = ChildProcess::new(Bus::new());
        let (confirmation, confirmed) = KillConfirmation::channel();
        process.kill(true, confirmation);
        assert!(confirmed.recv_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn forced_kill_stops_the_child_and_confirms() {
        let bus = Bus::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        bus.subscribe(Event::Start, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let process = ChildProcess::new(bus);
        process.run(&options("sleep 30")).expect("child starts");
        let pid = process.pid().expect("child pid");
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let (confirmation, confirmed) = KillConfirmation::channel();
        process.kill(true, confirmation);
        assert!(confirmed.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(process.pid().is_none());
        assert!(matches!(
            signal::kill(Pid::from_raw(pid as i32), None),
            Err(Errno::ESRCH)
        ));
    }

    #[test]
    fn crash_is_published_with_exit_code() {
        let bus = Bus::new();
        let code = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&code);
        bus.subscribe(Event::Crash, move |payload| {
            if let Payload::Exit(exit) = payload {
                *sink.lock().unwrap() = Some(*exit);
            }
        });

        let process = ChildProcess::new(bus);
        process.run(&options("exit 3")).expect("child starts");

        assert!(wait_until(|| code.lock().unwrap().is_some()));
        assert_eq!(*code.lock().unwrap(), Some(Some(3)));
    }

    #[test]
    fn restart_event_replaces_the_child() {
        let bus = Bus::new();
        let process = ChildProcess::new(bus.clone());
        process.run(&options("sleep 30")).expect("child starts");
        let first = process.pid().expect("first pid");

        bus.publish(&Event::Restart, Payload::None);
        let second = process.pid().expect("second pid");
        assert_ne!(first, second);

        let (confirmation, confirmed) = KillConfirmation::channel();
        process.kill(true, confirmation);
        assert!(confirmed.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn restart_after_kill_is_ignored_until_next_run() {
        let bus = Bus::new();
        let process = ChildProcess::new(bus.clone());
        process.run(&options("sleep 30")).expect("child starts");

        let (confirmation, confirmed) = KillConfirmation::channel();
        process.kill(true, confirmation);
        assert!(confirmed.recv_timeout(Duration::from_secs(5)).is_ok());

        bus.publish(&Event::Restart, Payload::None);
        process.restart().expect("ignored restart is not an error");
        assert!(process.pid().is_none());

        process.run(&options("sleep 30")).expect("child starts again");
        assert!(process.pid().is_some());
        let (confirmation, confirmed) = KillConfirmation::channel();
        process.kill(true, confirmation);
        assert!(confirmed.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn restart_gives_up_when_old_child_outlives_kill_timeout() {
        let process = ChildProcess::new(Bus::new());
        process
            .run(&Options {
                kill_timeout: Some("200ms".into()),
                ..options("trap '' TERM; sleep 30")
            })
            .expect("child starts");
        thread::sleep(Duration::from_millis(200));
        let stubborn = process.pid().expect("child pid");

        let err = process.restart().unwrap_err();
        assert!(matches!(
            err,
            ControlError::ExitTimeout { pid, timeout }
                if pid == stubborn && timeout == Duration::from_millis(200)
        ));
        assert!(process.pid().is_none());

        // The grace period ends in SIGKILL.
        assert!(wait_until(|| matches!(
            signal::kill(Pid::from_raw(stubborn as i32), None),
            Err(Errno::ESRCH)
        )));
    }

    #[test]
    fn piped_output_is_handed_out_once() {
        let process = ChildProcess::new(Bus::new());
        process
            .run(&Options {
                stdout: false,
                ..options("echo hello")
            })
            .expect("child starts");

        let (mut stdout, _stderr) = process.take_output().expect("piped output");
        assert!(process.take_output().is_none());

        let mut text = String::new();
        std::io::Read::read_to_string(&mut stdout, &mut text).expect("read stdout");
        assert_eq!(text, "hello\n");
    }
}
