//! Chainable facade over the bus, listener registry and reset coordinator.
use std::{
    backtrace::Backtrace,
    fmt,
    io::{self, Read},
    process::{ChildStderr, ChildStdout},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info};

use crate::{
    bus::{Bus, SubscriptionHandle},
    config::{ConfigStore, Options},
    constants::DEFAULT_KILL_TIMEOUT,
    error::{ControlError, ResetError},
    event::{ChildOutput, Event, Payload, ResetRequest},
    hooks,
    process::ProcessControl,
    registry::Registry,
    reset::{ResetCoordinator, Resettable},
};

/// Assembles a [`Control`] around a process collaborator.
pub struct ControlBuilder {
    bus: Bus,
    process: Arc<dyn ProcessControl>,
    hooks: Vec<Arc<dyn Resettable>>,
    kill_timeout: Duration,
}

impl ControlBuilder {
    /// Uses an existing bus instead of a fresh one.
    pub fn bus(mut self, bus: Bus) -> Self {
        self.bus = bus;
        self
    }

    /// Registers extra state to clear on every reset.
    pub fn reset_hook(mut self, hook: Arc<dyn Resettable>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Bounds the wait for kill confirmation during a reset.
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Wires the components together and attaches the reset coordinator.
    pub fn build(self) -> Control {
        let registry = Registry::new(self.bus.clone());
        let running = Arc::new(AtomicBool::new(false));
        let config = Arc::new(ConfigStore::new());

        let config_hook: Arc<dyn Resettable> = config.clone();
        let mut hooks = vec![config_hook];
        hooks.extend(self.hooks);

        let coordinator = ResetCoordinator::new(
            registry.clone(),
            Arc::clone(&self.process),
            hooks,
            Arc::clone(&running),
            self.kill_timeout,
        );
        coordinator.attach();

        Control {
            inner: Arc::new(ControlInner {
                bus: self.bus,
                registry,
                coordinator,
                process: self.process,
                running,
                config,
                error_logger: OnceLock::new(),
            }),
        }
    }
}

struct ControlInner {
    bus: Bus,
    registry: Registry,
    coordinator: ResetCoordinator,
    process: Arc<dyn ProcessControl>,
    running: Arc<AtomicBool>,
    config: Arc<ConfigStore>,
    error_logger: OnceLock<SubscriptionHandle>,
}

/// Public handle to the supervisor's control plane. Cheap to clone.
///
/// Every method returns `&Self` so calls can be chained:
///
/// ```ignore
/// control
///     .on(Event::Start, |_| println!("started"))
///     .once(Event::Crash, |_| println!("crashed"))
///     .restart();
/// ```
#[derive(Clone)]
pub struct Control {
    inner: Arc<ControlInner>,
}

impl Control {
    /// Starts building a control plane around `process`.
    pub fn builder(process: Arc<dyn ProcessControl>) -> ControlBuilder {
        ControlBuilder {
            bus: Bus::new(),
            process,
            hooks: Vec::new(),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    /// The shared bus.
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Listener bookkeeping for subscriptions made through this facade.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The reset coordinator attached to the bus.
    pub fn coordinator(&self) -> &ResetCoordinator {
        &self.inner.coordinator
    }

    /// Options of the current run, if booted and not reset since.
    pub fn options(&self) -> Option<Options> {
        self.inner.config.get()
    }

    /// Whether the supervised process is considered running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribes `handler` to `event`.
    pub fn on<F>(&self, event: Event, handler: F) -> &Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.inner.registry.on(event, handler);
        self
    }

    /// Subscribes `handler` to the next publish of `event`.
    pub fn once<F>(&self, event: Event, handler: F) -> &Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.inner.registry.once(event, handler);
        self
    }

    /// Publishes `event` with `payload`.
    pub fn emit(&self, event: Event, payload: Payload) -> &Self {
        self.inner.bus.publish(&event, payload);
        self
    }

    /// Removes listeners added through this facade, for one event or all of them.
    pub fn remove_all_listeners(&self, event: Option<&Event>) -> &Self {
        self.inner.registry.remove_all(event);
        self
    }

    /// Asks the process collaborator to restart the child.
    pub fn restart(&self) -> &Self {
        info!("Restarting child process");
        self.inner.bus.publish(&Event::Restart, Payload::None);
        self
    }

    /// Runs a reset cycle without a continuation.
    pub fn reset(&self) -> &Self {
        self.inner
            .bus
            .publish(&Event::Reset, Payload::Reset(ResetRequest::new(None)));
        self
    }

    /// Runs a reset cycle and hands its outcome to `done` exactly once.
    pub fn reset_with<F>(&self, done: F) -> &Self
    where
        F: FnOnce(Result<(), ResetError>) + Send + 'static,
    {
        let request = ResetRequest::new(Some(Box::new(done)));
        self.inner.bus.publish(&Event::Reset, Payload::Reset(request));
        self
    }

    /// Boots the supervisor with `options` and starts the child.
    ///
    /// Applies the configured kill timeout, publishes `boot`, runs a reset, installs
    /// the error logger, binds the configured event commands and hands over to the
    /// process collaborator.
    pub fn boot(&self, options: Options) -> Result<&Self, ControlError> {
        let kill_timeout = options.kill_timeout()?;
        self.inner.coordinator.set_kill_timeout(kill_timeout);

        self.emit(Event::Boot, Payload::None);
        self.reset();

        self.install_error_logger();
        if let Some(token) = options.restart_token() {
            info!("To restart at any time, enter `{token}`");
        }

        if !options.stdout {
            let bus = self.inner.bus.clone();
            let process = Arc::clone(&self.inner.process);
            self.on(Event::Start, move |_| {
                announce_output(&bus, process.take_output());
            });
        }

        hooks::bind_event_commands(self, &options.events);

        self.inner.config.set(options.clone());
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.process.run(&options)?;
        Ok(self)
    }

    /// Logs every `error` publish with a backtrace. Subscribed directly on the bus,
    /// once, so resets do not detach it.
    fn install_error_logger(&self) {
        self.inner.error_logger.get_or_init(|| {
            self.inner.bus.subscribe(Event::Error, |payload| {
                error!("{}", error_report(payload));
            })
        });
    }
}

fn error_report(payload: &Payload) -> String {
    let message = match payload {
        Payload::Message(message) => message.clone(),
        other => format!("{other:?}"),
    };
    format!("{message}\n{}", Backtrace::force_capture())
}

/// Publishes `readable` with the child's streams. Streams nobody took are drained
/// so the child never blocks on a full pipe.
fn announce_output(bus: &Bus, streams: Option<(ChildStdout, ChildStderr)>) {
    let Some((stdout, stderr)) = streams else {
        bus.publish(&Event::Readable, Payload::None);
        return;
    };

    let output = ChildOutput::new(stdout, stderr);
    bus.publish(&Event::Readable, Payload::Output(output.clone()));
    if let Some((stdout, stderr)) = output.take() {
        debug!("No consumer took the child's output; discarding it");
        drain(stdout);
        drain(stderr);
    }
}

fn drain<R: Read + Send + 'static>(mut stream: R) {
    thread::spawn(move || {
        let _ = io::copy(&mut stream, &mut io::sink());
    });
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("bus", &self.inner.bus)
            .field("coordinator", &self.inner.coordinator)
            .field("running", &self.is_running())
            .finish()
    }
}
