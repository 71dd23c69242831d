use std::{
    error::Error,
    io,
    sync::{Arc, mpsc},
    thread,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relaunch::{
    bus::Bus,
    cli::{Cli, parse_args},
    config::{Options, load_config},
    control::Control,
    event::{Event, Payload},
    process::ChildProcess,
    signals::SignalBridge,
    stdin::{Interpreter, Mode, RawModeGuard, StdinReader, TerminalSink},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let mut options = load_config(args.config.as_deref())?;
    args.apply(&mut options);

    if args.dump {
        print!("{}", serde_yaml::to_string(&options)?);
        return Ok(());
    }

    run(options)
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run(options: Options) -> Result<(), Box<dyn Error>> {
    let bus = Bus::new();
    let process = Arc::new(ChildProcess::new(bus.clone()));
    let control = Control::builder(process).bus(bus.clone()).build();

    let (quit_tx, quit_rx) = mpsc::channel::<()>();
    bus.subscribe(Event::Quit, move |_| {
        let _ = quit_tx.send(());
    });
    if !options.stdout {
        bus.subscribe(Event::Readable, forward_output);
    }

    let interpreter = Interpreter::from_options(&options);
    let raw_mode = match &interpreter {
        Some(interpreter) if *interpreter.mode() == Mode::Raw => RawModeGuard::enable()?,
        _ => None,
    };
    // Without a raw terminal, Ctrl-C still arrives as SIGINT.
    if raw_mode.is_none() {
        register_interrupt_handler(bus.clone())?;
    }

    let bridge = SignalBridge::spawn(control.clone(), options.signal)?;
    control.boot(options)?;

    if let Some(interpreter) = interpreter {
        StdinReader::spawn(io::stdin(), interpreter, TerminalSink::new(bus.clone(), raw_mode));
    }

    let _ = quit_rx.recv();
    info!("Shutting down");
    bridge.close();

    let (done_tx, done_rx) = mpsc::channel();
    control.reset_with(move |outcome| {
        let _ = done_tx.send(outcome);
    });
    match done_rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            error!("Shutdown reset failed: {err}");
            Err(err.into())
        }
        Err(_) => {
            warn!("Reset finished without reporting an outcome");
            Ok(())
        }
    }
}

/// Copies the child's piped output to our own stdout and stderr.
fn forward_output(payload: &Payload) {
    let Payload::Output(output) = payload else {
        return;
    };
    let Some((mut stdout, mut stderr)) = output.take() else {
        return;
    };
    thread::spawn(move || {
        let _ = io::copy(&mut stdout, &mut io::stdout());
    });
    thread::spawn(move || {
        let _ = io::copy(&mut stderr, &mut io::stderr());
    });
}

/// Turns Ctrl-C into a `quit` event when the terminal is not in raw mode.
fn register_interrupt_handler(bus: Bus) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        bus.publish(&Event::Quit, Payload::None);
    })?;

    Ok(())
}
