use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use relaunch::{
    bus::Bus,
    config::Options,
    control::Control,
    error::ResetError,
    event::{Event, Payload},
    process::{ChildProcess, ProcessControl},
    reset::{ResetPhase, Resettable},
    signals::RestartSignal,
    stdin::{Action, Interpreter},
    test_utils::{CountingHook, FakeProcess, KillBehaviour},
};

fn counter(calls: &Arc<AtomicUsize>) -> impl Fn(&Payload) + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_: &Payload| {
        calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn remove_all_for_one_event_leaves_others_attached() {
    let control = Control::builder(Arc::new(FakeProcess::new(KillBehaviour::Confirm))).build();
    let starts = Arc::new(AtomicUsize::new(0));
    let crashes = Arc::new(AtomicUsize::new(0));

    control
        .on(Event::Start, counter(&starts))
        .on(Event::Start, counter(&starts))
        .on(Event::Crash, counter(&crashes))
        .remove_all_listeners(Some(&Event::Start))
        .emit(Event::Start, Payload::None)
        .emit(Event::Crash, Payload::None);

    assert_eq!(starts.load(Ordering::SeqCst), 0);
    assert_eq!(crashes.load(Ordering::SeqCst), 1);
    assert_eq!(control.registry().tracked_count(&Event::Start), 0);
}

#[test]
fn once_listener_fires_exactly_once() {
    let control = Control::builder(Arc::new(FakeProcess::new(KillBehaviour::Confirm))).build();
    let calls = Arc::new(AtomicUsize::new(0));

    control.once(Event::Custom("deploy".into()), counter(&calls));
    for _ in 0..3 {
        control.emit(Event::Custom("deploy".into()), Payload::None);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(control.registry().total_tracked(), 0);
}

#[test]
fn reset_completes_only_after_kill_is_confirmed() {
    let process = Arc::new(FakeProcess::new(KillBehaviour::ConfirmAfter(
        Duration::from_millis(150),
    )));
    let hook = Arc::new(CountingHook::default());
    let control = Control::builder(process.clone())
        .reset_hook(hook.clone() as Arc<dyn Resettable>)
        .kill_timeout(Duration::from_secs(2))
        .build();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let listeners = control.registry().clone();
    process.on_kill(move || {
        seen.lock()
            .unwrap()
            .push(format!("kill:{}", listeners.total_tracked()));
    });

    control.on(Event::Start, |_| {});
    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    let done_order = Arc::clone(&order);
    control.reset_with(move |outcome| {
        done_order.lock().unwrap().push("done".to_string());
        let _ = tx.send(outcome);
    });

    let outcome = rx.recv_timeout(Duration::from_secs(5)).expect("continuation");
    assert_eq!(outcome, Ok(()));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(*order.lock().unwrap(), vec!["kill:0", "done"]);
    assert_eq!(process.kills(), vec![true]);
    assert_eq!(hook.count(), 1);
    assert_eq!(control.coordinator().phase(), ResetPhase::Done);
    assert!(!control.is_running());
}

#[test]
fn unconfirmed_kill_reports_timeout() {
    let control = Control::builder(Arc::new(FakeProcess::new(KillBehaviour::Never)))
        .kill_timeout(Duration::from_millis(100))
        .build();
    let (tx, rx) = mpsc::channel();
    control.reset_with(move |outcome| {
        let _ = tx.send(outcome);
    });

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("continuation"),
        Err(ResetError::KillTimeout(Duration::from_millis(100)))
    );
}

#[test]
fn boot_runs_the_process_with_loaded_options() {
    let process = Arc::new(FakeProcess::new(KillBehaviour::Confirm));
    let control = Control::builder(process.clone()).build();
    let boots = Arc::new(AtomicUsize::new(0));
    control.bus().subscribe(Event::Boot, counter(&boots));

    let options = Options {
        exec: Some("true".into()),
        ..Options::default()
    };
    control.boot(options.clone()).expect("boot");

    assert_eq!(boots.load(Ordering::SeqCst), 1);
    assert_eq!(process.runs(), 1);
    assert_eq!(process.kills(), vec![true]);
    assert_eq!(control.options(), Some(options));
    assert!(control.is_running());

    control.reset();
    assert_eq!(control.options(), None);
    assert!(!control.is_running());
}

#[test]
fn token_mode_restarts_on_trimmed_case_insensitive_match() {
    let mut interpreter = Interpreter::token("rs");
    assert_eq!(interpreter.feed(b"  RS\n"), Some(Action::Restart));
    assert_eq!(interpreter.feed(b"rsx\n"), None);
    assert_eq!(interpreter.feed(&[12]), Some(Action::ClearScreen));
}

#[test]
fn raw_mode_exits_on_double_ctrl_c_or_exit_command() {
    let mut interpreter = Interpreter::raw();
    assert_eq!(interpreter.feed(&[3]), None);
    assert_eq!(interpreter.feed(&[3]), Some(Action::Exit(0)));

    assert_eq!(interpreter.feed(&[3]), None);
    assert_eq!(interpreter.feed(b"x"), None);
    assert_eq!(interpreter.feed(&[3]), None);

    let mut interpreter = Interpreter::raw();
    for chunk in [&b"."[..], b"e", b"x", b"i"] {
        assert_eq!(interpreter.feed(chunk), None);
    }
    assert_eq!(interpreter.feed(b"t"), Some(Action::Exit(0)));
}

#[test]
fn configured_signal_selects_its_counterpart() {
    assert_eq!(RestartSignal::SigUsr2.inbound(), RestartSignal::SigHup);
    assert_eq!(RestartSignal::SigHup.inbound(), RestartSignal::SigUsr2);
    assert!(RestartSignal::SigUsr2.triggers_restart(libc::SIGHUP));
    assert!(!RestartSignal::SigUsr2.triggers_restart(libc::SIGUSR2));
    assert!("SIGTERM".parse::<RestartSignal>().is_err());
}

#[cfg(unix)]
#[test]
fn reset_stops_a_real_child() {
    let bus = Bus::new();
    let process = Arc::new(ChildProcess::new(bus.clone()));
    let control = Control::builder(process.clone() as Arc<dyn ProcessControl>)
        .bus(bus)
        .kill_timeout(Duration::from_secs(5))
        .build();

    let started = Arc::new(AtomicUsize::new(0));
    control.bus().subscribe(Event::Start, counter(&started));
    control
        .boot(Options {
            exec: Some("sleep 30".into()),
            stdin: false,
            ..Options::default()
        })
        .expect("boot");

    assert_eq!(started.load(Ordering::SeqCst), 1);
    let pid = process.pid().expect("child pid");

    let (tx, rx) = mpsc::channel();
    control.reset_with(move |outcome| {
        let _ = tx.send(outcome);
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).expect("continuation"), Ok(()));
    assert!(process.pid().is_none());
    assert!(wait_until(Duration::from_secs(2), || unsafe {
        libc::kill(pid as i32, 0) != 0
    }));
}

#[cfg(unix)]
#[test]
fn restarts_racing_a_reset_leave_no_child_behind() {
    let bus = Bus::new();
    let process = Arc::new(ChildProcess::new(bus.clone()));
    let control = Control::builder(process.clone() as Arc<dyn ProcessControl>)
        .bus(bus.clone())
        .build();

    let started = Arc::new(Mutex::new(Vec::new()));
    let pids = Arc::clone(&started);
    bus.subscribe(Event::Start, move |payload| {
        if let Some(pid) = payload.to_args().first().and_then(|pid| pid.parse::<i32>().ok()) {
            pids.lock().unwrap().push(pid);
        }
    });

    control
        .boot(Options {
            exec: Some("sleep 30".into()),
            stdin: false,
            kill_timeout: Some("5s".into()),
            ..Options::default()
        })
        .expect("boot");

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let restarter = {
        let control = control.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                control.restart();
            }
        })
    };
    thread::sleep(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    control.reset_with(move |outcome| {
        let _ = tx.send(outcome);
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).expect("continuation"), Ok(()));

    // Restarts after the reset must not bring a child back.
    thread::sleep(Duration::from_millis(200));
    stop.store(true, Ordering::SeqCst);
    restarter.join().expect("restarter thread");

    assert!(!control.is_running());
    assert!(process.pid().is_none());
    let started = started.lock().unwrap().clone();
    assert!(!started.is_empty());
    for pid in started {
        assert!(
            wait_until(Duration::from_secs(5), || unsafe { libc::kill(pid, 0) != 0 }),
            "child {pid} outlived the reset"
        );
    }
}
