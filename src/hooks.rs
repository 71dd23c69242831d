//! Shell commands bound to bus events through the `events` config section.
use std::{
    collections::BTreeMap,
    process::{Child, Command, ExitStatus},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    constants::{ARGS_ENV_VAR, EVENT_COMMAND_TIMEOUT, EVENT_ENV_VAR, EXIT_POLL_INTERVAL},
    control::Control,
    event::Event,
};

/// Subscribes a command runner for every `event name -> command` entry.
///
/// Subscriptions go through the facade, so a reset detaches them like any other
/// consumer listener.
pub fn bind_event_commands(control: &Control, events: &BTreeMap<String, String>) {
    for (name, command) in events {
        let event = Event::parse(name);
        info!("Bind {event} -> `{command}`");

        let command = command.clone();
        let label = event.clone();
        control.on(event, move |payload| {
            spawn_event_command(&label, &command, payload.to_args());
        });
    }
}

/// Runs `command` on a background thread so the publishing thread is never blocked.
fn spawn_event_command(event: &Event, command: &str, args: Vec<String>) {
    let event = event.clone();
    let command = command.to_string();
    thread::spawn(move || run_event_command(&event, &command, &args, EVENT_COMMAND_TIMEOUT));
}

fn run_event_command(event: &Event, command: &str, args: &[String], timeout: Duration) {
    debug!("Running '{event}' command: `{command}`");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .env(EVENT_ENV_VAR, event.as_str())
        .env(ARGS_ENV_VAR, args.join(" "));

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("Failed to run '{event}' command `{command}`: {err}");
            return;
        }
    };

    match wait_with_timeout(&mut child, timeout) {
        Ok(Some(status)) if status.success() => {
            debug!("'{event}' command completed successfully.");
        }
        Ok(Some(status)) => {
            warn!("'{event}' command exited with status: {status:?}");
        }
        Ok(None) => {
            warn!("'{event}' command timed out after {timeout:?}. Terminating it.");
            if let Err(err) = child.kill() {
                error!("Failed to terminate timed-out '{event}' command: {err}");
            }
            let _ = child.wait();
        }
        Err(err) => {
            error!("Failed while waiting for '{event}' command: {err}");
        }
    }
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(EXIT_POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use tempfile::tempdir;

    use super::*;
    use crate::{
        event::Payload,
        test_utils::{FakeProcess, KillBehaviour},
    };

    fn wait_for_file(path: &std::path::Path) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(content) = fs::read_to_string(path)
                && content.ends_with('\n')
            {
                return Some(content);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn bound_command_receives_event_and_args() {
        let dir = tempdir().expect("tempdir");
        let out = dir.path().join("out.txt");
        let control =
            Control::builder(Arc::new(FakeProcess::new(KillBehaviour::Confirm))).build();

        let mut events = BTreeMap::new();
        events.insert(
            "deploy".to_string(),
            format!(
                "echo \"${EVENT_ENV_VAR} ${ARGS_ENV_VAR}\" > {}",
                out.display()
            ),
        );
        bind_event_commands(&control, &events);
        assert_eq!(
            control
                .registry()
                .tracked_count(&Event::Custom("deploy".into())),
            1
        );

        control.emit(
            Event::Custom("deploy".into()),
            Payload::Args(vec!["v1".into(), "fast".into()]),
        );

        assert_eq!(wait_for_file(&out).as_deref(), Some("deploy v1 fast\n"));
    }

    #[test]
    fn bindings_are_detached_by_reset() {
        let control =
            Control::builder(Arc::new(FakeProcess::new(KillBehaviour::Confirm))).build();
        let mut events = BTreeMap::new();
        events.insert("crash".to_string(), "true".to_string());
        bind_event_commands(&control, &events);
        assert_eq!(control.registry().tracked_count(&Event::Crash), 1);

        control.reset();
        assert_eq!(control.registry().tracked_count(&Event::Crash), 0);
    }

    #[test]
    fn slow_command_is_killed_after_timeout() {
        let started = Instant::now();
        run_event_command(
            &Event::Custom("slow".into()),
            "sleep 5",
            &[],
            Duration::from_millis(100),
        );
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
