use std::{
    fs,
    process::{Command as StdCommand, Stdio},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use predicates::{boolean::PredicateBooleanExt, str::contains};
use tempfile::tempdir;

fn relaunch() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("relaunch"))
}

#[test]
fn help_lists_restart_options() {
    relaunch()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("--signal").and(contains("--restartable")));
}

#[test]
fn unsupported_restart_signal_is_rejected() {
    relaunch()
        .args(["--signal", "SIGTERM", "--", "true"])
        .assert()
        .failure()
        .stderr(contains("Unsupported restart signal"));
}

#[test]
fn dump_reflects_command_line_flags() {
    let temp = tempdir().expect("failed to create tempdir");
    relaunch()
        .current_dir(temp.path())
        .args(["--dump", "--signal", "hup", "--no-restartable", "--", "sleep", "1"])
        .assert()
        .success()
        .stdout(
            contains("signal: SIGHUP")
                .and(contains("restartable: null"))
                .and(contains("exec: sleep 1")),
        );
}

#[test]
fn dump_reads_config_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = temp.path().join("custom.yaml");
    fs::write(
        &config,
        r#"
signal: SIGHUP
restartable: go
kill_timeout: 250ms
events:
  crash: "echo crashed"
exec: "node server.js"
"#,
    )
    .expect("failed to write config");

    relaunch()
        .arg("-c")
        .arg(&config)
        .arg("--dump")
        .assert()
        .success()
        .stdout(
            contains("restartable: go")
                .and(contains("kill_timeout: 250ms"))
                .and(contains("crash: echo crashed")),
        );
}

#[test]
fn invalid_kill_timeout_fails_before_starting() {
    let temp = tempdir().expect("failed to create tempdir");
    relaunch()
        .current_dir(temp.path())
        .args(["--no-stdin", "--kill-timeout", "soon", "--", "true"])
        .assert()
        .failure();
}

#[test]
fn missing_config_file_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");
    relaunch()
        .arg("-c")
        .arg(temp.path().join("absent.yaml"))
        .arg("--dump")
        .assert()
        .failure();
}

#[cfg(unix)]
#[test]
fn interrupt_without_a_terminal_tears_the_child_down() {
    let temp = tempdir().expect("failed to create tempdir");
    let pid_file = temp.path().join("child.pid");

    let mut supervisor = StdCommand::new(assert_cmd::cargo::cargo_bin!("relaunch"))
        .current_dir(temp.path())
        .arg("--no-restartable")
        .arg("--on")
        .arg(format!("start=echo $RELAUNCH_ARGS > {}", pid_file.display()))
        .args(["--", "sleep", "30"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start relaunch");

    let deadline = Instant::now() + Duration::from_secs(10);
    let child_pid = loop {
        if let Ok(content) = fs::read_to_string(&pid_file)
            && let Ok(pid) = content.trim().parse::<i32>()
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "child never started");
        thread::sleep(Duration::from_millis(50));
    };

    unsafe {
        libc::kill(supervisor.id() as i32, libc::SIGINT);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = supervisor.try_wait().expect("try_wait") {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = supervisor.kill();
            panic!("relaunch did not exit after SIGINT");
        }
        thread::sleep(Duration::from_millis(50));
    };

    assert!(status.success(), "relaunch ended with {status:?}");
    assert_ne!(unsafe { libc::kill(child_pid, 0) }, 0, "child outlived relaunch");
}
