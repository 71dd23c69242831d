//! Keystroke interpreter for the supervisor's terminal input.
//!
//! Two modes, selected by configuration:
//!
//! - **Token mode** (a restart token is configured): every chunk is trimmed and
//!   lower-cased; a chunk equal to the token restarts the child, a chunk starting
//!   with Ctrl-L clears the screen.
//! - **Raw mode** (no token): bytes are delivered as typed. Two consecutive Ctrl-C
//!   presses, Ctrl-D, or typing `.exit` quit; Enter clears the pending buffer and
//!   Ctrl-L clears the screen.
use std::{
    io::{self, IsTerminal, Read, Write},
    os::fd::AsFd,
    thread::{self, JoinHandle},
};

use crossterm::{
    cursor::MoveTo,
    execute,
    terminal::{Clear, ClearType, disable_raw_mode, enable_raw_mode},
};
use nix::sys::termios::{self, OutputFlags, SetArg};
use tracing::{debug, info, warn};

use crate::{
    bus::Bus,
    config::Options,
    constants::{EXIT_COMMAND, keys},
    error::ControlError,
    event::{Event, Payload, ResetRequest},
};

/// What a chunk of input asks the supervisor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Restart the supervised process.
    Restart,
    /// Terminate the supervisor with the given exit code.
    Exit(i32),
    /// Clear the terminal.
    ClearScreen,
}

/// Interpretation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Line input compared against a restart token.
    Token(String),
    /// Unbuffered keystrokes.
    Raw,
}

/// Turns input chunks into [`Action`]s.
#[derive(Debug, Clone)]
pub struct Interpreter {
    mode: Mode,
    buffer: String,
    ctrl_c_armed: bool,
}

impl Interpreter {
    /// Interpreter restarting on `token`.
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            mode: Mode::Token(token.into()),
            buffer: String::new(),
            ctrl_c_armed: false,
        }
    }

    /// Interpreter for raw keystrokes.
    pub fn raw() -> Self {
        Self {
            mode: Mode::Raw,
            buffer: String::new(),
            ctrl_c_armed: false,
        }
    }

    /// Picks the mode from `options`; `None` when stdin handling is disabled.
    pub fn from_options(options: &Options) -> Option<Self> {
        if !options.stdin {
            return None;
        }
        Some(match options.restart_token() {
            Some(token) => Self::token(token),
            None => Self::raw(),
        })
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Characters typed since the last Enter or Ctrl-L (raw mode only).
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Whether the previous chunk was a lone Ctrl-C.
    pub fn ctrl_c_armed(&self) -> bool {
        self.ctrl_c_armed
    }

    /// Forgets any pending input.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.ctrl_c_armed = false;
    }

    /// Processes one chunk of input.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Action> {
        match &self.mode {
            Mode::Token(token) => Self::feed_token(token, chunk),
            Mode::Raw => self.feed_raw(chunk),
        }
    }

    fn feed_token(token: &str, chunk: &[u8]) -> Option<Action> {
        let text = String::from_utf8_lossy(chunk);
        if text.trim().to_lowercase() == token {
            Some(Action::Restart)
        } else if chunk.first() == Some(&keys::CTRL_L) {
            Some(Action::ClearScreen)
        } else {
            None
        }
    }

    fn feed_raw(&mut self, chunk: &[u8]) -> Option<Action> {
        let &first = chunk.first()?;

        if first == keys::CTRL_C {
            if self.ctrl_c_armed {
                self.reset();
                return Some(Action::Exit(0));
            }
            self.ctrl_c_armed = true;
            return None;
        }

        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let action = if self.buffer == EXIT_COMMAND || first == keys::CTRL_D {
            self.buffer.clear();
            Some(Action::Exit(0))
        } else if first == keys::CARRIAGE_RETURN || first == keys::LINE_FEED {
            self.buffer.clear();
            None
        } else if first == keys::CTRL_L {
            self.buffer.clear();
            Some(Action::ClearScreen)
        } else {
            None
        };

        self.ctrl_c_armed = false;
        action
    }
}

/// Receives the actions produced by the interpreter.
pub trait ActionSink: Send {
    /// Handles a restart request.
    fn restart(&mut self);
    /// Clears the terminal.
    fn clear_screen(&mut self);
    /// Terminates the supervisor.
    fn exit(&mut self, code: i32);
}

/// Puts the terminal into per-byte delivery for as long as it lives.
#[derive(Debug)]
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Enables raw mode when stdin is a terminal; returns `None` otherwise.
    pub fn enable() -> Result<Option<Self>, ControlError> {
        if !io::stdin().is_terminal() {
            debug!("stdin is not a terminal; leaving input buffered");
            return Ok(None);
        }
        enable_raw_mode().map_err(ControlError::Terminal)?;
        let guard = Self { _private: () };
        keep_output_processing(io::stdin().as_fd())?;
        Ok(Some(guard))
    }
}

/// Turns `\n` to `\r\n` translation back on after raw mode switched it off, so log
/// lines and child output keep starting at column zero.
fn keep_output_processing<Fd: AsFd>(fd: Fd) -> Result<(), ControlError> {
    let mut attrs =
        termios::tcgetattr(&fd).map_err(|err| ControlError::Terminal(err.into()))?;
    attrs
        .output_flags
        .insert(OutputFlags::OPOST | OutputFlags::ONLCR);
    termios::tcsetattr(&fd, SetArg::TCSANOW, &attrs)
        .map_err(|err| ControlError::Terminal(err.into()))
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = disable_raw_mode() {
            warn!("Failed to restore terminal mode: {err}");
        }
    }
}

/// Sink acting on the real terminal and process.
pub struct TerminalSink {
    bus: Bus,
    raw_mode: Option<RawModeGuard>,
}

impl TerminalSink {
    pub fn new(bus: Bus, raw_mode: Option<RawModeGuard>) -> Self {
        Self { bus, raw_mode }
    }
}

impl ActionSink for TerminalSink {
    fn restart(&mut self) {
        self.bus.publish(&Event::Restart, Payload::None);
    }

    fn clear_screen(&mut self) {
        let mut stdout = io::stdout();
        if let Err(err) = execute!(stdout, Clear(ClearType::All), MoveTo(0, 0)) {
            warn!("Failed to clear terminal: {err}");
        }
        let _ = stdout.flush();
    }

    fn exit(&mut self, code: i32) {
        info!("Exiting on terminal request");
        self.raw_mode.take();
        // Tear the child down before leaving so it is not orphaned.
        self.bus
            .publish(&Event::Reset, Payload::Reset(ResetRequest::new(None)));
        std::process::exit(code);
    }
}

/// Reads input on a background thread and dispatches interpreted actions.
pub struct StdinReader;

impl StdinReader {
    /// Spawns the reader loop. The thread ends when `input` reaches EOF or fails.
    pub fn spawn<R, S>(mut input: R, mut interpreter: Interpreter, mut sink: S) -> JoinHandle<()>
    where
        R: Read + Send + 'static,
        S: ActionSink + 'static,
    {
        thread::spawn(move || {
            let mut chunk = [0u8; 1024];
            loop {
                let read = match input.read(&mut chunk) {
                    Ok(0) => {
                        debug!("stdin closed");
                        break;
                    }
                    Ok(read) => read,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("Failed to read stdin: {err}");
                        break;
                    }
                };

                match interpreter.feed(&chunk[..read]) {
                    Some(Action::Restart) => sink.restart(),
                    Some(Action::ClearScreen) => sink.clear_screen(),
                    Some(Action::Exit(code)) => {
                        interpreter.reset();
                        sink.exit(code);
                    }
                    None => {}
                }
            }
        })
    }
}
