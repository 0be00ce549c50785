//! Session management
//!
//! A session runs from raw-mode entry to cooked-mode restoration. The process
//! hosting the input stage owns it: it forks the output and translation
//! stages, runs the input stage itself, and tears the peers down when the
//! input stage returns.

use std::fs::File;
use std::io::{self, Read, Write};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, kill, killpg, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpgrp, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelError, Channels};
use super::termmode::{RawModeGuard, TermModeError};
use crate::config::{Config, KeyMap};
use crate::stage::input::{InputExit, InputStage};
use crate::stage::output::OutputStage;
use crate::stage::translate;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to switch terminal mode: {0}")]
    TermMode(#[from] TermModeError),

    #[error("Error during forking: {0}")]
    Spawn(#[source] nix::Error),
}

impl SessionError {
    /// Process exit status for this failure. Terminal mode failures get their
    /// own status so they can be told apart from pipe setup failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::TermMode(_) => 2,
            SessionError::Channel(_) | SessionError::Spawn(_) => 1,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Terminate key or end of input, peers drained and stopped
    Completed,
    /// Control-kill, the whole process group was sent SIGQUIT
    Killed,
}

impl SessionOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            SessionOutcome::Completed => 0,
            SessionOutcome::Killed => 128 + Signal::SIGQUIT as i32,
        }
    }
}

/// Forked stages, owned by the session owner
#[derive(Debug, Default)]
pub struct Peers {
    output: Option<Pid>,
    translator: Option<Pid>,
}

impl Peers {
    pub fn new(output: Option<Pid>, translator: Option<Pid>) -> Self {
        Self { output, translator }
    }

    /// True once every peer has been reaped
    pub fn is_empty(&self) -> bool {
        self.output.is_none() && self.translator.is_none()
    }

    /// Give peers up to `grace` to exit on their own, then kill whatever is
    /// left. Returns how each peer ended.
    pub fn shutdown(&mut self, grace: Duration) -> Vec<WaitStatus> {
        let deadline = Instant::now() + grace;
        let mut statuses = Vec::new();
        loop {
            statuses.extend(self.reap_exited());
            if self.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        statuses.extend(self.kill_all());
        statuses
    }

    /// Reap peers that have already exited, without blocking
    fn reap_exited(&mut self) -> Vec<WaitStatus> {
        let mut statuses = Vec::new();
        for slot in [&mut self.output, &mut self.translator] {
            let Some(pid) = *slot else { continue };
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    debug!(?status, "peer exited");
                    statuses.push(status);
                    *slot = None;
                }
                Err(e) => {
                    warn!("waitpid({}) failed: {}", pid, e);
                    *slot = None;
                }
            }
        }
        statuses
    }

    /// SIGKILL and reap every peer still held
    pub fn kill_all(&mut self) -> Vec<WaitStatus> {
        let mut statuses = Vec::new();
        for slot in [&mut self.output, &mut self.translator] {
            let Some(pid) = slot.take() else { continue };
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                debug!("kill({}) failed: {}", pid, e);
            }
            statuses.extend(Self::reap(pid));
        }
        statuses
    }

    /// Block until every peer has been reaped
    fn wait_all(&mut self) -> Vec<WaitStatus> {
        [self.output.take(), self.translator.take()]
            .into_iter()
            .flatten()
            .filter_map(Self::reap)
            .collect()
    }

    fn reap(pid: Pid) -> Option<WaitStatus> {
        match waitpid(pid, None) {
            Ok(status) => {
                debug!(?status, "peer reaped");
                Some(status)
            }
            Err(e) => {
                debug!("waitpid({}) failed: {}", pid, e);
                None
            }
        }
    }
}

/// Write ends the input stage feeds once the peers are running
#[derive(Debug)]
pub struct StageWriters {
    echo: File,
    line: File,
}

/// Run a stage body in a forked child and leave without unwinding, so
/// nothing inherited from the owner (the raw mode guard in particular) runs.
fn exit_child(stage: &str, result: Result<(), ChannelError>) -> ! {
    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            error!(stage, "stage failed: {}", e);
            1
        }
    };
    process::exit(code)
}

/// Fork the output stage, rendering to `display`, and the translation stage.
/// The caller keeps only the two write ends the input stage needs.
fn spawn_stages<D: Write>(
    channels: Channels,
    display: D,
    keys: KeyMap,
) -> Result<(Peers, StageWriters), SessionError> {
    let Channels {
        echo,
        line,
        translated,
    } = channels;

    // SAFETY: the child only runs the stage body and exits
    let output_pid = match unsafe { fork() }.map_err(SessionError::Spawn)? {
        ForkResult::Child => {
            drop(line);
            drop(echo.writer);
            drop(translated.writer);
            let mut stage = OutputStage::new(echo.reader, translated.reader, display);
            exit_child("output", stage.run())
        }
        ForkResult::Parent { child } => child,
    };

    // SAFETY: as above
    let translator_pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(display);
            drop(echo);
            drop(line.writer);
            drop(translated.reader);
            let result = translate::run(line.reader, translated.writer, &keys).map(|_| ());
            exit_child("translate", result)
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            Peers::new(Some(output_pid), None).kill_all();
            return Err(SessionError::Spawn(e));
        }
    };

    // The owner only writes echo bytes and raw lines
    drop(display);
    drop(echo.reader);
    drop(line.reader);
    drop(translated);

    info!(%output_pid, %translator_pid, "stages started");
    let writers = StageWriters {
        echo: echo.writer,
        line: line.writer,
    };
    Ok((Peers::new(Some(output_pid), Some(translator_pid)), writers))
}

/// Run the input stage in the owner. Returns once the stage stops, with both
/// writers closed so the peers can drain and exit.
fn run_input<R: Read>(writers: StageWriters, input: R, config: &Config) -> InputExit {
    let mut stage = InputStage::new(writers.echo, writers.line, config.keys, config.line_capacity);
    match stage.run(input) {
        Ok(exit) => exit,
        Err(e) => {
            error!("input stage failed: {}", e);
            InputExit::Terminated
        }
    }
}

/// Run a full session on the controlling terminal
pub fn run(config: &Config) -> Result<SessionOutcome, SessionError> {
    let channels = Channels::open()?;
    let mut guard = RawModeGuard::enter()?;

    let (mut peers, writers) = spawn_stages(channels, io::stdout(), config.keys)?;
    info!("session started");

    match run_input(writers, io::stdin().lock(), config) {
        InputExit::Killed => {
            abort(&mut guard, &mut peers);
            Ok(SessionOutcome::Killed)
        }
        InputExit::Terminated | InputExit::EndOfInput => Ok(complete(
            &mut peers,
            config.shutdown_grace,
            || guard.restore(),
        )),
    }
}

/// Orderly teardown: let the peers drain, then restore the terminal. Every
/// stage has finished by the time `restore` runs, so a failed restore is
/// logged and the session still counts as completed.
fn complete<F>(peers: &mut Peers, grace: Duration, restore: F) -> SessionOutcome
where
    F: FnOnce() -> Result<(), TermModeError>,
{
    peers.shutdown(grace);
    if let Err(e) = restore() {
        warn!("failed to restore terminal mode: {}", e);
    }
    info!("session completed");
    SessionOutcome::Completed
}

/// Control-kill teardown: restore the terminal first, then quit the whole
/// process group at once.
fn abort(guard: &mut RawModeGuard, peers: &mut Peers) {
    if let Err(e) = guard.restore() {
        warn!("failed to restore terminal mode: {}", e);
    }
    quit_group(peers);
}

/// Send SIGQUIT to the caller's process group and reap the peers. The caller
/// ignores the signal so it survives to reap.
fn quit_group(peers: &mut Peers) -> Vec<WaitStatus> {
    // SAFETY: installing SIG_IGN runs no handler code
    if let Err(e) = unsafe { signal::signal(Signal::SIGQUIT, SigHandler::SigIgn) } {
        warn!("failed to ignore SIGQUIT: {}", e);
    }

    warn!("control-kill: sending SIGQUIT to the process group");
    if let Err(e) = killpg(getpgrp(), Signal::SIGQUIT) {
        error!("killpg failed: {}, killing peers directly", e);
        return peers.kill_all();
    }
    peers.wait_all()
}
