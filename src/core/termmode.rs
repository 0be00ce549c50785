//! Terminal mode controller
//!
//! Switches the controlling terminal between raw and cooked mode. Raw mode
//! turns off canonical input, local echo, CR-to-NL translation and signal
//! generation, so Ctrl+C and friends arrive as plain bytes instead of killing
//! the session with the terminal still raw. Restoring writes back the
//! settings captured on entry.

use std::io;
use std::os::fd::AsFd;

use crossterm::tty::IsTty;
use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum TermModeError {
    #[error("Standard input is not a terminal")]
    NotATty,

    #[error("Failed to read terminal attributes: {0}")]
    GetAttr(#[source] nix::Error),

    #[error("Failed to set terminal attributes: {0}")]
    SetAttr(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, TermModeError>;

/// Derive raw-mode settings from the current ones
pub fn raw_settings(original: &Termios) -> Termios {
    let mut raw = original.clone();
    raw.local_flags
        .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
    raw.input_flags.remove(InputFlags::ICRNL);
    // Deliver every byte as soon as it arrives
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    raw
}

/// Controlling terminal with its pre-session settings
#[derive(Debug)]
pub struct TerminalMode {
    original: Termios,
}

impl TerminalMode {
    /// Put stdin's terminal into raw mode
    pub fn enter_raw() -> Result<Self> {
        let stdin = io::stdin();
        if !stdin.is_tty() {
            return Err(TermModeError::NotATty);
        }

        let original = termios::tcgetattr(stdin.as_fd()).map_err(TermModeError::GetAttr)?;
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw_settings(&original))
            .map_err(TermModeError::SetAttr)?;

        debug!("terminal switched to raw mode");
        Ok(Self { original })
    }

    /// Write back the settings captured by `enter_raw`
    pub fn restore(&self) -> Result<()> {
        termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &self.original)
            .map_err(TermModeError::SetAttr)?;

        debug!("terminal restored to cooked mode");
        Ok(())
    }
}

/// Restores cooked mode exactly once, on request or on drop.
///
/// Forked stages leave through `std::process::exit`, so the guard they inherit
/// never runs; only the session owner restores the terminal.
#[derive(Debug)]
pub struct RawModeGuard {
    mode: TerminalMode,
    restored: bool,
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        Ok(Self {
            mode: TerminalMode::enter_raw()?,
            restored: false,
        })
    }

    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        self.mode.restore()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("failed to restore terminal mode: {}", e);
        }
    }
}
