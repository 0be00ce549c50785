//! brokenterm - a deliberately odd terminal line discipline
//!
//! brokenterm puts the terminal into raw mode and re-implements a tiny line
//! discipline in user space, using three cooperating processes connected by
//! pipes: an input stage, a translation stage and an output stage.
//!
//! # Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | E | Submit the current line |
//! | T | Submit the current line and exit |
//! | Ctrl+K | Abort the whole session immediately |
//! | a | Shown as `z` in the submitted line |
//! | X | Backspace (applied when the line is submitted) |
//! | K | Line kill (applied when the line is submitted) |
//!
//! Bindings are fixed; logs go to `~/.brokenterm/brokenterm.log`. Ctrl+C,
//! Ctrl+\\ and Ctrl+Z do not raise signals while the session runs.
//!
//! # Exit status
//!
//! - `0`: normal exit
//! - `1`: pipe, non-blocking flag or fork failure
//! - `2`: the terminal could not be switched to raw mode
//! - `131`: aborted with Ctrl+K

mod config;
mod core;
mod stage;

use std::fs::{self, OpenOptions};
use std::process;
use std::sync::Mutex;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::core::session;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log to `~/.brokenterm/brokenterm.log`; stdout belongs to the output stage
fn init_logging() -> anyhow::Result<()> {
    let dir = config::data_dir().context("no home directory")?;
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let log_path = dir.join("brokenterm.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing subscriber")?;
    Ok(())
}

fn main() {
    // Logging is best effort; the terminal is not the place to complain
    let _ = init_logging();
    info!("brokenterm {} starting...", VERSION);

    let config = Config::default();

    let code = match session::run(&config) {
        Ok(outcome) => {
            info!(?outcome, "session ended");
            outcome.exit_code()
        }
        Err(e) => {
            error!("startup failed: {}", e);
            eprint!("\r\n{}\r\n", e);
            e.exit_code()
        }
    };

    process::exit(code);
}
