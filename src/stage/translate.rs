//! Translation stage
//!
//! Consumes submitted lines, applies the remap and line-editing rules in a
//! single left-to-right pass, and forwards the result to the output stage.
//!
//! | Byte          | Effect                                  |
//! |---------------|-----------------------------------------|
//! | `a`           | written as `z`                          |
//! | `K`           | line kill: discard everything so far    |
//! | `X`           | backspace: remove the last written byte |
//! | anything else | copied unchanged                        |
//!
//! Every translated line ends in CR+NL.

use std::io::{Read, Write};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::KeyMap;
use crate::core::channel::{self, ChannelError};

/// Line terminator appended to every translated line
pub const LINE_TERMINATOR: &[u8; 2] = b"\r\n";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditError {
    #[error("backspace with nothing to remove")]
    Underflow,
}

/// Output of the remap pass, built only through checked edits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedLine {
    bytes: Vec<u8>,
}

impl TranslatedLine {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity + LINE_TERMINATOR.len()),
        }
    }

    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Cut the line back to `len` bytes. Longer lengths are a no-op.
    pub fn truncate_to(&mut self, len: usize) {
        self.bytes.truncate(len);
    }

    /// Remove the most recently written byte
    pub fn remove_last(&mut self) -> Result<u8, EditError> {
        self.bytes.pop().ok_or(EditError::Underflow)
    }

    #[allow(dead_code)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Append the terminator and hand out the finished bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.bytes.extend_from_slice(LINE_TERMINATOR);
        self.bytes
    }
}

/// Result of translating one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Translated bytes, terminator included
    pub line: Vec<u8>,
    /// Backspaces that found nothing to remove
    pub underflows: usize,
}

/// Apply the remap rules to one raw line
pub fn translate(input: &[u8], keys: &KeyMap) -> Translation {
    let mut out = TranslatedLine::with_capacity(input.len());
    let mut underflows = 0;

    for &byte in input {
        if byte == keys.remap_from {
            out.push(keys.remap_to);
        } else if byte == keys.line_kill {
            out.truncate_to(0);
        } else if byte == keys.backspace {
            if out.remove_last().is_err() {
                underflows += 1;
            }
        } else {
            out.push(byte);
        }
    }

    Translation {
        line: out.finish(),
        underflows,
    }
}

/// Translate every framed line from `inbound` until it closes.
///
/// Returns the number of lines translated.
pub fn run<R: Read, W: Write>(
    mut inbound: R,
    mut outbound: W,
    keys: &KeyMap,
) -> Result<usize, ChannelError> {
    info!(stage = "translate", "stage started");
    let mut lines = 0;

    while let Some(raw) = channel::read_frame(&mut inbound)? {
        let translation = translate(&raw, keys);
        if translation.underflows > 0 {
            warn!(
                stage = "translate",
                underflows = translation.underflows,
                "backspace past start of line clamped"
            );
        }

        channel::write_frame(&mut outbound, &translation.line)?;
        debug!(stage = "translate", len = translation.line.len(), "line translated");
        lines += 1;
    }

    info!(stage = "translate", lines, "inbound channel closed");
    Ok(lines)
}
