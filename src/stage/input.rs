//! Input stage
//!
//! Owns the keystroke stream. Every byte is acted on as soon as it arrives:
//! ordinary bytes are echoed and collected in a [`LineBuffer`], and the
//! submit/terminate keys ship the collected line to the translation stage.

use std::io::{self, Read, Write};

use crossterm::queue;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::KeyMap;
use crate::core::channel::{self, ChannelError};

/// One classified input byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keystroke {
    /// Echoed and appended to the line
    Ordinary(u8),
    /// Submit the current line
    Submit,
    /// Submit the current line and end the session normally
    Terminate,
    /// End the whole session immediately
    Kill,
}

impl Keystroke {
    pub fn classify(byte: u8, keys: &KeyMap) -> Self {
        if byte == keys.kill {
            Keystroke::Kill
        } else if byte == keys.submit {
            Keystroke::Submit
        } else if byte == keys.terminate {
            Keystroke::Terminate
        } else {
            Keystroke::Ordinary(byte)
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineBufferError {
    #[error("Please keep it under {capacity}!")]
    Full { capacity: usize },
}

/// Bytes typed since the last submit.
///
/// Holds at most `capacity - 1` bytes; one slot is kept in reserve.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl LineBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a byte, or report that the line is full
    pub fn push(&mut self, byte: u8) -> Result<(), LineBufferError> {
        if self.bytes.len() >= self.limit() {
            return Err(LineBufferError::Full {
                capacity: self.capacity,
            });
        }
        self.bytes.push(byte);
        Ok(())
    }

    /// Hand out the current line and start a new one
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.bytes, Vec::with_capacity(self.capacity))
    }

    #[allow(dead_code)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Maximum number of bytes a line can hold
    pub fn limit(&self) -> usize {
        self.capacity - 1
    }
}

/// How the input loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputExit {
    /// Terminate key: orderly teardown
    Terminated,
    /// Kill key: immediate whole-session teardown
    Killed,
    /// Keystroke source closed; treated like `Terminated`
    EndOfInput,
}

/// The input stage, writing echo bytes to `E` and framed lines to `L`
pub struct InputStage<E, L> {
    echo: E,
    lines: L,
    keys: KeyMap,
    buffer: LineBuffer,
}

impl<E: Write, L: Write> InputStage<E, L> {
    pub fn new(echo: E, lines: L, keys: KeyMap, capacity: usize) -> Self {
        Self {
            echo,
            lines,
            keys,
            buffer: LineBuffer::with_capacity(capacity),
        }
    }

    /// Read keystrokes one byte at a time until a terminating event
    pub fn run<R: Read>(&mut self, input: R) -> Result<InputExit, ChannelError> {
        info!(stage = "input", "stage started");

        for byte in input.bytes() {
            if let Some(exit) = self.handle(byte?)? {
                info!(stage = "input", ?exit, "stage finished");
                return Ok(exit);
            }
        }

        self.end_line()?;
        info!(stage = "input", "keystroke source closed");
        Ok(InputExit::EndOfInput)
    }

    /// Process a single keystroke. Returns `Some` when the loop must stop.
    pub fn handle(&mut self, byte: u8) -> Result<Option<InputExit>, ChannelError> {
        match Keystroke::classify(byte, &self.keys) {
            Keystroke::Kill => {
                warn!(stage = "input", "control-kill received");
                Ok(Some(InputExit::Killed))
            }
            Keystroke::Submit => {
                self.end_line()?;
                Ok(None)
            }
            Keystroke::Terminate => {
                self.end_line()?;
                Ok(Some(InputExit::Terminated))
            }
            Keystroke::Ordinary(b) => {
                self.echo.write_all(&[b])?;
                if let Err(e) = self.buffer.push(b) {
                    warn!(stage = "input", byte = b, "line buffer full, byte dropped");
                    self.notify(&e)?;
                }
                Ok(None)
            }
        }
    }

    /// Echo CR+NL and send the collected line to the translator
    fn end_line(&mut self) -> Result<(), ChannelError> {
        self.echo.write_all(b"\r\n")?;

        let line = self.buffer.take();
        if !line.is_empty() {
            channel::write_frame(&mut self.lines, &line)?;
        }
        debug!(stage = "input", len = line.len(), "line flushed");
        Ok(())
    }

    /// Show a notice through the echo channel
    fn notify(&mut self, error: &LineBufferError) -> io::Result<()> {
        queue!(
            self.echo,
            Print("\r\n"),
            SetForegroundColor(Color::Yellow),
            Print(error),
            ResetColor,
            Print("\r\n")
        )
    }

    #[allow(dead_code)]
    pub fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }

    #[allow(dead_code)]
    pub fn into_inner(self) -> (E, L) {
        (self.echo, self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::read_frame;

    fn stage(capacity: usize) -> InputStage<Vec<u8>, Vec<u8>> {
        InputStage::new(Vec::new(), Vec::new(), KeyMap::default(), capacity)
    }

    fn frames(mut wire: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = read_frame(&mut wire).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_classify() {
        let keys = KeyMap::default();
        assert_eq!(Keystroke::classify(11, &keys), Keystroke::Kill);
        assert_eq!(Keystroke::classify(b'E', &keys), Keystroke::Submit);
        assert_eq!(Keystroke::classify(b'T', &keys), Keystroke::Terminate);
        assert_eq!(Keystroke::classify(b'a', &keys), Keystroke::Ordinary(b'a'));
        // Line editing keys belong to the translator
        assert_eq!(Keystroke::classify(b'K', &keys), Keystroke::Ordinary(b'K'));
        assert_eq!(Keystroke::classify(b'X', &keys), Keystroke::Ordinary(b'X'));
    }

    #[test]
    fn test_line_buffer_capacity() {
        let mut buffer = LineBuffer::with_capacity(4);
        for b in b"abc" {
            buffer.push(*b).unwrap();
        }
        assert_eq!(buffer.push(b'd'), Err(LineBufferError::Full { capacity: 4 }));
        assert_eq!(buffer.as_bytes(), b"abc");

        assert_eq!(buffer.take(), b"abc".to_vec());
        assert!(buffer.is_empty());
        buffer.push(b'x').unwrap();
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_default_capacity_limit() {
        let mut buffer = LineBuffer::with_capacity(1024);
        for _ in 0..1023 {
            buffer.push(b'q').unwrap();
        }
        assert!(buffer.push(b'q').is_err());
        assert_eq!(buffer.len(), 1023);
    }

    #[test]
    fn test_ordinary_bytes_echo_and_accumulate() {
        let mut stage = stage(1024);
        let exit = stage.run(&b"hello"[..]).unwrap();

        assert_eq!(exit, InputExit::EndOfInput);
        let (echo, lines) = stage.into_inner();
        assert_eq!(echo, b"hello\r\n");
        assert_eq!(frames(&lines), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_submit_flushes_independent_lines() {
        let mut stage = stage(1024);
        assert_eq!(stage.handle(b'a').unwrap(), None);
        assert_eq!(stage.handle(b'b').unwrap(), None);
        assert_eq!(stage.handle(b'E').unwrap(), None);
        assert!(stage.buffer().is_empty());

        stage.handle(b'c').unwrap();
        stage.handle(b'E').unwrap();

        let (echo, lines) = stage.into_inner();
        assert_eq!(echo, b"ab\r\nc\r\n");
        assert_eq!(frames(&lines), vec![b"ab".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_empty_submit_sends_nothing() {
        let mut stage = stage(1024);
        stage.handle(b'E').unwrap();

        let (echo, lines) = stage.into_inner();
        assert_eq!(echo, b"\r\n");
        assert!(lines.is_empty());
    }

    #[test]
    fn test_terminate_flushes_then_stops() {
        let mut stage = stage(1024);
        let exit = stage.run(&b"abTignored"[..]).unwrap();

        assert_eq!(exit, InputExit::Terminated);
        let (echo, lines) = stage.into_inner();
        assert_eq!(echo, b"ab\r\n");
        assert_eq!(frames(&lines), vec![b"ab".to_vec()]);
    }

    #[test]
    fn test_kill_stops_without_flush() {
        let mut stage = stage(1024);
        let exit = stage.run(&b"ab\x0bcd"[..]).unwrap();

        assert_eq!(exit, InputExit::Killed);
        let (echo, lines) = stage.into_inner();
        assert_eq!(echo, b"ab");
        assert!(lines.is_empty());
    }

    #[test]
    fn test_signal_keys_are_ordinary_bytes() {
        // With ISIG off, Ctrl+C, Ctrl+\ and Ctrl+Z reach the stage as data
        let mut stage = stage(1024);
        let exit = stage.run(&b"a\x03b\x1c\x1aE"[..]).unwrap();

        assert_eq!(exit, InputExit::EndOfInput);
        let (echo, lines) = stage.into_inner();
        assert_eq!(echo, b"a\x03b\x1c\x1a\r\n\r\n");
        assert_eq!(frames(&lines), vec![b"a\x03b\x1c\x1a".to_vec()]);
    }

    #[test]
    fn test_full_buffer_drops_byte_and_continues() {
        let mut stage = stage(3);
        let exit = stage.run(&b"xyzE"[..]).unwrap();
        assert_eq!(exit, InputExit::EndOfInput);

        let (echo, lines) = stage.into_inner();
        let echo = String::from_utf8_lossy(&echo).into_owned();

        // Dropped byte is still echoed, then the notice follows
        assert!(echo.starts_with("xyz\r\n"));
        assert!(echo.contains("Please keep it under 3!"));
        assert_eq!(frames(&lines), vec![b"xy".to_vec()]);
    }
}
