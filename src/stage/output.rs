//! Output stage
//!
//! The only writer to the display. Merges the echo channel and the
//! translated-line channel: it sleeps in `poll(2)` until either has data,
//! renders whatever is ready, and flushes. The two channels are drained
//! independently, so a translated line may land between unrelated echoes.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use crate::core::channel::{ChannelError, FrameDecoder};

/// Bytes pulled from the translated-line channel per wake-up
const READ_BUFFER_SIZE: usize = 1024;

/// Result of a single non-blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStatus {
    Data(usize),
    Empty,
    Closed,
}

fn try_read(mut file: &File, buf: &mut [u8]) -> io::Result<ReadStatus> {
    match file.read(buf) {
        Ok(0) => Ok(ReadStatus::Closed),
        Ok(n) => Ok(ReadStatus::Data(n)),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
            Ok(ReadStatus::Empty)
        }
        Err(e) => Err(e),
    }
}

/// The output stage, rendering to `W`
pub struct OutputStage<W> {
    /// Echo channel, `None` once its producer has gone away
    echo: Option<File>,
    /// Translated-line channel, `None` once its producer has gone away
    translated: Option<File>,
    decoder: FrameDecoder,
    display: W,
}

impl<W: Write> OutputStage<W> {
    /// Both readers are expected to be in non-blocking mode
    pub fn new(echo: File, translated: File, display: W) -> Self {
        Self {
            echo: Some(echo),
            translated: Some(translated),
            decoder: FrameDecoder::new(),
            display,
        }
    }

    /// Render until both producers have closed their ends
    pub fn run(&mut self) -> Result<(), ChannelError> {
        info!(stage = "output", "stage started");

        while self.is_open() {
            self.wait()?;
            self.poll_once()?;
        }

        if self.decoder.has_partial() {
            warn!(stage = "output", "translated channel closed mid-line");
        }
        info!(stage = "output", "all channels closed");
        Ok(())
    }

    /// True while at least one inbound channel may still deliver data
    pub fn is_open(&self) -> bool {
        self.echo.is_some() || self.translated.is_some()
    }

    /// Block until an open channel is readable or hung up
    fn wait(&self) -> Result<(), ChannelError> {
        let mut fds: Vec<PollFd<'_>> = self
            .echo
            .iter()
            .chain(self.translated.iter())
            .map(|file| PollFd::new(file.as_fd(), PollFlags::POLLIN))
            .collect();

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(ChannelError::Wait(e)),
        }
    }

    /// One pass over both channels: at most one echo byte and at most one
    /// buffer of translated data, then flush. Never blocks.
    pub fn poll_once(&mut self) -> Result<(), ChannelError> {
        if let Some(echo) = &self.echo {
            let mut byte = [0u8; 1];
            match try_read(echo, &mut byte)? {
                ReadStatus::Data(_) => self.display.write_all(&byte)?,
                ReadStatus::Empty => {}
                ReadStatus::Closed => {
                    debug!(stage = "output", "echo channel closed");
                    self.echo = None;
                }
            }
        }

        if let Some(translated) = &self.translated {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            match try_read(translated, &mut buf)? {
                ReadStatus::Data(n) => {
                    self.decoder.push(&buf[..n]);
                    while let Some(line) = self.decoder.next_frame() {
                        self.display.write_all(&line)?;
                    }
                }
                ReadStatus::Empty => {}
                ReadStatus::Closed => {
                    debug!(stage = "output", "translated channel closed");
                    self.translated = None;
                }
            }
        }

        self.display.flush()?;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn display(&self) -> &W {
        &self.display
    }

    #[allow(dead_code)]
    pub fn into_display(self) -> W {
        self.display
    }
}
