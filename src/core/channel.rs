//! Byte-stream channels between the pipeline stages
//!
//! Each channel is a unidirectional pipe with exactly one producer and one
//! consumer. The echo channel is a plain byte stream. The two line-carrying
//! channels use length-prefixed frames, so a reader never depends on the pipe
//! preserving write boundaries.
//!
//! # Frame format
//!
//! ```text
//! +----------------+------------------------+
//! | len: u16 (BE)  | payload: len bytes     |
//! +----------------+------------------------+
//! ```

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;
use thiserror::Error;

/// Size of the frame length prefix in bytes
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a single frame can carry
#[allow(dead_code)]
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Opening pipe failed: {0}")]
    PipeCreation(#[source] nix::Error),

    #[error("Error setting flag on pipe: {0}")]
    NonBlocking(#[source] nix::Error),

    #[error("Frame of {0} bytes exceeds the channel limit")]
    FrameTooLarge(usize),

    #[error("Channel closed in the middle of a frame")]
    Truncated,

    #[error("Waiting on channels failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("Channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// A single pipe
#[derive(Debug)]
pub struct Channel {
    pub reader: File,
    pub writer: File,
}

impl Channel {
    /// Create a new pipe. Both ends start in blocking mode.
    pub fn open() -> Result<Self> {
        let (read_fd, write_fd) = unistd::pipe().map_err(ChannelError::PipeCreation)?;
        Ok(Self {
            reader: File::from(read_fd),
            writer: File::from(write_fd),
        })
    }

    /// Switch the read end to non-blocking mode
    pub fn set_reader_nonblocking(&self) -> Result<()> {
        let fd = self.reader.as_raw_fd();
        let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(ChannelError::NonBlocking)?;
        let flags = OFlag::from_bits_truncate(bits) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(ChannelError::NonBlocking)?;
        Ok(())
    }
}

/// The three pipes wiring the stages together
#[derive(Debug)]
pub struct Channels {
    /// Input stage -> output stage (raw echo bytes)
    pub echo: Channel,
    /// Input stage -> translation stage (framed raw lines)
    pub line: Channel,
    /// Translation stage -> output stage (framed translated lines)
    pub translated: Channel,
}

impl Channels {
    /// Create all three pipes. The two read by the output stage are made
    /// non-blocking; the translator's inbound pipe stays blocking.
    pub fn open() -> Result<Self> {
        let channels = Self {
            echo: Channel::open()?,
            line: Channel::open()?,
            translated: Channel::open()?,
        };
        channels.echo.set_reader_nonblocking()?;
        channels.translated.set_reader_nonblocking()?;
        Ok(channels)
    }
}

/// Write one frame. Header and payload go out in a single write, which keeps
/// frames below `PIPE_BUF` atomic.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u16::try_from(payload.len())
        .map_err(|_| ChannelError::FrameTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    Ok(())
}

/// Block until a whole frame is available.
///
/// Returns `Ok(None)` when the channel is closed on a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        FRAME_HEADER_LEN => {}
        _ => return Err(ChannelError::Truncated),
    }

    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? != len {
        return Err(ChannelError::Truncated);
    }
    Ok(Some(payload))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reassembles frames from arbitrarily split reads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the channel
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one has fully arrived
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < FRAME_HEADER_LEN {
            return None;
        }

        let len = u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
        let end = FRAME_HEADER_LEN + len;
        if self.pending.len() < end {
            return None;
        }

        let frame = self.pending[FRAME_HEADER_LEN..end].to_vec();
        self.pending.drain(..end);
        Some(frame)
    }

    /// True if some bytes of an unfinished frame are buffered
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_over_pipe() {
        let Channel { mut reader, mut writer } = Channel::open().unwrap();

        write_frame(&mut writer, b"hello").unwrap();
        write_frame(&mut writer, b"").unwrap();
        write_frame(&mut writer, b"world").unwrap();
        drop(writer);

        assert_eq!(read_frame(&mut reader).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).unwrap(), Some(b"world".to_vec()));
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_truncated_frame() {
        // Header promises 4 bytes, only 2 arrive
        let mut data: &[u8] = &[0x00, 0x04, b'a', b'b'];
        assert!(matches!(read_frame(&mut data), Err(ChannelError::Truncated)));

        let mut data: &[u8] = &[0x00];
        assert!(matches!(read_frame(&mut data), Err(ChannelError::Truncated)));
    }

    #[test]
    fn test_frame_too_large() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let mut sink = Vec::new();
        assert!(matches!(
            write_frame(&mut sink, &payload),
            Err(ChannelError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_decoder_reassembles_split_frames() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"zbc\r\n").unwrap();
        write_frame(&mut wire, b"cd\r\n").unwrap();

        let mut decoder = FrameDecoder::new();

        // Split inside the first header
        decoder.push(&wire[..1]);
        assert_eq!(decoder.next_frame(), None);
        assert!(decoder.has_partial());

        // Split inside the first payload
        decoder.push(&wire[1..4]);
        assert_eq!(decoder.next_frame(), None);

        decoder.push(&wire[4..]);
        assert_eq!(decoder.next_frame(), Some(b"zbc\r\n".to_vec()));
        assert_eq!(decoder.next_frame(), Some(b"cd\r\n".to_vec()));
        assert_eq!(decoder.next_frame(), None);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_nonblocking_reader_would_block() {
        let channel = Channel::open().unwrap();
        channel.set_reader_nonblocking().unwrap();

        let mut reader = &channel.reader;
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_channels_open() {
        let mut channels = Channels::open().unwrap();

        // Line channel stays blocking, but data written is readable
        write_frame(&mut channels.line.writer, b"abc").unwrap();
        assert_eq!(
            read_frame(&mut channels.line.reader).unwrap(),
            Some(b"abc".to_vec())
        );

        let mut buf = [0u8; 1];
        assert_eq!(
            channels.echo.reader.read(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );
        assert_eq!(
            channels.translated.reader.read(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );
    }
}
