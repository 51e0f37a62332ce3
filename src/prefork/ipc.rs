//! Framed IPC primitives for worker communication.
//!
//! A frame is an 8-byte big-endian length followed by that many payload
//! bytes. Reads and writes retry on EINTR.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 8;

/// Frames larger than this (256 MiB) are treated as a corrupt stream.
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create a pipe, returning `(read_end, write_end)`.
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok((PipeFd::new(read_fd), PipeFd::new(write_fd)))
}

/// Buffered frame reader.
pub struct FrameReader {
    reader: BufReader<PipeFd>,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Read one frame, returning a reference to the internal buffer.
    ///
    /// Returns `None` on a clean EOF (no bytes of a new header). EOF in the
    /// middle of a frame is an `UnexpectedEof` error.
    pub fn read_frame(&mut self) -> io::Result<Option<&[u8]>> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.reader.read(&mut header[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated frame header",
                    ));
                }
                n => filled += n,
            }
        }

        let len = u64::from_be_bytes(header);
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        self.buffer.clear();
        self.buffer.resize(len as usize, 0);
        self.reader.read_exact(&mut self.buffer)?;
        Ok(Some(&self.buffer))
    }

    /// Whether bytes are already buffered, so a read won't block on the fd.
    pub fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.reader.get_ref().as_fd()
    }
}

/// Buffered frame writer.
pub struct FrameWriter {
    writer: BufWriter<PipeFd>,
}

impl FrameWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write one frame and flush.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = payload.len() as u64;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.flush()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.writer.get_ref().as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefork::fork_guard;

    #[test]
    fn test_frames_survive_a_pipe() {
        let _guard = fork_guard();
        let (read_fd, write_fd) = pipe().unwrap();
        let mut reader = FrameReader::new(read_fd);
        let mut writer = FrameWriter::new(write_fd);

        writer.write_frame(b"hello").unwrap();
        writer.write_frame(b"").unwrap();
        writer.write_frame(b"with\nnewlines\n").unwrap();
        drop(writer);

        assert_eq!(reader.read_frame().unwrap(), Some(&b"hello"[..]));
        assert_eq!(reader.read_frame().unwrap(), Some(&b""[..]));
        assert_eq!(reader.read_frame().unwrap(), Some(&b"with\nnewlines\n"[..]));
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn test_length_prefix_is_eight_bytes_big_endian() {
        let _guard = fork_guard();
        let (mut raw_read, write_fd) = pipe().unwrap();
        let mut writer = FrameWriter::new(write_fd);
        writer.write_frame(b"abc").unwrap();
        drop(writer);

        let mut bytes = Vec::new();
        raw_read.read_to_end(&mut bytes).unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&bytes[8..], b"abc");
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let _guard = fork_guard();
        let (read_fd, mut raw_write) = pipe().unwrap();
        raw_write.write_all(&10u64.to_be_bytes()).unwrap();
        raw_write.write_all(b"short").unwrap();
        drop(raw_write);

        let mut reader = FrameReader::new(read_fd);
        let err = reader.read_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncated_header_is_an_error() {
        let _guard = fork_guard();
        let (read_fd, mut raw_write) = pipe().unwrap();
        raw_write.write_all(&[0, 0, 0]).unwrap();
        drop(raw_write);

        let mut reader = FrameReader::new(read_fd);
        assert!(reader.read_frame().is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let _guard = fork_guard();
        let (read_fd, mut raw_write) = pipe().unwrap();
        raw_write.write_all(&u64::MAX.to_be_bytes()).unwrap();
        drop(raw_write);

        let mut reader = FrameReader::new(read_fd);
        let err = reader.read_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_frame_just_over_limit_rejected_before_allocating() {
        let _guard = fork_guard();
        let (read_fd, mut raw_write) = pipe().unwrap();
        raw_write.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).unwrap();
        raw_write.write_all(b"tail").unwrap();
        drop(raw_write);

        let mut reader = FrameReader::new(read_fd);
        let err = reader.read_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains(&(MAX_FRAME_LEN + 1).to_string()));
        assert!(reader.buffer.capacity() < 1024 * 1024);
    }

    #[test]
    fn test_write_to_closed_pipe_is_broken_pipe() {
        let _guard = fork_guard();
        let (read_fd, write_fd) = pipe().unwrap();
        drop(read_fd);
        let mut writer = FrameWriter::new(write_fd);
        // Rust binaries ignore SIGPIPE, so the write surfaces EPIPE.
        let err = writer.write_frame(b"nobody listening").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
