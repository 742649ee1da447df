//! Framed IPC primitives for worker channels.
//!
//! A frame is a 4-byte little-endian payload length followed by the
//! payload. Frames ride directly on pipe descriptors; partial transfers
//! and EINTR are absorbed here so the protocol layer only ever sees whole
//! frames.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::unistd;

/// Maximum accepted frame payload (16 MiB). Guards against a corrupt
/// length prefix exhausting controller memory.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Fill `buf` from the descriptor, absorbing short reads and EINTR.
///
/// Returns `Ok(false)` when the pipe was already at EOF; hitting EOF
/// after the first byte surfaces as `UnexpectedEof`.
fn read_full(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match unistd::read(fd.as_raw_fd(), &mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pipe closed mid-transfer",
                ));
            }
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(true)
}

/// Drain `buf` into the descriptor, absorbing short writes and EINTR.
fn write_full(fd: &OwnedFd, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match unistd::write(fd, &buf[sent..]) {
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(())
}

/// Reads whole frames from the inbound pipe of a channel.
pub struct FrameReader {
    fd: OwnedFd,
}

impl FrameReader {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Raw descriptor of the read side, for readiness polling.
    pub fn read_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Read one frame payload.
    ///
    /// Returns `None` on a clean EOF at a frame boundary. EOF inside a
    /// frame surfaces as `UnexpectedEof`; both are terminal for the
    /// channel.
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        if !read_full(&self.fd, &mut header)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(header);
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes", len),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        if !read_full(&self.fd, &mut payload)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed before the frame payload",
            ));
        }
        Ok(Some(payload))
    }
}

/// Writes whole frames to the outbound pipe of a channel.
pub struct FrameWriter {
    fd: OwnedFd,
}

impl FrameWriter {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Write one frame: length prefix and payload in a single transfer.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes", payload.len()),
            ));
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        write_full(&self.fd, &frame)
    }
}

/// One duplex worker channel: a frame reader on one pipe and a frame
/// writer on the other.
pub struct Channel {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Channel {
    pub fn new(read: OwnedFd, write: OwnedFd) -> Self {
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
        }
    }

    /// Raw descriptor of the inbound side, for readiness polling.
    pub fn read_fd(&self) -> RawFd {
        self.reader.read_fd()
    }

    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.write_frame(payload)
    }

    pub fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.reader.read_frame()
    }
}
