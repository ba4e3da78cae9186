//! Buffered sequential file I/O.
//!
//! [`BufferedFile`] wraps a [`File`] with a fixed 4 KiB buffer and exactly
//! one active mode per open: a file is either being written (appended) or
//! being read, never both. The table writer streams records through the
//! write side, and the forward-only table reader streams them back through
//! the read side after [`BufferedFile::rewind`].
//!
//! The logical position is tracked by byte counters rather than `lseek`,
//! so [`BufferedFile::position`] accounts for unflushed and unread buffered
//! data without a syscall.
//!
//! Short reads and writes are retried until the requested length has been
//! transferred or a hard error is returned; `EINTR` is retried on every
//! path. A zero-length read at a record boundary is end-of-file and is
//! reported as `Ok(None)` from [`BufferedFile::read_byte`]; a short read
//! anywhere else surfaces as an `UnexpectedEof` I/O error.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Size of the read and write buffer.
pub const BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

/// A file handle with 4 KiB buffering and one active mode per open.
#[derive(Debug)]
pub struct BufferedFile {
    file: File,
    mode: Mode,
    /// Offset of this stream's first byte within the underlying file.
    /// Non-zero only when several tables share one file.
    base: u64,
    /// Write mode: bytes already handed to the OS beyond `base`.
    /// Read mode: bytes already handed to the caller beyond `base`.
    done: u64,
    buf: Vec<u8>,
    /// Read mode only: index of the next unread byte in `buf`.
    rpos: usize,
}

impl BufferedFile {
    /// Create (truncating) a file for writing.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::writer(file, 0))
    }

    /// Open an existing file for reading from offset 0.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            mode: Mode::Read,
            base: 0,
            done: 0,
            buf: Vec::with_capacity(BUFFER_SIZE),
            rpos: 0,
        })
    }

    /// Take over an already-open file for writing, starting at its current
    /// seek position. Used when several tables are appended to one file.
    pub fn append_to(mut file: File) -> io::Result<Self> {
        let base = file.stream_position()?;
        Ok(Self::writer(file, base))
    }

    fn writer(file: File, base: u64) -> Self {
        Self {
            file,
            mode: Mode::Write,
            base,
            done: 0,
            buf: Vec::with_capacity(BUFFER_SIZE),
            rpos: 0,
        }
    }

    /// Logical offset of the next byte to be read or written, relative to
    /// the start of the underlying file.
    pub fn position(&self) -> u64 {
        match self.mode {
            Mode::Write => self.base + self.done + self.buf.len() as u64,
            Mode::Read => self.base + self.done,
        }
    }

    /// Append a single byte.
    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.check_mode(Mode::Write)?;
        if self.buf.len() == BUFFER_SIZE {
            self.flush_buf()?;
        }
        self.buf.push(byte);
        Ok(())
    }

    /// Append a slice.
    ///
    /// When the slice does not fit in the buffer, the buffered bytes and
    /// the payload are written together with one vectored write loop so the
    /// payload is never copied into the buffer first.
    pub fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        self.check_mode(Mode::Write)?;
        if self.buf.len() + payload.len() <= BUFFER_SIZE {
            self.buf.extend_from_slice(payload);
            return Ok(());
        }

        let total = self.buf.len() + payload.len();
        let mut head: &[u8] = &self.buf;
        let mut tail: &[u8] = payload;
        while !head.is_empty() || !tail.is_empty() {
            let iov = [IoSlice::new(head), IoSlice::new(tail)];
            let n = match self.file.write_vectored(&iov) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "file refused further bytes",
                    ));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n <= head.len() {
                head = &head[n..];
            } else {
                tail = &tail[n - head.len()..];
                head = &[];
            }
        }
        self.done += total as u64;
        self.buf.clear();
        Ok(())
    }

    /// Read the next byte, or `None` at end of stream.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        self.check_mode(Mode::Read)?;
        if self.rpos == self.buf.len() && self.refill()? == 0 {
            return Ok(None);
        }
        let byte = self.buf[self.rpos];
        self.rpos += 1;
        self.done += 1;
        Ok(Some(byte))
    }

    /// Fill `out` completely, failing with `UnexpectedEof` on a short read.
    pub fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        self.check_mode(Mode::Read)?;
        let mut filled = 0;
        while filled < out.len() {
            let avail = self.buf.len() - self.rpos;
            if avail > 0 {
                let n = avail.min(out.len() - filled);
                out[filled..filled + n].copy_from_slice(&self.buf[self.rpos..self.rpos + n]);
                self.rpos += n;
                self.done += n as u64;
                filled += n;
                continue;
            }
            if out.len() - filled >= BUFFER_SIZE {
                // Large remainder: read straight into the caller's buffer.
                let n = match self.file.read(&mut out[filled..]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "short read inside a record",
                        ));
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                self.done += n as u64;
                filled += n;
            } else if self.refill()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short read inside a record",
                ));
            }
        }
        Ok(())
    }

    /// Write out any buffered data. Required before [`position`] is used
    /// as a durable offset.
    ///
    /// [`position`]: BufferedFile::position
    pub fn flush(&mut self) -> io::Result<()> {
        if self.mode == Mode::Write {
            self.flush_buf()?;
        }
        Ok(())
    }

    /// Durability barrier on the underlying file.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Reposition to the start of this stream and switch to read mode.
    ///
    /// Any buffered unwritten data must have been flushed first; rewinding
    /// discards the buffer.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.base))?;
        self.mode = Mode::Read;
        self.done = 0;
        self.buf.clear();
        self.rpos = 0;
        Ok(())
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.done += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    fn refill(&mut self) -> io::Result<usize> {
        self.buf.resize(BUFFER_SIZE, 0);
        loop {
            match self.file.read(&mut self.buf) {
                Ok(n) => {
                    self.buf.truncate(n);
                    self.rpos = 0;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.clear();
                    self.rpos = 0;
                    return Err(e);
                }
            }
        }
    }

    fn check_mode(&self, wanted: Mode) -> io::Result<()> {
        if self.mode != wanted {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                match wanted {
                    Mode::Write => "write on a file opened for reading",
                    Mode::Read => "read on a file opened for writing",
                },
            ));
        }
        Ok(())
    }
}
