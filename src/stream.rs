// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Random access big-endian byte stream.
//!
//! A [BinaryStream] keeps separate read and write positions over a named
//! file, an in-memory buffer or an externally supplied output stream. All
//! multi-byte values are big-endian on the wire.
//!
//! ```
//! use tpef::stream::BinaryStream;
//! # fn main() -> tpef::Result<()> {
//! let mut stream = BinaryStream::in_memory();
//! stream.write_word(0x0102_0304)?;
//! assert_eq!(stream.bytes(), Some(&[1u8, 2, 3, 4][..]));
//! assert_eq!(stream.read_word()?, 0x0102_0304);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// An output-only sink a [BinaryStream] can write into.
pub trait OutputStream: Write + Seek {}

impl<T: Write + Seek> OutputStream for T {}

enum Backend {
    File {
        path: PathBuf,
        input: Option<File>,
        output: Option<File>,
    },
    Memory(Vec<u8>),
    External(Box<dyn OutputStream>),
}

/// A seekable byte source and sink with independent read and write cursors.
pub struct BinaryStream {
    backend: Backend,
    read_position: u64,
    write_position: u64,
    eof: bool,
}

impl BinaryStream {
    /// A stream over the file at `path`. Nothing is opened until the stream
    /// is first used: reading opens the file for input, writing creates or
    /// truncates it for output.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::with_backend(Backend::File {
            path: path.as_ref().to_path_buf(),
            input: None,
            output: None,
        })
    }

    /// A stream over an in-memory buffer that grows as it is written.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::with_backend(Backend::Memory(bytes))
    }

    /// An empty in-memory stream.
    pub fn in_memory() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// A write-only stream over an external sink. Reading from it fails with
    /// [Error::UnreachableStream].
    pub fn from_writer(sink: impl OutputStream + 'static) -> Self {
        Self::with_backend(Backend::External(Box::new(sink)))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            read_position: 0,
            write_position: 0,
            eof: false,
        }
    }

    /// A human readable name for messages.
    pub fn name(&self) -> String {
        match &self.backend {
            Backend::File { path, .. } => path.display().to_string(),
            Backend::Memory(_) => "<memory>".into(),
            Backend::External(_) => "<external stream>".into(),
        }
    }

    /// The contents of an in-memory stream.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.backend {
            Backend::Memory(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Consumes an in-memory stream, returning its contents.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.backend {
            Backend::Memory(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn open_input(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::File { path, input, .. } => {
                if input.is_none() {
                    let file = File::open(&path).map_err(|e| {
                        Error::UnreachableStream(format!(
                            "File '{}' could not be opened for input: {e}",
                            path.display()
                        ))
                    })?;
                    *input = Some(file);
                }
                Ok(())
            }
            Backend::Memory(_) => Ok(()),
            Backend::External(_) => Err(write_only()),
        }
    }

    fn open_output(&mut self) -> Result<()> {
        if let Backend::File { path, output, .. } = &mut self.backend {
            if output.is_none() {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| {
                        Error::UnreachableStream(format!(
                            "File '{}' could not be opened for output: {e}",
                            path.display()
                        ))
                    })?;
                *output = Some(file);
            }
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at the read position, returning how many
    /// were read. Zero means the end of the input was reached.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.open_input()?;
        let position = self.read_position;
        let count = match &mut self.backend {
            Backend::File { input, .. } => match input {
                Some(file) => {
                    file.seek(SeekFrom::Start(position))?;
                    file.read(buf)?
                }
                None => 0,
            },
            Backend::Memory(bytes) => {
                let start = usize::try_from(position).unwrap_or(usize::MAX);
                let available = bytes.len().saturating_sub(start);
                let count = available.min(buf.len());
                if count > 0 {
                    buf[..count].copy_from_slice(&bytes[start..start + count]);
                }
                count
            }
            Backend::External(_) => return Err(write_only()),
        };
        if count == 0 && !buf.is_empty() {
            self.eof = true;
        }
        self.read_position += count as u64;
        Ok(count)
    }

    fn read_exact_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let start = self.read_position;
        let mut filled = 0;
        while filled < buf.len() {
            let count = self.read_some(&mut buf[filled..])?;
            if count == 0 {
                self.read_position = start;
                return Err(Error::EndOfFile(format!(
                    "reading {} bytes at offset {start} of {}",
                    buf.len(),
                    self.name()
                )));
            }
            filled += count;
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.open_output()?;
        let position = self.write_position;
        match &mut self.backend {
            Backend::File { output, .. } => {
                if let Some(file) = output {
                    file.seek(SeekFrom::Start(position))?;
                    file.write_all(bytes)?;
                }
            }
            Backend::Memory(buffer) => {
                let start = usize::try_from(position).map_err(|_| {
                    Error::WritePastEof(format!("offset {position} is not addressable"))
                })?;
                let end = start + bytes.len();
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[start..end].copy_from_slice(bytes);
            }
            Backend::External(sink) => {
                let size = sink.seek(SeekFrom::End(0))?;
                if position > size {
                    return Err(Error::WritePastEof(format!(
                        "offset {position} is past the end ({size}) of an output-only stream"
                    )));
                }
                sink.seek(SeekFrom::Start(position))?;
                sink.write_all(bytes)?;
            }
        }
        self.write_position += bytes.len() as u64;
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_into(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_half_word(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact_into(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_word(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact_into(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_byte_block(&mut self, block: &mut [u8]) -> Result<()> {
        self.read_exact_into(block)
    }

    /// Reads `count` bytes. Input shorter than that fails before anything is
    /// allocated.
    pub fn read_bytes(&mut self, count: u64) -> Result<Vec<u8>> {
        let position = self.read_position()?;
        let size = self.size_of_file()?;
        if position.saturating_add(count) > size {
            self.eof = true;
            return Err(Error::EndOfFile(format!(
                "reading {count} bytes at offset {position} of {}, which has {size}",
                self.name()
            )));
        }
        let mut bytes = vec![0; count as usize];
        self.read_exact_into(&mut bytes)?;
        Ok(bytes)
    }

    pub fn read_half_word_block(&mut self, block: &mut [u16]) -> Result<()> {
        for value in block.iter_mut() {
            *value = self.read_half_word()?;
        }
        Ok(())
    }

    pub fn read_word_block(&mut self, block: &mut [u32]) -> Result<()> {
        for value in block.iter_mut() {
            *value = self.read_word()?;
        }
        Ok(())
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])
    }

    pub fn write_half_word(&mut self, value: u16) -> Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    pub fn write_word(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    pub fn write_byte_block(&mut self, block: &[u8]) -> Result<()> {
        self.write_all(block)
    }

    pub fn write_half_word_block(&mut self, block: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = block.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.write_all(&bytes)
    }

    pub fn write_word_block(&mut self, block: &[u32]) -> Result<()> {
        let bytes: Vec<u8> = block.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.write_all(&bytes)
    }

    /// The read position. Opens a file-backed stream for input if needed.
    pub fn read_position(&mut self) -> Result<u64> {
        self.open_input()?;
        Ok(self.read_position)
    }

    /// The write position. Opens a file-backed stream for output if needed.
    pub fn write_position(&mut self) -> Result<u64> {
        self.open_output()?;
        Ok(self.write_position)
    }

    /// Moves the read cursor. Seeking back inside the stream clears a
    /// previously hit end-of-file condition.
    pub fn set_read_position(&mut self, position: u64) -> Result<()> {
        self.open_input()?;
        let size = self.size_of_file()?;
        self.eof = position > size;
        self.read_position = position;
        Ok(())
    }

    /// Moves the write cursor. The read cursor is not affected.
    pub fn set_write_position(&mut self, position: u64) -> Result<()> {
        self.open_output()?;
        self.write_position = position;
        Ok(())
    }

    /// Whether a read hit the end of the input, or the read cursor sits at
    /// or past it.
    pub fn end_of_file(&mut self) -> Result<bool> {
        self.open_input()?;
        let size = self.size_of_file()?;
        Ok(self.eof || self.read_position >= size)
    }

    /// The current size of the underlying file, buffer or sink.
    pub fn size_of_file(&mut self) -> Result<u64> {
        let unopened = matches!(
            self.backend,
            Backend::File {
                input: None,
                output: None,
                ..
            }
        );
        if unopened {
            self.open_input()?;
        }
        match &mut self.backend {
            Backend::File { input, output, .. } => match (output, input) {
                (Some(file), _) | (None, Some(file)) => Ok(file.metadata()?.len()),
                (None, None) => Ok(0),
            },
            Backend::Memory(bytes) => Ok(bytes.len() as u64),
            Backend::External(sink) => {
                let current = sink.stream_position()?;
                let size = sink.seek(SeekFrom::End(0))?;
                sink.seek(SeekFrom::Start(current))?;
                Ok(size)
            }
        }
    }

    /// Flushes pending output.
    pub fn flush(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::File {
                output: Some(file), ..
            } => file.flush()?,
            Backend::External(sink) => sink.flush()?,
            _ => {}
        }
        Ok(())
    }

    /// A [Read] + [Seek] view over the read cursor for binrw records.
    pub fn reader(&mut self) -> StreamReader<'_> {
        StreamReader(self)
    }

    /// A [Write] + [Seek] view over the write cursor for binrw records.
    pub fn writer(&mut self) -> StreamWriter<'_> {
        StreamWriter(self)
    }
}

impl fmt::Debug for BinaryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryStream")
            .field("name", &self.name())
            .field("read_position", &self.read_position)
            .field("write_position", &self.write_position)
            .field("eof", &self.eof)
            .finish()
    }
}

fn write_only() -> Error {
    Error::UnreachableStream("external stream is write-only".into())
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::EndOfFile(msg) => io::Error::new(io::ErrorKind::UnexpectedEof, msg),
        other => io::Error::other(other.to_string()),
    }
}

fn seek_target(current: u64, size: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => i128::from(offset),
        SeekFrom::Current(delta) => i128::from(current) + i128::from(delta),
        SeekFrom::End(delta) => i128::from(size) + i128::from(delta),
    };
    u64::try_from(target).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid seek to {target}"),
        )
    })
}

/// Read adapter returned by [BinaryStream::reader].
pub struct StreamReader<'a>(&'a mut BinaryStream);

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_some(buf).map_err(into_io)
    }
}

impl Seek for StreamReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.0.size_of_file().map_err(into_io)?;
        let target = seek_target(self.0.read_position, size, pos)?;
        self.0.set_read_position(target).map_err(into_io)?;
        Ok(target)
    }
}

/// Write adapter returned by [BinaryStream::writer].
pub struct StreamWriter<'a>(&'a mut BinaryStream);

impl Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf).map_err(into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush().map_err(into_io)
    }
}

impl Seek for StreamWriter<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.0.size_of_file().map_err(into_io)?;
        let target = seek_target(self.0.write_position, size, pos)?;
        self.0.set_write_position(target).map_err(into_io)?;
        Ok(target)
    }
}
