// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Error kinds raised while reading and writing object files.

use std::io;

use thiserror::Error;

/// Everything that can go wrong between a [BinaryStream](crate::stream::BinaryStream)
/// and a finished [Binary](crate::Binary).
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying file or stream could not be opened, read or written.
    #[error("Stream unreachable: {0}")]
    UnreachableStream(String),

    /// A read went past the end of the input.
    #[error("End of file: {0}")]
    EndOfFile(String),

    /// A write started past the end of a stream that cannot grow.
    #[error("Write past end of stream: {0}")]
    WritePastEof(String),

    /// A reference key was registered twice for two different objects.
    #[error("Key already exists: {0}")]
    KeyAlreadyExists(String),

    /// A reference request could not be matched with any registered object.
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    /// A value read from the input violates the format.
    #[error("Unexpected value: {0}")]
    UnexpectedValue(String),

    /// No handler (format driver, section reader, section writer) was found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Reference resolution failed after the whole input was read.
    #[error("Reference resolution failed, probably caused by a broken input file")]
    BrokenInput(#[source] Box<Error>),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps an [Error::UnresolvedReference] raised by a resolution pass.
    /// Other errors are passed through untouched.
    pub fn broken_input(self) -> Self {
        match self {
            Error::UnresolvedReference(_) => Error::BrokenInput(Box::new(self)),
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::EndOfFile(err.to_string()),
            _ => Error::UnreachableStream(err.to_string()),
        }
    }
}

impl From<binrw::Error> for Error {
    fn from(err: binrw::Error) -> Self {
        if err.is_eof() {
            return Error::EndOfFile(err.to_string());
        }
        match err {
            binrw::Error::Io(e) => e.into(),
            other => Error::UnexpectedValue(other.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        assert!(matches!(Error::from(eof), Error::EndOfFile(_)));

        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert!(matches!(Error::from(missing), Error::UnreachableStream(_)));
    }

    #[test]
    fn test_broken_input_keeps_source() {
        let err = Error::UnresolvedReference("section 3".into()).broken_input();
        let Error::BrokenInput(source) = &err else {
            panic!("expected broken input, got {err:?}");
        };
        assert!(matches!(**source, Error::UnresolvedReference(_)));
        assert_eq!(
            Some("Unresolved reference: section 3".to_string()),
            std::error::Error::source(&err).map(|s| s.to_string())
        );

        let other = Error::EndOfFile("x".into()).broken_input();
        assert!(matches!(other, Error::EndOfFile(_)));
    }
}
