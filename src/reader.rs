// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Format detection and section reader dispatch.
//!
//! Every file format provides a [BinaryReader] that parses its file header
//! and hands each section to the [SectionReader] registered for the section's
//! type. Readers record cross references with the [ReferenceManager] of the
//! [ReadContext]; [FormatReader::read_binary] resolves them once every
//! section has been read, runs the finalize pass and resolves again.

use std::collections::BTreeMap;

use crate::aout::AOutReader;
use crate::binary::{Binary, SectionRef};
use crate::error::{Error, Result};
use crate::reference::ReferenceManager;
use crate::section::SectionType;
use crate::stream::BinaryStream;
use crate::tpef::TpefReader;

/// State of one file being read.
///
/// `S` is scratch state owned by the file format: the header of the section
/// being read, ids of sections found while scanning headers and so on.
#[derive(Debug, Default)]
pub struct ReadContext<S> {
    pub binary: Binary,
    pub references: ReferenceManager,
    pub scratch: S,
}

/// Reads the body of one kind of section.
pub trait SectionReader<S>: Sync {
    /// The kind of section this reader handles.
    fn section_type(&self) -> SectionType;

    /// Reads `section` from `stream`, which is positioned where the format
    /// driver left it.
    fn read_data(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<S>,
    ) -> Result<()>;

    /// Fixups that need every section read and every reference resolved.
    fn finalize(&self, _section: SectionRef, _cx: &mut ReadContext<S>) -> Result<()> {
        Ok(())
    }
}

/// The section readers of one file format, by section type.
pub struct SectionReaderRegistry<S: 'static> {
    readers: BTreeMap<SectionType, &'static dyn SectionReader<S>>,
}

impl<S> SectionReaderRegistry<S> {
    pub fn new(readers: &[&'static dyn SectionReader<S>]) -> Self {
        Self {
            readers: readers.iter().map(|r| (r.section_type(), *r)).collect(),
        }
    }

    pub fn find(&self, kind: SectionType) -> Option<&'static dyn SectionReader<S>> {
        self.readers.get(&kind).copied()
    }

    /// Reads `section` with the reader registered for its type.
    pub fn read_section(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<S>,
    ) -> Result<()> {
        let kind = cx.binary.section(section).kind();
        let reader = self.find(kind).ok_or_else(|| {
            Error::InstanceNotFound(format!("no section reader registered for {kind}"))
        })?;
        reader.read_data(stream, section, cx)
    }

    /// Runs the finalize hook of every section of the binary. Sections
    /// without a reader are skipped.
    pub fn finalize_binary(&self, cx: &mut ReadContext<S>) -> Result<()> {
        for section in cx.binary.section_refs() {
            let kind = cx.binary.section(section).kind();
            match self.find(kind) {
                Some(reader) => reader.finalize(section, cx)?,
                None => tracing::trace!(%kind, "no reader to finalize section"),
            }
        }
        Ok(())
    }
}

/// A file format driver.
pub trait BinaryReader: Sync {
    type Scratch: Default + 'static;

    fn name(&self) -> &'static str;

    fn registry(&self) -> &SectionReaderRegistry<Self::Scratch>;

    /// Whether `stream` holds this format. The read position is left where
    /// it was.
    fn is_my_stream_type(&self, stream: &mut BinaryStream) -> Result<bool>;

    /// Reads the file header and every section into `cx.binary`.
    fn read_data(
        &self,
        stream: &mut BinaryStream,
        cx: &mut ReadContext<Self::Scratch>,
    ) -> Result<()>;
}

/// A [BinaryReader] with its scratch type erased.
pub trait FormatReader: Sync {
    fn format_name(&self) -> &'static str;

    fn probe(&self, stream: &mut BinaryStream) -> Result<bool>;

    /// Reads a complete [Binary], every reference resolved.
    fn read_binary(&self, stream: &mut BinaryStream) -> Result<Binary>;
}

impl<T: BinaryReader> FormatReader for T {
    fn format_name(&self) -> &'static str {
        self.name()
    }

    fn probe(&self, stream: &mut BinaryStream) -> Result<bool> {
        let start = stream.read_position()?;
        let mine = self.is_my_stream_type(stream);
        stream.set_read_position(start)?;
        mine
    }

    fn read_binary(&self, stream: &mut BinaryStream) -> Result<Binary> {
        let mut cx = ReadContext::<T::Scratch>::default();
        cx.references.cleanup_key_tables();

        self.read_data(stream, &mut cx)?;
        cx.references
            .resolve(&mut cx.binary)
            .map_err(Error::broken_input)?;

        self.registry().finalize_binary(&mut cx)?;
        cx.references
            .resolve(&mut cx.binary)
            .map_err(Error::broken_input)?;

        cx.references.cleanup_key_tables();
        tracing::debug!(
            format = self.name(),
            sections = cx.binary.section_count(),
            "read binary"
        );
        Ok(cx.binary)
    }
}

/// Every supported format, in the order they are probed.
pub static READERS: &[&dyn FormatReader] = &[&TpefReader, &AOutReader];

/// The first format that claims `stream`.
pub fn find_reader(stream: &mut BinaryStream) -> Result<&'static dyn FormatReader> {
    for reader in READERS {
        if reader.probe(stream)? {
            tracing::debug!(format = reader.format_name(), stream = %stream.name(), "found format");
            return Ok(*reader);
        }
    }
    Err(Error::InstanceNotFound(format!(
        "no reader recognizes the format of {}",
        stream.name()
    )))
}

/// Reads a [Binary] of any supported format.
pub fn read_binary(stream: &mut BinaryStream) -> Result<Binary> {
    find_reader(stream)?.read_binary(stream)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::LazyLock;

    static EMPTY: LazyLock<SectionReaderRegistry<()>> =
        LazyLock::new(|| SectionReaderRegistry::new(&[]));

    /// Claims streams starting with a zero word, without rewinding.
    struct Careless;

    impl BinaryReader for Careless {
        type Scratch = ();

        fn name(&self) -> &'static str {
            "careless"
        }

        fn registry(&self) -> &SectionReaderRegistry<()> {
            &EMPTY
        }

        fn is_my_stream_type(&self, stream: &mut BinaryStream) -> Result<bool> {
            Ok(stream.read_word()? == 0)
        }

        fn read_data(&self, _stream: &mut BinaryStream, _cx: &mut ReadContext<()>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_format_check_restores_position() {
        let mut stream = BinaryStream::from_bytes(vec![0, 0, 0, 0, 1, 2]);
        stream.set_read_position(0).expect("seek");
        assert!(Careless.probe(&mut stream).expect("format check"));
        assert_eq!(0, stream.read_position().expect("position"));

        stream.set_read_position(2).expect("seek");
        assert!(!Careless.probe(&mut stream).expect("format check"));
        assert_eq!(2, stream.read_position().expect("position"));

        stream.set_read_position(4).expect("seek");
        assert!(matches!(Careless.probe(&mut stream), Err(Error::EndOfFile(_))));
        assert_eq!(4, stream.read_position().expect("position"));
    }

    #[test]
    fn test_unknown_format() {
        let mut stream = BinaryStream::from_bytes(b"not an object file".to_vec());
        assert!(matches!(
            find_reader(&mut stream),
            Err(Error::InstanceNotFound(_))
        ));
        assert_eq!(0, stream.read_position().expect("position"));
    }
}
