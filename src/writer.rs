// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Section writer dispatch and section id assignment.

use std::collections::BTreeMap;

use crate::binary::{Binary, SectionRef};
use crate::error::{Error, Result};
use crate::reference::{SafePointer, SectionId};
use crate::section::SectionType;
use crate::stream::BinaryStream;

/// Hands out unique section identification codes for one output file.
/// Id 0 is reserved for the null section.
#[derive(Debug)]
pub struct SectionIdGenerator {
    next: Option<SectionId>,
}

impl Default for SectionIdGenerator {
    fn default() -> Self {
        Self { next: Some(1) }
    }
}

impl SectionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> Result<SectionId> {
        let id = self
            .next
            .ok_or_else(|| Error::UnexpectedValue("ran out of section ids".into()))?;
        self.next = id.checked_add(1);
        Ok(id)
    }
}

/// State of one file being written.
#[derive(Debug, Default)]
pub struct WriteContext<S> {
    section_ids: BTreeMap<SectionRef, SectionId>,
    pub ids: SectionIdGenerator,
    pub scratch: S,
}

impl<S> WriteContext<S> {
    pub fn assign_section_id(&mut self, section: SectionRef, id: SectionId) {
        self.section_ids.insert(section, id);
    }

    /// The id assigned to a section being written.
    pub fn section_id(&self, section: SectionRef) -> Result<SectionId> {
        self.section_ids.get(&section).copied().ok_or_else(|| {
            Error::UnexpectedValue(format!(
                "section {} is referred to but not part of the file",
                section.index()
            ))
        })
    }

    /// The id of the section a pointer refers to. Null pointers refer to the
    /// null section.
    pub fn pointer_section_id(&self, pointer: &SafePointer) -> Result<SectionId> {
        match pointer {
            SafePointer::Null => Ok(0),
            other => match other.section() {
                Some(section) => self.section_id(section),
                None => Err(Error::UnexpectedValue(format!(
                    "expected a section reference, found {other:?}"
                ))),
            },
        }
    }
}

/// Writes the body of one kind of section.
pub trait SectionWriter<S>: Sync {
    fn section_type(&self) -> SectionType;

    fn write_data(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        cx: &mut WriteContext<S>,
    ) -> Result<()>;
}

/// The section writers of one file format, by section type.
pub struct SectionWriterRegistry<S: 'static> {
    writers: BTreeMap<SectionType, &'static dyn SectionWriter<S>>,
}

impl<S> SectionWriterRegistry<S> {
    pub fn new(writers: &[&'static dyn SectionWriter<S>]) -> Self {
        Self {
            writers: writers.iter().map(|w| (w.section_type(), *w)).collect(),
        }
    }

    pub fn find(&self, kind: SectionType) -> Option<&'static dyn SectionWriter<S>> {
        self.writers.get(&kind).copied()
    }

    /// Writes `section` with the writer registered for its type.
    pub fn write_section(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        cx: &mut WriteContext<S>,
    ) -> Result<()> {
        let kind = binary.section(section).kind();
        let writer = self.find(kind).ok_or_else(|| {
            Error::InstanceNotFound(format!("no section writer registered for {kind}"))
        })?;
        writer.write_data(stream, binary, section, cx)
    }
}

/// A file format writer.
pub trait BinaryWriter: Sync {
    type Scratch: Default + 'static;

    fn name(&self) -> &'static str;

    fn registry(&self) -> &SectionWriterRegistry<Self::Scratch>;

    fn write_data(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        cx: &mut WriteContext<Self::Scratch>,
    ) -> Result<()>;
}

/// A [BinaryWriter] with its scratch type erased.
pub trait FormatWriter: Sync {
    fn format_name(&self) -> &'static str;

    fn write_binary(&self, stream: &mut BinaryStream, binary: &Binary) -> Result<()>;
}

impl<T: BinaryWriter> FormatWriter for T {
    fn format_name(&self) -> &'static str {
        self.name()
    }

    fn write_binary(&self, stream: &mut BinaryStream, binary: &Binary) -> Result<()> {
        let mut cx = WriteContext::<T::Scratch>::default();
        self.write_data(stream, binary, &mut cx)?;
        stream.flush()?;
        tracing::debug!(
            format = self.name(),
            sections = binary.section_count(),
            stream = %stream.name(),
            "wrote binary"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::section::Section;

    #[test]
    fn test_ids_skip_null() {
        let mut ids = SectionIdGenerator::new();
        assert_eq!(1, ids.next_id().expect("first"));
        assert_eq!(2, ids.next_id().expect("second"));

        let mut exhausted = SectionIdGenerator {
            next: Some(SectionId::MAX),
        };
        assert_eq!(SectionId::MAX, exhausted.next_id().expect("last"));
        assert!(exhausted.next_id().is_err());
    }

    #[test]
    fn test_section_ids() {
        let mut binary = Binary::new();
        let data = binary.add_section(Section::create(SectionType::Data));
        let detached = binary.create_detached(Section::create(SectionType::Data));

        let mut cx = WriteContext::<()>::default();
        cx.assign_section_id(data, 5);
        assert_eq!(5, cx.section_id(data).expect("assigned"));
        assert_eq!(5, cx.pointer_section_id(&SafePointer::to(data)).expect("pointer"));
        assert_eq!(0, cx.pointer_section_id(&SafePointer::Null).expect("null"));
        assert!(cx.section_id(detached).is_err());
    }
}
