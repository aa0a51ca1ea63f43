// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use std::collections::BTreeMap;
use std::sync::LazyLock;

use binrw::BinWrite;

use super::*;
use crate::binary::SectionRef;
use crate::element::{
    ASpaceElement, InstructionAnnotation, InstructionElement, SectionElement, SymbolBinding,
    SymbolElement, SymbolKind,
};
use crate::error::{Error, Result};
use crate::reference::{ObjectRef, SafePointer};
use crate::relocation;
use crate::section::{Section, SectionType};
use crate::stream::BinaryStream;
use crate::writer::{BinaryWriter, SectionWriter, SectionWriterRegistry, WriteContext};
use crate::Binary;

/// Writes TPEF files.
pub struct TpefWriter;

/// Where a section body ended up, for its header.
#[derive(Clone, Copy, Debug, Default)]
struct SectionLayout {
    body_offset: u32,
    body_size: u32,
    element_size: u32,
    info: u32,
}

/// Scratch state of a TPEF write.
#[derive(Debug, Default)]
pub struct TpefWriteScratch {
    layouts: BTreeMap<SectionRef, SectionLayout>,
    /// Byte offset of every element of each code section.
    element_offsets: BTreeMap<SectionRef, Vec<u32>>,
}

static NULL: NullSectionWriter = NullSectionWriter;
static STRINGS: RawSectionWriter = RawSectionWriter(SectionType::StrTab);
static DATA: RawSectionWriter = RawSectionWriter(SectionType::Data);
static UDATA: RawSectionWriter = RawSectionWriter(SectionType::UData);
static NOTES: RawSectionWriter = RawSectionWriter(SectionType::Note);
static ASPACES: ASpaceSectionWriter = ASpaceSectionWriter;
static SYMBOLS: SymbolSectionWriter = SymbolSectionWriter;
static RELOCATIONS: RelocSectionWriter = RelocSectionWriter;
static LINES: LineNumSectionWriter = LineNumSectionWriter;
static DEBUG: DebugSectionWriter = DebugSectionWriter;
static RESOURCES: ResourceSectionWriter = ResourceSectionWriter;
static CODE: CodeSectionWriter = CodeSectionWriter;

static REGISTRY: LazyLock<SectionWriterRegistry<TpefWriteScratch>> = LazyLock::new(|| {
    SectionWriterRegistry::new(&[
        &NULL,
        &STRINGS,
        &DATA,
        &UDATA,
        &NOTES,
        &ASPACES,
        &SYMBOLS,
        &RELOCATIONS,
        &LINES,
        &DEBUG,
        &RESOURCES,
        &CODE,
    ])
});

/// A copy of `original` with the placeholders every TPEF file has, and with
/// relocated values matching their destinations.
fn prepare(original: &Binary) -> Result<Binary> {
    let mut binary = original.clone();
    if binary.section_count_of(SectionType::Null) == 0 {
        tracing::debug!("adding null section");
        binary.insert_section(0, Section::create(SectionType::Null));
    }

    let aspaces = match binary.find_section(SectionType::AddrSp, 0) {
        Some(aspaces) => aspaces,
        None => binary.add_section(Section::create(SectionType::AddrSp)),
    };
    let has_undefined = binary
        .section(aspaces)
        .element(0)
        .and_then(SectionElement::as_aspace)
        .is_some_and(ASpaceElement::is_undefined);
    if !has_undefined {
        binary.insert_element(aspaces, 0, ASpaceElement::undefined());
    }

    let symbol_tables: Vec<SectionRef> = binary
        .sections()
        .filter(|(_, s)| s.kind() == SectionType::SymTab)
        .map(|(r, _)| r)
        .collect();
    for symbols in symbol_tables {
        let has_undefined = binary
            .section(symbols)
            .element(0)
            .and_then(SectionElement::as_symbol)
            .is_some_and(|s| {
                *s.kind() == SymbolKind::NoType && s.binding() == SymbolBinding::Local
            });
        if !has_undefined {
            binary.insert_element(symbols, 0, SymbolElement::undefined());
        }
    }

    relocation::patch_locations(&mut binary)?;
    Ok(binary)
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::UnexpectedValue(format!("offset {value:#x} does not fit a TPEF file")))
}

/// Offset of the string a name pointer refers to. Null names are at 0.
fn string_offset(name: &SafePointer) -> Result<u32> {
    match name {
        SafePointer::Null => Ok(0),
        other => other.chunk().map(|c| c.offset()).ok_or_else(|| {
            Error::UnexpectedValue(format!("expected a string, found {other:?}"))
        }),
    }
}

/// Index of the element a pointer refers to. Null pointers refer to the
/// placeholder at index 0.
fn element_index(pointer: &SafePointer) -> Result<u32> {
    match pointer {
        SafePointer::Null => Ok(0),
        other => other.element().map(|e| e.index()).ok_or_else(|| {
            Error::UnexpectedValue(format!("expected an element, found {other:?}"))
        }),
    }
}

/// Byte offset of a relocated location in its section.
fn location_offset(pointer: &SafePointer, cx: &WriteContext<TpefWriteScratch>) -> Result<u32> {
    match pointer.object() {
        None => Ok(0),
        Some(ObjectRef::Chunk(c)) => Ok(c.offset()),
        Some(ObjectRef::Element(e)) => cx
            .scratch
            .element_offsets
            .get(&e.section())
            .and_then(|offsets| offsets.get(e.index() as usize))
            .copied()
            .ok_or_else(|| {
                Error::UnexpectedValue(format!("relocated element {} is not code", e.index()))
            }),
        Some(other) => Err(Error::UnexpectedValue(format!(
            "relocation location points at {other}"
        ))),
    }
}

/// Size of a code element on disk.
fn encoded_size(element: &InstructionElement) -> u32 {
    let annotations: u32 = element
        .annotations()
        .iter()
        .map(|a| 5 + a.payload.len() as u32)
        .sum();
    annotations
        + match element {
            InstructionElement::Move(_) => 13,
            InstructionElement::Immediate(imm) => 4 + imm.bytes().len() as u32,
        }
}

fn write_annotations(
    stream: &mut BinaryStream,
    annotations: &[InstructionAnnotation],
) -> Result<()> {
    for (i, annotation) in annotations.iter().enumerate() {
        if annotation.payload.len() > MAX_ANNOTATION_PAYLOAD {
            return Err(Error::UnexpectedValue(format!(
                "annotation {:#x} payload of {} bytes is too long",
                annotation.id,
                annotation.payload.len()
            )));
        }
        let mut size = annotation.payload.len() as u8;
        if i + 1 < annotations.len() {
            size |= ANNOTATION_CONTINUES;
        }
        stream.write_byte(size)?;
        stream.write_word(annotation.id)?;
        stream.write_byte_block(&annotation.payload)?;
    }
    Ok(())
}

impl BinaryWriter for TpefWriter {
    type Scratch = TpefWriteScratch;

    fn name(&self) -> &'static str {
        "TPEF"
    }

    fn registry(&self) -> &SectionWriterRegistry<TpefWriteScratch> {
        &REGISTRY
    }

    fn write_data(
        &self,
        stream: &mut BinaryStream,
        original: &Binary,
        cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        let binary = &prepare(original)?;

        let mut null_seen = false;
        for (section, s) in binary.sections() {
            if s.kind() == SectionType::Null && !null_seen {
                null_seen = true;
                cx.assign_section_id(section, 0);
            } else {
                let id = cx.ids.next_id()?;
                cx.assign_section_id(section, id);
            }
            if s.kind() == SectionType::Code {
                let offsets = s
                    .instructions()
                    .scan(0u32, |offset, element| {
                        let start = *offset;
                        *offset += encoded_size(element);
                        Some(start)
                    })
                    .collect();
                cx.scratch.element_offsets.insert(section, offsets);
            }
        }

        let count = u16::try_from(binary.section_count())
            .map_err(|_| Error::UnexpectedValue("too many sections for a TPEF file".into()))?;
        let strings_offset = match binary.strings().and_then(|s| binary.section_position(s)) {
            Some(position) => u32::from(FILE_HEADER_SIZE) + position as u32 * u32::from(SECTION_HEADER_SIZE),
            None => 0,
        };

        stream.set_write_position(0)?;
        FileHeader {
            arch: binary.arch() as u8,
            file_type: binary.file_type() as u8,
            section_offset: u32::from(FILE_HEADER_SIZE),
            header_size: FILE_HEADER_SIZE,
            entry_size: SECTION_HEADER_SIZE,
            section_count: count,
            strings_offset,
        }
        .write(&mut stream.writer())?;
        stream.write_byte_block(&vec![0; usize::from(count) * usize::from(SECTION_HEADER_SIZE)])?;

        for section in binary.section_refs() {
            REGISTRY.write_section(stream, binary, section, cx)?;
        }
        let end = stream.write_position()?;

        for (position, (section, s)) in binary.sections().enumerate() {
            let layout = cx.scratch.layouts.get(&section).copied().unwrap_or_default();
            let aspace = element_index(&s.aspace())?;
            let header = SectionHeader {
                name: string_offset(&s.name())?,
                kind: s.kind() as u8,
                flags: s.flags(),
                start_address: s.start_address(),
                body_offset: layout.body_offset,
                body_size: layout.body_size,
                id: cx.section_id(section)?,
                aspace: u8::try_from(aspace).map_err(|_| {
                    Error::UnexpectedValue(format!("address space index {aspace} is too large"))
                })?,
                padding: 0,
                link: cx.pointer_section_id(&s.link())?,
                info: layout.info,
                element_size: layout.element_size,
            };
            let offset = u64::from(FILE_HEADER_SIZE) + position as u64 * u64::from(SECTION_HEADER_SIZE);
            stream.set_write_position(offset)?;
            header.write(&mut stream.writer())?;
        }
        stream.set_write_position(end)?;
        Ok(())
    }
}

/// Body encoding of one TPEF section type.
pub trait TpefBodyWriter: Sync {
    fn kind(&self) -> SectionType;

    /// Size of one record, 0 for variable length bodies.
    fn element_size(&self) -> u32 {
        0
    }

    /// Value of the type specific header field.
    fn info(
        &self,
        _binary: &Binary,
        _section: SectionRef,
        _cx: &WriteContext<TpefWriteScratch>,
    ) -> Result<u32> {
        Ok(0)
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()>;
}

impl<T: TpefBodyWriter> SectionWriter<TpefWriteScratch> for T {
    fn section_type(&self) -> SectionType {
        self.kind()
    }

    fn write_data(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        let s = binary.section(section);
        let info = self.info(binary, section, cx)?;
        let (body_offset, body_size) = if s.is_nobits() {
            (0, s.length())
        } else {
            let start = stream.write_position()?;
            self.write_body(stream, binary, section, cx)?;
            let end = stream.write_position()?;
            (to_u32(start)?, to_u32(end - start)?)
        };
        tracing::debug!(
            kind = %self.kind(),
            offset = body_offset,
            size = body_size,
            "wrote section"
        );
        cx.scratch.layouts.insert(
            section,
            SectionLayout {
                body_offset,
                body_size,
                element_size: self.element_size(),
                info,
            },
        );
        Ok(())
    }
}

struct NullSectionWriter;

impl TpefBodyWriter for NullSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::Null
    }

    fn write_body(
        &self,
        _stream: &mut BinaryStream,
        _binary: &Binary,
        _section: SectionRef,
        _cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        Ok(())
    }
}

struct RawSectionWriter(SectionType);

impl TpefBodyWriter for RawSectionWriter {
    fn kind(&self) -> SectionType {
        self.0
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        _cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        stream.write_byte_block(binary.section(section).data())
    }
}

fn unexpected_element(kind: SectionType, index: usize) -> Error {
    Error::UnexpectedValue(format!("element {index} does not belong in a {kind} section"))
}

struct ASpaceSectionWriter;

impl TpefBodyWriter for ASpaceSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::AddrSp
    }

    fn element_size(&self) -> u32 {
        ASPACE_SIZE
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        _cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        for (i, element) in binary.section(section).elements().iter().enumerate() {
            let aspace = element
                .as_aspace()
                .ok_or_else(|| unexpected_element(self.kind(), i))?;
            let id = u8::try_from(i)
                .map_err(|_| Error::UnexpectedValue("too many address spaces".into()))?;
            ASpaceRecord {
                id,
                mau: aspace.mau,
                align: aspace.align,
                word_size: aspace.word_size,
                name: string_offset(&aspace.name)?,
            }
            .write_be(&mut stream.writer())?;
        }
        Ok(())
    }
}

struct SymbolSectionWriter;

impl TpefBodyWriter for SymbolSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::SymTab
    }

    fn element_size(&self) -> u32 {
        SYMBOL_SIZE
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        for (i, element) in binary.section(section).elements().iter().enumerate() {
            let symbol = element
                .as_symbol()
                .ok_or_else(|| unexpected_element(self.kind(), i))?;
            let value = match symbol.reference() {
                Some(reference) if reference.is_resolved() => {
                    relocation::address_of(binary, &reference).ok_or_else(|| {
                        Error::UnexpectedValue(format!("symbol {i} refers to {reference:?}"))
                    })?
                }
                _ => symbol.value(),
            };
            SymbolRecord {
                name: string_offset(&symbol.name())?,
                value,
                size: symbol.size(),
                info: (symbol.binding() as u8) << 4 | symbol.kind().type_code(),
                other: if symbol.absolute() { SYMBOL_ABSOLUTE } else { 0 },
                section: cx.pointer_section_id(&symbol.section())?,
            }
            .write_be(&mut stream.writer())?;
        }
        Ok(())
    }
}

struct RelocSectionWriter;

impl TpefBodyWriter for RelocSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::Reloc
    }

    fn element_size(&self) -> u32 {
        RELOC_SIZE
    }

    fn info(
        &self,
        binary: &Binary,
        section: SectionRef,
        cx: &WriteContext<TpefWriteScratch>,
    ) -> Result<u32> {
        let referenced = binary.section(section).referenced_section();
        Ok(cx.pointer_section_id(&referenced)?.into())
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        for (i, element) in binary.section(section).elements().iter().enumerate() {
            let reloc = element
                .as_reloc()
                .ok_or_else(|| unexpected_element(self.kind(), i))?;
            let aspace = element_index(&reloc.aspace)?;
            RelocRecord {
                location: location_offset(&reloc.location, cx)?,
                symbol: element_index(&reloc.symbol)?,
                kind: reloc.kind as u8 | if reloc.chunked { RELOC_CHUNKED } else { 0 },
                aspace: u8::try_from(aspace).map_err(|_| {
                    Error::UnexpectedValue(format!("address space index {aspace} is too large"))
                })?,
                size: reloc.size,
                bit_offset: reloc.bit_offset,
            }
            .write_be(&mut stream.writer())?;
        }
        Ok(())
    }
}

struct LineNumSectionWriter;

impl TpefBodyWriter for LineNumSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::LineNo
    }

    fn element_size(&self) -> u32 {
        LINENUM_SIZE
    }

    fn info(
        &self,
        binary: &Binary,
        section: SectionRef,
        cx: &WriteContext<TpefWriteScratch>,
    ) -> Result<u32> {
        let referenced = binary.section(section).referenced_section();
        Ok(cx.pointer_section_id(&referenced)?.into())
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        _cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        for (i, element) in binary.section(section).elements().iter().enumerate() {
            let procedure = element
                .as_line_procedure()
                .ok_or_else(|| unexpected_element(self.kind(), i))?;
            LineNumRecord {
                address: element_index(&procedure.procedure)?,
                line: 0,
            }
            .write_be(&mut stream.writer())?;

            for line in &procedure.lines {
                let instruction = line
                    .instruction
                    .element()
                    .and_then(|e| binary.section(e.section()).instruction_index_of(e.index()))
                    .ok_or_else(|| {
                        Error::UnexpectedValue(format!("line {} has no instruction", line.line))
                    })?;
                LineNumRecord {
                    address: instruction,
                    line: line.line,
                }
                .write_be(&mut stream.writer())?;
            }
        }
        Ok(())
    }
}

struct DebugSectionWriter;

impl TpefBodyWriter for DebugSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::Debug
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        _cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        for (i, element) in binary.section(section).elements().iter().enumerate() {
            let debug = element
                .as_debug()
                .ok_or_else(|| unexpected_element(self.kind(), i))?;
            DebugRecord {
                kind: debug.debug_type,
                string: string_offset(&debug.debug_string)?,
                length: debug.data.len() as u32,
                data: debug.data.clone(),
            }
            .write_be(&mut stream.writer())?;
        }
        Ok(())
    }
}

struct ResourceSectionWriter;

impl TpefBodyWriter for ResourceSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::Mr
    }

    fn element_size(&self) -> u32 {
        RESOURCE_SIZE
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        _cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        for (i, element) in binary.section(section).elements().iter().enumerate() {
            let resource = element
                .as_resource()
                .ok_or_else(|| unexpected_element(self.kind(), i))?;
            ResourceRecord {
                id: resource.id,
                kind: resource.kind as u8,
                name: string_offset(&resource.name)?,
                info: resource.info,
            }
            .write_be(&mut stream.writer())?;
        }
        Ok(())
    }
}

struct CodeSectionWriter;

impl TpefBodyWriter for CodeSectionWriter {
    fn kind(&self) -> SectionType {
        SectionType::Code
    }

    fn write_body(
        &self,
        stream: &mut BinaryStream,
        binary: &Binary,
        section: SectionRef,
        _cx: &mut WriteContext<TpefWriteScratch>,
    ) -> Result<()> {
        let elements: Vec<&InstructionElement> = binary.section(section).instructions().collect();
        for (i, element) in elements.iter().enumerate() {
            let end = elements.get(i + 1).is_none_or(|next| next.begin());
            let mut attributes = if end { IA_END } else { 0 };
            if !element.annotations().is_empty() {
                attributes |= IA_ANNOTE;
            }

            match element {
                InstructionElement::Immediate(imm) => {
                    let length = u8::try_from(imm.bytes().len()).map_err(|_| {
                        Error::UnexpectedValue(format!("immediate {i} is too long"))
                    })?;
                    stream.write_byte(attributes | IA_IMM)?;
                    stream.write_byte(imm.destination_unit)?;
                    stream.write_byte(imm.destination_index)?;
                    stream.write_byte(length)?;
                    stream.write_byte_block(imm.bytes())?;
                }
                InstructionElement::Move(mv) => {
                    if mv.empty {
                        attributes |= IA_EMPTY;
                    }
                    if mv.guard.is_some() {
                        attributes |= IA_MGUARD;
                    }
                    let guard = mv.guard.map(|g| g.field).unwrap_or_default();
                    let mut types = (mv.destination.kind as u8) << 4
                        | (mv.source.kind as u8) << 2
                        | guard.kind as u8;
                    if mv.guard.is_some_and(|g| g.inverted) {
                        types |= GUARD_INVERTED;
                    }

                    stream.write_byte(attributes)?;
                    stream.write_byte(types)?;
                    stream.write_half_word(mv.bus)?;
                    for field in [mv.source, mv.destination, guard] {
                        stream.write_byte(field.unit)?;
                        stream.write_half_word(field.index)?;
                    }
                }
            }
            write_annotations(stream, element.annotations())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::{FieldType, ImmediateElement, MoveElement, MoveField};
    use crate::writer::FormatWriter;

    fn write(binary: &Binary) -> Vec<u8> {
        let mut stream = BinaryStream::in_memory();
        TpefWriter.write_binary(&mut stream, binary).expect("write");
        stream.into_bytes().expect("in memory")
    }

    fn word(bytes: &[u8], at: usize) -> u32 {
        u32::from_be_bytes(bytes[at..at + 4].try_into().expect("4 bytes"))
    }

    /// Body offset and size from the header of the section at `position`.
    fn body(bytes: &[u8], position: usize) -> (usize, u32) {
        let header = usize::from(FILE_HEADER_SIZE) + position * usize::from(SECTION_HEADER_SIZE);
        (word(bytes, header + 10) as usize, word(bytes, header + 14))
    }

    #[test]
    fn test_empty_binary_gets_placeholders() {
        let bytes = write(&Binary::new());
        assert_eq!(&MAGIC[..], &bytes[..10]);
        // null and address space sections
        assert_eq!(&[0, 2], &bytes[20..22]);

        let (offset, size) = body(&bytes, 1);
        assert_eq!(ASPACE_SIZE, size);
        assert_eq!(&[0u8; 8], &bytes[offset..offset + 8]);
    }

    #[test]
    fn test_code_encoding() {
        let mut binary = Binary::new();
        let code = binary.add_section(Section::create(SectionType::Code));
        let s = binary.section_mut(code);
        s.add_element(ImmediateElement::new(true, 0, 0, 0x1234));
        s.add_element(MoveElement::new(
            false,
            1,
            MoveField::new(FieldType::Imm, 0, 0),
            MoveField::new(FieldType::Rf, 0x80, 3),
        ));
        s.add_element(MoveElement::empty(true));

        let bytes = write(&binary);
        // the null section is inserted before the code
        let (offset, size) = body(&bytes, 1);
        assert_eq!(8 + 13 + 13, size);
        assert_eq!(&[IA_IMM, 0, 0, 4, 0, 0, 0x12, 0x34], &bytes[offset..offset + 8]);
        assert_eq!(IA_END, bytes[offset + 8]);
        assert_eq!(1 << 4 | 2 << 2, bytes[offset + 9]);
        assert_eq!(IA_END | IA_EMPTY, bytes[offset + 21]);
    }
}
