// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use std::sync::LazyLock;

use binrw::BinRead;

use super::*;
use crate::binary::{ElementRef, FileArchitecture, FileType, SectionRef};
use crate::element::{
    ASpaceElement, DebugElement, FieldType, Guard, ImmediateElement, InstructionAnnotation,
    InstructionElement, LineNumElement, LineNumProcedure, MoveElement, MoveField, RelocElement,
    RelocType, ResourceElement, ResourceType, SectionElement, SymbolBinding, SymbolElement,
    SymbolKind,
    STT_CODE, STT_DATA, STT_FILE, STT_NOTYPE, STT_PROCEDURE, STT_SECTION,
};
use crate::error::{Error, Result};
use crate::reader::{BinaryReader, ReadContext, SectionReader, SectionReaderRegistry};
use crate::reference::{FileOffsetKey, SafePointer, SectionIndexKey, SectionKey, SectionOffsetKey};
use crate::relocation;
use crate::section::{Section, SectionType, SF_VLEN};
use crate::stream::BinaryStream;
use crate::Binary;

/// Reads TPEF files.
pub struct TpefReader;

static NULL: NullSectionReader = NullSectionReader;
static STRINGS: RawSectionReader = RawSectionReader(SectionType::StrTab);
static DATA: RawSectionReader = RawSectionReader(SectionType::Data);
static UDATA: RawSectionReader = RawSectionReader(SectionType::UData);
static NOTES: RawSectionReader = RawSectionReader(SectionType::Note);
static ASPACES: ASpaceSectionReader = ASpaceSectionReader;
static SYMBOLS: SymbolSectionReader = SymbolSectionReader;
static RELOCATIONS: RelocSectionReader = RelocSectionReader;
static LINES: LineNumSectionReader = LineNumSectionReader;
static DEBUG: DebugSectionReader = DebugSectionReader;
static RESOURCES: ResourceSectionReader = ResourceSectionReader;
static CODE: CodeSectionReader = CodeSectionReader;

static REGISTRY: LazyLock<SectionReaderRegistry<TpefScratch>> = LazyLock::new(|| {
    SectionReaderRegistry::new(&[
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

impl BinaryReader for TpefReader {
    type Scratch = TpefScratch;

    fn name(&self) -> &'static str {
        "TPEF"
    }

    fn registry(&self) -> &SectionReaderRegistry<TpefScratch> {
        &REGISTRY
    }

    fn is_my_stream_type(&self, stream: &mut BinaryStream) -> Result<bool> {
        let start = stream.read_position()?;
        if stream.size_of_file()? < start + u64::from(FILE_HEADER_SIZE) {
            return Ok(false);
        }
        let mut magic = [0u8; 10];
        let read = stream.read_byte_block(&mut magic);
        stream.set_read_position(start)?;
        match read {
            Ok(()) => Ok(&magic == MAGIC),
            Err(Error::EndOfFile(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = FileHeader::read(&mut stream.reader())?;
        cx.binary.set_arch(FileArchitecture::try_from(header.arch)?);
        cx.binary.set_file_type(FileType::try_from(header.file_type)?);
        if header.entry_size < SECTION_HEADER_SIZE {
            return Err(Error::UnexpectedValue(format!(
                "section header size {} is smaller than {SECTION_HEADER_SIZE}",
                header.entry_size
            )));
        }

        let positions = (0..u32::from(header.section_count))
            .map(|i| {
                i.checked_mul(u32::from(header.entry_size))
                    .and_then(|o| o.checked_add(header.section_offset))
                    .ok_or_else(|| Error::UnexpectedValue("section header table overflows".into()))
            })
            .collect::<Result<Vec<u32>>>()?;

        // the address space and section name tables must be known before
        // any section header can be interpreted
        for position in &positions {
            stream.set_read_position(u64::from(*position))?;
            let section = SectionHeader::read(&mut stream.reader())?;
            if section.kind == SectionType::AddrSp as u8 && cx.scratch.aspace_id.is_none() {
                cx.scratch.aspace_id = Some(section.id);
            }
            if header.strings_offset != 0 && *position == header.strings_offset {
                cx.scratch.strings_id = Some(section.id);
            }
        }

        for position in positions {
            stream.set_read_position(u64::from(position) + 4)?;
            let kind = SectionType::try_from(stream.read_byte()?)?;
            stream.set_read_position(u64::from(position))?;

            let section = cx.binary.add_section(Section::create(kind));
            cx.references
                .add_object_reference(FileOffsetKey::new(position), section)?;
            REGISTRY.read_section(stream, section, cx)?;
        }

        if header.strings_offset != 0 {
            let strings = cx
                .references
                .create(FileOffsetKey::new(header.strings_offset));
            cx.binary.set_strings_pointer(strings);
        }

        check_sections(&cx.binary)
    }
}

fn check_sections(binary: &Binary) -> Result<()> {
    let count = |kind| binary.section_count_of(kind);
    if count(SectionType::AddrSp) != 1 {
        return Err(Error::UnexpectedValue(format!(
            "expected exactly one address space section, found {}",
            count(SectionType::AddrSp)
        )));
    }
    if count(SectionType::Null) != 1 {
        return Err(Error::UnexpectedValue(format!(
            "expected exactly one null section, found {}",
            count(SectionType::Null)
        )));
    }
    match count(SectionType::Mr) {
        0 if binary.sections().any(|(_, s)| s.kind().is_program_section()) => Err(
            Error::UnexpectedValue("program sections need a machine resource section".into()),
        ),
        0 | 1 => Ok(()),
        n => Err(Error::UnexpectedValue(format!(
            "expected at most one machine resource section, found {n}"
        ))),
    }
}

/// A pointer to the string at `offset` of the string table with id `link`.
/// Offset 0 is the empty name.
#[track_caller]
fn string_pointer(cx: &mut ReadContext<TpefScratch>, link: u16, offset: u32) -> SafePointer {
    if offset == 0 {
        SafePointer::Null
    } else {
        cx.references.create(SectionOffsetKey::new(link, offset))
    }
}

fn section_id(value: u32) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| Error::UnexpectedValue(format!("{value:#x} is not a section id")))
}

/// Reads the fixed-size records of the current section body.
fn read_records<R>(stream: &mut BinaryStream, header: &SectionHeader, size: u32) -> Result<Vec<R>>
where
    R: for<'a> BinRead<Args<'a> = ()>,
{
    let step = match header.element_size {
        0 => size,
        n if n < size => {
            return Err(Error::UnexpectedValue(format!(
                "element size {n} of section {} is smaller than {size}",
                header.id
            )))
        }
        n => n,
    };
    (0..header.body_size / step)
        .map(|i| {
            stream.set_read_position(u64::from(header.body_offset) + u64::from(i * step))?;
            Ok(R::read_be(&mut stream.reader())?)
        })
        .collect()
}

/// Body parsing of one TPEF section type. The common section header has
/// already been read into [TpefScratch::header] when these are called.
pub trait TpefBodyReader: Sync {
    fn kind(&self) -> SectionType;

    /// Interprets the info field of the header.
    fn read_info(&self, _section: SectionRef, _cx: &mut ReadContext<TpefScratch>) -> Result<()> {
        Ok(())
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()>;

    fn finalize_section(
        &self,
        _section: SectionRef,
        _cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        Ok(())
    }
}

impl<T: TpefBodyReader> SectionReader<TpefScratch> for T {
    fn section_type(&self) -> SectionType {
        self.kind()
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = SectionHeader::read(&mut stream.reader())?;
        if header.padding != 0 {
            return Err(Error::UnexpectedValue(format!(
                "padding of section {} header is {:#x}",
                header.id, header.padding
            )));
        }
        let vlen = header.flags & SF_VLEN != 0;
        if vlen != cx.binary.section(section).is_vlen() {
            return Err(Error::UnexpectedValue(format!(
                "variable length flag of {} section {} is {vlen}",
                self.kind(),
                header.id
            )));
        }
        let aspace_id = cx
            .scratch
            .aspace_id
            .ok_or_else(|| Error::UnexpectedValue("file has no address space section".into()))?;

        cx.references
            .add_object_reference(SectionKey::new(header.id), section)?;
        let link = cx.references.create(SectionKey::new(header.link));
        let aspace = cx
            .references
            .create(SectionIndexKey::new(aspace_id, header.aspace.into()));
        let name = match cx.scratch.strings_id {
            Some(strings) => string_pointer(cx, strings, header.name),
            None => SafePointer::Null,
        };

        let s = cx.binary.section_mut(section);
        s.set_flags(header.flags);
        s.set_start_address(header.start_address);
        s.set_link(link);
        s.set_aspace(aspace);
        s.set_name(name);
        let nobits = s.is_nobits();

        tracing::debug!(
            id = header.id,
            kind = %self.kind(),
            offset = header.body_offset,
            size = header.body_size,
            "reading section"
        );
        cx.scratch.header = header.clone();
        self.read_info(section, cx)?;
        if !nobits {
            stream.set_read_position(u64::from(header.body_offset))?;
        }
        self.read_body(stream, section, cx)
    }

    fn finalize(&self, section: SectionRef, cx: &mut ReadContext<TpefScratch>) -> Result<()> {
        self.finalize_section(section, cx)
    }
}

struct NullSectionReader;

impl TpefBodyReader for NullSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::Null
    }

    fn read_body(
        &self,
        _stream: &mut BinaryStream,
        _section: SectionRef,
        _cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        Ok(())
    }
}

/// String tables, notes, data and uninitialized data.
struct RawSectionReader(SectionType);

impl TpefBodyReader for RawSectionReader {
    fn kind(&self) -> SectionType {
        self.0
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let size = cx.scratch.header().body_size;
        let s = cx.binary.section_mut(section);
        if s.is_nobits() {
            s.set_data_length(size);
        } else {
            let bytes = stream.read_bytes(u64::from(size))?;
            s.set_data(bytes);
        }
        Ok(())
    }
}

struct ASpaceSectionReader;

impl TpefBodyReader for ASpaceSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::AddrSp
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = cx.scratch.header().clone();
        let mut aspaces = Vec::new();
        if !cx.binary.section(section).is_nobits() {
            for record in read_records::<ASpaceRecord>(stream, &header, ASPACE_SIZE)? {
                let mut aspace = ASpaceElement::new(record.mau, record.align, record.word_size);
                if record.id == 0 && !aspace.is_undefined() {
                    return Err(Error::UnexpectedValue(format!(
                        "address space 0 must be undefined, found mau {} align {} word size {}",
                        record.mau, record.align, record.word_size
                    )));
                }
                aspace.name = string_pointer(cx, header.link, record.name);
                aspaces.push((record.id, aspace));
            }
        }
        if !aspaces.iter().any(|(id, _)| *id == 0) {
            aspaces.insert(0, (0, ASpaceElement::undefined()));
        }

        for (id, aspace) in aspaces {
            let index = cx.binary.section_mut(section).add_element(aspace);
            cx.references.add_object_reference(
                SectionIndexKey::new(header.id, id.into()),
                ElementRef::new(section, index),
            )?;
        }
        Ok(())
    }
}

struct SymbolSectionReader;

impl SymbolSectionReader {
    fn add_undefined(&self, section: SectionRef, cx: &mut ReadContext<TpefScratch>) -> Result<()> {
        let id = cx.scratch.header().id;
        let mut undefined = SymbolElement::undefined();
        undefined.set_section(cx.references.create(SectionKey::new(0)));
        let index = cx.binary.section_mut(section).add_element(undefined);
        cx.references
            .add_object_reference(SectionIndexKey::new(id, 0), ElementRef::new(section, index))
    }
}

impl TpefBodyReader for SymbolSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::SymTab
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        if cx.binary.section(section).is_nobits() {
            return self.add_undefined(section, cx);
        }
        let header = cx.scratch.header().clone();
        let step = header.element_size.max(SYMBOL_SIZE);
        let records = read_records::<SymbolRecord>(stream, &header, SYMBOL_SIZE)?;
        if records.is_empty() {
            return self.add_undefined(section, cx);
        }

        for (i, record) in records.into_iter().enumerate() {
            let i = i as u32;
            let binding = SymbolBinding::try_from(record.info >> 4)?;
            let kind = match record.info & 0x0f {
                STT_NOTYPE => SymbolKind::NoType,
                STT_DATA => SymbolKind::Data {
                    reference: SafePointer::Null,
                },
                STT_CODE => SymbolKind::Code {
                    reference: SafePointer::Null,
                },
                STT_PROCEDURE => SymbolKind::Procedure {
                    reference: SafePointer::Null,
                },
                STT_SECTION => SymbolKind::Section,
                STT_FILE => SymbolKind::File,
                other if i == 0 => {
                    return Err(Error::UnexpectedValue(format!(
                        "first symbol of section {} must be the undefined symbol, found type {other}",
                        header.id
                    )));
                }
                other => {
                    tracing::warn!(index = i, kind = other, "skipping symbol of unknown type");
                    continue;
                }
            };
            if i == 0 && (kind != SymbolKind::NoType || binding != SymbolBinding::Local) {
                return Err(Error::UnexpectedValue(format!(
                    "first symbol of section {} must be the undefined symbol, found {} {binding}",
                    header.id,
                    kind.name()
                )));
            }

            let mut symbol = SymbolElement::new(kind);
            symbol.set_binding(binding);
            symbol.set_absolute(record.other & SYMBOL_ABSOLUTE != 0);
            symbol.set_value(record.value);
            symbol.set_size(record.size);
            symbol.set_name(string_pointer(cx, header.link, record.name));
            symbol.set_section(cx.references.create(SectionKey::new(record.section)));

            let index = cx.binary.section_mut(section).add_element(symbol);
            let element = ElementRef::new(section, index);
            cx.references
                .add_object_reference(SectionIndexKey::new(header.id, i), element)?;
            cx.references
                .add_object_reference(SectionOffsetKey::new(header.id, i * step), element)?;
            tracing::trace!(index = i, "read symbol");
        }
        Ok(())
    }

    /// Symbol values are addresses. Turns those of code, procedure and data
    /// symbols into references to the instruction or chunk they name.
    fn finalize_section(
        &self,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let mut references = Vec::new();
        for (index, element) in cx.binary.section(section).elements().iter().enumerate() {
            let Some(symbol) = element.as_symbol() else {
                continue;
            };
            if symbol.absolute() || !symbol.reference().is_some_and(|r| r.is_null()) {
                continue;
            }
            let Some(target) = symbol.section().section() else {
                continue;
            };
            let Some(id) = cx.references.section_id_of(target) else {
                continue;
            };
            let target_section = cx.binary.section(target);
            let Some(offset) = symbol.value().checked_sub(target_section.start_address()) else {
                return Err(Error::UnexpectedValue(format!(
                    "symbol {index} value {:#x} is below the start of its section",
                    symbol.value()
                )));
            };
            if offset >= cx.binary.address_length(target) {
                tracing::warn!(index, offset, "symbol points past the end of its section");
                continue;
            }

            let key = match (symbol.kind(), target_section.kind()) {
                (SymbolKind::Data { .. }, kind) if kind.is_chunkable() => {
                    let bytes = offset * cx.binary.bytes_per_mau(target);
                    cx.references.create(SectionOffsetKey::new(id, bytes))
                }
                (SymbolKind::Code { .. } | SymbolKind::Procedure { .. }, SectionType::Code) => {
                    cx.references.create(SectionIndexKey::new(id, offset))
                }
                _ => continue,
            };
            references.push((index as u32, key));
        }

        for (index, reference) in references {
            if let Some(symbol) = cx
                .binary
                .section_mut(section)
                .element_mut(index)
                .and_then(SectionElement::as_symbol_mut)
            {
                symbol.set_reference(reference)?;
            }
        }
        Ok(())
    }
}

struct RelocSectionReader;

impl TpefBodyReader for RelocSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::Reloc
    }

    fn read_info(&self, section: SectionRef, cx: &mut ReadContext<TpefScratch>) -> Result<()> {
        let target = section_id(cx.scratch.header().info)?;
        let referenced = cx.references.create(SectionKey::new(target));
        cx.binary
            .section_mut(section)
            .set_referenced_section(referenced);
        Ok(())
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = cx.scratch.header().clone();
        let target = section_id(header.info)?;
        let aspace_id = cx.scratch.aspace_id.unwrap_or_default();

        for (i, record) in read_records::<RelocRecord>(stream, &header, RELOC_SIZE)?
            .into_iter()
            .enumerate()
        {
            let symbol = if header.link == 0 {
                SafePointer::Null
            } else {
                cx.references
                    .create(SectionIndexKey::new(header.link, record.symbol))
            };
            let reloc = RelocElement {
                location: cx
                    .references
                    .create(SectionOffsetKey::new(target, record.location)),
                destination: SafePointer::Null,
                symbol,
                aspace: cx
                    .references
                    .create(SectionIndexKey::new(aspace_id, record.aspace.into())),
                kind: RelocType::try_from(record.kind & 0x0f)?,
                size: record.size,
                bit_offset: record.bit_offset,
                chunked: record.kind & RELOC_CHUNKED != 0,
            };
            let index = cx.binary.section_mut(section).add_element(reloc);
            cx.references.add_object_reference(
                SectionIndexKey::new(header.id, i as u32),
                ElementRef::new(section, index),
            )?;
        }
        Ok(())
    }

    fn finalize_section(
        &self,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        relocation::finalize_relocations(section, cx, relocation::tpef_address)
    }
}

struct LineNumSectionReader;

impl TpefBodyReader for LineNumSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::LineNo
    }

    fn read_info(&self, section: SectionRef, cx: &mut ReadContext<TpefScratch>) -> Result<()> {
        let code = section_id(cx.scratch.header().info)?;
        let referenced = cx.references.create(SectionKey::new(code));
        cx.binary
            .section_mut(section)
            .set_referenced_section(referenced);
        Ok(())
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = cx.scratch.header().clone();
        let code = section_id(header.info)?;
        let mut current: Option<LineNumProcedure> = None;

        for record in read_records::<LineNumRecord>(stream, &header, LINENUM_SIZE)? {
            if record.line == 0 {
                if let Some(procedure) = current.take() {
                    cx.binary.section_mut(section).add_element(procedure);
                }
                current = Some(LineNumProcedure {
                    procedure: cx
                        .references
                        .create(SectionIndexKey::new(header.link, record.address)),
                    lines: Vec::new(),
                });
            } else {
                let instruction = cx
                    .references
                    .create(SectionIndexKey::new(code, record.address));
                current
                    .as_mut()
                    .ok_or_else(|| {
                        Error::UnexpectedValue(format!(
                            "line {} of section {} comes before any procedure",
                            record.line, header.id
                        ))
                    })?
                    .lines
                    .push(LineNumElement {
                        instruction,
                        line: record.line,
                    });
            }
        }
        if let Some(procedure) = current {
            cx.binary.section_mut(section).add_element(procedure);
        }
        Ok(())
    }
}

struct DebugSectionReader;

impl TpefBodyReader for DebugSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::Debug
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = cx.scratch.header().clone();
        let start = u64::from(header.body_offset);
        let end = start + u64::from(header.body_size);
        while stream.read_position()? < end {
            let offset = (stream.read_position()? - start) as u32;
            let record = DebugRecord::read_be(&mut stream.reader())?;
            let element = DebugElement {
                debug_type: record.kind,
                debug_string: string_pointer(cx, header.link, record.string),
                data: record.data,
            };
            let index = cx.binary.section_mut(section).add_element(element);
            cx.references.add_object_reference(
                SectionOffsetKey::new(header.id, offset),
                ElementRef::new(section, index),
            )?;
        }
        Ok(())
    }
}

struct ResourceSectionReader;

impl TpefBodyReader for ResourceSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::Mr
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = cx.scratch.header().clone();
        for (i, record) in read_records::<ResourceRecord>(stream, &header, RESOURCE_SIZE)?
            .into_iter()
            .enumerate()
        {
            let resource = ResourceElement {
                id: record.id,
                kind: ResourceType::try_from(record.kind)?,
                name: string_pointer(cx, header.link, record.name),
                info: record.info,
            };
            let index = cx.binary.section_mut(section).add_element(resource);
            cx.references.add_object_reference(
                SectionIndexKey::new(header.id, i as u32),
                ElementRef::new(section, index),
            )?;
        }
        Ok(())
    }
}

struct CodeSectionReader;

impl CodeSectionReader {
    fn read_move(stream: &mut BinaryStream, attributes: u8, begin: bool) -> Result<MoveElement> {
        let types = stream.read_byte()?;
        let bus = stream.read_half_word()?;
        let mut field = |shift: u8| -> Result<MoveField> {
            let kind = FieldType::try_from((types >> shift) & 0x03)?;
            let unit = stream.read_byte()?;
            let index = stream.read_half_word()?;
            Ok(MoveField::new(kind, unit, index))
        };
        let source = field(2)?;
        let destination = field(4)?;
        let guard = field(0)?;
        Ok(MoveElement {
            begin,
            empty: attributes & IA_EMPTY != 0,
            bus,
            source,
            destination,
            guard: (attributes & IA_MGUARD != 0).then_some(Guard {
                field: guard,
                inverted: types & GUARD_INVERTED != 0,
            }),
            annotations: Vec::new(),
        })
    }

    fn read_annotations(stream: &mut BinaryStream) -> Result<Vec<InstructionAnnotation>> {
        let mut annotations = Vec::new();
        loop {
            let size = stream.read_byte()?;
            let id = stream.read_word()?;
            let mut payload = vec![0; usize::from(size & !ANNOTATION_CONTINUES)];
            stream.read_byte_block(&mut payload)?;
            annotations.push(InstructionAnnotation::new(id, payload));
            if size & ANNOTATION_CONTINUES == 0 {
                return Ok(annotations);
            }
        }
    }
}

impl TpefBodyReader for CodeSectionReader {
    fn kind(&self) -> SectionType {
        SectionType::Code
    }

    fn read_body(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<TpefScratch>,
    ) -> Result<()> {
        let header = cx.scratch.header().clone();
        let start = u64::from(header.body_offset);
        let end = start + u64::from(header.body_size);
        let mut begin = true;
        let mut instruction = 0u32;

        while stream.read_position()? < end {
            let offset = (stream.read_position()? - start) as u32;
            let attributes = stream.read_byte()?;
            let mut element = if attributes & IA_IMM != 0 {
                let unit = stream.read_byte()?;
                let index = stream.read_byte()?;
                let mut value = vec![0; usize::from(stream.read_byte()?)];
                stream.read_byte_block(&mut value)?;
                InstructionElement::Immediate(ImmediateElement::from_bytes(
                    begin, unit, index, value,
                ))
            } else {
                InstructionElement::Move(Self::read_move(stream, attributes, begin)?)
            };
            if attributes & IA_ANNOTE != 0 {
                for annotation in Self::read_annotations(stream)? {
                    element.add_annotation(annotation);
                }
            }

            let index = cx.binary.section_mut(section).add_element(element);
            let element = ElementRef::new(section, index);
            cx.references
                .add_object_reference(SectionOffsetKey::new(header.id, offset), element)?;
            if begin {
                cx.references
                    .add_object_reference(SectionIndexKey::new(header.id, instruction), element)?;
                instruction += 1;
            }
            begin = attributes & IA_END != 0;
        }
        tracing::trace!(id = header.id, instructions = instruction, "read code");
        Ok(())
    }
}
