// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Sections and their raw payload.

use std::collections::BTreeSet;
use std::fmt;

use crate::binary::SectionRef;
use crate::element::{InstructionElement, SectionElement};
use crate::error::{Error, Result};
use crate::reference::SafePointer;

/// Section flag: elements have variable length.
pub const SF_VLEN: u8 = 0x40;
/// Section flag: the body is not stored in the file.
pub const SF_NOBITS: u8 = 0x80;

/// The kind of a [Section].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SectionType {
    Null = 0x00,
    StrTab = 0x01,
    SymTab = 0x02,
    Debug = 0x03,
    Reloc = 0x04,
    LineNo = 0x05,
    Note = 0x06,
    AddrSp = 0x07,
    Mr = 0x0A,
    Code = 0x81,
    Data = 0x82,
    UData = 0x83,
}

impl SectionType {
    /// Code, data and uninitialized data sections are loaded into an address
    /// space when a program runs.
    pub fn is_program_section(self) -> bool {
        matches!(self, SectionType::Code | SectionType::Data | SectionType::UData)
    }

    /// Sections holding raw bytes that can be referred to by [Chunk].
    pub fn is_chunkable(self) -> bool {
        matches!(
            self,
            SectionType::StrTab | SectionType::Note | SectionType::Data | SectionType::UData
        )
    }

    /// The short name used in dumps.
    pub fn name(self) -> &'static str {
        match self {
            SectionType::Null => "NULL",
            SectionType::StrTab => "STRTAB",
            SectionType::SymTab => "SYMTAB",
            SectionType::Debug => "DEBUG",
            SectionType::Reloc => "RELOC",
            SectionType::LineNo => "LINENO",
            SectionType::Note => "NOTE",
            SectionType::AddrSp => "ADDRSP",
            SectionType::Mr => "MR",
            SectionType::Code => "CODE",
            SectionType::Data => "DATA",
            SectionType::UData => "UDATA",
        }
    }
}

impl TryFrom<u8> for SectionType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => SectionType::Null,
            0x01 => SectionType::StrTab,
            0x02 => SectionType::SymTab,
            0x03 => SectionType::Debug,
            0x04 => SectionType::Reloc,
            0x05 => SectionType::LineNo,
            0x06 => SectionType::Note,
            0x07 => SectionType::AddrSp,
            0x0A => SectionType::Mr,
            0x81 => SectionType::Code,
            0x82 => SectionType::Data,
            0x83 => SectionType::UData,
            other => {
                return Err(Error::InstanceNotFound(format!(
                    "no section prototype registered for type {other:#04x}"
                )))
            }
        })
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A handle to the bytes starting at `offset` of a raw section.
///
/// Two chunks of the same section and offset are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk {
    section: SectionRef,
    offset: u32,
}

impl Chunk {
    pub(crate) fn new(section: SectionRef, offset: u32) -> Self {
        Self { section, offset }
    }

    pub fn section(&self) -> SectionRef {
        self.section
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Payload of a chunkable section.
///
/// `length` equals `bytes.len()` unless the section has no bits, in which
/// case only the length is known.
#[derive(Clone, Debug, Default, PartialEq)]
struct RawData {
    bytes: Vec<u8>,
    length: u32,
    chunks: BTreeSet<u32>,
}

/// A typed region of an object file.
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    kind: SectionType,
    flags: u8,
    start_address: u32,
    link: SafePointer,
    aspace: SafePointer,
    name: SafePointer,
    referenced_section: SafePointer,
    elements: Vec<SectionElement>,
    raw: Option<RawData>,
}

impl Section {
    /// A new empty section of `kind`, cloned from that kind's prototype.
    pub fn create(kind: SectionType) -> Section {
        let flags = match kind {
            SectionType::Code | SectionType::Debug => SF_VLEN,
            SectionType::UData => SF_NOBITS,
            _ => 0,
        };
        let raw = kind.is_chunkable().then(|| match kind {
            // offset 0 of every string table is the empty string
            SectionType::StrTab => RawData {
                bytes: vec![0],
                length: 1,
                chunks: BTreeSet::new(),
            },
            _ => RawData::default(),
        });
        Section {
            kind,
            flags,
            start_address: 0,
            link: SafePointer::Null,
            aspace: SafePointer::Null,
            name: SafePointer::Null,
            referenced_section: SafePointer::Null,
            elements: Vec::new(),
            raw,
        }
    }

    pub fn kind(&self) -> SectionType {
        self.kind
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn is_vlen(&self) -> bool {
        self.flags & SF_VLEN != 0
    }

    pub fn is_nobits(&self) -> bool {
        self.flags & SF_NOBITS != 0
    }

    pub fn set_nobits(&mut self, nobits: bool) {
        if nobits {
            self.flags |= SF_NOBITS;
        } else {
            self.flags &= !SF_NOBITS;
        }
    }

    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    pub fn set_start_address(&mut self, address: u32) {
        self.start_address = address;
    }

    /// The linked section. A symbol table links to its string table, a
    /// relocation table to its symbol table, a code section to its resource
    /// table.
    pub fn link(&self) -> SafePointer {
        self.link
    }

    pub fn set_link(&mut self, link: SafePointer) {
        self.link = link;
    }

    /// The [ASpaceElement](crate::element::ASpaceElement) of this section.
    pub fn aspace(&self) -> SafePointer {
        self.aspace
    }

    pub fn set_aspace(&mut self, aspace: SafePointer) {
        self.aspace = aspace;
    }

    /// The name, a chunk of the binary's section name string table.
    pub fn name(&self) -> SafePointer {
        self.name
    }

    pub fn set_name(&mut self, name: SafePointer) {
        self.name = name;
    }

    /// For relocation tables the section being patched, for line number
    /// tables the code section.
    pub fn referenced_section(&self) -> SafePointer {
        self.referenced_section
    }

    pub fn set_referenced_section(&mut self, section: SafePointer) {
        self.referenced_section = section;
    }

    pub fn elements(&self) -> &[SectionElement] {
        &self.elements
    }

    pub fn elements_mut(&mut self) -> &mut [SectionElement] {
        &mut self.elements
    }

    pub fn element(&self, index: u32) -> Option<&SectionElement> {
        self.elements.get(index as usize)
    }

    pub fn element_mut(&mut self, index: u32) -> Option<&mut SectionElement> {
        self.elements.get_mut(index as usize)
    }

    pub fn element_count(&self) -> u32 {
        self.elements.len() as u32
    }

    /// Appends an element, returning its index.
    pub fn add_element(&mut self, element: impl Into<SectionElement>) -> u32 {
        self.elements.push(element.into());
        self.elements.len() as u32 - 1
    }

    /// Inserts an element before `index`. References to later elements are
    /// not adjusted; use [Binary::insert_element](crate::Binary::insert_element)
    /// for that.
    pub(crate) fn insert_element(&mut self, index: u32, element: impl Into<SectionElement>) {
        let index = (index as usize).min(self.elements.len());
        self.elements.insert(index, element.into());
    }

    /// Replaces the element at `index`.
    pub fn set_element(&mut self, index: u32, element: impl Into<SectionElement>) -> Result<()> {
        let count = self.element_count();
        let slot = self.elements.get_mut(index as usize).ok_or_else(|| {
            Error::UnexpectedValue(format!(
                "element index {index} out of range for {} section with {count} elements",
                self.kind
            ))
        })?;
        *slot = element.into();
        Ok(())
    }

    /// Whether this section holds raw bytes.
    pub fn is_chunkable(&self) -> bool {
        self.raw.is_some()
    }

    /// Stored bytes of a raw section. Empty for other sections and for
    /// sections without bits.
    pub fn data(&self) -> &[u8] {
        self.raw.as_ref().map(|r| r.bytes.as_slice()).unwrap_or(&[])
    }

    /// Length in bytes of a raw section.
    pub fn length(&self) -> u32 {
        self.raw.as_ref().map(|r| r.length).unwrap_or(0)
    }

    /// Replaces the bytes of a raw section.
    pub fn set_data(&mut self, bytes: Vec<u8>) {
        if let Some(raw) = &mut self.raw {
            raw.length = bytes.len() as u32;
            raw.bytes = bytes;
            raw.chunks.retain(|offset| *offset < raw.length);
        }
    }

    /// Declares the length of a raw section without storing any bytes.
    pub fn set_data_length(&mut self, length: u32) {
        if let Some(raw) = &mut self.raw {
            raw.bytes.clear();
            raw.length = length;
            raw.chunks.retain(|offset| *offset < length);
        }
    }

    /// Appends bytes to a raw section, returning the offset they start at.
    pub fn append_data(&mut self, bytes: &[u8]) -> Result<u32> {
        let kind = self.kind;
        let raw = self
            .raw
            .as_mut()
            .ok_or_else(|| Error::UnexpectedValue(format!("{kind} section is not chunkable")))?;
        let offset = raw.length;
        raw.bytes.extend_from_slice(bytes);
        raw.length += bytes.len() as u32;
        Ok(offset)
    }

    /// Records that a chunk exists at `offset`.
    pub(crate) fn materialize_chunk(&mut self, offset: u32) -> Result<()> {
        let kind = self.kind;
        let raw = self
            .raw
            .as_mut()
            .ok_or_else(|| Error::UnexpectedValue(format!("{kind} section is not chunkable")))?;
        if offset >= raw.length {
            return Err(Error::UnexpectedValue(format!(
                "offset {offset:#x} is outside the {kind} section of length {:#x}",
                raw.length
            )));
        }
        raw.chunks.insert(offset);
        Ok(())
    }

    /// Offsets of every chunk handed out for this section.
    pub fn chunk_offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.raw.iter().flat_map(|r| r.chunks.iter().copied())
    }

    /// The NUL-terminated string at `offset`. Invalid UTF-8 is replaced.
    pub fn string_at(&self, offset: u32) -> Result<String> {
        let data = self.data();
        let start = offset as usize;
        if start >= data.len() {
            return Err(Error::UnexpectedValue(format!(
                "string offset {offset:#x} is outside the {} section",
                self.kind
            )));
        }
        let end = data[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|p| start + p)
            .unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[start..end]).into_owned())
    }

    /// Offset of `s` as a NUL-terminated string in this section, appending
    /// it if it is not present yet.
    pub fn find_or_append_string(&mut self, s: &str) -> Result<u32> {
        let needle: Vec<u8> = s.bytes().chain(std::iter::once(0)).collect();
        if let Some(offset) = self
            .data()
            .windows(needle.len())
            .position(|window| window == needle.as_slice())
        {
            return Ok(offset as u32);
        }
        self.append_data(&needle)
    }

    /// Number of instructions of a code section.
    pub fn instruction_count(&self) -> u32 {
        self.elements
            .iter()
            .filter(|e| matches!(e, SectionElement::Instruction(i) if i.begin()))
            .count() as u32
    }

    /// Element index of the first element of instruction `index`.
    pub fn instruction_start(&self, index: u32) -> Option<u32> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, SectionElement::Instruction(i) if i.begin()))
            .nth(index as usize)
            .map(|(position, _)| position as u32)
    }

    /// Index of the instruction the element at `element` belongs to.
    pub fn instruction_index_of(&self, element: u32) -> Option<u32> {
        let upto = self.elements.get(..=element as usize)?;
        upto.iter()
            .filter(|e| matches!(e, SectionElement::Instruction(i) if i.begin()))
            .count()
            .checked_sub(1)
            .map(|i| i as u32)
    }

    /// The instruction elements of a code section.
    pub fn instructions(&self) -> impl Iterator<Item = &InstructionElement> {
        self.elements.iter().filter_map(SectionElement::as_instruction)
    }

    /// Every pointer held by this section and its elements.
    pub fn pointers(&self) -> Vec<&SafePointer> {
        let mut pointers = vec![
            &self.link,
            &self.aspace,
            &self.name,
            &self.referenced_section,
        ];
        for element in &self.elements {
            pointers.extend(element.pointers());
        }
        pointers
    }

    pub fn pointers_mut(&mut self) -> Vec<&mut SafePointer> {
        let mut pointers = vec![
            &mut self.link,
            &mut self.aspace,
            &mut self.name,
            &mut self.referenced_section,
        ];
        for element in &mut self.elements {
            pointers.extend(element.pointers_mut());
        }
        pointers
    }
}
