// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! The TTA program exchange format.
//!
//! A TPEF file is a [FileHeader] followed by a table of [SectionHeader]s
//! and the section bodies they point at. All values are big-endian.
//! Sections refer to each other by identification code; the null section
//! always has id 0.

use binrw::binrw;

mod reader;
mod writer;

pub use reader::TpefReader;
pub use writer::TpefWriter;

/// Size of a [FileHeader] on disk.
pub const FILE_HEADER_SIZE: u16 = 26;

/// Size of a [SectionHeader] on disk.
pub const SECTION_HEADER_SIZE: u16 = 32;

pub(crate) const MAGIC: &[u8; 10] = b"\x7fTTA-PF\x00\x01\x0a";

/// Element sizes of the fixed-length record sections.
pub(crate) const SYMBOL_SIZE: u32 = 16;
pub(crate) const RELOC_SIZE: u32 = 12;
pub(crate) const ASPACE_SIZE: u32 = 8;
pub(crate) const RESOURCE_SIZE: u32 = 11;
pub(crate) const LINENUM_SIZE: u32 = 6;

/// Code element attribute bits.
pub(crate) const IA_END: u8 = 0x01;
pub(crate) const IA_EMPTY: u8 = 0x02;
pub(crate) const IA_IMM: u8 = 0x04;
pub(crate) const IA_MGUARD: u8 = 0x08;
pub(crate) const IA_ANNOTE: u8 = 0x10;

/// Annotations follow the element they annotate, each as
///
/// | Offset | Type | Description                                        |
/// |--------|------|----------------------------------------------------|
/// | 0      | u8   | Payload length, 0x80 set if another one follows    |
/// | 1      | u32  | Annotation id                                      |
/// | 5      | [u8] | Payload                                            |
pub(crate) const ANNOTATION_CONTINUES: u8 = 0x80;
pub(crate) const MAX_ANNOTATION_PAYLOAD: usize = 0x7f;

/// Relocation type bit marking values split over several immediates.
pub(crate) const RELOC_CHUNKED: u8 = 0x80;

/// Symbol other bit marking absolute symbols.
pub(crate) const SYMBOL_ABSOLUTE: u8 = 0x80;

/// Move field type bit marking an inverted guard.
pub(crate) const GUARD_INVERTED: u8 = 0x80;

/// # Structure on Disk
///
/// | Offset | Type       | Description                                    |
/// |--------|------------|------------------------------------------------|
/// | 0      | `[u8; 10]` | Magic: `7f 'TTA-PF' 00 01 0a`                  |
/// | 10     | `u8`       | [FileArchitecture](crate::binary::FileArchitecture) |
/// | 11     | `u8`       | [FileType](crate::binary::FileType)            |
/// | 12     | `u32`      | Offset of the first section header             |
/// | 16     | `u16`      | Size of this header                            |
/// | 18     | `u16`      | Size of one section header                     |
/// | 20     | `u16`      | Number of section headers                      |
/// | 22     | `u32`      | Offset of the header of the section name table, 0 if none |
#[binrw]
#[brw(big, magic = b"\x7fTTA-PF\x00\x01\x0a")]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileHeader {
    pub arch: u8,
    pub file_type: u8,
    pub section_offset: u32,
    pub header_size: u16,
    pub entry_size: u16,
    pub section_count: u16,
    pub strings_offset: u32,
}

/// # Structure on Disk
///
/// | Offset | Type  | Description                                      |
/// |--------|-------|--------------------------------------------------|
/// | 0      | `u32` | Offset of the name in the section name table     |
/// | 4      | `u8`  | [SectionType](crate::section::SectionType)       |
/// | 5      | `u8`  | Flags                                            |
/// | 6      | `u32` | Starting address                                 |
/// | 10     | `u32` | File offset of the body                          |
/// | 14     | `u32` | Size of the body                                 |
/// | 18     | `u16` | Identification code                              |
/// | 20     | `u8`  | Index of the address space                       |
/// | 21     | `u8`  | Padding, always 0                                |
/// | 22     | `u16` | Identification code of the linked section        |
/// | 24     | `u32` | Type specific information                        |
/// | 28     | `u32` | Size of one element, 0 for variable length       |
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SectionHeader {
    pub name: u32,
    pub kind: u8,
    pub flags: u8,
    pub start_address: u32,
    pub body_offset: u32,
    pub body_size: u32,
    pub id: u16,
    pub aspace: u8,
    pub padding: u8,
    pub link: u16,
    pub info: u32,
    pub element_size: u32,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SymbolRecord {
    pub name: u32,
    pub value: u32,
    pub size: u32,
    /// Type in the low nibble, binding in the high nibble.
    pub info: u8,
    pub other: u8,
    pub section: u16,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct RelocRecord {
    /// Byte offset into the patched section.
    pub location: u32,
    pub symbol: u32,
    pub kind: u8,
    pub aspace: u8,
    pub size: u8,
    pub bit_offset: u8,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ASpaceRecord {
    pub id: u8,
    pub mau: u8,
    pub align: u8,
    pub word_size: u8,
    pub name: u32,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ResourceRecord {
    pub id: u16,
    pub kind: u8,
    pub name: u32,
    pub info: u32,
}

/// A line of a procedure, or with `line` 0 the start of a procedure whose
/// symbol index is `address`.
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct LineNumRecord {
    pub address: u32,
    pub line: u16,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DebugRecord {
    pub kind: u8,
    pub string: u32,
    pub length: u32,
    #[br(count = length)]
    pub data: Vec<u8>,
}

/// Scratch state of a TPEF read.
#[derive(Debug, Default)]
pub struct TpefScratch {
    header: SectionHeader,
    aspace_id: Option<u16>,
    strings_id: Option<u16>,
}

impl TpefScratch {
    /// Header of the section being read.
    pub fn header(&self) -> &SectionHeader {
        &self.header
    }
}
