// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Reading of old impure format (OMAGIC) a.out object files.
//!
//! An a.out file is converted into the same model a TPEF file reads into:
//! text becomes a code section of move and immediate elements, symbols a
//! symbol table plus stabs in a debug section, and the registers the
//! program uses a machine resource table.
//!
//! # Structure on Disk
//!
//! | Offset | Type     | Description                               |
//! |--------|----------|-------------------------------------------|
//! | 0      | [Header] | Section sizes                             |
//! | 32     | `[u8]`   | Text, 8 bytes per instruction             |
//! |        | `[u8]`   | Initialized data                          |
//! |        | `[u8]`   | Text relocations                          |
//! |        | `[u8]`   | Data relocations                          |
//! |        | `[u8]`   | Symbols                                   |
//! |        | `[u8]`   | Strings, up to the end of the file        |

use std::collections::BTreeMap;

use binrw::BinRead;

mod reader;

use crate::binary::{Binary, ElementRef, FileArchitecture, FileType, SectionRef};
use crate::element::{ASpaceElement, SectionElement};
use crate::error::{Error, Result};
use crate::reader::{BinaryReader, ReadContext, SectionReaderRegistry};
use crate::reference::{SafePointer, SectionId, SectionKey};
use crate::section::{Section, SectionType};
use crate::stream::BinaryStream;

/// Magic of old impure format files.
pub const OMAGIC: u16 = 0x0107;

/// Size of a [Header] on disk.
pub const HEADER_SIZE: u64 = 32;

pub(crate) const INSTRUCTION_SIZE: u32 = 8;
pub(crate) const SYMBOL_SIZE: u32 = 12;
pub(crate) const RELOC_SIZE: u32 = 12;

/// Identification codes the converted sections are registered under. The
/// program sections use the symbol type of symbols defined in them.
pub(crate) const ST_TEXT: SectionId = N_TEXT as SectionId;
pub(crate) const ST_DATA: SectionId = N_DATA as SectionId;
pub(crate) const ST_UDATA: SectionId = N_BSS as SectionId;
pub(crate) const ST_SYMBOL: SectionId = 0x100;
pub(crate) const ST_STRING: SectionId = 0x101;

/// Symbol types.
pub(crate) const N_UNDF: u8 = 0x00;
pub(crate) const N_EXT: u8 = 0x01;
pub(crate) const N_TEXT: u8 = 0x04;
pub(crate) const N_DATA: u8 = 0x06;
pub(crate) const N_BSS: u8 = 0x08;
pub(crate) const N_FN: u8 = 0x1e;
/// Maps an operation or special register name to its register number.
pub(crate) const N_PRTAB: u8 = 0x70;
/// Instruction annotation.
pub(crate) const N_ANN: u8 = 0x72;

/// Register numbering of the text.
pub(crate) const FIRST_FP_REGISTER: u32 = 1024;
pub(crate) const BOOL_REGISTER: u32 = 2048;
pub(crate) const FIRST_FU_REGISTER: u32 = 2049;

/// Relocation info bit marking a reference to an external symbol.
///
/// The info word holds the symbol or section index above bit 8 and the
/// relocation type in the low 5 bits. Types with bit 1 set refer to a
/// symbol: the index is then a symbol table index, not a section id.
pub(crate) const RELOC_EXTERN: u32 = 0x02;

const AOUT_BITS_PER_MAU: u8 = 8;
const AOUT_WORD_ALIGN: u8 = 4;
const AOUT_WORD_SIZE: u8 = 4;
const CODE_ASPACE_NAME: &str = "universal_instructions";
const DATA_ASPACE_NAME: &str = "universal_data";

/// # Structure on Disk
///
/// | Offset | Type  | Description                          |
/// |--------|-------|--------------------------------------|
/// | 0      | `u16` | Machine                              |
/// | 2      | `u16` | Magic, [OMAGIC]                      |
/// | 4      | `u32` | Size of text                         |
/// | 8      | `u32` | Size of initialized data             |
/// | 12     | `u32` | Size of uninitialized data           |
/// | 16     | `u32` | Size of symbols                      |
/// | 20     | `u32` | Entry point, always 0                |
/// | 24     | `u32` | Size of text relocations             |
/// | 28     | `u32` | Size of data relocations             |
#[derive(BinRead, Clone, Debug, Default, PartialEq)]
#[br(big)]
pub struct Header {
    pub machine: u16,
    #[br(assert(magic == OMAGIC, "a.out magic {:#06x} is not OMAGIC", magic))]
    pub magic: u16,
    pub text: u32,
    pub data: u32,
    pub bss: u32,
    pub symbols: u32,
    #[br(assert(entry == 0, "a.out entry point {:#x} is not 0", entry))]
    pub entry: u32,
    pub text_relocs: u32,
    pub data_relocs: u32,
}

impl Header {
    /// Offset in the address space of a program section that holds the
    /// a.out address `address`. Text comes first, then data, then bss.
    pub fn section_offset_of_address(&self, address: u32) -> u32 {
        if address < self.text {
            address
        } else if address - self.text < self.data {
            address - self.text
        } else {
            address - self.text - self.data
        }
    }
}

#[derive(BinRead, Clone, Debug, Default, PartialEq)]
#[br(big)]
pub(crate) struct SymbolRecord {
    pub strx: u32,
    pub kind: u8,
    pub other: u8,
    pub desc: u16,
    pub value: u32,
}

/// `info` holds a symbol or section index above bit 8, the extern bit and
/// the relocation type in the low 5 bits.
#[derive(BinRead, Clone, Debug, Default, PartialEq)]
#[br(big)]
pub(crate) struct RelocRecord {
    pub address: u32,
    pub info: u32,
    pub addend: u32,
}

/// The sections of the converted binary.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AOutSections {
    pub null: SectionRef,
    pub text: SectionRef,
    pub data: SectionRef,
    pub strings: SectionRef,
    pub debug: SectionRef,
    pub resources: SectionRef,
    pub undefined_aspace: ElementRef,
    pub code_aspace: ElementRef,
    pub data_aspace: ElementRef,
}

/// Operand register renumbering of one compilation module. Operations are
/// numbered per module; the first number seen for a name wins.
#[derive(Clone, Debug, Default)]
pub(crate) struct CompilationModule {
    /// First instruction of the module.
    pub start: u32,
    pub resources: BTreeMap<u32, u32>,
}

/// Scratch state of an a.out read.
#[derive(Debug, Default)]
pub struct AOutScratch {
    header: Header,
    sections: Option<AOutSections>,
    /// Size of the section being read.
    section_size: u32,
    resolved_resources: BTreeMap<String, u32>,
    modules: Vec<CompilationModule>,
    /// Annotation stabs: text offset of the instruction and the stab string.
    annotations: Vec<(u32, String)>,
}

impl AOutScratch {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub(crate) fn sections(&self) -> Result<AOutSections> {
        self.sections
            .ok_or_else(|| Error::UnexpectedValue("a.out sections have not been created".into()))
    }
}

/// Reads a.out files.
pub struct AOutReader;

fn read_section_at(
    stream: &mut BinaryStream,
    position: u64,
    size: u32,
    section: SectionRef,
    cx: &mut ReadContext<AOutScratch>,
) -> Result<()> {
    cx.scratch.section_size = size;
    stream.set_read_position(position)?;
    reader::REGISTRY.read_section(stream, section, cx)
}

impl BinaryReader for AOutReader {
    type Scratch = AOutScratch;

    fn name(&self) -> &'static str {
        "a.out"
    }

    fn registry(&self) -> &SectionReaderRegistry<AOutScratch> {
        &reader::REGISTRY
    }

    fn is_my_stream_type(&self, stream: &mut BinaryStream) -> Result<bool> {
        let start = stream.read_position()?;
        if stream.size_of_file()? < start + HEADER_SIZE {
            return Ok(false);
        }
        let magic = stream.read_half_word().and_then(|_| stream.read_half_word());
        stream.set_read_position(start)?;
        match magic {
            Ok(magic) => Ok(magic == OMAGIC),
            Err(Error::EndOfFile(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        cx: &mut ReadContext<AOutScratch>,
    ) -> Result<()> {
        let start = stream.read_position()?;
        let header = Header::read(&mut stream.reader())?;

        let text_start = start + HEADER_SIZE;
        let data_start = text_start + u64::from(header.text);
        let text_relocs_start = data_start + u64::from(header.data);
        let data_relocs_start = text_relocs_start + u64::from(header.text_relocs);
        let symbols_start = data_relocs_start + u64::from(header.data_relocs);
        let strings_start = symbols_start + u64::from(header.symbols);
        let strings_size = stream
            .size_of_file()?
            .checked_sub(strings_start)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or_else(|| {
                Error::UnexpectedValue(format!(
                    "a.out sections end at {strings_start:#x}, past the end of the file"
                ))
            })?;
        tracing::debug!(
            text = header.text,
            data = header.data,
            bss = header.bss,
            symbols = header.symbols,
            strings = strings_size,
            "read a.out header"
        );

        let binary = &mut cx.binary;
        let null = binary.create_detached(Section::create(SectionType::Null));
        let text = binary.create_detached(Section::create(SectionType::Code));
        let data = binary.create_detached(Section::create(SectionType::Data));
        let udata = binary.create_detached(Section::create(SectionType::UData));
        let strings = binary.create_detached(Section::create(SectionType::StrTab));
        let symbols = binary.create_detached(Section::create(SectionType::SymTab));
        let text_relocs = binary.create_detached(Section::create(SectionType::Reloc));
        let data_relocs = binary.create_detached(Section::create(SectionType::Reloc));
        let debug = binary.create_detached(Section::create(SectionType::Debug));
        let resources = binary.create_detached(Section::create(SectionType::Mr));
        let aspaces = binary.create_detached(Section::create(SectionType::AddrSp));

        let aspace = |binary: &mut Binary, element: ASpaceElement| {
            ElementRef::new(aspaces, binary.section_mut(aspaces).add_element(element))
        };
        let undefined_aspace = aspace(binary, ASpaceElement::undefined());
        let code_aspace = aspace(
            binary,
            ASpaceElement::new(AOUT_BITS_PER_MAU, AOUT_WORD_ALIGN, AOUT_WORD_SIZE),
        );
        let data_aspace = aspace(
            binary,
            ASpaceElement::new(AOUT_BITS_PER_MAU, AOUT_WORD_ALIGN, AOUT_WORD_SIZE),
        );

        for (section, link, aspace) in [
            (null, null, undefined_aspace),
            (text, resources, code_aspace),
            (data, null, data_aspace),
            (udata, null, data_aspace),
            (strings, null, undefined_aspace),
            (symbols, strings, undefined_aspace),
            (text_relocs, symbols, undefined_aspace),
            (data_relocs, symbols, undefined_aspace),
            (debug, strings, undefined_aspace),
            (resources, strings, undefined_aspace),
            (aspaces, strings, undefined_aspace),
        ] {
            let s = binary.section_mut(section);
            s.set_link(SafePointer::to(link));
            s.set_aspace(SafePointer::to(aspace));
        }
        binary.section_mut(data).set_start_address(header.text);
        binary
            .section_mut(udata)
            .set_start_address(header.text.wrapping_add(header.data));
        binary.section_mut(udata).set_data_length(header.bss);
        binary
            .section_mut(text_relocs)
            .set_referenced_section(SafePointer::to(text));
        binary
            .section_mut(data_relocs)
            .set_referenced_section(SafePointer::to(data));

        cx.scratch.header = header.clone();
        cx.scratch.sections = Some(AOutSections {
            null,
            text,
            data,
            strings,
            debug,
            resources,
            undefined_aspace,
            code_aspace,
            data_aspace,
        });

        cx.references
            .add_object_reference(SectionKey::new(ST_UDATA), udata)?;
        cx.references
            .add_object_reference(SectionKey::new(ST_STRING), strings)?;
        read_section_at(stream, strings_start, strings_size, strings, cx)?;
        cx.references
            .add_object_reference(SectionKey::new(ST_TEXT), text)?;
        read_section_at(stream, text_start, header.text, text, cx)?;
        cx.references
            .add_object_reference(SectionKey::new(ST_DATA), data)?;
        read_section_at(stream, data_start, header.data, data, cx)?;
        cx.references
            .add_object_reference(SectionKey::new(ST_SYMBOL), symbols)?;
        read_section_at(stream, symbols_start, header.symbols, symbols, cx)?;
        read_section_at(stream, text_relocs_start, header.text_relocs, text_relocs, cx)?;
        read_section_at(stream, data_relocs_start, header.data_relocs, data_relocs, cx)?;

        let binary = &mut cx.binary;
        for (section, name) in [
            (symbols, "Symbols"),
            (resources, "Universal resources"),
            (data, "Initialized data"),
            (text, "Code"),
            (aspaces, "Address spaces"),
            (null, "Null section"),
            (udata, "Uninitilized data"),
            (text_relocs, "Relocated immediates"),
            (data_relocs, "Relocated data"),
            (strings, "Strings of TPEF"),
            (debug, "A.out stabs"),
        ] {
            let chunk = binary.string_to_chunk(strings, name)?;
            binary.section_mut(section).set_name(SafePointer::to(chunk));
        }
        for (element, name) in [
            (undefined_aspace, ""),
            (code_aspace, CODE_ASPACE_NAME),
            (data_aspace, DATA_ASPACE_NAME),
        ] {
            let chunk = binary.string_to_chunk(strings, name)?;
            if let Some(aspace) = binary
                .element_mut(element)
                .and_then(SectionElement::as_aspace_mut)
            {
                aspace.name = SafePointer::to(chunk);
            }
        }

        binary.attach(null);
        binary.attach(aspaces);
        for section in [
            text,
            text_relocs,
            symbols,
            data,
            data_relocs,
            udata,
            resources,
            debug,
        ] {
            let s = binary.section(section);
            if s.element_count() > 0 || s.length() > 0 {
                binary.attach(section);
            } else {
                tracing::trace!(kind = %s.kind(), "dropping empty section");
            }
        }
        binary.attach(strings);
        binary.set_strings(strings);

        binary.set_file_type(FileType::ObjSeq);
        binary.set_arch(FileArchitecture::TtaTut);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use binrw::io::Cursor;

    fn header_bytes(magic: u16, entry: u32) -> Vec<u8> {
        let mut bytes = vec![0, 0];
        bytes.extend(magic.to_be_bytes());
        for value in [16u32, 8, 4, 12, entry, 0, 0] {
            bytes.extend(value.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn test_header() {
        let header = Header::read(&mut Cursor::new(header_bytes(OMAGIC, 0))).expect("header");
        assert_eq!(16, header.text);
        assert_eq!(8, header.data);
        assert_eq!(4, header.bss);
        assert_eq!(12, header.symbols);

        assert!(Header::read(&mut Cursor::new(header_bytes(0x0108, 0))).is_err());
        assert!(Header::read(&mut Cursor::new(header_bytes(OMAGIC, 4))).is_err());
    }

    #[test]
    fn test_section_offset_of_address() {
        let header = Header {
            text: 16,
            data: 8,
            bss: 4,
            ..Header::default()
        };
        assert_eq!(8, header.section_offset_of_address(8));
        assert_eq!(4, header.section_offset_of_address(20));
        assert_eq!(2, header.section_offset_of_address(26));
    }

    #[test]
    fn test_magic_detection() {
        let mut stream = BinaryStream::from_bytes(header_bytes(OMAGIC, 0));
        assert!(AOutReader.is_my_stream_type(&mut stream).expect("format check"));
        assert_eq!(0, stream.read_position().expect("position"));

        let mut stream = BinaryStream::from_bytes(vec![0, 0, 1, 7]);
        assert!(!AOutReader.is_my_stream_type(&mut stream).expect("format check"));
    }
}
