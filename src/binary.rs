// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! The in-memory object file.

use std::fmt;

use crate::display::{self, DisplayWithOptions};
use crate::element::{ASpaceElement, InstructionElement, SectionElement};
use crate::error::{Error, Result};
use crate::reference::{ObjectRef, SafePointer};
use crate::section::{Chunk, Section, SectionType};

/// A handle to a [Section] of a [Binary].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionRef(u32);

impl SectionRef {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Position of the section in its binary's storage.
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// A handle to an element of a [Section].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementRef {
    section: SectionRef,
    index: u32,
}

impl ElementRef {
    pub fn new(section: SectionRef, index: u32) -> Self {
        Self { section, index }
    }

    pub fn section(&self) -> SectionRef {
        self.section
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Architecture tag of the file header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FileArchitecture {
    #[default]
    NoArch = 0x00,
    TtaMove = 0x01,
    TtaTut = 0x02,
    TdsTi = 0x03,
}

impl TryFrom<u8> for FileArchitecture {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(FileArchitecture::NoArch),
            0x01 => Ok(FileArchitecture::TtaMove),
            0x02 => Ok(FileArchitecture::TtaTut),
            0x03 => Ok(FileArchitecture::TdsTi),
            other => Err(Error::UnexpectedValue(format!(
                "unknown file architecture {other:#04x}"
            ))),
        }
    }
}

impl fmt::Display for FileArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            FileArchitecture::NoArch => "NOARCH",
            FileArchitecture::TtaMove => "TTA_MOVE",
            FileArchitecture::TtaTut => "TTA_TUT",
            FileArchitecture::TdsTi => "TDS_TI",
        })
    }
}

/// File type tag of the file header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FileType {
    #[default]
    Null = 0x00,
    ObjSeq = 0x01,
    PureSeq = 0x02,
    LibSeq = 0x03,
    Mixed = 0x04,
    Parallel = 0x05,
}

impl TryFrom<u8> for FileType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(FileType::Null),
            0x01 => Ok(FileType::ObjSeq),
            0x02 => Ok(FileType::PureSeq),
            0x03 => Ok(FileType::LibSeq),
            0x04 => Ok(FileType::Mixed),
            0x05 => Ok(FileType::Parallel),
            other => Err(Error::UnexpectedValue(format!(
                "unknown file type {other:#04x}"
            ))),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            FileType::Null => "NULL",
            FileType::ObjSeq => "OBJSEQ",
            FileType::PureSeq => "PURESEQ",
            FileType::LibSeq => "LIBSEQ",
            FileType::Mixed => "MIXED",
            FileType::Parallel => "PARALLEL",
        })
    }
}

/// An object file: an ordered list of sections.
///
/// Sections are stored in an arena and handed out as [SectionRef]s. A
/// section created with [Binary::create_detached] lives in the arena but is
/// not part of the file until it is [attached](Binary::attach).
///
/// ```
/// use tpef::element::ASpaceElement;
/// use tpef::reference::SafePointer;
/// use tpef::section::{Section, SectionType};
/// use tpef::Binary;
/// # fn main() -> tpef::Result<()> {
/// let mut binary = Binary::new();
/// let strings = binary.add_section(Section::create(SectionType::StrTab));
/// binary.set_strings(strings);
///
/// let aspaces = binary.add_section(Section::create(SectionType::AddrSp));
/// let name = binary.string_to_chunk(strings, "address spaces")?;
/// binary.section_mut(aspaces).set_name(SafePointer::to(name));
/// binary.section_mut(aspaces).add_element(ASpaceElement::new(8, 1, 32));
///
/// assert_eq!(2, binary.section_count());
/// assert_eq!("address spaces", binary.section_name(aspaces)?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Binary {
    arch: FileArchitecture,
    file_type: FileType,
    sections: Vec<Section>,
    order: Vec<SectionRef>,
    strings: SafePointer,
}

impl Binary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arch(&self) -> FileArchitecture {
        self.arch
    }

    pub fn set_arch(&mut self, arch: FileArchitecture) {
        self.arch = arch;
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn set_file_type(&mut self, file_type: FileType) {
        self.file_type = file_type;
    }

    /// Appends `section` to the file.
    pub fn add_section(&mut self, section: Section) -> SectionRef {
        let section = self.create_detached(section);
        self.order.push(section);
        section
    }

    /// Inserts `section` at `position` in file order.
    pub fn insert_section(&mut self, position: usize, section: Section) -> SectionRef {
        let section = self.create_detached(section);
        let position = position.min(self.order.len());
        self.order.insert(position, section);
        section
    }

    /// Stores `section` without making it part of the file.
    pub fn create_detached(&mut self, section: Section) -> SectionRef {
        self.sections.push(section);
        SectionRef::new(self.sections.len() as u32 - 1)
    }

    /// Appends a detached section to the file.
    pub fn attach(&mut self, section: SectionRef) {
        if !self.order.contains(&section) {
            self.order.push(section);
        }
    }

    /// # Panics
    ///
    /// If `section` was not handed out by this binary.
    pub fn section(&self, section: SectionRef) -> &Section {
        &self.sections[section.0 as usize]
    }

    /// # Panics
    ///
    /// If `section` was not handed out by this binary.
    pub fn section_mut(&mut self, section: SectionRef) -> &mut Section {
        &mut self.sections[section.0 as usize]
    }

    /// The sections of the file in file order.
    pub fn sections(&self) -> impl Iterator<Item = (SectionRef, &Section)> {
        self.order.iter().map(|r| (*r, &self.sections[r.0 as usize]))
    }

    /// Handles to the sections of the file in file order.
    pub fn section_refs(&self) -> Vec<SectionRef> {
        self.order.clone()
    }

    pub fn section_count(&self) -> usize {
        self.order.len()
    }

    /// Number of sections of the given kind.
    pub fn section_count_of(&self, kind: SectionType) -> usize {
        self.sections().filter(|(_, s)| s.kind() == kind).count()
    }

    /// The `nth` section of the given kind.
    pub fn find_section(&self, kind: SectionType, nth: usize) -> Option<SectionRef> {
        self.sections()
            .filter(|(_, s)| s.kind() == kind)
            .nth(nth)
            .map(|(r, _)| r)
    }

    /// Position of a section in file order.
    pub fn section_position(&self, section: SectionRef) -> Option<usize> {
        self.order.iter().position(|r| *r == section)
    }

    /// The string table holding section names.
    pub fn strings(&self) -> Option<SectionRef> {
        self.strings.section()
    }

    pub fn set_strings(&mut self, strings: SectionRef) {
        self.strings = SafePointer::to(strings);
    }

    pub(crate) fn set_strings_pointer(&mut self, strings: SafePointer) {
        self.strings = strings;
    }

    pub fn element(&self, element: ElementRef) -> Option<&SectionElement> {
        self.sections
            .get(element.section.0 as usize)
            .and_then(|s| s.element(element.index))
    }

    pub fn element_mut(&mut self, element: ElementRef) -> Option<&mut SectionElement> {
        self.sections
            .get_mut(element.section.0 as usize)
            .and_then(|s| s.element_mut(element.index))
    }

    /// The chunk at `offset` of a raw section.
    pub fn chunk(&mut self, section: SectionRef, offset: u32) -> Result<Chunk> {
        self.section_mut(section).materialize_chunk(offset)?;
        Ok(Chunk::new(section, offset))
    }

    /// A chunk holding `s` in a string table, appending it if needed.
    pub fn string_to_chunk(&mut self, section: SectionRef, s: &str) -> Result<Chunk> {
        let kind = self.section(section).kind();
        if kind != SectionType::StrTab {
            return Err(Error::UnexpectedValue(format!(
                "strings are stored in STRTAB sections, not {kind}"
            )));
        }
        let offset = self.section_mut(section).find_or_append_string(s)?;
        self.chunk(section, offset)
    }

    /// The NUL-terminated string a chunk points at.
    pub fn chunk_to_string(&self, chunk: Chunk) -> Result<String> {
        self.section(chunk.section()).string_at(chunk.offset())
    }

    /// The string a name pointer refers to. Null names are empty.
    pub fn name_of(&self, name: &SafePointer) -> Result<String> {
        match name {
            SafePointer::Null => Ok(String::new()),
            SafePointer::Resolved(ObjectRef::Chunk(chunk)) => self.chunk_to_string(*chunk),
            SafePointer::Pending(_) => Err(Error::UnresolvedReference(
                "name has not been resolved yet".into(),
            )),
            SafePointer::Resolved(other) => Err(Error::UnexpectedValue(format!(
                "name points at {other}, not a chunk"
            ))),
        }
    }

    pub fn section_name(&self, section: SectionRef) -> Result<String> {
        self.name_of(&self.section(section).name())
    }

    /// The address space element a pointer refers to.
    pub fn address_space(&self, aspace: &SafePointer) -> Option<&ASpaceElement> {
        aspace
            .element()
            .and_then(|e| self.element(e))
            .and_then(SectionElement::as_aspace)
    }

    /// Bytes per minimum addressable unit of a section's address space.
    pub fn bytes_per_mau(&self, section: SectionRef) -> u32 {
        self.address_space(&self.section(section).aspace())
            .map(ASpaceElement::bytes_per_mau)
            .unwrap_or(1)
    }

    /// Size of a program section in its address space: instructions for
    /// code, minimum addressable units for data.
    pub fn address_length(&self, section: SectionRef) -> u32 {
        let s = self.section(section);
        match s.kind() {
            SectionType::Code => s.instruction_count(),
            kind if kind.is_chunkable() => s.length() / self.bytes_per_mau(section),
            _ => 0,
        }
    }

    /// The instruction element a pointer refers to.
    pub fn instruction(&self, pointer: &SafePointer) -> Option<&InstructionElement> {
        pointer
            .element()
            .and_then(|e| self.element(e))
            .and_then(SectionElement::as_instruction)
    }

    /// Every pointer held by the binary and its sections.
    pub fn pointers(&self) -> Vec<&SafePointer> {
        let mut pointers = vec![&self.strings];
        for section in &self.sections {
            pointers.extend(section.pointers());
        }
        pointers
    }

    pub fn pointers_mut(&mut self) -> Vec<&mut SafePointer> {
        let mut pointers = vec![&mut self.strings];
        for section in &mut self.sections {
            pointers.extend(section.pointers_mut());
        }
        pointers
    }

    /// Inserts an element before `index`, moving every pointer to a later
    /// element of the same section along with it.
    pub fn insert_element(
        &mut self,
        section: SectionRef,
        index: u32,
        element: impl Into<SectionElement>,
    ) -> ElementRef {
        for pointer in self.pointers_mut() {
            if let Some(e) = pointer.element() {
                if e.section == section && e.index >= index {
                    pointer.replace(ElementRef::new(section, e.index + 1));
                }
            }
        }
        self.section_mut(section).insert_element(index, element);
        ElementRef::new(section, index)
    }

    /// Whether anything in the binary points at `object`.
    pub fn is_referenced(&self, object: impl Into<ObjectRef>) -> bool {
        let object = object.into();
        self.pointers().iter().any(|p| p.object() == Some(object))
    }

    /// Points everything that points at `old` to `new` instead, returning how
    /// many pointers changed.
    pub fn replace_all_references(
        &mut self,
        old: impl Into<ObjectRef>,
        new: impl Into<ObjectRef>,
    ) -> usize {
        let (old, new) = (old.into(), new.into());
        let mut replaced = 0;
        for pointer in self.pointers_mut() {
            if pointer.object() == Some(old) {
                pointer.replace(new);
                replaced += 1;
            }
        }
        replaced
    }

    fn describe(&self, pointer: &SafePointer) -> String {
        match pointer {
            SafePointer::Null => "-".into(),
            SafePointer::Pending(_) => "?".into(),
            SafePointer::Resolved(ObjectRef::Section(s)) => self
                .section_position(*s)
                .map(|p| p.to_string())
                .unwrap_or_else(|| "detached".into()),
            SafePointer::Resolved(ObjectRef::Element(e)) => format!(
                "{}[{}]",
                self.section_position(e.section())
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                e.index()
            ),
            SafePointer::Resolved(ObjectRef::Chunk(c)) => format!(
                "{}+{:#x}",
                self.section_position(c.section())
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                c.offset()
            ),
        }
    }

    fn fmt_element(
        &self,
        f: &mut fmt::Formatter,
        index: usize,
        element: &SectionElement,
    ) -> fmt::Result {
        write!(f, "[{index:4}] ")?;
        match element {
            SectionElement::Symbol(s) => write!(
                f,
                "{:<9} {:<6} {:08x} size {} section {} ref {} {}{}",
                s.kind().name(),
                s.binding(),
                s.value(),
                s.size(),
                self.describe(&s.section()),
                s.reference()
                    .map(|r| self.describe(&r))
                    .unwrap_or_else(|| "-".into()),
                if s.absolute() { "ABS " } else { "" },
                self.name_of(&s.name()).unwrap_or_default()
            ),
            SectionElement::Reloc(r) => write!(
                f,
                "{:<6} {}{} bits location {} destination {} symbol {} aspace {}",
                r.kind,
                r.size,
                if r.chunked { " chunked" } else { "" },
                self.describe(&r.location),
                self.describe(&r.destination),
                self.describe(&r.symbol),
                self.describe(&r.aspace)
            ),
            SectionElement::Instruction(instruction) => {
                write!(f, "{}", if instruction.begin() { "begin " } else { "      " })?;
                match instruction {
                    InstructionElement::Move(m) if m.empty => write!(f, "...")?,
                    InstructionElement::Move(m) => {
                        if let Some(guard) = m.guard {
                            let sign = if guard.inverted { "!" } else { "?" };
                            write!(f, "{sign}{} ", guard.field)?;
                        }
                        write!(f, "bus {} {} -> {}", m.bus, m.source, m.destination)?;
                    }
                    InstructionElement::Immediate(i) => write!(
                        f,
                        "#{:#x} -> imm {}.{}",
                        i.word(),
                        i.destination_unit,
                        i.destination_index
                    )?,
                }
                for annotation in instruction.annotations() {
                    write!(f, " @{:#x}[{}]", annotation.id, annotation.payload.len())?;
                }
                Ok(())
            }
            SectionElement::AddressSpace(a) => write!(
                f,
                "mau {} align {} word {} {}",
                a.mau,
                a.align,
                a.word_size,
                self.name_of(&a.name).unwrap_or_default()
            ),
            SectionElement::LineNumProcedure(p) => {
                write!(f, "procedure {}:", self.describe(&p.procedure))?;
                for line in &p.lines {
                    write!(f, " {}@{}", line.line, self.describe(&line.instruction))?;
                }
                Ok(())
            }
            SectionElement::Debug(d) => match d.as_stab() {
                Some(stab) => write!(
                    f,
                    "stab {:#04x} other {} desc {} value {:#x} {}",
                    stab.stab_type,
                    stab.other,
                    stab.description,
                    stab.value,
                    self.name_of(&d.debug_string).unwrap_or_default()
                ),
                None => write!(f, "debug {:#04x} {} bytes", d.debug_type, d.data.len()),
            },
            SectionElement::Resource(r) => write!(
                f,
                "resource {:#06x} {:?} info {:#x} {}",
                r.id,
                r.kind,
                r.info,
                self.name_of(&r.name).unwrap_or_default()
            ),
        }
    }
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_with_options(f, &display::Options::default())
    }
}

impl DisplayWithOptions for Binary {
    fn fmt_with_options(&self, f: &mut fmt::Formatter, options: &display::Options) -> fmt::Result {
        options.write_indent(f)?;
        writeln!(
            f,
            "Header : {} {} sections {} strings {}",
            self.arch,
            self.file_type,
            self.section_count(),
            self.describe(&self.strings)
        )?;
        writeln!(f)?;
        options.write_indent(f)?;
        writeln!(
            f,
            "  #  type    flags address  length   link aspace elements name"
        )?;
        for (position, (r, section)) in self.sections().enumerate() {
            options.write_indent(f)?;
            writeln!(
                f,
                "{position:3}  {:<7} {:02x}    {:08x} {:08x} {:<4} {:<6} {:<8} {}",
                section.kind(),
                section.flags(),
                section.start_address(),
                section.length(),
                self.describe(&section.link()),
                self.describe(&section.aspace()),
                section.element_count(),
                self.name_of(&section.name()).unwrap_or_default()
            )?;

            let inner = options.indent();
            if options.elements {
                for (index, element) in section.elements().iter().enumerate() {
                    inner.write_indent(f)?;
                    self.fmt_element(f, index, element)?;
                    writeln!(f)?;
                }
            }
            if let display::DataFormat::Hex = options.data_format {
                for (i, chunk) in self.section(r).data().chunks(16).enumerate() {
                    inner.write_indent(f)?;
                    write!(f, "{:04x}:", i * 16)?;
                    for byte in chunk {
                        write!(f, " {byte:02x}")?;
                    }
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::display::{DataFormat, Displayable, Options};
    use crate::element::{SymbolElement, SymbolKind};

    #[test]
    fn test_detached_sections() {
        let mut binary = Binary::new();
        let kept = binary.add_section(Section::create(SectionType::Null));
        let detached = binary.create_detached(Section::create(SectionType::Debug));
        assert_eq!(1, binary.section_count());
        assert_eq!(None, binary.section_position(detached));

        binary.attach(detached);
        binary.attach(detached);
        assert_eq!(vec![kept, detached], binary.section_refs());
        assert_eq!(Some(detached), binary.find_section(SectionType::Debug, 0));
        assert_eq!(None, binary.find_section(SectionType::Debug, 1));
    }

    #[test]
    fn test_names_and_chunks() {
        let mut binary = Binary::new();
        let strings = binary.add_section(Section::create(SectionType::StrTab));
        let data = binary.add_section(Section::create(SectionType::Data));

        let chunk = binary.string_to_chunk(strings, "Code").expect("chunk");
        assert_eq!("Code", binary.chunk_to_string(chunk).expect("string"));
        assert_eq!(chunk, binary.string_to_chunk(strings, "Code").expect("same"));
        assert!(binary.string_to_chunk(data, "nope").is_err());

        assert_eq!("", binary.name_of(&SafePointer::Null).expect("null"));
        assert!(binary.name_of(&SafePointer::to(data)).is_err());
    }

    #[test]
    fn test_address_arithmetic() {
        let mut binary = Binary::new();
        let aspaces = binary.add_section(Section::create(SectionType::AddrSp));
        binary.section_mut(aspaces).add_element(ASpaceElement::undefined());
        let wide = binary
            .section_mut(aspaces)
            .add_element(ASpaceElement::new(16, 2, 4));

        let mut data = Section::create(SectionType::Data);
        data.set_data(vec![0; 10]);
        data.set_aspace(SafePointer::to(ElementRef::new(aspaces, wide)));
        let data = binary.add_section(data);

        assert_eq!(2, binary.bytes_per_mau(data));
        assert_eq!(5, binary.address_length(data));
        assert_eq!(0, binary.address_length(aspaces));
    }

    #[test]
    fn test_insert_element_moves_pointers() {
        let mut binary = Binary::new();
        let aspaces = binary.add_section(Section::create(SectionType::AddrSp));
        binary
            .section_mut(aspaces)
            .add_element(ASpaceElement::new(8, 1, 4));
        let mut code = Section::create(SectionType::Code);
        code.set_aspace(SafePointer::to(ElementRef::new(aspaces, 0)));
        let code = binary.insert_section(0, code);

        binary.insert_element(aspaces, 0, ASpaceElement::undefined());
        assert_eq!(
            Some(ElementRef::new(aspaces, 1)),
            binary.section(code).aspace().element()
        );
        assert_eq!(Some(0), binary.section_position(code));
        assert!(binary
            .address_space(&binary.section(code).aspace())
            .is_some_and(|a| a.mau == 8));
    }

    #[test]
    fn test_replace_all_references() {
        let mut binary = Binary::new();
        let first = binary.add_section(Section::create(SectionType::Data));
        let second = binary.add_section(Section::create(SectionType::Data));
        let symbols = binary.add_section(Section::create(SectionType::SymTab));
        for _ in 0..3 {
            let mut symbol = SymbolElement::new(SymbolKind::Section);
            symbol.set_section(SafePointer::to(first));
            binary.section_mut(symbols).add_element(symbol);
        }

        assert!(binary.is_referenced(first));
        assert_eq!(3, binary.replace_all_references(first, second));
        assert!(!binary.is_referenced(first));
        assert!(binary.is_referenced(second));
    }

    #[test]
    fn test_display() {
        let mut binary = Binary::new();
        binary.set_arch(FileArchitecture::TtaTut);
        let strings = binary.add_section(Section::create(SectionType::StrTab));
        binary.set_strings(strings);
        let name = binary.string_to_chunk(strings, "Strings").expect("name");
        binary.section_mut(strings).set_name(SafePointer::to(name));

        let text = format!("{binary}");
        assert!(text.starts_with("Header : TTA_TUT NULL sections 1"));
        assert!(text.contains("STRTAB"));
        assert!(text.contains("Strings"));

        let options = Options {
            data_format: DataFormat::Hex,
            elements: true,
            indent_level: 0,
        };
        let text = format!("{}", Displayable::wrap(&binary, options));
        assert!(text.contains("0000: 00 53 74 72"));
    }
}
