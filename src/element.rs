// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! The records held by sections.
//!
//! Every kind of record is a variant of [SectionElement]. Cross references
//! between records are [SafePointer]s.

use std::fmt;

use crate::error::{Error, Result};
use crate::reference::SafePointer;

/// Symbol binding, the high nibble of a symbol's info byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SymbolBinding {
    #[default]
    Local = 0,
    Global = 1,
    Weak = 2,
}

impl TryFrom<u8> for SymbolBinding {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SymbolBinding::Local),
            1 => Ok(SymbolBinding::Global),
            2 => Ok(SymbolBinding::Weak),
            other => Err(Error::UnexpectedValue(format!(
                "unknown symbol binding {other}"
            ))),
        }
    }
}

impl fmt::Display for SymbolBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SymbolBinding::Local => "LOCAL",
            SymbolBinding::Global => "GLOBAL",
            SymbolBinding::Weak => "WEAK",
        })
    }
}

/// Symbol type codes, the low nibble of a symbol's info byte.
pub const STT_NOTYPE: u8 = 0;
pub const STT_DATA: u8 = 1;
pub const STT_CODE: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;
pub const STT_PROCEDURE: u8 = 5;

/// What a symbol names. Code, procedure and data symbols refer to the
/// instruction or chunk they are defined at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    NoType,
    Data { reference: SafePointer },
    Code { reference: SafePointer },
    Procedure { reference: SafePointer },
    Section,
    File,
}

impl SymbolKind {
    pub fn type_code(&self) -> u8 {
        match self {
            SymbolKind::NoType => STT_NOTYPE,
            SymbolKind::Data { .. } => STT_DATA,
            SymbolKind::Code { .. } => STT_CODE,
            SymbolKind::Section => STT_SECTION,
            SymbolKind::File => STT_FILE,
            SymbolKind::Procedure { .. } => STT_PROCEDURE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SymbolKind::NoType => "NOTYPE",
            SymbolKind::Data { .. } => "DATA",
            SymbolKind::Code { .. } => "CODE",
            SymbolKind::Section => "SECTION",
            SymbolKind::File => "FILE",
            SymbolKind::Procedure { .. } => "PROCEDURE",
        }
    }
}

/// An entry of a symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolElement {
    kind: SymbolKind,
    name: SafePointer,
    binding: SymbolBinding,
    absolute: bool,
    section: SafePointer,
    value: u32,
    size: u32,
}

impl SymbolElement {
    pub fn new(kind: SymbolKind) -> Self {
        Self {
            kind,
            name: SafePointer::Null,
            binding: SymbolBinding::Local,
            absolute: false,
            section: SafePointer::Null,
            value: 0,
            size: 0,
        }
    }

    /// The symbol found at index 0 of every symbol table.
    pub fn undefined() -> Self {
        Self {
            absolute: true,
            ..Self::new(SymbolKind::NoType)
        }
    }

    /// Whether this is the local, absolute, untyped placeholder at index 0.
    pub fn is_undefined(&self) -> bool {
        self.kind == SymbolKind::NoType
            && self.binding == SymbolBinding::Local
            && self.absolute
            && self.value == 0
            && self.size == 0
    }

    pub fn kind(&self) -> &SymbolKind {
        &self.kind
    }

    pub fn set_kind(&mut self, kind: SymbolKind) {
        self.kind = kind;
    }

    pub fn name(&self) -> SafePointer {
        self.name
    }

    pub fn set_name(&mut self, name: SafePointer) {
        self.name = name;
    }

    pub fn binding(&self) -> SymbolBinding {
        self.binding
    }

    pub fn set_binding(&mut self, binding: SymbolBinding) {
        self.binding = binding;
    }

    pub fn absolute(&self) -> bool {
        self.absolute
    }

    pub fn set_absolute(&mut self, absolute: bool) {
        self.absolute = absolute;
    }

    /// The section the symbol is defined in.
    pub fn section(&self) -> SafePointer {
        self.section
    }

    pub fn set_section(&mut self, section: SafePointer) {
        self.section = section;
    }

    /// The value as stored in the file.
    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn set_value(&mut self, value: u32) {
        self.value = value;
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    /// The instruction or chunk a code, procedure or data symbol refers to.
    pub fn reference(&self) -> Option<SafePointer> {
        match self.kind {
            SymbolKind::Data { reference }
            | SymbolKind::Code { reference }
            | SymbolKind::Procedure { reference } => Some(reference),
            _ => None,
        }
    }

    fn reference_slot(&mut self) -> Option<&mut SafePointer> {
        match &mut self.kind {
            SymbolKind::Data { reference }
            | SymbolKind::Code { reference }
            | SymbolKind::Procedure { reference } => Some(reference),
            _ => None,
        }
    }

    /// Sets the reference of a code, procedure or data symbol.
    pub fn set_reference(&mut self, target: SafePointer) -> Result<()> {
        let kind = self.kind.name();
        let slot = self.reference_slot().ok_or_else(|| {
            Error::UnexpectedValue(format!("{kind} symbols have no reference"))
        })?;
        *slot = target;
        Ok(())
    }
}

/// Relocation type codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RelocType {
    #[default]
    NoRel = 0x00,
    SelfRel = 0x01,
    Page = 0x02,
    PcRel = 0x03,
}

impl TryFrom<u8> for RelocType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(RelocType::NoRel),
            0x01 => Ok(RelocType::SelfRel),
            0x02 => Ok(RelocType::Page),
            0x03 => Ok(RelocType::PcRel),
            other => Err(Error::UnexpectedValue(format!(
                "unknown relocation type {other:#x}"
            ))),
        }
    }
}

impl fmt::Display for RelocType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RelocType::NoRel => "NOREL",
            RelocType::SelfRel => "SELF",
            RelocType::Page => "PAGE",
            RelocType::PcRel => "PCREL",
        })
    }
}

/// A value in code or data that must be patched when the program moves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelocElement {
    /// The immediate or data chunk being patched.
    pub location: SafePointer,
    /// The instruction or chunk the patched value refers to.
    pub destination: SafePointer,
    pub symbol: SafePointer,
    pub aspace: SafePointer,
    pub kind: RelocType,
    /// Size of the patched value in bits.
    pub size: u8,
    pub bit_offset: u8,
    /// The value is split over several immediates.
    pub chunked: bool,
}

/// What a move field addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FieldType {
    #[default]
    Null = 0,
    Rf = 1,
    Imm = 2,
    Unit = 3,
}

impl TryFrom<u8> for FieldType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FieldType::Null),
            1 => Ok(FieldType::Rf),
            2 => Ok(FieldType::Imm),
            3 => Ok(FieldType::Unit),
            other => Err(Error::UnexpectedValue(format!(
                "unknown move field type {other}"
            ))),
        }
    }
}

/// A source, destination or guard of a move.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveField {
    pub kind: FieldType,
    pub unit: u8,
    pub index: u16,
}

impl MoveField {
    pub fn new(kind: FieldType, unit: u8, index: u16) -> Self {
        Self { kind, unit, index }
    }
}

impl fmt::Display for MoveField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            FieldType::Null => f.write_str("-"),
            FieldType::Rf => write!(f, "r{}.{}", self.unit, self.index),
            FieldType::Imm => write!(f, "i{}.{}", self.unit, self.index),
            FieldType::Unit => write!(f, "u{}.{}", self.unit, self.index),
        }
    }
}

/// The guard of a conditional move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Guard {
    pub field: MoveField,
    pub inverted: bool,
}

/// Tool specific data attached to a code element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstructionAnnotation {
    pub id: u32,
    pub payload: Vec<u8>,
}

impl InstructionAnnotation {
    pub fn new(id: u32, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }
}

/// A data transport over a bus.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MoveElement {
    pub begin: bool,
    pub empty: bool,
    pub bus: u16,
    pub source: MoveField,
    pub destination: MoveField,
    pub guard: Option<Guard>,
    pub annotations: Vec<InstructionAnnotation>,
}

impl MoveElement {
    pub fn new(begin: bool, bus: u16, source: MoveField, destination: MoveField) -> Self {
        Self {
            begin,
            empty: false,
            bus,
            source,
            destination,
            guard: None,
            annotations: Vec::new(),
        }
    }

    /// A move slot that transports nothing.
    pub fn empty(begin: bool) -> Self {
        Self {
            begin,
            empty: true,
            ..Self::default()
        }
    }
}

/// A long immediate written into an immediate unit register.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImmediateElement {
    pub begin: bool,
    pub destination_unit: u8,
    pub destination_index: u8,
    value: Vec<u8>,
    pub annotations: Vec<InstructionAnnotation>,
}

impl ImmediateElement {
    pub fn new(begin: bool, destination_unit: u8, destination_index: u8, word: u32) -> Self {
        Self {
            begin,
            destination_unit,
            destination_index,
            value: word.to_be_bytes().to_vec(),
            annotations: Vec::new(),
        }
    }

    /// An immediate of exactly the given big-endian bytes.
    pub fn from_bytes(
        begin: bool,
        destination_unit: u8,
        destination_index: u8,
        value: Vec<u8>,
    ) -> Self {
        Self {
            begin,
            destination_unit,
            destination_index,
            value,
            annotations: Vec::new(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.value
    }

    pub fn set_bytes(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    /// The low 32 bits of the value.
    pub fn word(&self) -> u32 {
        self.value
            .iter()
            .fold(0u32, |acc, b| acc.wrapping_shl(8) | u32::from(*b))
    }

    pub fn set_word(&mut self, word: u32) {
        self.value = word.to_be_bytes().to_vec();
    }
}

/// One element of a code section. An instruction is a run of elements
/// starting at one whose `begin` flag is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstructionElement {
    Move(MoveElement),
    Immediate(ImmediateElement),
}

impl InstructionElement {
    pub fn begin(&self) -> bool {
        match self {
            InstructionElement::Move(m) => m.begin,
            InstructionElement::Immediate(i) => i.begin,
        }
    }

    pub fn set_begin(&mut self, begin: bool) {
        match self {
            InstructionElement::Move(m) => m.begin = begin,
            InstructionElement::Immediate(i) => i.begin = begin,
        }
    }

    pub fn annotations(&self) -> &[InstructionAnnotation] {
        match self {
            InstructionElement::Move(m) => &m.annotations,
            InstructionElement::Immediate(i) => &i.annotations,
        }
    }

    pub fn add_annotation(&mut self, annotation: InstructionAnnotation) {
        match self {
            InstructionElement::Move(m) => m.annotations.push(annotation),
            InstructionElement::Immediate(i) => i.annotations.push(annotation),
        }
    }

    pub fn as_immediate(&self) -> Option<&ImmediateElement> {
        match self {
            InstructionElement::Immediate(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_move(&self) -> Option<&MoveElement> {
        match self {
            InstructionElement::Move(m) => Some(m),
            _ => None,
        }
    }
}

/// An address space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ASpaceElement {
    /// Minimum addressable unit in bits.
    pub mau: u8,
    pub align: u8,
    pub word_size: u8,
    pub name: SafePointer,
}

impl ASpaceElement {
    pub fn new(mau: u8, align: u8, word_size: u8) -> Self {
        Self {
            mau,
            align,
            word_size,
            name: SafePointer::Null,
        }
    }

    /// The address space found at index 0 of every address space table.
    pub fn undefined() -> Self {
        Self::default()
    }

    pub fn is_undefined(&self) -> bool {
        self.mau == 0 && self.align == 0 && self.word_size == 0
    }

    /// Bytes needed to store one minimum addressable unit.
    pub fn bytes_per_mau(&self) -> u32 {
        (u32::from(self.mau)).div_ceil(8).max(1)
    }
}

/// A source line and the instruction it was compiled to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineNumElement {
    pub instruction: SafePointer,
    pub line: u16,
}

/// The line numbers of one procedure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineNumProcedure {
    /// The procedure symbol.
    pub procedure: SafePointer,
    pub lines: Vec<LineNumElement>,
}

/// Debug type code of a stab.
pub const DE_STAB: u8 = 0x01;

/// A stab as stored in a [DebugElement].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stab {
    pub stab_type: u8,
    pub other: u8,
    pub description: u16,
    pub value: u32,
}

/// Opaque debug information.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugElement {
    pub debug_type: u8,
    /// String attached to the entry.
    pub debug_string: SafePointer,
    pub data: Vec<u8>,
}

impl DebugElement {
    pub fn stab(stab: Stab, debug_string: SafePointer) -> Self {
        let mut data = vec![stab.stab_type, stab.other];
        data.extend_from_slice(&stab.description.to_be_bytes());
        data.extend_from_slice(&stab.value.to_be_bytes());
        Self {
            debug_type: DE_STAB,
            debug_string,
            data,
        }
    }

    /// The stab this entry holds, if it is one.
    pub fn as_stab(&self) -> Option<Stab> {
        if self.debug_type != DE_STAB || self.data.len() != 8 {
            return None;
        }
        let d = &self.data;
        Some(Stab {
            stab_type: d[0],
            other: d[1],
            description: u16::from_be_bytes([d[2], d[3]]),
            value: u32::from_be_bytes([d[4], d[5], d[6], d[7]]),
        })
    }
}

/// Machine resource type codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResourceType {
    #[default]
    Null = 0x00,
    Bus = 0x01,
    Unit = 0x02,
    Rf = 0x03,
    Op = 0x04,
    Imm = 0x05,
    Sr = 0x06,
    Port = 0x07,
}

impl TryFrom<u8> for ResourceType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => ResourceType::Null,
            0x01 => ResourceType::Bus,
            0x02 => ResourceType::Unit,
            0x03 => ResourceType::Rf,
            0x04 => ResourceType::Op,
            0x05 => ResourceType::Imm,
            0x06 => ResourceType::Sr,
            0x07 => ResourceType::Port,
            other => {
                return Err(Error::UnexpectedValue(format!(
                    "unknown machine resource type {other:#x}"
                )))
            }
        })
    }
}

/// A machine resource referred to by moves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceElement {
    pub id: u16,
    pub kind: ResourceType,
    pub name: SafePointer,
    pub info: u32,
}

impl ResourceElement {
    pub const UNIVERSAL_BUS: u16 = 0x00;
    pub const UNIVERSAL_FU: u16 = 0x00;
    pub const INT_RF: u16 = 0x80;
    pub const BOOL_RF: u16 = 0x81;
    pub const FP_RF: u16 = 0x82;

    pub fn new(id: u16, kind: ResourceType, info: u32) -> Self {
        Self {
            id,
            kind,
            name: SafePointer::Null,
            info,
        }
    }
}

/// Any record held by a section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SectionElement {
    Symbol(SymbolElement),
    Reloc(RelocElement),
    Instruction(InstructionElement),
    AddressSpace(ASpaceElement),
    LineNumProcedure(LineNumProcedure),
    Debug(DebugElement),
    Resource(ResourceElement),
}

macro_rules! element_variant {
    ($variant:ident, $ty:ty, $as:ident, $as_mut:ident) => {
        impl From<$ty> for SectionElement {
            fn from(element: $ty) -> Self {
                SectionElement::$variant(element)
            }
        }

        impl SectionElement {
            pub fn $as(&self) -> Option<&$ty> {
                match self {
                    SectionElement::$variant(e) => Some(e),
                    _ => None,
                }
            }

            pub fn $as_mut(&mut self) -> Option<&mut $ty> {
                match self {
                    SectionElement::$variant(e) => Some(e),
                    _ => None,
                }
            }
        }
    };
}

element_variant!(Symbol, SymbolElement, as_symbol, as_symbol_mut);
element_variant!(Reloc, RelocElement, as_reloc, as_reloc_mut);
element_variant!(Instruction, InstructionElement, as_instruction, as_instruction_mut);
element_variant!(AddressSpace, ASpaceElement, as_aspace, as_aspace_mut);
element_variant!(
    LineNumProcedure,
    LineNumProcedure,
    as_line_procedure,
    as_line_procedure_mut
);
element_variant!(Debug, DebugElement, as_debug, as_debug_mut);
element_variant!(Resource, ResourceElement, as_resource, as_resource_mut);

impl From<MoveElement> for SectionElement {
    fn from(element: MoveElement) -> Self {
        SectionElement::Instruction(InstructionElement::Move(element))
    }
}

impl From<ImmediateElement> for SectionElement {
    fn from(element: ImmediateElement) -> Self {
        SectionElement::Instruction(InstructionElement::Immediate(element))
    }
}

impl SectionElement {
    /// Every pointer held by this element.
    pub fn pointers(&self) -> Vec<&SafePointer> {
        match self {
            SectionElement::Symbol(s) => {
                let mut pointers = vec![&s.name, &s.section];
                match &s.kind {
                    SymbolKind::Data { reference }
                    | SymbolKind::Code { reference }
                    | SymbolKind::Procedure { reference } => pointers.push(reference),
                    _ => {}
                }
                pointers
            }
            SectionElement::Reloc(r) => vec![&r.location, &r.destination, &r.symbol, &r.aspace],
            SectionElement::Instruction(_) => Vec::new(),
            SectionElement::Resource(r) => vec![&r.name],
            SectionElement::AddressSpace(a) => vec![&a.name],
            SectionElement::LineNumProcedure(p) => std::iter::once(&p.procedure)
                .chain(p.lines.iter().map(|l| &l.instruction))
                .collect(),
            SectionElement::Debug(d) => vec![&d.debug_string],
        }
    }

    pub fn pointers_mut(&mut self) -> Vec<&mut SafePointer> {
        match self {
            SectionElement::Symbol(s) => {
                let mut pointers = vec![&mut s.name, &mut s.section];
                match &mut s.kind {
                    SymbolKind::Data { reference }
                    | SymbolKind::Code { reference }
                    | SymbolKind::Procedure { reference } => pointers.push(reference),
                    _ => {}
                }
                pointers
            }
            SectionElement::Reloc(r) => vec![
                &mut r.location,
                &mut r.destination,
                &mut r.symbol,
                &mut r.aspace,
            ],
            SectionElement::Instruction(_) => Vec::new(),
            SectionElement::Resource(r) => vec![&mut r.name],
            SectionElement::AddressSpace(a) => vec![&mut a.name],
            SectionElement::LineNumProcedure(p) => std::iter::once(&mut p.procedure)
                .chain(p.lines.iter_mut().map(|l| &mut l.instruction))
                .collect(),
            SectionElement::Debug(d) => vec![&mut d.debug_string],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::binary::SectionRef;

    #[test]
    fn test_undefined_placeholders() {
        let symbol = SymbolElement::undefined();
        assert!(symbol.is_undefined());
        assert!(symbol.absolute());
        assert_eq!(STT_NOTYPE, symbol.kind().type_code());
        assert!(symbol.name().is_null());

        let mut global = SymbolElement::undefined();
        global.set_binding(SymbolBinding::Global);
        assert!(!global.is_undefined());

        assert!(ASpaceElement::undefined().is_undefined());
        assert!(!ASpaceElement::new(8, 1, 32).is_undefined());
    }

    #[test]
    fn test_symbol_references() {
        let mut data = SymbolElement::new(SymbolKind::Data {
            reference: SafePointer::Null,
        });
        data.set_reference(SafePointer::to(SectionRef::new(3)))
            .expect("data symbols have references");
        assert_eq!(Some(SectionRef::new(3)), data.reference().and_then(|r| r.section()));

        let mut file = SymbolElement::new(SymbolKind::File);
        assert!(file.set_reference(SafePointer::Null).is_err());
        assert_eq!(None, file.reference());
        assert_eq!(3, SectionElement::from(data).pointers().len());
    }

    #[test]
    fn test_immediate_words() {
        let mut imm = ImmediateElement::from_bytes(true, 0, 0, vec![0x12, 0x34]);
        assert_eq!(0x1234, imm.word());
        imm.set_word(0xffff_fffe);
        assert_eq!(&[0xff, 0xff, 0xff, 0xfe], imm.bytes());
        assert_eq!(0xffff_fffe, imm.word());
    }

    #[test]
    fn test_stab_payload() {
        let stab = Stab {
            stab_type: 0x64,
            other: 0,
            description: 2,
            value: 0x100,
        };
        let element = DebugElement::stab(stab, SafePointer::Null);
        assert_eq!(8, element.data.len());
        assert_eq!(Some(stab), element.as_stab());

        let other = DebugElement {
            debug_type: 9,
            ..element
        };
        assert_eq!(None, other.as_stab());
    }

    #[test]
    fn test_bytes_per_mau() {
        assert_eq!(1, ASpaceElement::new(8, 4, 4).bytes_per_mau());
        assert_eq!(2, ASpaceElement::new(16, 1, 2).bytes_per_mau());
        assert_eq!(1, ASpaceElement::new(1, 1, 1).bytes_per_mau());
        assert_eq!(1, ASpaceElement::undefined().bytes_per_mau());
    }
}
