// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use std::sync::LazyLock;

use binrw::BinRead;

use super::*;
use crate::element::{
    DebugElement, FieldType, Guard, ImmediateElement, InstructionAnnotation, InstructionElement,
    MoveElement, MoveField, RelocElement, RelocType, ResourceElement, ResourceType, SectionElement,
    Stab, SymbolBinding, SymbolElement, SymbolKind,
};
use crate::reader::SectionReader;
use crate::reference::{ObjectRef, SectionIndexKey, SectionOffsetKey};
use crate::relocation;

const GCC_MODULE_START_SYMBOL1: &str = "gcc2_compiled.";
const GCC_MODULE_START_SYMBOL2: &str = "___gnu_compiled_c";

/// Annotation stabs start with a hexadecimal id of this many characters
/// and a `:`, e.g. `0x00011000:`.
const ANNOTATION_ID_LENGTH: usize = 10;

/// Size given to data symbols, which a.out does not record.
const DATA_SYMBOL_SIZE: u32 = 4;

/// Relocation info of the first instruction of a program as written by the
/// old toolchain: section 4 (text) with type 2. The type carries
/// [RELOC_EXTERN] but the relocation refers to the text section, not to
/// symbol 4.
const FIRST_INSTRUCTION_RELOC_INFO: u32 = 4 << 8 | 2;

static STRINGS: StringSectionReader = StringSectionReader;
static TEXT: TextSectionReader = TextSectionReader;
static DATA: DataSectionReader = DataSectionReader;
static SYMBOLS: SymbolSectionReader = SymbolSectionReader;
static RELOCATIONS: RelocSectionReader = RelocSectionReader;

pub(super) static REGISTRY: LazyLock<SectionReaderRegistry<AOutScratch>> = LazyLock::new(|| {
    SectionReaderRegistry::new(&[&STRINGS, &TEXT, &DATA, &SYMBOLS, &RELOCATIONS])
});

struct StringSectionReader;

impl SectionReader<AOutScratch> for StringSectionReader {
    fn section_type(&self) -> SectionType {
        SectionType::StrTab
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<AOutScratch>,
    ) -> Result<()> {
        let bytes = stream.read_bytes(u64::from(cx.scratch.section_size))?;
        // an empty table keeps the empty string at offset 0
        if !bytes.is_empty() {
            cx.binary.section_mut(section).set_data(bytes);
        }
        Ok(())
    }
}

struct DataSectionReader;

impl SectionReader<AOutScratch> for DataSectionReader {
    fn section_type(&self) -> SectionType {
        SectionType::Data
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<AOutScratch>,
    ) -> Result<()> {
        let bytes = stream.read_bytes(u64::from(cx.scratch.section_size))?;
        cx.binary.section_mut(section).set_data(bytes);
        Ok(())
    }
}

/// Text is a list of 8-byte moves. The first word holds flags and the
/// destination register, the second the source register or an immediate.
struct TextSectionReader;

const MOVE_IMMEDIATE: u32 = 0x8000_0000;
const MOVE_GUARDED: u32 = 0x4000_0000;
const MOVE_INVERTED: u32 = 0x2000_0000;
const MOVE_REGISTER: u32 = 0x1fff_ffff;

impl TextSectionReader {
    /// The move field of an a.out register number.
    fn register(register: u32) -> Result<MoveField> {
        let rf = |unit: u16, index: u32| {
            MoveField::new(FieldType::Rf, unit as u8, index as u16)
        };
        Ok(match register {
            r if r < FIRST_FP_REGISTER => rf(ResourceElement::INT_RF, r),
            r if r < BOOL_REGISTER => rf(ResourceElement::FP_RF, r - FIRST_FP_REGISTER),
            BOOL_REGISTER => rf(ResourceElement::BOOL_RF, 0),
            r => MoveField::new(
                FieldType::Unit,
                ResourceElement::UNIVERSAL_FU as u8,
                u16::try_from(r).map_err(|_| {
                    Error::UnexpectedValue(format!("register {r} is out of range"))
                })?,
            ),
        })
    }
}

impl SectionReader<AOutScratch> for TextSectionReader {
    fn section_type(&self) -> SectionType {
        SectionType::Code
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<AOutScratch>,
    ) -> Result<()> {
        let size = cx.scratch.section_size;
        if size % INSTRUCTION_SIZE != 0 {
            return Err(Error::UnexpectedValue(format!(
                "text size {size} is not a multiple of {INSTRUCTION_SIZE}"
            )));
        }

        for instruction in 0..size / INSTRUCTION_SIZE {
            let offset = instruction * INSTRUCTION_SIZE;
            let flags = stream.read_word()?;
            let source = stream.read_word()?;
            let destination = Self::register(flags & MOVE_REGISTER)?;

            let immediate = (flags & MOVE_IMMEDIATE != 0)
                .then(|| ImmediateElement::new(true, 0, 0, source));
            let mut mv = match immediate {
                Some(_) => MoveElement::new(
                    false,
                    ResourceElement::UNIVERSAL_BUS,
                    MoveField::new(FieldType::Imm, 0, 0),
                    destination,
                ),
                None => MoveElement::new(
                    true,
                    ResourceElement::UNIVERSAL_BUS,
                    Self::register(source)?,
                    destination,
                ),
            };
            if flags & MOVE_GUARDED != 0 {
                mv.guard = Some(Guard {
                    field: MoveField::new(FieldType::Rf, ResourceElement::BOOL_RF as u8, 0),
                    inverted: flags & MOVE_INVERTED != 0,
                });
            }

            let s = cx.binary.section_mut(section);
            let first = match immediate {
                Some(imm) => {
                    let first = s.add_element(imm);
                    s.add_element(mv);
                    // relocations may name the word holding the immediate
                    cx.references.add_object_reference(
                        SectionOffsetKey::new(ST_TEXT, offset + 4),
                        ElementRef::new(section, first),
                    )?;
                    first
                }
                None => s.add_element(mv),
            };
            let first = ElementRef::new(section, first);
            cx.references
                .add_object_reference(SectionOffsetKey::new(ST_TEXT, offset), first)?;
            cx.references
                .add_object_reference(SectionIndexKey::new(ST_TEXT, instruction), first)?;
        }
        tracing::trace!(instructions = size / INSTRUCTION_SIZE, "read text");
        Ok(())
    }
}

struct SymbolSectionReader;

impl SymbolSectionReader {
    /// The symbol for one a.out symbol record, or `None` for records that
    /// are stored elsewhere or dropped.
    fn initialize_symbol(
        &self,
        record: &SymbolRecord,
        cx: &mut ReadContext<AOutScratch>,
    ) -> Result<Option<SymbolElement>> {
        let sections = cx.scratch.sections()?;
        let kind = record.kind & !N_EXT;
        let name = cx.binary.section(sections.strings).string_at(record.strx)?;

        let symbol = match kind {
            N_UNDF => {
                let mut symbol = SymbolElement::new(SymbolKind::NoType);
                symbol.set_section(SafePointer::to(sections.null));
                symbol
            }
            N_TEXT if cx.scratch.header.text != 0 => {
                if name == GCC_MODULE_START_SYMBOL1 {
                    cx.scratch.modules.push(CompilationModule {
                        start: record.value / INSTRUCTION_SIZE,
                        ..CompilationModule::default()
                    });
                }
                let offset = cx.scratch.header.section_offset_of_address(record.value);
                let reference = cx
                    .references
                    .create(SectionOffsetKey::new(ST_TEXT, offset));
                let mut symbol = SymbolElement::new(SymbolKind::Code { reference });
                symbol.set_section(cx.references.create(SectionKey::new(ST_TEXT)));
                symbol
            }
            N_TEXT => {
                let mut symbol = SymbolElement::new(SymbolKind::NoType);
                symbol.set_section(SafePointer::to(sections.null));
                symbol
            }
            N_DATA | N_BSS => {
                let offset = cx.scratch.header.section_offset_of_address(record.value);
                let reference = cx
                    .references
                    .create(SectionOffsetKey::new(kind.into(), offset));
                let mut symbol = SymbolElement::new(SymbolKind::Data { reference });
                symbol.set_size(DATA_SYMBOL_SIZE);
                symbol.set_section(cx.references.create(SectionKey::new(kind.into())));
                symbol
            }
            N_FN => {
                let mut symbol = SymbolElement::new(SymbolKind::File);
                symbol.set_section(SafePointer::to(sections.null));
                symbol
            }
            N_PRTAB => {
                match cx.scratch.resolved_resources.get(&name).copied() {
                    None => {
                        cx.scratch.resolved_resources.insert(name, record.value);
                    }
                    Some(resolved) if resolved != record.value => {
                        match cx.scratch.modules.last_mut() {
                            Some(module) => {
                                module.resources.insert(record.value, resolved);
                            }
                            None => tracing::warn!(
                                %name,
                                value = record.value,
                                "register renumbering outside of any compilation module"
                            ),
                        }
                    }
                    Some(_) => {}
                }
                return Ok(None);
            }
            N_ANN => {
                let offset = cx.scratch.header.section_offset_of_address(record.value);
                cx.scratch.annotations.push((offset, name));
                return Ok(None);
            }
            _ => {
                let stab = Stab {
                    stab_type: record.kind,
                    other: record.other,
                    description: record.desc,
                    value: record.value,
                };
                let string = cx
                    .references
                    .create(SectionOffsetKey::new(ST_STRING, record.strx));
                cx.binary
                    .section_mut(sections.debug)
                    .add_element(DebugElement::stab(stab, string));
                return Ok(None);
            }
        };
        Ok(Some(symbol))
    }

    fn add_resources(&self, cx: &mut ReadContext<AOutScratch>) -> Result<()> {
        let sections = cx.scratch.sections()?;
        let empty_name = cx.references.create(SectionOffsetKey::new(ST_STRING, 0));

        for (name, value) in std::mem::take(&mut cx.scratch.resolved_resources) {
            let kind = match value.cmp(&FIRST_FU_REGISTER) {
                std::cmp::Ordering::Greater => ResourceType::Op,
                std::cmp::Ordering::Equal => ResourceType::Sr,
                std::cmp::Ordering::Less => continue,
            };
            let id = u16::try_from(value).map_err(|_| {
                Error::UnexpectedValue(format!("register {value} of {name} is out of range"))
            })?;
            let chunk = cx.binary.string_to_chunk(sections.strings, &name)?;
            let mut resource = ResourceElement::new(id, kind, 0);
            resource.name = SafePointer::to(chunk);
            cx.binary
                .section_mut(sections.resources)
                .add_element(resource);
        }

        for (id, kind) in [
            (ResourceElement::INT_RF, ResourceType::Rf),
            (ResourceElement::FP_RF, ResourceType::Rf),
            (ResourceElement::BOOL_RF, ResourceType::Rf),
            (ResourceElement::UNIVERSAL_FU, ResourceType::Unit),
            (ResourceElement::UNIVERSAL_BUS, ResourceType::Bus),
        ] {
            let mut resource = ResourceElement::new(id, kind, 0);
            resource.name = empty_name;
            cx.binary
                .section_mut(sections.resources)
                .add_element(resource);
        }
        Ok(())
    }

    /// Attaches every annotation stab to the first element of the
    /// instruction it names.
    fn add_annotations(&self, cx: &mut ReadContext<AOutScratch>) -> Result<()> {
        for (offset, stab) in std::mem::take(&mut cx.scratch.annotations) {
            let annotation = parse_annotation(&stab)?;
            let target = match cx.references.lookup(SectionOffsetKey::new(ST_TEXT, offset)) {
                Some(ObjectRef::Element(element)) => element,
                _ => {
                    return Err(Error::UnexpectedValue(format!(
                        "annotation {:#x} refers to no instruction at offset {offset}",
                        annotation.id
                    )))
                }
            };
            let instruction = cx
                .binary
                .element_mut(target)
                .and_then(SectionElement::as_instruction_mut)
                .ok_or_else(|| {
                    Error::UnexpectedValue(format!("annotated element {target:?} is not code"))
                })?;
            tracing::trace!(id = annotation.id, offset, "annotate instruction");
            instruction.add_annotation(annotation);
        }
        Ok(())
    }

    /// Operation registers are numbered per compilation module. Renumbers
    /// the function unit ports each module's moves use.
    fn renumber_operands(&self, cx: &mut ReadContext<AOutScratch>) -> Result<()> {
        let text = cx.scratch.sections()?.text;
        let modules = std::mem::take(&mut cx.scratch.modules);
        let starts: Vec<u32> = {
            let s = cx.binary.section(text);
            (0..s.instruction_count())
                .filter_map(|i| s.instruction_start(i))
                .collect()
        };

        for (m, module) in modules.iter().enumerate() {
            let end = modules
                .get(m + 1)
                .map(|next| next.start)
                .unwrap_or(starts.len() as u32);
            for instruction in module.start..end {
                let Some(&start) = starts.get(instruction as usize) else {
                    break;
                };
                let s = cx.binary.section_mut(text);
                let is_immediate = s
                    .element(start)
                    .and_then(SectionElement::as_instruction)
                    .is_some_and(|i| i.as_immediate().is_some());
                let element = if is_immediate { start + 1 } else { start };
                let Some(InstructionElement::Move(mv)) = s
                    .element_mut(element)
                    .and_then(SectionElement::as_instruction_mut)
                else {
                    continue;
                };
                for field in [&mut mv.source, &mut mv.destination] {
                    if field.kind != FieldType::Unit
                        || u16::from(field.unit) != ResourceElement::UNIVERSAL_FU
                    {
                        continue;
                    }
                    if let Some(&renumbered) = module.resources.get(&u32::from(field.index)) {
                        field.index = u16::try_from(renumbered).map_err(|_| {
                            Error::UnexpectedValue(format!("register {renumbered} is out of range"))
                        })?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl SectionReader<AOutScratch> for SymbolSectionReader {
    fn section_type(&self) -> SectionType {
        SectionType::SymTab
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<AOutScratch>,
    ) -> Result<()> {
        let sections = cx.scratch.sections()?;
        let size = cx.scratch.section_size;

        let mut undefined = SymbolElement::new(SymbolKind::NoType);
        undefined.set_name(cx.references.create(SectionOffsetKey::new(ST_STRING, 0)));
        undefined.set_section(SafePointer::to(sections.null));
        let index = cx.binary.section_mut(section).add_element(undefined);
        cx.references.add_object_reference(
            SectionIndexKey::new(ST_SYMBOL, 0),
            ElementRef::new(section, index),
        )?;

        cx.scratch.resolved_resources.clear();
        cx.scratch.modules.clear();
        cx.scratch.annotations.clear();

        // a.out symbol i is symbol i + 1 of the table, counting records that
        // do not become symbols
        for i in 0..size / SYMBOL_SIZE {
            let offset = i * SYMBOL_SIZE;
            let record = SymbolRecord::read(&mut stream.reader())?;
            let Some(mut symbol) = self.initialize_symbol(&record, cx)? else {
                continue;
            };
            symbol.set_binding(if record.kind & N_EXT != 0 {
                SymbolBinding::Global
            } else {
                SymbolBinding::Local
            });
            symbol.set_name(
                cx.references
                    .create(SectionOffsetKey::new(ST_STRING, record.strx)),
            );

            let index = cx.binary.section_mut(section).add_element(symbol);
            let element = ElementRef::new(section, index);
            cx.references
                .add_object_reference(SectionOffsetKey::new(ST_SYMBOL, offset), element)?;
            cx.references
                .add_object_reference(SectionIndexKey::new(ST_SYMBOL, i + 1), element)?;
            tracing::trace!(index = i, kind = record.kind, "read symbol");
        }

        self.add_resources(cx)
    }

    /// Turns GCC module start symbols into file symbols and adds a procedure
    /// symbol for every code symbol. Renumbers operands and attaches
    /// annotations to their instructions.
    fn finalize(&self, section: SectionRef, cx: &mut ReadContext<AOutScratch>) -> Result<()> {
        let null = cx.scratch.sections()?.null;
        let count = cx.binary.section(section).element_count();

        for i in 0..count {
            let Some(symbol) = cx
                .binary
                .section(section)
                .element(i)
                .and_then(SectionElement::as_symbol)
                .cloned()
            else {
                continue;
            };
            let SymbolKind::Code { reference } = *symbol.kind() else {
                continue;
            };
            let name = cx.binary.name_of(&symbol.name())?;

            // in a linked program the symbol before a module start names the
            // module's file
            if i > 1 && name == GCC_MODULE_START_SYMBOL1 {
                let previous = cx
                    .binary
                    .section(section)
                    .element(i - 1)
                    .and_then(SectionElement::as_symbol)
                    .cloned()
                    .filter(|s| matches!(s.kind(), SymbolKind::Code { .. } | SymbolKind::NoType))
                    .ok_or_else(|| {
                        Error::UnexpectedValue(format!(
                            "symbol before module start {i} is not a code symbol"
                        ))
                    })?;
                let mut file = SymbolElement::new(SymbolKind::File);
                file.set_name(previous.name());
                file.set_section(SafePointer::to(null));
                cx.binary.section_mut(section).set_element(i - 1, file)?;
            }

            if name == GCC_MODULE_START_SYMBOL1 || name == GCC_MODULE_START_SYMBOL2 {
                let mut replacement = SymbolElement::new(SymbolKind::NoType);
                replacement.set_name(symbol.name());
                replacement.set_section(SafePointer::to(null));
                cx.binary.section_mut(section).set_element(i, replacement)?;
            } else {
                let mut procedure = SymbolElement::new(SymbolKind::Procedure { reference });
                procedure.set_absolute(symbol.absolute());
                procedure.set_binding(SymbolBinding::Local);
                procedure.set_name(symbol.name());
                procedure.set_section(symbol.section());
                procedure.set_size(symbol.size());
                cx.binary.section_mut(section).add_element(procedure);
            }
        }

        self.renumber_operands(cx)?;
        self.add_annotations(cx)
    }
}

/// Splits an annotation stab into its id and payload.
fn parse_annotation(stab: &str) -> Result<InstructionAnnotation> {
    if stab.as_bytes().get(ANNOTATION_ID_LENGTH) != Some(&b':') {
        return Err(Error::UnexpectedValue(format!(
            "annotation {stab:?} does not start with an id like 0x00011000:"
        )));
    }
    let (id, payload) = stab.split_at(ANNOTATION_ID_LENGTH);
    let parsed = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => id.trim().parse(),
    };
    let id = parsed
        .map_err(|e| Error::UnexpectedValue(format!("bad annotation id {id:?}: {e}")))?;
    Ok(InstructionAnnotation::new(id, payload.as_bytes()[1..].to_vec()))
}

/// Relocations are 12-byte records of patched address, info and addend.
struct RelocSectionReader;

/// Address a relocated a.out value refers to. Code addresses count bytes,
/// eight per instruction.
fn aout_address(code: ElementRef, reloc: &RelocElement, value: u32) -> Option<u32> {
    if reloc.aspace.element() == Some(code) {
        Some(value / INSTRUCTION_SIZE)
    } else {
        Some(value)
    }
}

impl SectionReader<AOutScratch> for RelocSectionReader {
    fn section_type(&self) -> SectionType {
        SectionType::Reloc
    }

    fn read_data(
        &self,
        stream: &mut BinaryStream,
        section: SectionRef,
        cx: &mut ReadContext<AOutScratch>,
    ) -> Result<()> {
        let sections = cx.scratch.sections()?;
        let patched = if cx.binary.section(section).referenced_section().section()
            == Some(sections.text)
        {
            ST_TEXT
        } else {
            ST_DATA
        };

        for _ in 0..cx.scratch.section_size / RELOC_SIZE {
            let record = RelocRecord::read(&mut stream.reader())?;
            let index = record.info >> 8;
            let mut reloc = RelocElement {
                location: cx
                    .references
                    .create(SectionOffsetKey::new(patched, record.address)),
                kind: RelocType::SelfRel,
                size: 32,
                ..RelocElement::default()
            };

            let external = record.addend == 0
                && record.info & RELOC_EXTERN != 0
                && record.info != FIRST_INSTRUCTION_RELOC_INFO;
            if external {
                reloc.symbol = cx
                    .references
                    .create(SectionIndexKey::new(ST_SYMBOL, index + 1));
                reloc.aspace = SafePointer::to(sections.undefined_aspace);
            } else {
                reloc.symbol = cx.references.create(SectionIndexKey::new(ST_SYMBOL, 0));
                reloc.aspace = SafePointer::to(if index == u32::from(N_TEXT) {
                    sections.code_aspace
                } else {
                    sections.data_aspace
                });
                if record.addend != 0 {
                    match u8::try_from(index) {
                        Ok(target @ (N_TEXT | N_DATA | N_BSS)) => {
                            let offset =
                                cx.scratch.header.section_offset_of_address(record.addend);
                            reloc.destination = cx
                                .references
                                .create(SectionOffsetKey::new(target.into(), offset));
                        }
                        _ => tracing::warn!(
                            address = record.address,
                            index,
                            "relocation against unknown section"
                        ),
                    }
                }
            }

            cx.binary.section_mut(section).add_element(reloc);
            tracing::trace!(address = record.address, info = record.info, "read relocation");
        }
        Ok(())
    }

    fn finalize(&self, section: SectionRef, cx: &mut ReadContext<AOutScratch>) -> Result<()> {
        let code = cx.scratch.sections()?.code_aspace;
        relocation::finalize_relocations(section, cx, |_, reloc, value| {
            aout_address(code, reloc, value)
        })
    }
}
