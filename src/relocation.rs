// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Relocation destinations.
//!
//! Files store relocated values in place: an immediate in code, or a few
//! bytes of data. Readers turn that value back into a reference to the
//! instruction or chunk it addresses; the writer does the opposite.

use crate::binary::{Binary, ElementRef, SectionRef};
use crate::element::{ImmediateElement, InstructionElement, RelocElement, RelocType, SectionElement};
use crate::error::{Error, Result};
use crate::reader::ReadContext;
use crate::reference::{ObjectRef, SafePointer, SectionIndexKey, SectionOffsetKey};
use crate::section::SectionType;

/// Sign extends the low `bits` bits of `value`.
pub fn sign_extend(value: u32, bits: u8) -> u32 {
    match bits {
        1..=31 => {
            let shift = 32 - u32::from(bits);
            (((value << shift) as i32) >> shift) as u32
        }
        _ => value,
    }
}

/// Address of an instruction element or chunk in its section's address
/// space.
pub fn address_of(binary: &Binary, pointer: &SafePointer) -> Option<u32> {
    match pointer.object()? {
        ObjectRef::Element(e) => {
            let section = binary.section(e.section());
            if section.kind() != SectionType::Code {
                return None;
            }
            let index = section.instruction_index_of(e.index())?;
            Some(section.start_address().wrapping_add(index))
        }
        ObjectRef::Chunk(c) => {
            let start = binary.section(c.section()).start_address();
            Some(start.wrapping_add(c.offset() / binary.bytes_per_mau(c.section())))
        }
        ObjectRef::Section(s) => Some(binary.section(s).start_address()),
    }
}

/// Number of bytes a data relocation of `size` bits patches.
fn data_width(size: u8) -> Option<usize> {
    match size {
        8 | 16 | 32 => Some(usize::from(size / 8)),
        _ => None,
    }
}

/// The value currently stored at a relocation's location.
pub fn location_value(binary: &Binary, reloc: &RelocElement) -> Option<u32> {
    match reloc.location.object()? {
        ObjectRef::Element(e) => binary
            .element(e)
            .and_then(SectionElement::as_instruction)
            .and_then(InstructionElement::as_immediate)
            .map(ImmediateElement::word),
        ObjectRef::Chunk(c) => {
            let width = data_width(reloc.size)?;
            let start = c.offset() as usize;
            let bytes = binary.section(c.section()).data().get(start..start + width)?;
            Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
        }
        ObjectRef::Section(_) => None,
    }
}

/// The program section of `aspace` that holds `address`.
pub fn section_at(binary: &Binary, aspace: ElementRef, address: u32) -> Option<SectionRef> {
    binary
        .sections()
        .filter(|(_, s)| s.kind().is_program_section())
        .filter(|(_, s)| s.aspace().element() == Some(aspace))
        .map(|(r, _)| r)
        .find(|r| {
            let start = binary.section(*r).start_address();
            address >= start && u64::from(address) < u64::from(start) + u64::from(binary.address_length(*r))
        })
}

/// Address a relocated value refers to under TPEF rules.
pub fn tpef_address(binary: &Binary, reloc: &RelocElement, value: u32) -> Option<u32> {
    if reloc.chunked {
        return None;
    }
    match reloc.kind {
        RelocType::SelfRel => Some(value),
        RelocType::PcRel => {
            address_of(binary, &reloc.location).map(|pc| pc.wrapping_add(sign_extend(value, reloc.size)))
        }
        RelocType::NoRel | RelocType::Page => None,
    }
}

/// Points the destination of every relocation of `section` that has none yet
/// at the instruction or chunk its stored value addresses.
///
/// Relocations against the undefined address space are left alone, as are
/// values that fall outside every section.
pub fn finalize_relocations<S>(
    section: SectionRef,
    cx: &mut ReadContext<S>,
    rule: impl Fn(&Binary, &RelocElement, u32) -> Option<u32>,
) -> Result<()> {
    let mut destinations = Vec::new();
    for (index, element) in cx.binary.section(section).elements().iter().enumerate() {
        let Some(reloc) = element.as_reloc() else {
            continue;
        };
        if !reloc.destination.is_null() || reloc.kind == RelocType::NoRel {
            continue;
        }
        let Some(aspace) = reloc.aspace.element() else {
            continue;
        };
        if cx.binary.address_space(&reloc.aspace).is_none_or(|a| a.is_undefined()) {
            continue;
        }
        let Some(value) = location_value(&cx.binary, reloc) else {
            tracing::trace!(index, "relocation location holds no value");
            continue;
        };
        let Some(address) = rule(&cx.binary, reloc, value) else {
            continue;
        };
        let Some(target) = section_at(&cx.binary, aspace, address) else {
            tracing::warn!(
                index,
                address = format_args!("{address:#x}"),
                "relocated value is outside every section"
            );
            continue;
        };
        let Some(id) = cx.references.section_id_of(target) else {
            tracing::warn!(index, "relocation target section has no id");
            continue;
        };

        let target_section = cx.binary.section(target);
        let offset = address - target_section.start_address();
        let destination = if target_section.kind() == SectionType::Code {
            cx.references.create(SectionIndexKey::new(id, offset))
        } else {
            let bytes = offset
                .checked_mul(cx.binary.bytes_per_mau(target))
                .ok_or_else(|| Error::UnexpectedValue(format!("address {address:#x} overflows")))?;
            cx.references.create(SectionOffsetKey::new(id, bytes))
        };
        destinations.push((index as u32, destination));
    }

    for (index, destination) in destinations {
        if let Some(reloc) = cx
            .binary
            .section_mut(section)
            .element_mut(index)
            .and_then(SectionElement::as_reloc_mut)
        {
            reloc.destination = destination;
        }
    }
    Ok(())
}

/// Stores the address of each relocation's destination at its location, so
/// that a reader can find the destination again.
pub fn patch_locations(binary: &mut Binary) -> Result<()> {
    let mut patches = Vec::new();
    for (_, section) in binary.sections() {
        for reloc in section.elements().iter().filter_map(SectionElement::as_reloc) {
            if reloc.chunked || reloc.destination.is_null() {
                continue;
            }
            let Some(target) = address_of(binary, &reloc.destination) else {
                continue;
            };
            let value = match reloc.kind {
                RelocType::SelfRel => target,
                RelocType::PcRel => match address_of(binary, &reloc.location) {
                    Some(pc) => target.wrapping_sub(pc),
                    None => continue,
                },
                RelocType::NoRel | RelocType::Page => continue,
            };
            if let Some(location) = reloc.location.object() {
                patches.push((location, reloc.size, value));
            }
        }
    }

    for (location, size, value) in patches {
        match location {
            ObjectRef::Element(e) => {
                let Some(imm) = binary
                    .element_mut(e)
                    .and_then(SectionElement::as_instruction_mut)
                    .and_then(|i| match i {
                        InstructionElement::Immediate(imm) => Some(imm),
                        InstructionElement::Move(_) => None,
                    })
                else {
                    continue;
                };
                let width = imm.bytes().len().min(4);
                let bytes = value.to_be_bytes()[4 - width..].to_vec();
                let mut padded = vec![0; imm.bytes().len() - width];
                padded.extend(bytes);
                imm.set_bytes(padded);
            }
            ObjectRef::Chunk(c) => {
                let Some(width) = data_width(size) else {
                    tracing::warn!(size, "cannot patch data relocation of this size");
                    continue;
                };
                let section = binary.section_mut(c.section());
                let start = c.offset() as usize;
                let mut data = section.data().to_vec();
                let Some(slot) = data.get_mut(start..start + width) else {
                    continue;
                };
                slot.copy_from_slice(&value.to_be_bytes()[4 - width..]);
                section.set_data(data);
            }
            ObjectRef::Section(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::{ASpaceElement, MoveElement};
    use crate::reference::SectionKey;
    use crate::section::Section;

    struct Fixture {
        binary: Binary,
        code: SectionRef,
        data: SectionRef,
        aspace: ElementRef,
    }

    fn fixture() -> Fixture {
        let mut binary = Binary::new();
        let aspaces = binary.add_section(Section::create(SectionType::AddrSp));
        binary.section_mut(aspaces).add_element(ASpaceElement::undefined());
        let index = binary
            .section_mut(aspaces)
            .add_element(ASpaceElement::new(8, 1, 4));
        let aspace = ElementRef::new(aspaces, index);

        let mut code = Section::create(SectionType::Code);
        code.set_start_address(0x10);
        code.set_aspace(SafePointer::to(aspace));
        code.add_element(ImmediateElement::new(true, 0, 0, 0));
        code.add_element(MoveElement::empty(false));
        code.add_element(MoveElement::empty(true));
        let code = binary.add_section(code);

        let mut data = Section::create(SectionType::Data);
        data.set_start_address(0x100);
        data.set_aspace(SafePointer::to(aspace));
        data.set_data(vec![0; 8]);
        let data = binary.add_section(data);

        Fixture {
            binary,
            code,
            data,
            aspace,
        }
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(0xffff_fffe, sign_extend(0xfe, 8));
        assert_eq!(0x7e, sign_extend(0x7e, 8));
        assert_eq!(0x1234, sign_extend(0x1234, 32));
    }

    #[test]
    fn test_addresses() {
        let Fixture {
            mut binary,
            code,
            data,
            aspace,
        } = fixture();
        let second = SafePointer::to(ElementRef::new(code, 2));
        assert_eq!(Some(0x11), address_of(&binary, &second));

        let chunk = binary.chunk(data, 4).expect("chunk");
        assert_eq!(Some(0x104), address_of(&binary, &SafePointer::to(chunk)));

        assert_eq!(Some(code), section_at(&binary, aspace, 0x11));
        assert_eq!(Some(data), section_at(&binary, aspace, 0x107));
        assert_eq!(None, section_at(&binary, aspace, 0x108));
        assert_eq!(None, section_at(&binary, aspace, 0x12));
    }

    #[test]
    fn test_patch_then_finalize() {
        let Fixture {
            mut binary,
            code,
            data,
            aspace,
        } = fixture();
        let chunk = binary.chunk(data, 4).expect("chunk");
        let relocs = binary.add_section(Section::create(SectionType::Reloc));
        binary.section_mut(relocs).add_element(RelocElement {
            location: SafePointer::to(ElementRef::new(code, 0)),
            destination: SafePointer::to(chunk),
            aspace: SafePointer::to(aspace),
            kind: RelocType::SelfRel,
            size: 32,
            ..RelocElement::default()
        });
        binary.section_mut(relocs).add_element(RelocElement {
            location: SafePointer::to(chunk),
            destination: SafePointer::to(ElementRef::new(code, 2)),
            aspace: SafePointer::to(aspace),
            kind: RelocType::SelfRel,
            size: 16,
            ..RelocElement::default()
        });

        patch_locations(&mut binary).expect("patch");
        assert_eq!(&[0, 0, 0, 0, 0, 0x11, 0, 0], binary.section(data).data());
        let immediate = binary
            .element(ElementRef::new(code, 0))
            .and_then(SectionElement::as_instruction)
            .and_then(InstructionElement::as_immediate)
            .expect("immediate");
        assert_eq!(0x104, immediate.word());

        for element in binary.section_mut(relocs).elements_mut() {
            if let Some(reloc) = element.as_reloc_mut() {
                reloc.destination = SafePointer::Null;
            }
        }
        let mut cx = ReadContext::<()> {
            binary,
            ..ReadContext::default()
        };
        cx.references
            .add_object_reference(SectionKey::new(1), code)
            .expect("code id");
        cx.references
            .add_object_reference(SectionKey::new(2), data)
            .expect("data id");
        cx.references
            .add_object_reference(SectionIndexKey::new(1, 1), ElementRef::new(code, 2))
            .expect("instruction");
        finalize_relocations(relocs, &mut cx, tpef_address).expect("finalize");
        cx.references.resolve(&mut cx.binary).expect("resolve");

        let destinations: Vec<_> = cx
            .binary
            .section(relocs)
            .elements()
            .iter()
            .filter_map(SectionElement::as_reloc)
            .map(|r| r.destination)
            .collect();
        assert_eq!(SafePointer::to(chunk), destinations[0]);
        assert_eq!(SafePointer::to(ElementRef::new(code, 2)), destinations[1]);
    }

    #[test]
    fn test_values_outside_sections_are_left_alone() {
        let Fixture {
            mut binary,
            code,
            aspace,
            ..
        } = fixture();
        if let Some(SectionElement::Instruction(InstructionElement::Immediate(imm))) =
            binary.section_mut(code).element_mut(0)
        {
            imm.set_word(0x5000);
        }
        let relocs = binary.add_section(Section::create(SectionType::Reloc));
        binary.section_mut(relocs).add_element(RelocElement {
            location: SafePointer::to(ElementRef::new(code, 0)),
            aspace: SafePointer::to(aspace),
            kind: RelocType::SelfRel,
            size: 32,
            ..RelocElement::default()
        });

        let mut cx = ReadContext::<()> {
            binary,
            ..ReadContext::default()
        };
        finalize_relocations(relocs, &mut cx, tpef_address).expect("finalize");
        assert_eq!(0, cx.references.pending_count());
    }
}
