// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use tpef::aout::{AOutReader, OMAGIC};
use tpef::binary::{ElementRef, FileArchitecture, FileType, SectionRef};
use tpef::element::{
    FieldType, InstructionAnnotation, InstructionElement, MoveField, ResourceElement, ResourceType, SectionElement,
    SymbolBinding, SymbolKind,
};
use tpef::reader::{self, FormatReader};
use tpef::reference::ObjectRef;
use tpef::section::SectionType;
use tpef::stream::BinaryStream;
use tpef::tpef::TpefWriter;
use tpef::writer::FormatWriter;
use tpef::{Binary, Error};

const N_EXT: u8 = 0x01;
const N_TEXT: u8 = 0x04;
const N_DATA: u8 = 0x06;
const N_PRTAB: u8 = 0x70;
const N_ANN: u8 = 0x72;
const N_SO: u8 = 0x64;

const RELOC_EXTERN: u32 = 0x02;

const IMMEDIATE: u32 = 0x8000_0000;
const GUARDED: u32 = 0x4000_0000;
const INVERTED: u32 = 0x2000_0000;

struct Symbol {
    name: &'static str,
    kind: u8,
    desc: u16,
    value: u32,
}

fn symbol(name: &'static str, kind: u8, value: u32) -> Symbol {
    Symbol {
        name,
        kind,
        desc: 0,
        value,
    }
}

/// An a.out file assembled byte by byte.
#[derive(Default)]
struct AOut {
    text: Vec<[u32; 2]>,
    data: Vec<u8>,
    bss: u32,
    text_relocs: Vec<[u32; 3]>,
    symbols: Vec<Symbol>,
}

impl AOut {
    fn bytes(&self) -> Vec<u8> {
        let mut strings = vec![0u8];
        let mut symbols = Vec::new();
        for s in &self.symbols {
            let strx = if s.name.is_empty() {
                0
            } else {
                let strx = strings.len() as u32;
                strings.extend(s.name.bytes());
                strings.push(0);
                strx
            };
            symbols.extend(strx.to_be_bytes());
            symbols.push(s.kind);
            symbols.push(0);
            symbols.extend(s.desc.to_be_bytes());
            symbols.extend(s.value.to_be_bytes());
        }

        let mut bytes = vec![0, 0];
        bytes.extend(OMAGIC.to_be_bytes());
        for value in [
            self.text.len() as u32 * 8,
            self.data.len() as u32,
            self.bss,
            symbols.len() as u32,
            0,
            self.text_relocs.len() as u32 * 12,
            0,
        ] {
            bytes.extend(value.to_be_bytes());
        }
        for word in self.text.iter().flatten() {
            bytes.extend(word.to_be_bytes());
        }
        bytes.extend(&self.data);
        for word in self.text_relocs.iter().flatten() {
            bytes.extend(word.to_be_bytes());
        }
        bytes.extend(symbols);
        bytes.extend(strings);
        bytes
    }

    fn read(&self) -> tpef::Result<Binary> {
        reader::read_binary(&mut BinaryStream::from_bytes(self.bytes()))
    }
}

/// Loads the address of `_x` and moves it on under an inverted guard.
fn program() -> AOut {
    AOut {
        text: vec![[IMMEDIATE | 5, 16], [GUARDED | INVERTED | 6, 5]],
        data: vec![0, 0, 0, 42],
        bss: 4,
        text_relocs: vec![
            // the immediate holds an address in data
            [4, u32::from(N_DATA) << 8, 0],
            // and names the external symbol 1
            [4, 1 << 8 | RELOC_EXTERN, 0],
        ],
        symbols: vec![
            symbol("_main", N_TEXT | N_EXT, 0),
            symbol("_x", N_DATA | N_EXT, 16),
            Symbol {
                name: "file.c",
                kind: N_SO,
                desc: 3,
                value: 0,
            },
        ],
    }
}

fn only(binary: &Binary, kind: SectionType) -> SectionRef {
    assert_eq!(1, binary.section_count_of(kind), "{kind} sections");
    binary.find_section(kind, 0).expect("section")
}

fn symbol_at<'a>(binary: &'a Binary, symbols: SectionRef, index: u32) -> &'a tpef::element::SymbolElement {
    binary
        .section(symbols)
        .element(index)
        .and_then(SectionElement::as_symbol)
        .expect("symbol")
}

fn move_at(binary: &Binary, code: SectionRef, index: u32) -> tpef::element::MoveElement {
    binary
        .section(code)
        .element(index)
        .and_then(SectionElement::as_instruction)
        .and_then(InstructionElement::as_move)
        .cloned()
        .expect("move")
}

#[test]
fn test_magic_detection() {
    let bytes = program().bytes();
    let mut stream = BinaryStream::from_bytes(bytes);
    assert!(AOutReader.probe(&mut stream).expect("format check"));
    assert_eq!("a.out", reader::find_reader(&mut stream).expect("reader").format_name());
}

#[test]
fn test_layout() {
    let binary = program().read().expect("read");
    assert_eq!(FileArchitecture::TtaTut, binary.arch());
    assert_eq!(FileType::ObjSeq, binary.file_type());

    let kinds: Vec<SectionType> = binary.sections().map(|(_, s)| s.kind()).collect();
    assert_eq!(
        vec![
            SectionType::Null,
            SectionType::AddrSp,
            SectionType::Code,
            SectionType::Reloc,
            SectionType::SymTab,
            SectionType::Data,
            SectionType::UData,
            SectionType::Mr,
            SectionType::Debug,
            SectionType::StrTab,
        ],
        kinds
    );
    for pointer in binary.pointers() {
        assert!(!pointer.is_pending(), "{pointer:?} is still pending");
    }

    let code = only(&binary, SectionType::Code);
    assert_eq!("Code", binary.section_name(code).expect("name"));
    let aspace = binary
        .address_space(&binary.section(code).aspace())
        .expect("code address space");
    assert_eq!((8, 4, 4), (aspace.mau, aspace.align, aspace.word_size));
    assert_eq!(
        "universal_instructions",
        binary.name_of(&aspace.name).expect("name")
    );

    let data = only(&binary, SectionType::Data);
    assert_eq!(16, binary.section(data).start_address());
    assert_eq!(&[0, 0, 0, 42], binary.section(data).data());
    let bss = only(&binary, SectionType::UData);
    assert_eq!(20, binary.section(bss).start_address());
    assert_eq!(4, binary.section(bss).length());
    assert!(binary.section(bss).is_nobits());
}

#[test]
fn test_text() {
    let binary = program().read().expect("read");
    let code = only(&binary, SectionType::Code);
    let s = binary.section(code);
    assert_eq!(3, s.element_count());
    assert_eq!(2, s.instruction_count());

    let imm = s
        .element(0)
        .and_then(SectionElement::as_instruction)
        .and_then(InstructionElement::as_immediate)
        .expect("immediate");
    assert!(imm.begin);
    assert_eq!(16, imm.word());

    let load = move_at(&binary, code, 1);
    assert!(!load.begin);
    assert_eq!(FieldType::Imm, load.source.kind);
    assert_eq!(
        MoveField::new(FieldType::Rf, ResourceElement::INT_RF as u8, 5),
        load.destination
    );

    let guarded = move_at(&binary, code, 2);
    assert!(guarded.begin);
    assert_eq!(
        MoveField::new(FieldType::Rf, ResourceElement::INT_RF as u8, 5),
        guarded.source
    );
    let guard = guarded.guard.expect("guard");
    assert!(guard.inverted);
    assert_eq!(
        MoveField::new(FieldType::Rf, ResourceElement::BOOL_RF as u8, 0),
        guard.field
    );
}

#[test]
fn test_symbols() {
    let binary = program().read().expect("read");
    let code = only(&binary, SectionType::Code);
    let data = only(&binary, SectionType::Data);
    let symbols = only(&binary, SectionType::SymTab);
    assert_eq!(4, binary.section(symbols).element_count());

    let undefined = symbol_at(&binary, symbols, 0);
    assert_eq!(SymbolKind::NoType, *undefined.kind());
    assert_eq!("", binary.name_of(&undefined.name()).expect("name"));

    let main = symbol_at(&binary, symbols, 1);
    assert_eq!("_main", binary.name_of(&main.name()).expect("name"));
    assert_eq!(SymbolBinding::Global, main.binding());
    assert!(matches!(main.kind(), SymbolKind::Code { .. }));
    assert_eq!(
        Some(ElementRef::new(code, 0)),
        main.reference().and_then(|r| r.element())
    );
    assert_eq!(Some(code), main.section().section());

    let x = symbol_at(&binary, symbols, 2);
    assert_eq!("_x", binary.name_of(&x.name()).expect("name"));
    assert_eq!(4, x.size());
    let chunk = x.reference().and_then(|r| r.chunk()).expect("chunk");
    assert_eq!((data, 0), (chunk.section(), chunk.offset()));

    let procedure = symbol_at(&binary, symbols, 3);
    assert!(matches!(procedure.kind(), SymbolKind::Procedure { .. }));
    assert_eq!(SymbolBinding::Local, procedure.binding());
    assert_eq!("_main", binary.name_of(&procedure.name()).expect("name"));
    assert_eq!(main.reference(), procedure.reference());

    let debug = only(&binary, SectionType::Debug);
    let entry = binary
        .section(debug)
        .element(0)
        .and_then(SectionElement::as_debug)
        .expect("stab");
    let stab = entry.as_stab().expect("stab");
    assert_eq!((N_SO, 3), (stab.stab_type, stab.description));
    assert_eq!("file.c", binary.name_of(&entry.debug_string).expect("name"));
}

#[test]
fn test_relocations() {
    let binary = program().read().expect("read");
    let code = only(&binary, SectionType::Code);
    let data = only(&binary, SectionType::Data);
    let symbols = only(&binary, SectionType::SymTab);
    let relocs = only(&binary, SectionType::Reloc);
    assert_eq!(Some(code), binary.section(relocs).referenced_section().section());
    assert_eq!(Some(symbols), binary.section(relocs).link().section());

    let relocations: Vec<_> = binary
        .section(relocs)
        .elements()
        .iter()
        .filter_map(SectionElement::as_reloc)
        .collect();
    assert_eq!(2, relocations.len());

    let local = relocations[0];
    assert_eq!(Some(ElementRef::new(code, 0)), local.location.element());
    assert_eq!(Some(ElementRef::new(symbols, 0)), local.symbol.element());
    let Some(ObjectRef::Chunk(destination)) = local.destination.object() else {
        panic!("expected a chunk, found {:?}", local.destination);
    };
    assert_eq!((data, 0), (destination.section(), destination.offset()));

    let external = relocations[1];
    assert_eq!(Some(ElementRef::new(symbols, 2)), external.symbol.element());
    assert!(external.destination.is_null());
    assert!(binary
        .address_space(&external.aspace)
        .is_some_and(|a| a.is_undefined()));
}

#[test]
fn test_first_instruction_relocation() {
    const FIRST_INSTRUCTION: u32 = 1026;
    assert_ne!(0, FIRST_INSTRUCTION & RELOC_EXTERN);

    let mut aout = program();
    aout.text_relocs = vec![[0, FIRST_INSTRUCTION, 0], [0, RELOC_EXTERN, 0]];
    let binary = aout.read().expect("read");
    let code = only(&binary, SectionType::Code);
    let symbols = only(&binary, SectionType::SymTab);
    let relocs = only(&binary, SectionType::Reloc);
    let reloc = |index| {
        binary
            .section(relocs)
            .element(index)
            .and_then(SectionElement::as_reloc)
            .expect("reloc")
    };

    let first = reloc(0);
    assert_eq!(Some(ElementRef::new(code, 0)), first.location.element());
    assert_eq!(Some(ElementRef::new(symbols, 0)), first.symbol.element());
    let aspace = binary.address_space(&first.aspace).expect("aspace");
    assert!(!aspace.is_undefined());
    assert_eq!(
        "universal_instructions",
        binary.name_of(&aspace.name).expect("name")
    );

    // same type bits, symbol 0 (_main)
    let main = reloc(1);
    assert_eq!(Some(ElementRef::new(code, 0)), main.location.element());
    assert_eq!(Some(ElementRef::new(symbols, 1)), main.symbol.element());
    assert!(binary
        .address_space(&main.aspace)
        .is_some_and(|a| a.is_undefined()));
    assert!(main.destination.is_null());
}

#[test]
fn test_resources() {
    let binary = program().read().expect("read");
    let resources = only(&binary, SectionType::Mr);
    let found: Vec<(u16, ResourceType)> = binary
        .section(resources)
        .elements()
        .iter()
        .filter_map(SectionElement::as_resource)
        .map(|r| (r.id, r.kind))
        .collect();
    assert_eq!(
        vec![
            (ResourceElement::INT_RF, ResourceType::Rf),
            (ResourceElement::FP_RF, ResourceType::Rf),
            (ResourceElement::BOOL_RF, ResourceType::Rf),
            (ResourceElement::UNIVERSAL_FU, ResourceType::Unit),
            (ResourceElement::UNIVERSAL_BUS, ResourceType::Bus),
        ],
        found
    );
}

/// Two compilation modules that number the same operation differently.
fn modules() -> AOut {
    AOut {
        text: vec![[2050, 1], [2051, 2]],
        symbols: vec![
            symbol("a.o", N_TEXT, 0),
            symbol("gcc2_compiled.", N_TEXT, 0),
            symbol("add", N_PRTAB, 2050),
            symbol("b.o", N_TEXT, 8),
            symbol("gcc2_compiled.", N_TEXT, 8),
            symbol("add", N_PRTAB, 2051),
            symbol("0x00000001:b.o", N_ANN, 8),
            symbol("_main", N_TEXT | N_EXT, 8),
        ],
        ..AOut::default()
    }
}

#[test]
fn test_compilation_modules() {
    let binary = modules().read().expect("read");
    let symbols = only(&binary, SectionType::SymTab);
    let kinds: Vec<(String, &'static str)> = binary
        .section(symbols)
        .elements()
        .iter()
        .filter_map(SectionElement::as_symbol)
        .map(|s| (binary.name_of(&s.name()).expect("name"), s.kind().name()))
        .collect();
    let expected = [
        ("", SymbolKind::NoType),
        ("a.o", SymbolKind::File),
        ("gcc2_compiled.", SymbolKind::NoType),
        ("b.o", SymbolKind::File),
        ("gcc2_compiled.", SymbolKind::NoType),
    ];
    for (i, (name, kind)) in expected.iter().enumerate() {
        assert_eq!((name.to_string(), kind.name()), kinds[i], "symbol {i}");
    }
    let procedures: Vec<&str> = kinds
        .iter()
        .filter(|(_, kind)| *kind == "PROCEDURE")
        .map(|(name, _)| name.as_str())
        .collect();
    assert!(procedures.contains(&"_main"));

    // the second module's operation is renumbered to the first number seen
    let code = only(&binary, SectionType::Code);
    assert_eq!(
        MoveField::new(FieldType::Unit, 0, 2050),
        move_at(&binary, code, 0).destination
    );
    assert_eq!(
        MoveField::new(FieldType::Unit, 0, 2050),
        move_at(&binary, code, 1).destination
    );

    let resources = only(&binary, SectionType::Mr);
    let add = binary
        .section(resources)
        .elements()
        .iter()
        .filter_map(SectionElement::as_resource)
        .find(|r| r.kind == ResourceType::Op)
        .expect("operation");
    assert_eq!(2050, add.id);
    assert_eq!("add", binary.name_of(&add.name).expect("name"));
}

fn annotations(binary: &Binary, code: SectionRef, index: u32) -> Vec<InstructionAnnotation> {
    binary
        .section(code)
        .element(index)
        .and_then(SectionElement::as_instruction)
        .map(|i| i.annotations().to_vec())
        .expect("instruction")
}

#[test]
fn test_annotations() {
    let mut aout = program();
    aout.symbols.push(symbol("0x00011000:payload", N_ANN, 8));
    aout.symbols.push(symbol("0x00000002:", N_ANN, 0));
    let binary = aout.read().expect("read");
    let code = only(&binary, SectionType::Code);

    // attached to the first element of each instruction
    assert_eq!(
        vec![InstructionAnnotation::new(2, Vec::new())],
        annotations(&binary, code, 0)
    );
    assert!(annotations(&binary, code, 1).is_empty());
    assert_eq!(
        vec![InstructionAnnotation::new(0x11000, b"payload".to_vec())],
        annotations(&binary, code, 2)
    );
    // annotations are not symbols
    let symbols = only(&binary, SectionType::SymTab);
    assert_eq!(4, binary.section(symbols).element_count());

    let mut stream = BinaryStream::in_memory();
    TpefWriter
        .write_binary(&mut stream, &binary)
        .expect("write");
    stream.set_read_position(0).expect("rewind");
    let tpef = reader::read_binary(&mut stream).expect("read back");
    let tpef_code = only(&tpef, SectionType::Code);
    for index in 0..3 {
        assert_eq!(
            annotations(&binary, code, index),
            annotations(&tpef, tpef_code, index),
            "element {index}"
        );
    }
    assert_eq!(move_at(&binary, code, 2), move_at(&tpef, tpef_code, 2));
}

#[test]
fn test_bad_annotation() {
    for stab in ["0x00011000;payload", "short"] {
        let mut aout = program();
        aout.symbols.push(symbol(stab, N_ANN, 8));
        let e = aout.read().expect_err("bad annotation");
        assert!(matches!(e, Error::UnexpectedValue(_)), "{stab}: {e:?}");
    }
}

#[test]
fn test_bad_text_size() {
    let mut bytes = program().bytes();
    // text size 12 is not a whole number of instructions
    bytes[4..8].copy_from_slice(&12u32.to_be_bytes());
    let e = reader::read_binary(&mut BinaryStream::from_bytes(bytes)).expect_err("bad size");
    assert!(matches!(e, Error::UnexpectedValue(_)), "{e:?}");
}

#[test]
fn test_sections_past_end() {
    let mut bytes = program().bytes();
    bytes.truncate(40);
    assert!(reader::read_binary(&mut BinaryStream::from_bytes(bytes)).is_err());
}

#[test]
fn test_convert_to_tpef() {
    let binary = program().read().expect("read");
    let mut stream = BinaryStream::in_memory();
    TpefWriter
        .write_binary(&mut stream, &binary)
        .expect("write");
    stream.set_read_position(0).expect("rewind");
    let tpef = reader::read_binary(&mut stream).expect("read back");
    for pointer in tpef.pointers() {
        assert!(!pointer.is_pending(), "{pointer:?} is still pending");
    }
    assert_eq!(binary.section_count(), tpef.section_count());
    assert_eq!(FileArchitecture::TtaTut, tpef.arch());

    let code = only(&tpef, SectionType::Code);
    assert_eq!(2, tpef.section(code).instruction_count());
    assert_eq!(
        move_at(&binary, only(&binary, SectionType::Code), 2),
        move_at(&tpef, code, 2)
    );

    let symbols = only(&tpef, SectionType::SymTab);
    assert_eq!(4, tpef.section(symbols).element_count());
    let x = symbol_at(&tpef, symbols, 2);
    assert_eq!("_x", tpef.name_of(&x.name()).expect("name"));
    let data = only(&tpef, SectionType::Data);
    let chunk = x.reference().and_then(|r| r.chunk()).expect("chunk");
    assert_eq!((data, 0), (chunk.section(), chunk.offset()));

    let relocs = only(&tpef, SectionType::Reloc);
    let local = tpef
        .section(relocs)
        .element(0)
        .and_then(SectionElement::as_reloc)
        .expect("reloc");
    assert_eq!(Some(ObjectRef::Chunk(chunk)), local.destination.object());

    let bss = only(&tpef, SectionType::UData);
    assert_eq!(4, tpef.section(bss).length());
    assert_eq!("Code", tpef.section_name(code).expect("name"));
}
