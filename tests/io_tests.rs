// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use std::fs;
use std::path::Path;

use tpef::element::{ASpaceElement, SectionElement};
use tpef::io;
use tpef::reference::SafePointer;
use tpef::section::{Section, SectionType};
use tpef::stream::BinaryStream;
use tpef::Binary;

fn binary() -> Binary {
    let mut binary = Binary::new();
    let strings = binary.add_section(Section::create(SectionType::StrTab));
    binary.set_strings(strings);
    let aspaces = binary.add_section(Section::create(SectionType::AddrSp));
    let name = binary.string_to_chunk(strings, "data").expect("name");
    let mut aspace = ASpaceElement::new(8, 1, 32);
    aspace.name = SafePointer::to(name);
    binary.section_mut(aspaces).set_link(SafePointer::to(strings));
    binary.section_mut(aspaces).add_element(aspace);
    binary
}

#[test]
fn test_file_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.tpef");

    io::write(&binary(), &path).expect("write");
    assert!(fs::metadata(&path).expect("metadata").len() > 0);

    let read = io::read(&path).expect("read");
    let aspaces = read.find_section(SectionType::AddrSp, 0).expect("aspaces");
    let aspace = read
        .section(aspaces)
        .element(1)
        .and_then(SectionElement::as_aspace)
        .expect("aspace");
    assert_eq!((8, 1, 32), (aspace.mau, aspace.align, aspace.word_size));
    assert_eq!("data", read.name_of(&aspace.name).expect("name"));
}

#[test]
fn test_write_replaces_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.tpef");
    fs::write(&path, vec![0xff; 4096]).expect("garbage");

    io::write(&binary(), &path).expect("write");
    assert!(fs::metadata(&path).expect("metadata").len() < 4096);
    io::read(&path).expect("read");
}

#[test]
fn test_stream_round_trip() {
    let mut stream = BinaryStream::in_memory();
    io::write_binary(&binary(), &mut stream).expect("write");
    stream.set_read_position(0).expect("rewind");
    let read = io::read_binary(&mut stream).expect("read");
    assert_eq!(3, read.section_count());
}

#[test]
fn test_bad_filenames() {
    assert!(io::read(Path::new("bad file name")).is_err());

    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing").join("out.tpef");
    assert!(io::write(&binary(), &missing).is_err());
}

#[test]
fn test_not_readable() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(io::read(dir.path()).is_err());
}

#[test]
fn test_unknown_format() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("notes.txt");
    fs::write(&path, "this is plainly not an object file of any kind").expect("write");

    let e = io::read(&path).expect_err("unknown format");
    let message = e.chain().next().map(|x| format!("{x}")).expect("reason");
    assert!(message.contains("no reader recognizes"), "{message}");

    let e = io::read(Path::new("/dev/null")).expect_err("empty");
    assert!(matches!(
        e.downcast_ref::<tpef::Error>(),
        Some(tpef::Error::InstanceNotFound(_))
    ));
}

#[test]
fn test_broken_file_names_format() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.tpef");
    let mut stream = BinaryStream::in_memory();
    io::write_binary(&binary(), &mut stream).expect("write");
    let mut bytes = stream.into_bytes().expect("in memory");
    bytes.truncate(bytes.len() - 4);
    fs::write(&path, bytes).expect("write");

    let e = io::read(&path).expect_err("truncated");
    let context = e.to_string();
    assert!(context.contains("as TPEF"), "{context}");
    assert!(e.downcast_ref::<tpef::Error>().is_some());
}
