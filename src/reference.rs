// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Deferred cross references.
//!
//! Object files refer forward and backward between sections: a relocation
//! may name a symbol whose table has not been read yet. Readers therefore
//! never hold direct handles while parsing. Instead they
//!
//! 1. register every object they construct under one or more
//!    [keys](ReferenceKey) with [ReferenceManager::add_object_reference], and
//! 2. ask for a [SafePointer] to whatever is registered under a key with
//!    [ReferenceManager::create].
//!
//! When the whole input has been read, [ReferenceManager::resolve] matches
//! every pending request with its object and patches the pointers held by
//! the [Binary](crate::Binary). A request that cannot be matched is an
//! [Error::UnresolvedReference].
//!
//! ```
//! use tpef::reference::{ReferenceManager, SafePointer, SectionKey};
//! use tpef::section::{Section, SectionType};
//! use tpef::Binary;
//! # fn main() -> tpef::Result<()> {
//! let mut binary = Binary::new();
//! let mut references = ReferenceManager::new();
//!
//! let link = references.create(SectionKey::new(1));
//! assert!(link.is_pending());
//!
//! let strings = binary.add_section(Section::create(SectionType::StrTab));
//! binary.section_mut(strings).set_link(link);
//! references.add_object_reference(SectionKey::new(1), strings)?;
//!
//! references.resolve(&mut binary)?;
//! assert_eq!(Some(strings), binary.section(strings).link().section());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::Location;

use crate::binary::{Binary, ElementRef, SectionRef};
use crate::error::{Error, Result};
use crate::section::Chunk;

/// Identification code of a section as stored in a file.
pub type SectionId = u16;

/// Identifies a section by its identification code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionKey {
    section_id: SectionId,
}

impl SectionKey {
    pub fn new(section_id: SectionId) -> Self {
        Self { section_id }
    }

    pub fn section_id(&self) -> SectionId {
        self.section_id
    }
}

/// Identifies an element by its section and index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionIndexKey {
    section_id: SectionId,
    index: u32,
}

impl SectionIndexKey {
    pub fn new(section_id: SectionId, index: u32) -> Self {
        Self { section_id, index }
    }

    pub fn section_id(&self) -> SectionId {
        self.section_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Identifies an element or a chunk by its section and byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionOffsetKey {
    section_id: SectionId,
    offset: u32,
}

impl SectionOffsetKey {
    pub fn new(section_id: SectionId, offset: u32) -> Self {
        Self { section_id, offset }
    }

    pub fn section_id(&self) -> SectionId {
        self.section_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Identifies an object by the file offset it was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileOffsetKey {
    file_offset: u32,
}

impl FileOffsetKey {
    pub fn new(file_offset: u32) -> Self {
        Self { file_offset }
    }

    pub fn file_offset(&self) -> u32 {
        self.file_offset
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "section id {}", self.section_id)
    }
}

impl fmt::Display for SectionIndexKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "section id {} index {}", self.section_id, self.index)
    }
}

impl fmt::Display for SectionOffsetKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "section id {} offset {:#x}", self.section_id, self.offset)
    }
}

impl fmt::Display for FileOffsetKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "file offset {:#x}", self.file_offset)
    }
}

/// Any of the four key kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferenceKey {
    Section(SectionKey),
    SectionIndex(SectionIndexKey),
    SectionOffset(SectionOffsetKey),
    FileOffset(FileOffsetKey),
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReferenceKey::Section(k) => k.fmt(f),
            ReferenceKey::SectionIndex(k) => k.fmt(f),
            ReferenceKey::SectionOffset(k) => k.fmt(f),
            ReferenceKey::FileOffset(k) => k.fmt(f),
        }
    }
}

impl From<SectionKey> for ReferenceKey {
    fn from(key: SectionKey) -> Self {
        ReferenceKey::Section(key)
    }
}

impl From<SectionIndexKey> for ReferenceKey {
    fn from(key: SectionIndexKey) -> Self {
        ReferenceKey::SectionIndex(key)
    }
}

impl From<SectionOffsetKey> for ReferenceKey {
    fn from(key: SectionOffsetKey) -> Self {
        ReferenceKey::SectionOffset(key)
    }
}

impl From<FileOffsetKey> for ReferenceKey {
    fn from(key: FileOffsetKey) -> Self {
        ReferenceKey::FileOffset(key)
    }
}

/// Something a [SafePointer] can point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectRef {
    Section(SectionRef),
    Element(ElementRef),
    Chunk(Chunk),
}

impl From<SectionRef> for ObjectRef {
    fn from(section: SectionRef) -> Self {
        ObjectRef::Section(section)
    }
}

impl From<ElementRef> for ObjectRef {
    fn from(element: ElementRef) -> Self {
        ObjectRef::Element(element)
    }
}

impl From<Chunk> for ObjectRef {
    fn from(chunk: Chunk) -> Self {
        ObjectRef::Chunk(chunk)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectRef::Section(s) => write!(f, "section {}", s.index()),
            ObjectRef::Element(e) => {
                write!(f, "element {} of section {}", e.index(), e.section().index())
            }
            ObjectRef::Chunk(c) => {
                write!(
                    f,
                    "chunk {:#x} of section {}",
                    c.offset(),
                    c.section().index()
                )
            }
        }
    }
}

/// Ticket for a reference request that has not been resolved yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingId(u32);

/// A handle to an object in a [Binary].
///
/// `Null` means intentionally absent. `Pending` handles only exist while a
/// file is being read; a [Binary] returned by a reader holds none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SafePointer {
    #[default]
    Null,
    Pending(PendingId),
    Resolved(ObjectRef),
}

impl SafePointer {
    /// A resolved pointer to `object`.
    pub fn to(object: impl Into<ObjectRef>) -> Self {
        SafePointer::Resolved(object.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SafePointer::Null)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, SafePointer::Pending(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, SafePointer::Resolved(_))
    }

    pub fn pending_id(&self) -> Option<PendingId> {
        match self {
            SafePointer::Pending(id) => Some(*id),
            _ => None,
        }
    }

    /// The object pointed at, if resolved.
    pub fn object(&self) -> Option<ObjectRef> {
        match self {
            SafePointer::Resolved(object) => Some(*object),
            _ => None,
        }
    }

    pub fn section(&self) -> Option<SectionRef> {
        match self.object() {
            Some(ObjectRef::Section(section)) => Some(section),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<ElementRef> {
        match self.object() {
            Some(ObjectRef::Element(element)) => Some(element),
            _ => None,
        }
    }

    pub fn chunk(&self) -> Option<Chunk> {
        match self.object() {
            Some(ObjectRef::Chunk(chunk)) => Some(chunk),
            _ => None,
        }
    }

    /// Points this handle at `object`, returning what it pointed at before.
    pub fn replace(&mut self, object: impl Into<ObjectRef>) -> SafePointer {
        std::mem::replace(self, SafePointer::to(object))
    }
}

/// A key kind with its own lookup table in the [ReferenceManager].
pub trait Key: Copy + Ord + fmt::Display + Into<ReferenceKey> {
    #[doc(hidden)]
    fn table(references: &ReferenceManager) -> &BTreeMap<Self, ObjectRef>;
    #[doc(hidden)]
    fn table_mut(references: &mut ReferenceManager) -> &mut BTreeMap<Self, ObjectRef>;
}

macro_rules! key_table {
    ($key:ty, $field:ident) => {
        impl Key for $key {
            fn table(references: &ReferenceManager) -> &BTreeMap<Self, ObjectRef> {
                &references.$field
            }

            fn table_mut(references: &mut ReferenceManager) -> &mut BTreeMap<Self, ObjectRef> {
                &mut references.$field
            }
        }
    };
}

key_table!(SectionKey, sections);
key_table!(SectionIndexKey, indices);
key_table!(SectionOffsetKey, offsets);
key_table!(FileOffsetKey, file_offsets);

#[derive(Clone, Copy, Debug)]
struct Request {
    key: ReferenceKey,
    origin: &'static Location<'static>,
}

/// Key tables and pending requests for one file operation.
#[derive(Debug, Default)]
pub struct ReferenceManager {
    sections: BTreeMap<SectionKey, ObjectRef>,
    indices: BTreeMap<SectionIndexKey, ObjectRef>,
    offsets: BTreeMap<SectionOffsetKey, ObjectRef>,
    file_offsets: BTreeMap<FileOffsetKey, ObjectRef>,
    pending: BTreeMap<PendingId, Request>,
    next_pending: u32,
}

impl ReferenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `object` as the thing identified by `key`.
    ///
    /// Registering the same object twice is allowed. Registering a different
    /// object under a key that is already taken fails with
    /// [Error::KeyAlreadyExists].
    pub fn add_object_reference<K: Key>(
        &mut self,
        key: K,
        object: impl Into<ObjectRef>,
    ) -> Result<()> {
        let object = object.into();
        match K::table(self).get(&key) {
            Some(existing) if *existing != object => Err(Error::KeyAlreadyExists(format!(
                "{key} is registered for {existing}, not {object}"
            ))),
            Some(_) => Ok(()),
            None => {
                K::table_mut(self).insert(key, object);
                Ok(())
            }
        }
    }

    /// Requests a pointer to whatever is registered under `key`.
    ///
    /// If the key is already known the pointer is resolved right away,
    /// otherwise it stays pending until [ReferenceManager::resolve].
    #[track_caller]
    pub fn create<K: Key>(&mut self, key: K) -> SafePointer {
        if let Some(object) = K::table(self).get(&key) {
            return SafePointer::Resolved(*object);
        }

        let id = PendingId(self.next_pending);
        self.next_pending += 1;
        self.pending.insert(
            id,
            Request {
                key: key.into(),
                origin: Location::caller(),
            },
        );
        SafePointer::Pending(id)
    }

    /// The object registered under `key`.
    pub fn lookup<K: Key>(&self, key: K) -> Option<ObjectRef> {
        K::table(self).get(&key).copied()
    }

    fn lookup_any(&self, key: ReferenceKey) -> Option<ObjectRef> {
        match key {
            ReferenceKey::Section(k) => self.lookup(k),
            ReferenceKey::SectionIndex(k) => self.lookup(k),
            ReferenceKey::SectionOffset(k) => self.lookup(k),
            ReferenceKey::FileOffset(k) => self.lookup(k),
        }
    }

    /// The key `object` was registered under, if any.
    pub fn key_for<K: Key>(&self, object: impl Into<ObjectRef>) -> Option<K> {
        let object = object.into();
        K::table(self)
            .iter()
            .find(|(_, registered)| **registered == object)
            .map(|(key, _)| *key)
    }

    /// The identification code a section was registered under.
    pub fn section_id_of(&self, section: SectionRef) -> Option<SectionId> {
        self.key_for::<SectionKey>(section).map(|k| k.section_id())
    }

    /// Number of requests waiting for [ReferenceManager::resolve].
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolves every pending request reachable from `binary` and patches
    /// the pointers that hold them.
    ///
    /// Section offsets with no registered object are taken to be chunks of
    /// the section with that identification code, which must be a raw data
    /// section.
    pub fn resolve(&mut self, binary: &mut Binary) -> Result<()> {
        let live: BTreeSet<PendingId> = binary
            .pointers()
            .into_iter()
            .filter_map(SafePointer::pending_id)
            .collect();
        self.pending.retain(|id, _| live.contains(id));

        let chunk_keys: BTreeSet<SectionOffsetKey> = self
            .pending
            .values()
            .filter_map(|request| match request.key {
                ReferenceKey::SectionOffset(key) if !self.offsets.contains_key(&key) => Some(key),
                _ => None,
            })
            .collect();
        for key in chunk_keys {
            let section = match self.lookup(SectionKey::new(key.section_id())) {
                Some(ObjectRef::Section(section)) => section,
                _ => {
                    return Err(Error::UnresolvedReference(format!(
                        "Cannot find section with identification code {} for {key}",
                        key.section_id()
                    )))
                }
            };
            let chunk = binary.chunk(section, key.offset()).map_err(|e| {
                Error::UnresolvedReference(format!("Cannot create a chunk for {key}: {e}"))
            })?;
            self.add_object_reference(key, chunk)?;
        }

        let mut targets = BTreeMap::new();
        for (id, request) in &self.pending {
            let Some(object) = self.lookup_any(request.key) else {
                return Err(Error::UnresolvedReference(format!(
                    "nothing registered for {} requested at {}",
                    request.key, request.origin
                )));
            };
            targets.insert(*id, object);
        }

        for pointer in binary.pointers_mut() {
            if let SafePointer::Pending(id) = *pointer {
                if let Some(object) = targets.get(&id) {
                    *pointer = SafePointer::Resolved(*object);
                }
            }
        }
        tracing::trace!(count = targets.len(), "resolved references");
        self.pending.clear();
        Ok(())
    }

    /// Forgets every registered key and pending request.
    pub fn cleanup_key_tables(&mut self) {
        self.sections.clear();
        self.indices.clear();
        self.offsets.clear();
        self.file_offsets.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::{SectionElement, SymbolElement};
    use crate::section::{Section, SectionType};

    fn binary_with_data() -> (Binary, SectionRef) {
        let mut binary = Binary::new();
        let mut data = Section::create(SectionType::Data);
        data.set_data(vec![0; 16]);
        let data = binary.add_section(data);
        (binary, data)
    }

    #[test]
    fn test_key_ordering() {
        assert!(SectionIndexKey::new(1, 1) < SectionIndexKey::new(1, 2));
        assert!(SectionIndexKey::new(1, 9) < SectionIndexKey::new(2, 0));
        assert_eq!(SectionOffsetKey::new(3, 4), SectionOffsetKey::new(3, 4));
        assert_ne!(FileOffsetKey::new(1), FileOffsetKey::new(2));
        assert_eq!("section id 2 index 5", SectionIndexKey::new(2, 5).to_string());
    }

    #[test]
    fn test_duplicate_keys() {
        let (mut binary, data) = binary_with_data();
        let other = binary.add_section(Section::create(SectionType::Data));
        let mut references = ReferenceManager::new();

        references
            .add_object_reference(SectionKey::new(1), data)
            .expect("first");
        references
            .add_object_reference(SectionKey::new(1), data)
            .expect("same object again");
        let err = references
            .add_object_reference(SectionKey::new(1), other)
            .expect_err("different object");
        assert!(matches!(err, Error::KeyAlreadyExists(_)));
    }

    #[test]
    fn test_known_keys_resolve_immediately() {
        let (_, data) = binary_with_data();
        let mut references = ReferenceManager::new();
        references
            .add_object_reference(FileOffsetKey::new(26), data)
            .expect("register");

        let pointer = references.create(FileOffsetKey::new(26));
        assert_eq!(Some(data), pointer.section());
        assert_eq!(0, references.pending_count());
        assert_eq!(
            Some(FileOffsetKey::new(26)),
            references.key_for::<FileOffsetKey>(data)
        );
        assert_eq!(None, references.key_for::<SectionKey>(data));
    }

    #[test]
    fn test_forward_references() {
        let (mut binary, data) = binary_with_data();
        let mut references = ReferenceManager::new();

        let symtab = binary.add_section(Section::create(SectionType::SymTab));
        let mut symbol = SymbolElement::undefined();
        symbol.set_section(references.create(SectionKey::new(7)));
        symbol.set_name(references.create(SectionOffsetKey::new(7, 4)));
        binary.section_mut(symtab).add_element(symbol);
        assert_eq!(2, references.pending_count());

        references
            .add_object_reference(SectionKey::new(7), data)
            .expect("register");
        references.resolve(&mut binary).expect("resolve");

        let element = binary
            .section(symtab)
            .element(0)
            .and_then(SectionElement::as_symbol)
            .expect("symbol");
        assert_eq!(Some(data), element.section().section());
        let chunk = element.name().chunk().expect("chunk");
        assert_eq!(4, chunk.offset());
        assert_eq!(data, chunk.section());
        assert_eq!(0, references.pending_count());
    }

    #[test]
    fn test_unresolved_references() {
        let (mut binary, data) = binary_with_data();
        let mut references = ReferenceManager::new();
        let pointer = references.create(SectionIndexKey::new(2, 3));
        binary.section_mut(data).set_link(pointer);

        let err = references.resolve(&mut binary).expect_err("unresolved");
        assert!(matches!(err, Error::UnresolvedReference(_)));
        assert!(err.to_string().contains("section id 2 index 3"));
    }

    #[test]
    fn test_offsets_need_raw_sections() {
        let mut binary = Binary::new();
        let symtab = binary.add_section(Section::create(SectionType::SymTab));
        let mut references = ReferenceManager::new();
        references
            .add_object_reference(SectionKey::new(1), symtab)
            .expect("register");
        let pointer = references.create(SectionOffsetKey::new(1, 0));
        binary.section_mut(symtab).set_name(pointer);

        let err = references.resolve(&mut binary).expect_err("not chunkable");
        assert!(matches!(err, Error::UnresolvedReference(_)));

        let mut binary = Binary::new();
        let mut references = ReferenceManager::new();
        let section = binary.add_section(Section::create(SectionType::Data));
        let pointer = references.create(SectionOffsetKey::new(9, 0));
        binary.section_mut(section).set_name(pointer);
        let err = references.resolve(&mut binary).expect_err("no section");
        assert!(err.to_string().contains("identification code 9"));
    }

    #[test]
    fn test_same_offset_same_chunk() {
        let (mut binary, data) = binary_with_data();
        let mut references = ReferenceManager::new();
        references
            .add_object_reference(SectionKey::new(1), data)
            .expect("register");

        let symtab = binary.add_section(Section::create(SectionType::SymTab));
        for _ in 0..2 {
            let mut symbol = SymbolElement::undefined();
            symbol.set_name(references.create(SectionOffsetKey::new(1, 8)));
            binary.section_mut(symtab).add_element(symbol);
        }
        references.resolve(&mut binary).expect("resolve");

        let names: Vec<_> = binary
            .section(symtab)
            .elements()
            .iter()
            .filter_map(SectionElement::as_symbol)
            .map(|s| s.name())
            .collect();
        assert_eq!(names[0], names[1]);
        assert_eq!(1, binary.section(data).chunk_offsets().count());
    }

    #[test]
    fn test_dropped_requests_are_ignored() {
        let (mut binary, _) = binary_with_data();
        let mut references = ReferenceManager::new();
        let _unused = references.create(SectionKey::new(42));
        assert_eq!(1, references.pending_count());
        references.resolve(&mut binary).expect("nothing live");
        assert_eq!(0, references.pending_count());
    }

    #[test]
    fn test_cleanup_key_tables() {
        let (_, data) = binary_with_data();
        let mut references = ReferenceManager::new();
        references
            .add_object_reference(SectionKey::new(1), data)
            .expect("register");
        let _pending = references.create(SectionKey::new(2));
        references.cleanup_key_tables();

        assert_eq!(None, references.lookup(SectionKey::new(1)));
        assert_eq!(0, references.pending_count());
        assert!(references.create(SectionKey::new(1)).is_pending());
    }

    #[test]
    fn test_replace() {
        let (mut binary, data) = binary_with_data();
        let other = binary.add_section(Section::create(SectionType::UData));
        let mut pointer = SafePointer::to(data);
        let old = pointer.replace(other);
        assert_eq!(Some(data), old.section());
        assert_eq!(Some(other), pointer.section());
        assert!(SafePointer::default().is_null());
    }
}
