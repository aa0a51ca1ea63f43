// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! TTA Program Exchange Format Reader and Writer
//!
//! This crate reads object files of the TTA (transport triggered
//! architecture) toolchain into an in-memory [Binary] and writes them back
//! out as TPEF.
//!
//! # Overview
//!
//! Two input formats are understood:
//!
//! - **TPEF**: the TTA program exchange format, sections of code, data,
//!   symbols, relocations and debug information that refer to each other by
//!   section id, index and offset
//! - **a.out**: the old impure format produced by the first TTA compiler,
//!   converted into the same model on read
//!
//! While a file is read, every cross reference is requested through a
//! [ReferenceManager](reference::ReferenceManager) by key and resolved into a
//! [SafePointer](reference::SafePointer) once the whole file is in memory, so
//! sections may refer to sections that come later in the file.
//!
//! # Quick Start
//!
//! Converting an a.out file to TPEF:
//!
//! ```no_run
//! use std::path::Path;
//! use tpef::io;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let binary = io::read(Path::new("program.aout"))?;
//!     println!("{binary}");
//!     io::write(&binary, Path::new("program.tpef"))?;
//!     Ok(())
//! }
//! ```
//!
//! Building a binary in memory:
//!
//! ```
//! use tpef::element::ASpaceElement;
//! use tpef::section::{Section, SectionType};
//! use tpef::stream::BinaryStream;
//! use tpef::{io, Binary};
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//! let mut binary = Binary::new();
//! let aspaces = binary.add_section(Section::create(SectionType::AddrSp));
//! binary
//!     .section_mut(aspaces)
//!     .add_element(ASpaceElement::new(8, 1, 32));
//!
//! let mut stream = BinaryStream::in_memory();
//! io::write_binary(&binary, &mut stream)?;
//! # Ok(())
//! # }
//! ```

pub mod aout;
pub mod binary;
pub mod display;
pub mod element;
pub mod error;
pub mod io;
pub mod reader;
pub mod reference;
pub mod relocation;
pub mod section;
pub mod stream;
pub mod tpef;
pub mod writer;

pub use binary::Binary;
pub use error::{Error, Result};
