// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

//! Reading and writing whole files.
//!
//! ```no_run
//! use std::path::Path;
//! use tpef::io;
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//! let binary = io::read(Path::new("program.aout"))?;
//! io::write(&binary, Path::new("program.tpef"))?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use anyhow::{Context, Result};

use crate::reader;
use crate::stream::BinaryStream;
use crate::tpef::TpefWriter;
use crate::writer::FormatWriter;
use crate::Binary;

/// Reads a [Binary] of any supported format from `stream`.
pub fn read_binary(stream: &mut BinaryStream) -> Result<Binary> {
    let name = stream.name();
    let reader = reader::find_reader(stream)?;
    reader
        .read_binary(stream)
        .with_context(|| format!("reading {} as {}", name, reader.format_name()))
}

/// Reads the [Binary] in the file at `path`.
pub fn read(path: &Path) -> Result<Binary> {
    let mut stream = BinaryStream::open(path);
    read_binary(&mut stream)
}

/// Writes `binary` to `stream` as TPEF.
pub fn write_binary(binary: &Binary, stream: &mut BinaryStream) -> Result<()> {
    TpefWriter
        .write_binary(stream, binary)
        .with_context(|| format!("writing {} as {}", stream.name(), TpefWriter.format_name()))
}

/// Writes `binary` to the file at `path` as TPEF, replacing it.
pub fn write(binary: &Binary, path: &Path) -> Result<()> {
    let mut stream = BinaryStream::open(path);
    write_binary(binary, &mut stream)
}
