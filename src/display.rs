// SPDX-FileCopyrightText: © 2025 TTKB, LLC
// SPDX-License-Identifier: BSD-3-CLAUSE

use std::default::Default;
use std::fmt::{Display, Formatter, Result};

/// How raw section payloads are shown.
#[derive(Clone, Default)]
pub enum DataFormat {
    #[default]
    None,
    Hex,
}

/// Options for dumping a [Binary](crate::Binary).
#[derive(Clone, Default)]
pub struct Options {
    /// How to show the bytes of raw sections
    pub data_format: DataFormat,

    /// Whether or not to list the elements of each section
    pub elements: bool,

    /// Level to indent
    pub indent_level: u8,
}

impl Options {
    pub fn indent(&self) -> Self {
        let mut o = self.clone();
        o.indent_level += 1;
        o
    }

    pub fn write_indent(&self, f: &mut Formatter) -> Result {
        write!(f, "{:width$}", "", width = 4 * (self.indent_level as usize))
    }
}

/// Display something with options.
pub trait DisplayWithOptions: Display {
    fn fmt_with_options(&self, f: &mut Formatter<'_>, _options: &Options) -> Result {
        self.fmt(f)
    }
}

/// Pairs a value with the [Options] to display it with.
pub struct Displayable<'a, P: DisplayWithOptions> {
    p: &'a P,
    options: Options,
}

impl<'a, P> Displayable<'a, P>
where
    P: DisplayWithOptions,
{
    pub fn wrap(p: &'a P, options: Options) -> Displayable<'a, P> {
        Self { p, options }
    }
}

impl<P> Display for Displayable<'_, P>
where
    P: DisplayWithOptions,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.p.fmt_with_options(f, &self.options)
    }
}
