//! On-disk PE/COFF wire structs: the DOS header and stub, the COFF
//! file header, the optional header (PE32 and PE32+), the section
//! table, the data directory array, and base relocation blocks.
//!
//! Everything here is pure wire format — byte layout, magic numbers,
//! characteristic flags — with no notion of the live object model
//! `crate::image`/`crate::section_manager` build on top of it. Keeping
//! the split this way mirrors how a linker's own on-disk-structs
//! header is kept free of its in-memory symbol table.

pub mod coff;
pub mod data_directories;
pub mod dos;
pub mod optional_header;
pub mod reloc;
pub mod section_table;
