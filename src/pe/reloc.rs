//! Base relocation block reader/writer.
//!
//! A block is an `IMAGE_BASE_RELOCATION` header (page RVA + block
//! size) followed by a run of 2-byte packed entries. Per spec open
//! question 2, entries are read/written as an explicit masked `u16`
//! rather than a bitfield struct, sidestepping any compiler-dependent
//! field-packing order the source's comment warned about.

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::patch::PatchKind;

pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
#[derive(Pread, Pwrite, SizeWith)]
pub struct BaseRelocationBlockHeader {
    pub virtual_address: u32,
    pub size_of_block: u32,
}

pub const SIZEOF_BASE_RELOCATION_BLOCK_HEADER: usize = 8;

/// One packed relocation entry: bits `0..=11` are the offset within
/// the block's page, bits `12..=15` are the relocation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseRelocationEntry(pub u16);

impl BaseRelocationEntry {
    pub fn new(offset_in_page: u16, reloc_type: u16) -> Self {
        debug_assert!(offset_in_page < 0x1000, "relocation offset must fit in 12 bits");
        BaseRelocationEntry(((reloc_type & 0xF) << 12) | (offset_in_page & 0x0FFF))
    }

    pub fn offset(self) -> u16 {
        self.0 & 0x0FFF
    }

    pub fn kind(self) -> u16 {
        self.0 >> 12
    }
}

/// Maps a patch kind to its relocation type. `Rva32` is never passed
/// here: RVA-kind patches do not emit relocations (spec 4.4).
pub fn relocation_type_for(kind: PatchKind) -> u16 {
    match kind {
        PatchKind::Va32 => IMAGE_REL_BASED_HIGHLOW,
        PatchKind::Va64 => IMAGE_REL_BASED_DIR64,
        PatchKind::Rva32 => IMAGE_REL_BASED_ABSOLUTE,
    }
}

/// Groups `(rva, kind)` relocation sites into 4 KiB page-aligned
/// blocks and serializes them back to back. Blocks with an odd entry
/// count are padded with an `IMAGE_REL_BASED_ABSOLUTE` entry so every
/// block ends on a 4-byte boundary, matching the linker convention.
pub fn build_blocks(sites: &[(u32, PatchKind)]) -> Result<Vec<u8>> {
    use std::collections::BTreeMap;

    let mut pages: BTreeMap<u32, Vec<BaseRelocationEntry>> = BTreeMap::new();
    for &(rva, kind) in sites {
        let page = rva & !0xFFF;
        let offset = (rva & 0xFFF) as u16;
        pages
            .entry(page)
            .or_default()
            .push(BaseRelocationEntry::new(offset, relocation_type_for(kind)));
    }

    for entries in pages.values_mut() {
        if entries.len() % 2 != 0 {
            entries.push(BaseRelocationEntry::new(0, IMAGE_REL_BASED_ABSOLUTE));
        }
    }
    let total_len: usize = pages
        .values()
        .map(|entries| SIZEOF_BASE_RELOCATION_BLOCK_HEADER + entries.len() * 2)
        .sum();

    let mut out = vec![0u8; total_len];
    let mut offset = 0usize;
    for (page, entries) in pages {
        let header = BaseRelocationBlockHeader {
            virtual_address: page,
            size_of_block: (SIZEOF_BASE_RELOCATION_BLOCK_HEADER + entries.len() * 2) as u32,
        };
        offset += out.pwrite_with(header, offset, scroll::LE)?;
        for entry in entries {
            offset += out.pwrite_with(entry.0, offset, scroll::LE)?;
        }
    }
    Ok(out)
}

/// One decoded relocation, with its block's page folded back into an
/// absolute RVA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRelocation {
    pub rva: u32,
    pub kind: u16,
}

/// Reads back every block in `bytes` (the full `.reloc` section
/// content) into a flat list of decoded entries, skipping the padding
/// `IMAGE_REL_BASED_ABSOLUTE` entries blocks may carry.
pub fn parse_blocks(bytes: &[u8]) -> Result<Vec<ParsedRelocation>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + SIZEOF_BASE_RELOCATION_BLOCK_HEADER <= bytes.len() {
        let header: BaseRelocationBlockHeader = bytes.pread_with(offset, scroll::LE)?;
        if header.size_of_block < SIZEOF_BASE_RELOCATION_BLOCK_HEADER as u32 {
            return Err(Error::InvalidFormat(
                "base relocation block size smaller than its own header".into(),
            ));
        }
        let entry_count = (header.size_of_block as usize - SIZEOF_BASE_RELOCATION_BLOCK_HEADER) / 2;
        let mut cursor = offset + SIZEOF_BASE_RELOCATION_BLOCK_HEADER;
        for _ in 0..entry_count {
            let raw: u16 = bytes.pread_with(cursor, scroll::LE)?;
            cursor += 2;
            let entry = BaseRelocationEntry(raw);
            if entry.kind() != IMAGE_REL_BASED_ABSOLUTE as u16 {
                out.push(ParsedRelocation {
                    rva: header.virtual_address + entry.offset() as u32,
                    kind: entry.kind(),
                });
            }
        }
        offset += header.size_of_block as usize;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_and_unpacks_offset_and_type() {
        let e = BaseRelocationEntry::new(0x248, IMAGE_REL_BASED_DIR64);
        assert_eq!(e.offset(), 0x248);
        assert_eq!(e.kind(), IMAGE_REL_BASED_DIR64);
    }

    #[test]
    fn build_and_parse_round_trip() {
        let sites = vec![
            (0x1100u32, PatchKind::Va64),
            (0x1204u32, PatchKind::Va32),
            (0x3050u32, PatchKind::Va64),
        ];
        let bytes = build_blocks(&sites).unwrap();
        let parsed = parse_blocks(&bytes).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(parsed.iter().any(|r| r.rva == 0x1100 && r.kind == IMAGE_REL_BASED_DIR64));
        assert!(parsed.iter().any(|r| r.rva == 0x1204 && r.kind == IMAGE_REL_BASED_HIGHLOW));
        assert!(parsed.iter().any(|r| r.rva == 0x3050 && r.kind == IMAGE_REL_BASED_DIR64));
    }

    #[test]
    fn odd_entry_count_block_is_padded_to_four_bytes() {
        let sites = vec![(0x1000u32, PatchKind::Va64)];
        let bytes = build_blocks(&sites).unwrap();
        assert_eq!(bytes.len() % 4, 0);
    }
}
