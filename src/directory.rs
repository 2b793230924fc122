//! Generic data-directory interface: decouples specific directory
//! payloads (exports, imports, resources, the architecture-specific
//! exception table variants, ...) from the commit pipeline. See spec
//! 4.5 and design note "Polymorphic data directories" (9): inheritance
//! is replaced with a tagged sum dispatched through one operation.
//!
//! This crate ships no production export/import/resource codecs
//! (spec section 1 scopes payload parsing out); it ships only this
//! interface plus, under `#[cfg(test)]`, the minimal fixtures needed
//! to exercise the commit pipeline end-to-end.

use crate::error::Result;
use crate::patch::PatchGraph;
use crate::section::SectionId;
use crate::section_manager::SectionManager;

/// The 15 fixed data-directory slots in the optional header, in their
/// on-disk order (spec section 6 / GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorySlot {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    Certificate = 4,
    BaseReloc = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    Clr = 14,
}

pub const NUM_DATA_DIRECTORIES: usize = 15;

/// Where a serialized directory ended up: what the optional header's
/// data directory array records for its slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryLocation {
    pub virtual_address: u32,
    pub size: u32,
}

/// A data-directory payload. The object model is agnostic to what a
/// payload means (export table, resource tree, ...); it only demands
/// that every payload can place itself into a section and register
/// whatever cross-section patches its internal references require.
pub trait DataDirectoryPayload {
    /// Allocates space for this directory's on-disk layout in
    /// `target`, writes its bytes, and registers placed-offsets (via
    /// `patches`) for every internal cross-reference the payload
    /// carries (an export's function pointer, a resource leaf's data
    /// pointer, ...). Returns the directory's own location, recorded
    /// verbatim into the optional header's data directory array.
    fn serialize_into(
        &self,
        target: SectionId,
        sections: &mut SectionManager,
        patches: &mut PatchGraph,
        image_base: u64,
    ) -> Result<DirectoryLocation>;
}

struct DirectoryEntry {
    slot: DirectorySlot,
    payload: Box<dyn DataDirectoryPayload>,
}

/// The set of directories one image carries. Dispatch is uniform
/// regardless of how many concrete payload types are registered.
#[derive(Default)]
pub struct DirectoryTable {
    entries: Vec<DirectoryEntry>,
}

impl DirectoryTable {
    pub fn new() -> Self {
        DirectoryTable::default()
    }

    /// Registers `payload` for `slot`, replacing any prior payload
    /// already registered there.
    pub fn insert(&mut self, slot: DirectorySlot, payload: Box<dyn DataDirectoryPayload>) {
        self.entries.retain(|e| e.slot != slot);
        self.entries.push(DirectoryEntry { slot, payload });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs `serialize_into` on every registered payload, targeting
    /// `target` for all of them (spec 4.6 step 1), returning each
    /// slot's resulting location in registration order.
    pub fn serialize_all(
        &self,
        target: SectionId,
        sections: &mut SectionManager,
        patches: &mut PatchGraph,
        image_base: u64,
    ) -> Result<Vec<(DirectorySlot, DirectoryLocation)>> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let loc = entry
                .payload
                .serialize_into(target, sections, patches, image_base)?;
            out.push((entry.slot, loc));
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Minimal `DataDirectoryPayload` implementations used only by
    //! this crate's own tests to exercise the commit pipeline, per
    //! spec section 8 scenarios 2 and 6. Not part of the public API.

    use super::*;
    use crate::patch::PatchKind;

    /// A single-export directory: one named function at a fixed RVA,
    /// ordinal base 1. Lays out `IMAGE_EXPORT_DIRECTORY`'s three
    /// parallel arrays (address/name/ordinal) with one entry each,
    /// plus the name string, enough to exercise `DataDirectory[0]`.
    pub struct SingleExportStub {
        pub name: &'static str,
        pub function_target: SectionId,
        pub function_offset: usize,
    }

    impl DataDirectoryPayload for SingleExportStub {
        fn serialize_into(
            &self,
            target: SectionId,
            sections: &mut SectionManager,
            patches: &mut PatchGraph,
            _image_base: u64,
        ) -> Result<DirectoryLocation> {
            // Layout: [header: 40][address_table: 4][name_table: 4]
            // [ordinal_table: 2][name bytes + NUL].
            let name_bytes = self.name.as_bytes();
            let layout_size = 40 + 4 + 4 + 2 + name_bytes.len() + 1;
            let base = sections.section_mut(target)?.allocate(layout_size, 4)?;

            let address_table_off = base + 40;
            let name_table_off = address_table_off + 4;
            let ordinal_table_off = name_table_off + 4;
            let name_str_off = ordinal_table_off + 2;

            {
                let section = sections.section_mut(target)?;
                section.write_bytes(name_str_off, name_bytes)?;
                section.write_bytes(name_str_off + name_bytes.len(), &[0u8])?;
                section.write_bytes(ordinal_table_off, &0u16.to_le_bytes())?;

                let mut header = [0u8; 40];
                header[12..16].copy_from_slice(&0u32.to_le_bytes()); // name RVA patched below
                header[16..20].copy_from_slice(&1u32.to_le_bytes()); // ordinal base
                header[20..24].copy_from_slice(&1u32.to_le_bytes()); // address table entries
                header[24..28].copy_from_slice(&1u32.to_le_bytes()); // name pointer entries
                section.write_bytes(base, &header)?;
            }

            patches.register(
                target,
                address_table_off,
                self.function_target,
                self.function_offset,
                PatchKind::Rva32,
            );
            patches.register(target, name_table_off, target, name_str_off, PatchKind::Rva32);

            Ok(DirectoryLocation {
                virtual_address: sections.section(target)?.vaddr() + base as u32,
                size: layout_size as u32,
            })
        }
    }

    /// A two-level resource tree: a root directory with one
    /// name-keyed entry `"MAIN"`, beneath it one id-keyed entry `10`
    /// pointing at a data leaf. Enough to exercise scenario 6.
    pub struct TinyResourceTree {
        pub name_entry: &'static str,
        pub id_entry: u16,
        pub blob: Vec<u8>,
    }

    const DIR_HEADER_SIZE: usize = 16;
    const DIR_ENTRY_SIZE: usize = 8;
    const DATA_ENTRY_SIZE: usize = 16;

    impl DataDirectoryPayload for TinyResourceTree {
        fn serialize_into(
            &self,
            target: SectionId,
            sections: &mut SectionManager,
            patches: &mut PatchGraph,
            _image_base: u64,
        ) -> Result<DirectoryLocation> {
            let name_utf16: Vec<u16> = self.name_entry.encode_utf16().collect();
            let name_blob_size = 2 + name_utf16.len() * 2;

            let root_off = sections.section_mut(target)?.allocate(DIR_HEADER_SIZE + DIR_ENTRY_SIZE, 4)?;
            let sub_off = sections.section_mut(target)?.allocate(DIR_HEADER_SIZE + DIR_ENTRY_SIZE, 4)?;
            let name_off = sections.section_mut(target)?.allocate(name_blob_size, 2)?;
            let data_entry_off = sections.section_mut(target)?.allocate(DATA_ENTRY_SIZE, 4)?;
            let blob_off = sections.section_mut(target)?.allocate(self.blob.len().max(1), 1)?;

            {
                let section = sections.section_mut(target)?;
                section.write_bytes(root_off + DIR_HEADER_SIZE, &0u32.to_le_bytes())?; // name RVA patched
                section.write_bytes(root_off + DIR_HEADER_SIZE + 4, &(0x8000_0000u32 | sub_off as u32).to_le_bytes())?;

                section.write_bytes(sub_off + DIR_HEADER_SIZE, &(self.id_entry as u32).to_le_bytes())?;
                section.write_bytes(sub_off + DIR_HEADER_SIZE + 4, &(data_entry_off as u32).to_le_bytes())?;

                section.write_bytes(name_off, &(name_utf16.len() as u16).to_le_bytes())?;
                for (i, unit) in name_utf16.iter().enumerate() {
                    section.write_bytes(name_off + 2 + i * 2, &unit.to_le_bytes())?;
                }

                section.write_bytes(data_entry_off + 4, &(self.blob.len() as u32).to_le_bytes())?;
                if !self.blob.is_empty() {
                    section.write_bytes(blob_off, &self.blob)?;
                }
            }

            patches.register(target, root_off + DIR_HEADER_SIZE, target, name_off, PatchKind::Rva32);
            patches.register(target, data_entry_off, target, blob_off, PatchKind::Rva32);

            Ok(DirectoryLocation {
                virtual_address: sections.section(target)?.vaddr() + root_off as u32,
                size: (DIR_HEADER_SIZE + DIR_ENTRY_SIZE) as u32,
            })
        }
    }

    #[test]
    fn export_stub_registers_two_patches_and_a_location() {
        let mut sections = SectionManager::new(0x1000);
        let mut patches = PatchGraph::new();
        let text = sections.add_section(*b".text\0\0\0", 0, 0x10);
        let dir_section = sections.add_section(*b".edata\0\0", 0, 0x100);

        let stub = SingleExportStub {
            name: "Foo",
            function_target: text,
            function_offset: 0,
        };
        let loc = stub
            .serialize_into(dir_section, &mut sections, &mut patches, 0x1000_0000)
            .unwrap();
        assert_eq!(loc.virtual_address, sections.section(dir_section).unwrap().vaddr());
        assert_eq!(patches.len(), 2);
    }

    #[test]
    fn resource_tree_round_trips_blob_bytes() {
        let mut sections = SectionManager::new(0x1000);
        let mut patches = PatchGraph::new();
        let rsrc = sections.add_section(*b".rsrc\0\0\0", 0, 0x200);

        let tree = TinyResourceTree {
            name_entry: "MAIN",
            id_entry: 10,
            blob: vec![0xAB; 128],
        };
        tree.serialize_into(rsrc, &mut sections, &mut patches, 0).unwrap();
        patches.write(&mut sections, 0).unwrap();
        sections.section_mut(rsrc).unwrap().finalize(None);

        let raw = sections.section(rsrc).unwrap().raw_data().to_vec();
        assert!(
            raw.windows(128).any(|w| w == vec![0xABu8; 128].as_slice()),
            "serialized section should contain the blob bytes verbatim"
        );
    }
}
