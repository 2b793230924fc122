//! End-to-end scenarios against the public `ImageLayout` surface:
//! build an image in memory, commit it, and read the produced bytes
//! back with the on-disk wire structs directly (not through any
//! parser convenience this crate doesn't ship).

use pe_forge::directory::DirectorySlot;
use pe_forge::image::ImageLayout;
use pe_forge::patch::PatchKind;
use pe_forge::pe::coff::{self, IMAGE_FILE_DLL, IMAGE_FILE_EXECUTABLE_IMAGE};
use pe_forge::pe::dos::{DosHeader, PE_MAGIC};
use pe_forge::pe::optional_header::OptionalHeader;
use pe_forge::pe::reloc::{self, IMAGE_REL_BASED_DIR64};
use pe_forge::pe::section_table::{
    SectionTable, IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE,
    IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE, SIZEOF_SECTION_TABLE,
};

fn section_name(s: &str) -> [u8; 8] {
    let mut n = [0u8; 8];
    n[..s.len()].copy_from_slice(s.as_bytes());
    n
}

/// Re-reads the COFF header, optional header, and on-disk section
/// table out of a committed image, returning `(coff_header,
/// optional_header, sections, section_table_offset)`.
fn read_sections(bytes: &[u8]) -> (coff::CoffHeader, OptionalHeader, Vec<SectionTable>, usize) {
    use scroll::Pread;

    let (_dos, _stub, pe_pointer) = DosHeader::parse(bytes).unwrap();
    let coff_offset = pe_pointer as usize + 4;
    let coff_header: coff::CoffHeader = bytes.pread_with(coff_offset, scroll::LE).unwrap();
    let optional_header_offset = coff_offset + coff::SIZEOF_COFF_HEADER;
    let (optional, consumed) = OptionalHeader::parse(&bytes[optional_header_offset..]).unwrap();
    let section_table_offset = optional_header_offset + consumed;

    let mut sections = Vec::with_capacity(coff_header.number_of_sections as usize);
    let mut offset = section_table_offset;
    for _ in 0..coff_header.number_of_sections {
        let table: SectionTable = bytes.pread_with(offset, scroll::LE).unwrap();
        sections.push(table);
        offset += SIZEOF_SECTION_TABLE;
    }
    (coff_header, optional, sections, section_table_offset)
}

#[test]
fn round_trip_empty_dll() {
    let mut image = ImageLayout::new(0x1000_0000, 0x1000, 0x200, false).unwrap();
    image.characteristics = IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_DLL;

    let text = image.sections.add_section(
        section_name(".text"),
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        16,
    );
    let reloc = image
        .sections
        .add_section(*b".reloc\0\0", IMAGE_SCN_CNT_INITIALIZED_DATA, 0);
    let code = [0x90u8; 16];
    let off = image.sections.section_mut(text).unwrap().allocate(16, 1).unwrap();
    image.sections.section_mut(text).unwrap().write_bytes(off, &code).unwrap();

    let bytes = image.commit(text, reloc).unwrap();

    assert_eq!(&bytes[0..2], b"MZ");
    let (_dos, _stub, pe_pointer) = DosHeader::parse(&bytes).unwrap();
    let pe_magic: u32 = {
        use scroll::Pread;
        bytes.pread_with(pe_pointer as usize, scroll::LE).unwrap()
    };
    assert_eq!(pe_magic, PE_MAGIC);

    let (coff_header, _optional, sections, _) = read_sections(&bytes);
    assert_eq!(coff_header.characteristics & IMAGE_FILE_DLL, IMAGE_FILE_DLL);
    assert_eq!(sections.len(), 2);

    let text_table = sections.iter().find(|s| s.name == section_name(".text")).unwrap();
    assert_eq!(text_table.virtual_size, 16);
    let raw_start = text_table.pointer_to_raw_data as usize;
    let raw_end = raw_start + text_table.virtual_size as usize;
    assert_eq!(&bytes[raw_start..raw_end], &code[..]);
}

#[test]
fn cross_section_rva_patch_resolves_on_reload() {
    let mut image = ImageLayout::new(0x1000_0000, 0x1000, 0x200, false).unwrap();
    let text = image.sections.add_section(
        section_name(".text"),
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        0x10,
    );
    let data = image.sections.add_section(
        section_name(".data"),
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
        8,
    );
    let reloc = image
        .sections
        .add_section(*b".reloc\0\0", IMAGE_SCN_CNT_INITIALIZED_DATA, 0);

    image.sections.section_mut(text).unwrap().allocate(0x10, 1).unwrap();
    let patch_off = image.sections.section_mut(data).unwrap().allocate(8, 4).unwrap();
    image
        .patches
        .register(data, patch_off + 4, text, 0x8, PatchKind::Rva32);

    let text_vaddr_before = image.sections.section(text).unwrap().vaddr();
    let bytes = image.commit(text, reloc).unwrap();

    let (_coff, _optional, sections, _) = read_sections(&bytes);
    let text_table = sections.iter().find(|s| s.name == section_name(".text")).unwrap();
    assert_eq!(text_table.virtual_address, text_vaddr_before);

    let data_table = sections.iter().find(|s| s.name == section_name(".data")).unwrap();
    let patched_start = data_table.pointer_to_raw_data as usize + patch_off + 4;
    let rva = u32::from_le_bytes(bytes[patched_start..patched_start + 4].try_into().unwrap());
    assert_eq!(rva, text_table.virtual_address + 0x8);
}

#[test]
fn relocation_emission_produces_dir64_block() {
    let mut image = ImageLayout::new(0x1_4000_0000, 0x1000, 0x200, true).unwrap();
    let text = image
        .sections
        .add_section(section_name(".text"), IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE, 0x1000);
    let data = image
        .sections
        .add_section(section_name(".data"), IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_WRITE, 0x1000);
    let reloc = image
        .sections
        .add_section(*b".reloc\0\0", IMAGE_SCN_CNT_INITIALIZED_DATA, 0);

    image.sections.section_mut(text).unwrap().allocate(0x1000, 1).unwrap();
    image.sections.section_mut(data).unwrap().allocate(0x1000, 1).unwrap();
    image
        .patches
        .register(text, 0x100, data, 0x200, PatchKind::Va64);

    let text_vaddr = image.sections.section(text).unwrap().vaddr();
    let data_vaddr = image.sections.section(data).unwrap().vaddr();
    let bytes = image.commit(text, reloc).unwrap();

    let (_coff, optional, sections, _) = read_sections(&bytes);
    let text_table = sections.iter().find(|s| s.name == section_name(".text")).unwrap();
    let reloc_table = sections.iter().find(|s| s.name == *b".reloc\0\0").unwrap();

    let patched_off = text_table.pointer_to_raw_data as usize + 0x100;
    let value = u64::from_le_bytes(bytes[patched_off..patched_off + 8].try_into().unwrap());
    assert_eq!(value, 0x1_4000_0000 + data_vaddr as u64 + 0x200);

    let reloc_start = reloc_table.pointer_to_raw_data as usize;
    let reloc_end = reloc_start + reloc_table.virtual_size as usize;
    let parsed = reloc::parse_blocks(&bytes[reloc_start..reloc_end]).unwrap();
    assert!(parsed
        .iter()
        .any(|r| r.rva == text_vaddr + 0x100 && r.kind == IMAGE_REL_BASED_DIR64));

    // DataDirectory[5] (base reloc) must point at the .reloc section's
    // own bytes, not be left zeroed, or a loader has no way to find
    // the block this test just verified above.
    let base_reloc_dir = optional
        .data_directories
        .get(DirectorySlot::BaseReloc as usize)
        .expect("base reloc data directory must be populated");
    assert_eq!(base_reloc_dir.virtual_address, reloc_table.virtual_address);
    assert_eq!(base_reloc_dir.size as usize, reloc_table.virtual_size as usize);
}
