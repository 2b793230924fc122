//! The top-level object model for one PE image: a [`SectionManager`]
//! plus the DOS/COFF/optional-header fields that live outside any
//! section, the registered data directories, and the patch graph tying
//! it all together. [`ImageLayout::commit`] runs the six-step pipeline
//! of spec 4.6 and returns the finished file bytes.

use log::debug;
use scroll::Pwrite;

use crate::directory::DirectoryTable;
use crate::error::{Error, Result};
use crate::patch::PatchGraph;
use crate::pe::coff::{CoffHeader, IMAGE_FILE_EXECUTABLE_IMAGE};
use crate::pe::data_directories::{DataDirectories, DataDirectory, NUM_DATA_DIRECTORIES as PE_NUM_DATA_DIRECTORIES};
use crate::pe::dos::{DosHeader, DosStub, PE_MAGIC};
use crate::pe::optional_header::{MAGIC_32, MAGIC_64, StandardFields, WindowsFields};
use crate::pe::reloc;
use crate::pe::section_table::{
    SectionTable, IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA,
    IMAGE_SCN_CNT_UNINITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
    IMAGE_SCN_MEM_WRITE, SIZEOF_SECTION_TABLE,
};
use crate::section::SectionId;
use crate::section_manager::SectionManager;

/// Raw, file-space-only payload (certificates, bound imports) appended
/// after the section region at commit time. This crate never
/// interprets the bytes, per spec 4.6's "file vs. section storage".
pub struct OpaquePayload {
    pub data_directory_slot: Option<usize>,
    pub bytes: Vec<u8>,
}

/// Everything needed to serialize one PE image, short of the bytes
/// `commit()` produces.
pub struct ImageLayout {
    pub sections: SectionManager,
    pub patches: PatchGraph,
    pub directories: DirectoryTable,

    pub dos_header: DosHeader,
    pub dos_stub: DosStub,
    pub machine: u16,
    pub characteristics: u16,
    pub is_pe32_plus: bool,

    pub image_base: u64,
    pub file_alignment: u32,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,

    /// Where execution begins, as an offset into a section rather than
    /// a bare RVA: resolved against the section's (possibly still
    /// moving) virtual address at commit time.
    pub entry_point: Option<(SectionId, usize)>,

    /// File-space-only payloads, appended after the section region in
    /// registration order.
    pub opaque_payloads: Vec<OpaquePayload>,
}

impl ImageLayout {
    /// A fresh image with sane defaults (PE32+, 0x1000 section
    /// alignment, 0x200 file alignment, the stock DOS stub), ready for
    /// `add_section`/directory registration.
    pub fn new(image_base: u64, section_alignment: u32, file_alignment: u32, is_pe32_plus: bool) -> Result<Self> {
        if image_base % 0x1000 != 0 {
            return Err(Error::InvalidFormat(format!(
                "image base {image_base:#x} is not page-aligned"
            )));
        }
        Ok(ImageLayout {
            sections: SectionManager::new(section_alignment),
            patches: PatchGraph::new(),
            directories: DirectoryTable::new(),
            dos_header: DosHeader::new(),
            dos_stub: DosStub::default(),
            machine: crate::pe::coff::COFF_MACHINE_X86_64,
            characteristics: IMAGE_FILE_EXECUTABLE_IMAGE,
            is_pe32_plus,
            image_base,
            file_alignment,
            major_linker_version: 0,
            minor_linker_version: 0,
            major_os_version: 6,
            minor_os_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            subsystem: crate::pe::optional_header::IMAGE_SUBSYSTEM_WINDOWS_CUI,
            dll_characteristics: 0,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            entry_point: None,
            opaque_payloads: Vec::new(),
        })
    }

    fn standard_fields_template(&self) -> StandardFields {
        StandardFields {
            magic: if self.is_pe32_plus { MAGIC_64 } else { MAGIC_32 },
            major_linker_version: self.major_linker_version,
            minor_linker_version: self.minor_linker_version,
            size_of_code: 0,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0,
            base_of_code: 0,
            base_of_data: 0,
        }
    }

    fn windows_fields_template(&self) -> WindowsFields {
        WindowsFields {
            image_base: self.image_base,
            section_alignment: self.sections.section_alignment(),
            file_alignment: self.file_alignment,
            major_operating_system_version: self.major_os_version,
            minor_operating_system_version: self.minor_os_version,
            major_image_version: self.major_image_version,
            minor_image_version: self.minor_image_version,
            major_subsystem_version: self.major_subsystem_version,
            minor_subsystem_version: self.minor_subsystem_version,
            win32_version_value: 0,
            size_of_image: 0,
            size_of_headers: 0,
            check_sum: 0,
            subsystem: self.subsystem,
            dll_characteristics: self.dll_characteristics,
            size_of_stack_reserve: self.size_of_stack_reserve,
            size_of_stack_commit: self.size_of_stack_commit,
            size_of_heap_reserve: self.size_of_heap_reserve,
            size_of_heap_commit: self.size_of_heap_commit,
            loader_flags: self.loader_flags,
            number_of_rva_and_sizes: PE_NUM_DATA_DIRECTORIES as u32,
        }
    }

    fn optional_header_size(&self) -> u32 {
        use crate::pe::optional_header::{
            SIZEOF_STANDARD_FIELDS_32, SIZEOF_STANDARD_FIELDS_64, SIZEOF_WINDOWS_FIELDS_32,
            SIZEOF_WINDOWS_FIELDS_64,
        };
        use crate::pe::data_directories::SIZEOF_DATA_DIRECTORY;
        let (standard, windows) = if self.is_pe32_plus {
            (SIZEOF_STANDARD_FIELDS_64, SIZEOF_WINDOWS_FIELDS_64)
        } else {
            (SIZEOF_STANDARD_FIELDS_32, SIZEOF_WINDOWS_FIELDS_32)
        };
        (standard + windows + SIZEOF_DATA_DIRECTORY * PE_NUM_DATA_DIRECTORIES) as u32
    }

    /// Runs the six-step commit pipeline of spec 4.6 and returns the
    /// finished image bytes. `directory_target` is the section every
    /// registered data directory serializes itself into; `reloc_section`
    /// is the (still-`Open`) section base relocations are written into.
    pub fn commit(&mut self, directory_target: SectionId, reloc_section: SectionId) -> Result<Vec<u8>> {
        // Step 1: let directories lay themselves out.
        let mut locations = self.directories.serialize_all(
            directory_target,
            &mut self.sections,
            &mut self.patches,
            self.image_base,
        )?;
        debug!("serialized {} data directories", locations.len());

        // Step 2: finalize every section except the reloc section,
        // whose final content depends on patches this step's siblings
        // may still be registering against it.
        let section_ids: Vec<SectionId> = self.sections.sections().map(|s| s.id()).collect();
        for id in &section_ids {
            if *id != reloc_section {
                self.sections.section_mut(*id)?.finalize(None);
            }
        }

        // Step 3: rebuild base relocations from the live VA-kind patches
        // and write them into the reloc section, then finalize it too.
        let sites = self.patches.relocation_sites(&self.sections)?;
        let reloc_bytes = reloc::build_blocks(&sites)?;
        if !reloc_bytes.is_empty() {
            let offset = self.sections.section_mut(reloc_section)?.allocate(reloc_bytes.len(), 4)?;
            self.sections.section_mut(reloc_section)?.write_bytes(offset, &reloc_bytes)?;
            let reloc_vaddr = self.sections.section(reloc_section)?.vaddr();
            locations.push((
                crate::directory::DirectorySlot::BaseReloc,
                crate::directory::DirectoryLocation {
                    virtual_address: reloc_vaddr + offset as u32,
                    size: reloc_bytes.len() as u32,
                },
            ));
        }
        self.sections.section_mut(reloc_section)?.finalize(None);
        debug!("wrote {} bytes of base relocations", reloc_bytes.len());

        self.sections.assert_disjoint();

        // Step 4: derive header fields from the final section layout.
        let mut standard_fields = self.standard_fields_template();
        let mut windows_fields = self.windows_fields_template();

        let mut size_of_code = 0u64;
        let mut size_of_initialized_data = 0u64;
        let mut size_of_uninitialized_data = 0u64;
        let mut base_of_code = 0u32;
        let mut first_code_seen = false;
        for section in self.sections.sections() {
            let raw_size = crate::utils::align_up(section.vsize(), self.file_alignment) as u64;
            if section.characteristics() & IMAGE_SCN_CNT_CODE != 0 {
                size_of_code += raw_size;
                if !first_code_seen {
                    base_of_code = section.vaddr();
                    first_code_seen = true;
                }
            }
            if section.characteristics() & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
                size_of_initialized_data += raw_size;
            }
            if section.characteristics() & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
                size_of_uninitialized_data += raw_size;
            }
        }
        standard_fields.size_of_code = size_of_code.try_into()?;
        standard_fields.size_of_initialized_data = size_of_initialized_data.try_into()?;
        standard_fields.size_of_uninitialized_data = size_of_uninitialized_data.try_into()?;
        standard_fields.base_of_code = base_of_code;

        if let Some((section_id, offset)) = self.entry_point {
            let vaddr = self.sections.section(section_id)?.vaddr();
            standard_fields.address_of_entry_point = vaddr + offset as u32;
        }

        windows_fields.size_of_image = self.sections.image_size();

        let section_count = section_ids.len();
        let headers_size_unaligned = self.dos_header_pointer()
            + 4 // PE signature
            + crate::pe::coff::SIZEOF_COFF_HEADER as u32
            + self.optional_header_size()
            + SIZEOF_SECTION_TABLE as u32 * section_count as u32;
        let size_of_headers = crate::utils::align_up(headers_size_unaligned, self.file_alignment);
        windows_fields.size_of_headers = size_of_headers;

        // Step 5: resolve every live placed-offset now that every
        // section (including the reloc section) has its final vaddr.
        self.patches.write(&mut self.sections, self.image_base)?;

        // Step 6: emit headers, section table, section bytes, and any
        // file-space-only payloads.
        let bytes = self.emit(standard_fields, windows_fields, &locations, size_of_headers)?;
        debug!("finalized image at {} bytes", bytes.len());
        Ok(bytes)
    }

    fn dos_header_pointer(&self) -> u32 {
        (crate::pe::dos::PE_POINTER_OFFSET + 4 + self.dos_stub.code.len()) as u32
    }

    fn emit(
        &self,
        standard_fields: StandardFields,
        windows_fields: WindowsFields,
        directory_locations: &[(crate::directory::DirectorySlot, crate::directory::DirectoryLocation)],
        size_of_headers: u32,
    ) -> Result<Vec<u8>> {
        let pe_pointer = self.dos_header_pointer();

        let mut data_directories = DataDirectories::new();
        for (slot, loc) in directory_locations {
            data_directories.set(
                *slot as usize,
                DataDirectory {
                    virtual_address: loc.virtual_address,
                    size: loc.size,
                },
            );
        }
        let sections_raw_total: u32 = self
            .sections
            .sections()
            .map(|s| crate::utils::align_up(s.vsize(), self.file_alignment))
            .sum();

        // File-space-only payloads are appended after the section
        // region (spec 4.6 step 6), never interleaved with it.
        let mut running_file_offset = size_of_headers + sections_raw_total;
        for payload in &self.opaque_payloads {
            if let Some(slot) = payload.data_directory_slot {
                data_directories.set(
                    slot,
                    DataDirectory {
                        virtual_address: running_file_offset,
                        size: payload.bytes.len() as u32,
                    },
                );
            }
            running_file_offset += payload.bytes.len() as u32;
        }

        let coff = CoffHeader {
            machine: self.machine,
            number_of_sections: self.sections.len() as u16,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbol_table: 0,
            size_of_optional_header: self.optional_header_size() as u16,
            characteristics: self.characteristics,
        };

        let total_size = running_file_offset;
        let mut out = vec![0u8; total_size as usize];

        let dos_bytes = self.dos_header.to_bytes(&self.dos_stub, pe_pointer)?;
        out[..dos_bytes.len()].copy_from_slice(&dos_bytes);

        out.pwrite_with(PE_MAGIC, pe_pointer as usize, scroll::LE)?;
        let mut header_cursor = pe_pointer as usize + 4;
        header_cursor += out.pwrite_with(coff, header_cursor, scroll::LE)?;

        header_cursor += write_standard_fields(&mut out, header_cursor, standard_fields, self.is_pe32_plus)?;
        header_cursor += write_windows_fields(&mut out, header_cursor, windows_fields, self.is_pe32_plus)?;
        for dir in data_directories.iter() {
            header_cursor += out.pwrite_with(dir, header_cursor, scroll::LE)?;
        }

        let mut section_header_cursor = header_cursor;
        let mut section_data_cursor = size_of_headers;
        for section in self.sections.sections() {
            let raw_size = crate::utils::align_up(section.vsize(), self.file_alignment);
            let table = SectionTable {
                name: section.name(),
                virtual_size: section.vsize(),
                virtual_address: section.vaddr(),
                size_of_raw_data: raw_size,
                pointer_to_raw_data: if raw_size > 0 { section_data_cursor } else { 0 },
                pointer_to_relocations: 0,
                pointer_to_linenumbers: 0,
                number_of_relocations: 0,
                number_of_linenumbers: 0,
                characteristics: section.characteristics(),
            };
            section_header_cursor += out.pwrite_with(table, section_header_cursor, scroll::LE)?;

            let raw = section.raw_data();
            let dest_start = section_data_cursor as usize;
            out[dest_start..dest_start + raw.len()].copy_from_slice(raw);
            section_data_cursor += raw_size;
        }

        let mut payload_cursor = size_of_headers + sections_raw_total;
        for payload in &self.opaque_payloads {
            let start = payload_cursor as usize;
            out[start..start + payload.bytes.len()].copy_from_slice(&payload.bytes);
            payload_cursor += payload.bytes.len() as u32;
        }

        Ok(out)
    }
}

fn write_standard_fields(out: &mut [u8], offset: usize, fields: StandardFields, is_pe32_plus: bool) -> Result<usize> {
    if is_pe32_plus {
        let wire = crate::pe::optional_header::StandardFields64 {
            magic: fields.magic,
            major_linker_version: fields.major_linker_version,
            minor_linker_version: fields.minor_linker_version,
            size_of_code: fields.size_of_code,
            size_of_initialized_data: fields.size_of_initialized_data,
            size_of_uninitialized_data: fields.size_of_uninitialized_data,
            address_of_entry_point: fields.address_of_entry_point,
            base_of_code: fields.base_of_code,
        };
        Ok(out.pwrite_with(wire, offset, scroll::LE)?)
    } else {
        let wire = crate::pe::optional_header::StandardFields32 {
            magic: fields.magic,
            major_linker_version: fields.major_linker_version,
            minor_linker_version: fields.minor_linker_version,
            size_of_code: fields.size_of_code,
            size_of_initialized_data: fields.size_of_initialized_data,
            size_of_uninitialized_data: fields.size_of_uninitialized_data,
            address_of_entry_point: fields.address_of_entry_point,
            base_of_code: fields.base_of_code,
            base_of_data: fields.base_of_data,
        };
        Ok(out.pwrite_with(wire, offset, scroll::LE)?)
    }
}

fn write_windows_fields(out: &mut [u8], offset: usize, fields: WindowsFields, is_pe32_plus: bool) -> Result<usize> {
    if is_pe32_plus {
        Ok(out.pwrite_with(fields, offset, scroll::LE)?)
    } else {
        let wire = crate::pe::optional_header::WindowsFields32 {
            image_base: fields.image_base as u32,
            section_alignment: fields.section_alignment,
            file_alignment: fields.file_alignment,
            major_operating_system_version: fields.major_operating_system_version,
            minor_operating_system_version: fields.minor_operating_system_version,
            major_image_version: fields.major_image_version,
            minor_image_version: fields.minor_image_version,
            major_subsystem_version: fields.major_subsystem_version,
            minor_subsystem_version: fields.minor_subsystem_version,
            win32_version_value: fields.win32_version_value,
            size_of_image: fields.size_of_image,
            size_of_headers: fields.size_of_headers,
            check_sum: fields.check_sum,
            subsystem: fields.subsystem,
            dll_characteristics: fields.dll_characteristics,
            size_of_stack_reserve: fields.size_of_stack_reserve as u32,
            size_of_stack_commit: fields.size_of_stack_commit as u32,
            size_of_heap_reserve: fields.size_of_heap_reserve as u32,
            size_of_heap_commit: fields.size_of_heap_commit as u32,
            loader_flags: fields.loader_flags,
            number_of_rva_and_sizes: fields.number_of_rva_and_sizes,
        };
        Ok(out.pwrite_with(wire, offset, scroll::LE)?)
    }
}
