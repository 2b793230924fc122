//! The PE/PE32+ optional header: standard COFF fields, Windows-specific
//! fields, and the trailing data directory array. Written fresh in the
//! plain `#[derive(Pread, Pwrite, SizeWith)]` idiom used elsewhere in
//! this module rather than reused from the retrieved source, which
//! built the 32/64-bit field pairs through a bespoke
//! `implement_ctx_cstruct!` macro this crate does not carry forward.

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::pe::data_directories::DataDirectories;

pub const MAGIC_32: u16 = 0x10b;
pub const MAGIC_64: u16 = 0x20b;

#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
#[derive(Pread, Pwrite, SizeWith)]
pub struct StandardFields32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
}

pub const SIZEOF_STANDARD_FIELDS_32: usize = 28;

#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
#[derive(Pread, Pwrite, SizeWith)]
pub struct StandardFields64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
}

pub const SIZEOF_STANDARD_FIELDS_64: usize = 24;

/// Unified 32/64-bit standard fields, widened to the PE32+ field
/// widths; `base_of_data` is absent (always zero) in a PE32+ image.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct StandardFields {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
}

impl From<StandardFields32> for StandardFields {
    fn from(f: StandardFields32) -> Self {
        StandardFields {
            magic: f.magic,
            major_linker_version: f.major_linker_version,
            minor_linker_version: f.minor_linker_version,
            size_of_code: f.size_of_code,
            size_of_initialized_data: f.size_of_initialized_data,
            size_of_uninitialized_data: f.size_of_uninitialized_data,
            address_of_entry_point: f.address_of_entry_point,
            base_of_code: f.base_of_code,
            base_of_data: f.base_of_data,
        }
    }
}

impl From<StandardFields64> for StandardFields {
    fn from(f: StandardFields64) -> Self {
        StandardFields {
            magic: f.magic,
            major_linker_version: f.major_linker_version,
            minor_linker_version: f.minor_linker_version,
            size_of_code: f.size_of_code,
            size_of_initialized_data: f.size_of_initialized_data,
            size_of_uninitialized_data: f.size_of_uninitialized_data,
            address_of_entry_point: f.address_of_entry_point,
            base_of_code: f.base_of_code,
            base_of_data: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
#[derive(Pread, Pwrite, SizeWith)]
pub struct WindowsFields32 {
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

pub const SIZEOF_WINDOWS_FIELDS_32: usize = 68;

/// Also the unified, widened representation: PE32+ already uses the
/// widest field sizes, so `WindowsFields` is just this struct.
#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
#[derive(Pread, Pwrite, SizeWith)]
pub struct WindowsFields64 {
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

pub const SIZEOF_WINDOWS_FIELDS_64: usize = 88;

pub type WindowsFields = WindowsFields64;

impl From<WindowsFields32> for WindowsFields {
    fn from(w: WindowsFields32) -> Self {
        WindowsFields64 {
            image_base: w.image_base as u64,
            section_alignment: w.section_alignment,
            file_alignment: w.file_alignment,
            major_operating_system_version: w.major_operating_system_version,
            minor_operating_system_version: w.minor_operating_system_version,
            major_image_version: w.major_image_version,
            minor_image_version: w.minor_image_version,
            major_subsystem_version: w.major_subsystem_version,
            minor_subsystem_version: w.minor_subsystem_version,
            win32_version_value: w.win32_version_value,
            size_of_image: w.size_of_image,
            size_of_headers: w.size_of_headers,
            check_sum: w.check_sum,
            subsystem: w.subsystem,
            dll_characteristics: w.dll_characteristics,
            size_of_stack_reserve: w.size_of_stack_reserve as u64,
            size_of_stack_commit: w.size_of_stack_commit as u64,
            size_of_heap_reserve: w.size_of_heap_reserve as u64,
            size_of_heap_commit: w.size_of_heap_commit as u64,
            loader_flags: w.loader_flags,
            number_of_rva_and_sizes: w.number_of_rva_and_sizes,
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub struct OptionalHeader {
    pub standard_fields: StandardFields,
    pub windows_fields: WindowsFields,
    pub data_directories: DataDirectories,
}

impl OptionalHeader {
    pub fn is_pe32plus(&self) -> bool {
        self.standard_fields.magic == MAGIC_64
    }

    /// Parses an optional header starting at `bytes[0]`, dispatching
    /// on the magic number to the PE32 or PE32+ field layout. Returns
    /// the header and the number of bytes consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut offset = 0usize;
        let magic: u16 = bytes.pread_with(0, scroll::LE)?;
        let (standard_fields, windows_fields): (StandardFields, WindowsFields) = match magic {
            MAGIC_32 => {
                let standard: StandardFields32 = bytes.gread_with(&mut offset, scroll::LE)?;
                let windows: WindowsFields32 = bytes.gread_with(&mut offset, scroll::LE)?;
                (standard.into(), windows.into())
            }
            MAGIC_64 => {
                let standard: StandardFields64 = bytes.gread_with(&mut offset, scroll::LE)?;
                let windows: WindowsFields64 = bytes.gread_with(&mut offset, scroll::LE)?;
                (standard.into(), windows.into())
            }
            _ => {
                return Err(Error::InvalidFormat(format!(
                    "unrecognized optional header magic {:#x}",
                    magic
                )))
            }
        };
        let data_directories = DataDirectories::parse(
            bytes,
            windows_fields.number_of_rva_and_sizes as usize,
            &mut offset,
        )?;
        Ok((
            OptionalHeader {
                standard_fields,
                windows_fields,
                data_directories,
            },
            offset,
        ))
    }
}

/// Windows subsystem identifiers (`IMAGE_SUBSYSTEM_*`).
pub const IMAGE_SUBSYSTEM_WINDOWS_GUI: u16 = 2;
pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;
pub const IMAGE_SUBSYSTEM_EFI_APPLICATION: u16 = 10;

/// DLL characteristics bits (`IMAGE_DLLCHARACTERISTICS_*`).
pub const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA: u16 = 0x0020;
pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;
pub const IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY: u16 = 0x0080;
pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;
pub const IMAGE_DLLCHARACTERISTICS_NO_ISOLATION: u16 = 0x0200;
pub const IMAGE_DLLCHARACTERISTICS_NO_SEH: u16 = 0x0400;
pub const IMAGE_DLLCHARACTERISTICS_NO_BIND: u16 = 0x0800;
pub const IMAGE_DLLCHARACTERISTICS_APPCONTAINER: u16 = 0x1000;
pub const IMAGE_DLLCHARACTERISTICS_WDM_DRIVER: u16 = 0x2000;
pub const IMAGE_DLLCHARACTERISTICS_GUARD_CF: u16 = 0x4000;
pub const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE: u16 = 0x8000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizeof_standards32() {
        use scroll::ctx::SizeWith;
        assert_eq!(StandardFields32::size_with(&scroll::LE), SIZEOF_STANDARD_FIELDS_32);
    }

    #[test]
    fn sizeof_windows32() {
        use scroll::ctx::SizeWith;
        assert_eq!(WindowsFields32::size_with(&scroll::LE), SIZEOF_WINDOWS_FIELDS_32);
    }

    #[test]
    fn sizeof_standards64() {
        use scroll::ctx::SizeWith;
        assert_eq!(StandardFields64::size_with(&scroll::LE), SIZEOF_STANDARD_FIELDS_64);
    }

    #[test]
    fn sizeof_windows64() {
        use scroll::ctx::SizeWith;
        assert_eq!(WindowsFields64::size_with(&scroll::LE), SIZEOF_WINDOWS_FIELDS_64);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let bytes = [0xFFu8, 0xFF];
        assert!(OptionalHeader::parse(&bytes).is_err());
    }
}
