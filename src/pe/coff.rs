//! The COFF file header: machine type, section count, symbol table
//! pointer, and file characteristics. Immediately follows the PE
//! signature; the optional header (if any) immediately follows this.

use scroll::{Pread, Pwrite, SizeWith};

#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
#[derive(Pread, Pwrite, SizeWith)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbol_table: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

pub const SIZEOF_COFF_HEADER: usize = 20;

pub const COFF_MACHINE_UNKNOWN: u16 = 0x0;
pub const COFF_MACHINE_AM33: u16 = 0x1d3;
pub const COFF_MACHINE_X86_64: u16 = 0x8664;
pub const COFF_MACHINE_ARM: u16 = 0x1c0;
pub const COFF_MACHINE_ARM64: u16 = 0xaa64;
pub const COFF_MACHINE_ARMNT: u16 = 0x1c4;
pub const COFF_MACHINE_EBC: u16 = 0xebc;
pub const COFF_MACHINE_X86: u16 = 0x14c;
pub const COFF_MACHINE_IA64: u16 = 0x200;
pub const COFF_MACHINE_RISCV32: u16 = 0x5032;
pub const COFF_MACHINE_RISCV64: u16 = 0x5064;
pub const COFF_MACHINE_RISCV128: u16 = 0x5128;

/// COFF/PE file characteristics (`IMAGE_FILE_*`), the COFF header's
/// `characteristics` field.
pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
pub const IMAGE_FILE_LINE_NUMS_STRIPPED: u16 = 0x0004;
pub const IMAGE_FILE_LOCAL_SYMS_STRIPPED: u16 = 0x0008;
pub const IMAGE_FILE_AGGRESSIVE_WS_TRIM: u16 = 0x0010;
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
pub const IMAGE_FILE_BYTES_REVERSED_LO: u16 = 0x0080;
pub const IMAGE_FILE_32BIT_MACHINE: u16 = 0x0100;
pub const IMAGE_FILE_DEBUG_STRIPPED: u16 = 0x0200;
pub const IMAGE_FILE_REMOVABLE_RUN_FROM_SWAP: u16 = 0x0400;
pub const IMAGE_FILE_NET_RUN_FROM_SWAP: u16 = 0x0800;
pub const IMAGE_FILE_SYSTEM: u16 = 0x1000;
pub const IMAGE_FILE_DLL: u16 = 0x2000;
pub const IMAGE_FILE_UP_SYSTEM_ONLY: u16 = 0x4000;
pub const IMAGE_FILE_BYTES_REVERSED_HI: u16 = 0x8000;

pub fn machine_to_str(machine: u16) -> &'static str {
    match machine {
        COFF_MACHINE_UNKNOWN => "UNKNOWN",
        COFF_MACHINE_AM33 => "AM33",
        COFF_MACHINE_X86_64 => "X86_64",
        COFF_MACHINE_ARM => "ARM",
        COFF_MACHINE_ARM64 => "ARM64",
        COFF_MACHINE_ARMNT => "ARM_NT",
        COFF_MACHINE_EBC => "EBC",
        COFF_MACHINE_X86 => "X86",
        COFF_MACHINE_IA64 => "IA64",
        COFF_MACHINE_RISCV32 => "RISC-V_32",
        COFF_MACHINE_RISCV64 => "RISC-V_64",
        COFF_MACHINE_RISCV128 => "RISC-V_128",
        _ => "COFF_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_with_matches_wire_layout() {
        use scroll::ctx::SizeWith;
        assert_eq!(CoffHeader::size_with(&scroll::LE), SIZEOF_COFF_HEADER);
    }

    #[test]
    fn machine_name_lookup() {
        assert_eq!(machine_to_str(COFF_MACHINE_X86_64), "X86_64");
        assert_eq!(machine_to_str(0xBEEF), "COFF_UNKNOWN");
    }
}
