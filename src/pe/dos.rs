//! DOS header and stub. Only `signature` and the PE header pointer
//! (`e_lfanew`) are meaningful to a modern loader; everything else —
//! the 14 documented MS-DOS fields, the OEM/reserved words, and the
//! stub program itself — is carried opaquely and round-tripped
//! byte-for-byte (spec 6's "DOS stub passthrough").

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};

pub const DOS_MAGIC: u16 = 0x5A4D;
pub const PE_MAGIC: u32 = 0x0000_4550;
pub const PE_POINTER_OFFSET: usize = 0x3C;

#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
#[derive(Pread, Pwrite, SizeWith)]
pub struct DosHeader {
    pub signature: u16,
    pub bytes_on_last_page: u16,
    pub pages_in_file: u16,
    pub relocations: u16,
    pub size_of_header_in_paragraphs: u16,
    pub minimum_extra_paragraphs_needed: u16,
    pub maximum_extra_paragraphs_needed: u16,
    pub initial_relative_ss: u16,
    pub initial_sp: u16,
    pub checksum: u16,
    pub initial_ip: u16,
    pub initial_relative_cs: u16,
    pub file_address_of_relocation_table: u16,
    pub overlay_number: u16,
}

pub const SIZEOF_DOS_HEADER: usize = 28;

/// The opaque region between the fixed header and the PE header:
/// OEM id/info plus reserved words (`[28, 0x3C)`), and the stub
/// program text that follows `e_lfanew` (`[0x40, e_lfanew)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosStub {
    pub reserved_and_oem: Vec<u8>,
    pub code: Vec<u8>,
}

impl Default for DosStub {
    fn default() -> Self {
        DosStub {
            reserved_and_oem: vec![0u8; PE_POINTER_OFFSET - SIZEOF_DOS_HEADER],
            // "This program cannot be run in DOS mode" — the stub
            // every mainstream linker emits.
            code: vec![
                0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD,
                0x21, 0x54, 0x68, 0x69, 0x73, 0x20, 0x70, 0x72, 0x6F, 0x67, 0x72, 0x61, 0x6D,
                0x20, 0x63, 0x61, 0x6E, 0x6E, 0x6F, 0x74, 0x20, 0x62, 0x65, 0x20, 0x72, 0x75,
                0x6E, 0x20, 0x69, 0x6E, 0x20, 0x44, 0x4F, 0x53, 0x20, 0x6D, 0x6F, 0x64, 0x65,
                0x2E, 0x0D, 0x0D, 0x0A, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        }
    }
}

impl DosHeader {
    /// Default header for a freshly constructed image: standard
    /// magic, `size_of_header_in_paragraphs = 4` (the 64-byte header),
    /// everything else zero until a parser overwrites it.
    pub fn new() -> Self {
        DosHeader {
            signature: DOS_MAGIC,
            size_of_header_in_paragraphs: 4,
            maximum_extra_paragraphs_needed: 0xFFFF,
            ..Default::default()
        }
    }

    /// Parses the fixed header, validates both magic numbers, and
    /// returns the header, its opaque stub region, and `e_lfanew`.
    pub fn parse(bytes: &[u8]) -> Result<(DosHeader, DosStub, u32)> {
        let header: DosHeader = bytes
            .pread_with(0, scroll::LE)
            .map_err(|_| Error::InvalidFormat("DOS header truncated".into()))?;
        if header.signature != DOS_MAGIC {
            return Err(Error::InvalidFormat(format!(
                "bad DOS signature {:#x}",
                header.signature
            )));
        }
        let pe_pointer: u32 = bytes
            .pread_with(PE_POINTER_OFFSET, scroll::LE)
            .map_err(|_| Error::InvalidFormat("missing e_lfanew".into()))?;
        if (pe_pointer as usize) < PE_POINTER_OFFSET + 4 {
            return Err(Error::InvalidFormat(
                "e_lfanew points inside the DOS header it follows".into(),
            ));
        }
        let pe_signature: u32 = bytes
            .pread_with(pe_pointer as usize, scroll::LE)
            .map_err(|_| Error::InvalidFormat("missing PE signature".into()))?;
        if pe_signature != PE_MAGIC {
            return Err(Error::InvalidFormat(format!(
                "bad PE signature {:#x}",
                pe_signature
            )));
        }
        let reserved_and_oem = bytes
            .get(SIZEOF_DOS_HEADER..PE_POINTER_OFFSET)
            .ok_or(Error::OutOfBounds {
                offset: SIZEOF_DOS_HEADER,
                len: PE_POINTER_OFFSET - SIZEOF_DOS_HEADER,
                bound: bytes.len(),
            })?
            .to_vec();
        let code = bytes
            .get(PE_POINTER_OFFSET + 4..pe_pointer as usize)
            .ok_or(Error::OutOfBounds {
                offset: PE_POINTER_OFFSET + 4,
                len: (pe_pointer as usize).saturating_sub(PE_POINTER_OFFSET + 4),
                bound: bytes.len(),
            })?
            .to_vec();
        Ok((header, DosStub { reserved_and_oem, code }, pe_pointer))
    }

    /// Serializes the header, the opaque stub, and `e_lfanew` back
    /// into exactly `pe_pointer` bytes.
    pub fn to_bytes(&self, stub: &DosStub, pe_pointer: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; pe_pointer as usize];
        out.pwrite_with(*self, 0, scroll::LE)?;
        let reserved_end = SIZEOF_DOS_HEADER + stub.reserved_and_oem.len();
        out[SIZEOF_DOS_HEADER..reserved_end].copy_from_slice(&stub.reserved_and_oem);
        out.pwrite_with(pe_pointer, PE_POINTER_OFFSET, scroll::LE)?;
        let code_start = PE_POINTER_OFFSET + 4;
        let code_end = code_start + stub.code.len();
        out[code_start..code_end].copy_from_slice(&stub.code);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let header = DosHeader::new();
        let stub = DosStub::default();
        let pe_pointer = (PE_POINTER_OFFSET + 4 + stub.code.len()) as u32;
        let mut bytes = header.to_bytes(&stub, pe_pointer).unwrap();
        bytes.extend_from_slice(&PE_MAGIC.to_le_bytes());

        let (parsed_header, parsed_stub, parsed_pointer) = DosHeader::parse(&bytes).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_stub, stub);
        assert_eq!(parsed_pointer, pe_pointer);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 64];
        assert!(DosHeader::parse(&bytes).is_err());
    }
}
