//! Holds every section of one image, ordered by ascending virtual
//! address, and translates RVAs into `(section, offset)` pairs. See
//! spec 4.3; grounded on the way `goblin::pe::writer::PEWriter` keeps
//! an ordered `Vec<SectionTable>` it appends to and scans linearly.

use crate::error::{corrupt, Error, Result};
use crate::section::{Section, SectionId, SectionState};
use crate::utils::align_up;

/// Ordered collection of a single image's sections, plus the
/// image-wide section alignment used for first-fit placement.
pub struct SectionManager {
    sections: Vec<Section>,
    section_alignment: u32,
    next_id: SectionId,
}

impl SectionManager {
    pub fn new(section_alignment: u32) -> Self {
        SectionManager {
            sections: Vec::new(),
            section_alignment: section_alignment.max(1),
            next_id: 1,
        }
    }

    pub fn section_alignment(&self) -> u32 {
        self.section_alignment
    }

    fn next_section_id(&mut self) -> SectionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Finds the lowest gap at or after the headers region (`vaddr 0`
    /// is reserved for the PE headers) that is large enough to hold
    /// `vsize_hint` bytes aligned to `section_alignment`, and assigns
    /// the new section that virtual address.
    pub fn add_section(&mut self, name: [u8; 8], characteristics: u32, vsize_hint: u32) -> SectionId {
        let align = self.section_alignment;
        let want = align_up(vsize_hint.max(1), align);

        let mut start = align;
        for section in &self.sections {
            if section.vaddr() >= start + want {
                break;
            }
            start = align_up(section.vaddr() + section.reserved_vsize(), align);
        }

        let id = self.next_section_id();
        let mut section = Section::new(id, name, characteristics);
        section.set_vaddr(start);
        let pos = self.sections.partition_point(|s| s.vaddr() < start);
        self.sections.insert(pos, section);
        id
    }

    /// Inserts `section` at the virtual address already stored on it
    /// (the deserialization path: a parser collaborator has already
    /// populated its bytes and `vaddr`). Fails if it would overlap an
    /// existing section.
    pub fn place_section(&mut self, mut section: Section) -> Result<SectionId> {
        let vaddr = section.vaddr();
        let end = vaddr as u64 + section.reserved_vsize() as u64;
        for s in &self.sections {
            let s_end = s.vaddr() as u64 + s.reserved_vsize() as u64;
            if (vaddr as u64) < s_end && (s.vaddr() as u64) < end {
                return Err(Error::Overlap {
                    offset: vaddr as usize,
                    len: section.reserved_vsize() as usize,
                });
            }
        }
        let id = self.next_section_id();
        section.reassign_id(id);
        let pos = self.sections.partition_point(|s| s.vaddr() < vaddr);
        self.sections.insert(pos, section);
        Ok(id)
    }

    pub fn section(&self, id: SectionId) -> Result<&Section> {
        self.sections
            .iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| Error::Unallocated(format!("section {id} is gone")))
    }

    pub fn section_mut(&mut self, id: SectionId) -> Result<&mut Section> {
        self.sections
            .iter_mut()
            .find(|s| s.id() == id)
            .ok_or_else(|| Error::Unallocated(format!("section {id} is gone")))
    }

    /// Destroys a section: every allocation it held and every
    /// placed-offset targeting or hosted by it becomes invalid. The
    /// caller (normally [`crate::image::ImageLayout`]) is responsible
    /// for unlinking patches before calling this.
    pub fn remove_section(&mut self, id: SectionId) {
        if let Some(pos) = self.sections.iter().position(|s| s.id() == id) {
            self.sections[pos].destroy();
            self.sections.remove(pos);
        }
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// `rva -> (section, offset)`, scanning sections in virtual-address
    /// order (linear in section count, which is typically small).
    pub fn resolve_rva(&self, rva: u32) -> Option<(SectionId, usize)> {
        for s in &self.sections {
            let size = s.reserved_vsize() as u64;
            let start = s.vaddr() as u64;
            if (rva as u64) >= start && (rva as u64) < start + size {
                return Some((s.id(), (rva as u64 - start) as usize));
            }
        }
        None
    }

    /// As [`SectionManager::resolve_rva`], but only succeeds if the
    /// entire `[rva, rva+len)` range lies within one *finalized*
    /// section.
    pub fn resolve_rva_range(&self, rva: u32, len: u32) -> Option<(SectionId, usize)> {
        let (id, offset) = self.resolve_rva(rva)?;
        let section = self.section(id).ok()?;
        if section.state() != SectionState::Finalized {
            return None;
        }
        if offset as u64 + len as u64 <= section.vsize() as u64 {
            Some((id, offset))
        } else {
            None
        }
    }

    /// A zero-padded read view over one section's bytes, presenting
    /// reads past the backing buffer (but within `virtual_size`) as
    /// zero, matching PE loader behavior for uninitialized tails.
    pub fn data_stream(&self, id: SectionId) -> Result<DataStream<'_>> {
        Ok(DataStream {
            section: self.section(id)?,
        })
    }

    /// `align_up(max(vaddr(S) + vsize(S)), section_alignment)` across
    /// every section, per testable property in spec section 8.
    pub fn image_size(&self) -> u32 {
        let max_end = self
            .sections
            .iter()
            .map(|s| s.vaddr() + s.reserved_vsize())
            .max()
            .unwrap_or(0);
        align_up(max_end.max(self.section_alignment), self.section_alignment)
    }

    pub(crate) fn assert_disjoint(&self) {
        for (i, a) in self.sections.iter().enumerate() {
            for b in &self.sections[i + 1..] {
                let a_end = a.vaddr() as u64 + a.reserved_vsize() as u64;
                let b_end = b.vaddr() as u64 + b.reserved_vsize() as u64;
                if (a.vaddr() as u64) < b_end && (b.vaddr() as u64) < a_end {
                    corrupt!("sections {} and {} overlap", a.id(), b.id());
                }
            }
        }
    }
}

/// A zero-padded read view over `(section, offset)`, per spec 4.3.
pub struct DataStream<'a> {
    section: &'a Section,
}

impl DataStream<'_> {
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.section.read_at(offset, buf)
    }

    pub fn len(&self) -> usize {
        self.section.reserved_vsize() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
