//! Cross-section placed-offset graph: every unresolved pointer from
//! one section's bytes into another section is an explicit edge here,
//! so section moves/deletes propagate correctly and the commit phase
//! can write final RVAs/VAs in one pass. See spec 4.4.
//!
//! Per the design notes' "re-express intrusive lists as arenas plus
//! stable handles", patches live in a flat `Vec` arena addressed by
//! index, with forward (by holder) and backward (by target) index
//! lists kept as parallel `HashMap<SectionId, Vec<PatchId>>`s rather
//! than intrusive list nodes.

use std::collections::HashMap;

use crate::error::Result;
use crate::section::SectionId;
use crate::section_manager::SectionManager;

pub type PatchId = usize;

/// What a patch writes: an RVA relative to the image base, or a full
/// virtual address (32- or 64-bit). Only VA patches emit base
/// relocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Rva32,
    Va32,
    Va64,
}

impl PatchKind {
    pub fn byte_width(self) -> usize {
        match self {
            PatchKind::Rva32 | PatchKind::Va32 => 4,
            PatchKind::Va64 => 8,
        }
    }

    pub fn needs_relocation(self) -> bool {
        !matches!(self, PatchKind::Rva32)
    }
}

struct Patch {
    holder: SectionId,
    holder_offset: usize,
    target: SectionId,
    target_offset: usize,
    kind: PatchKind,
    live: bool,
}

/// All cross-section patches for one image.
#[derive(Default)]
pub struct PatchGraph {
    patches: Vec<Patch>,
    forward: HashMap<SectionId, Vec<PatchId>>,
    backward: HashMap<SectionId, Vec<PatchId>>,
}

impl PatchGraph {
    pub fn new() -> Self {
        PatchGraph::default()
    }

    /// Registers a new edge: `holder_offset` bytes into `holder`
    /// will, at commit time, hold the resolved address of
    /// `target_offset` bytes into `target`.
    pub fn register(
        &mut self,
        holder: SectionId,
        holder_offset: usize,
        target: SectionId,
        target_offset: usize,
        kind: PatchKind,
    ) -> PatchId {
        let id = self.patches.len();
        self.patches.push(Patch {
            holder,
            holder_offset,
            target,
            target_offset,
            kind,
            live: true,
        });
        self.forward.entry(holder).or_default().push(id);
        self.backward.entry(target).or_default().push(id);
        id
    }

    /// Unlinks (marks dead) every patch holding or targeting
    /// `section`, as required when that section is destroyed. Back-
    /// references are cleared before the forward list, matching spec
    /// section 5's destruction-order guarantee.
    pub fn unlink_section(&mut self, section: SectionId) {
        if let Some(ids) = self.backward.remove(&section) {
            for id in ids {
                self.patches[id].live = false;
            }
        }
        if let Some(ids) = self.forward.remove(&section) {
            for id in ids {
                self.patches[id].live = false;
            }
        }
    }

    pub fn unlink(&mut self, id: PatchId) {
        if let Some(patch) = self.patches.get_mut(id) {
            patch.live = false;
        }
    }

    pub fn is_live(&self, id: PatchId) -> bool {
        self.patches.get(id).is_some_and(|p| p.live)
    }

    fn live_patches(&self) -> impl Iterator<Item = &Patch> {
        self.patches.iter().filter(|p| p.live)
    }

    /// Writes the resolved value of every live patch into its
    /// holder's bytes, little-endian. `RVA32` patches write
    /// `target.vaddr + target_offset`; `VA32`/`VA64` patches write
    /// `image_base + target.vaddr + target_offset`.
    pub fn write(&self, manager: &mut SectionManager, image_base: u64) -> Result<()> {
        for patch in self.live_patches() {
            let target_vaddr = manager.section(patch.target)?.vaddr() as u64;
            let value = target_vaddr + patch.target_offset as u64;
            let value = match patch.kind {
                PatchKind::Rva32 => value,
                PatchKind::Va32 | PatchKind::Va64 => image_base + value,
            };
            let holder = manager.section_mut(patch.holder)?;
            match patch.kind {
                PatchKind::Rva32 | PatchKind::Va32 => {
                    holder.write_bytes(patch.holder_offset, &(value as u32).to_le_bytes())?;
                }
                PatchKind::Va64 => {
                    holder.write_bytes(patch.holder_offset, &value.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Every live VA-kind patch's holder RVA, for base-relocation
    /// emission (spec 4.4: "every VA32 or VA64 patch must produce a
    /// base-relocation entry"). RVA-kind patches are excluded.
    pub fn relocation_sites(&self, manager: &SectionManager) -> Result<Vec<(u32, PatchKind)>> {
        let mut sites = Vec::new();
        for patch in self.live_patches() {
            if !patch.kind.needs_relocation() {
                continue;
            }
            let holder_vaddr = manager.section(patch.holder)?.vaddr();
            sites.push((holder_vaddr + patch.holder_offset as u32, patch.kind));
        }
        Ok(sites)
    }

    pub fn len(&self) -> usize {
        self.patches.iter().filter(|p| p.live).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> [u8; 8] {
        let mut n = [0u8; 8];
        n[..s.len()].copy_from_slice(s.as_bytes());
        n
    }

    #[test]
    fn register_and_write_rva32() {
        let mut mgr = SectionManager::new(0x1000);
        let text = mgr.add_section(name(".text"), 0, 0x10);
        let data = mgr.add_section(name(".data"), 0, 0x10);
        mgr.section_mut(data).unwrap().allocate(4, 4).unwrap();
        mgr.section_mut(text).unwrap().finalize(None);
        mgr.section_mut(data).unwrap().finalize(None);

        let mut patches = PatchGraph::new();
        patches.register(data, 0, text, 0x8, PatchKind::Rva32);
        patches.write(&mut mgr, 0x1000_0000).unwrap();

        let mut buf = [0u8; 4];
        mgr.data_stream(data).unwrap().read_at(0, &mut buf).unwrap();
        let expected = mgr.section(text).unwrap().vaddr() + 0x8;
        assert_eq!(u32::from_le_bytes(buf), expected);
    }

    #[test]
    fn unlink_section_kills_its_patches() {
        let mut mgr = SectionManager::new(0x1000);
        let text = mgr.add_section(name(".text"), 0, 0x10);
        let data = mgr.add_section(name(".data"), 0, 0x10);
        mgr.section_mut(data).unwrap().allocate(4, 4).unwrap();

        let mut patches = PatchGraph::new();
        let id = patches.register(data, 0, text, 0, PatchKind::Rva32);
        patches.unlink_section(text);
        assert!(!patches.is_live(id));
        assert_eq!(patches.len(), 0);
    }
}
