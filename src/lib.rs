//! An in-memory object model for building and editing PE/COFF images.
//!
//! This crate is not a parser in the usual sense: it models a PE image
//! as a live graph of sections, allocations, and cross-section
//! placed-offset patches that can be mutated freely and only turned
//! into bytes on demand, via [`image::ImageLayout::commit`]. The
//! pieces compose bottom-up:
//!
//! - [`heap`] — a native heap allocator over real OS virtual memory: a
//!   reusable substrate other code can build on, independent of the
//!   section/image model below it (spec 4.1's "native heap").
//! - [`section`] — a single section's intra-section free-list
//!   allocator and `Open -> Finalized -> Destroyed` state machine.
//! - [`section_manager`] — every section of one image, ordered by
//!   virtual address, with RVA resolution.
//! - [`patch`] — the cross-section reference graph: every unresolved
//!   RVA/VA pointer from one section into another is an explicit edge
//!   here until commit time.
//! - [`directory`] — the generic data-directory interface; this crate
//!   ships the dispatch mechanism but no production export/import/
//!   resource codecs (see `directory`'s module docs).
//! - [`image`] — ties the above together with the DOS/COFF/optional
//!   header fields and runs the commit pipeline.
//! - [`pe`] — the on-disk wire structs (`#[derive(Pread, Pwrite,
//!   SizeWith)]`) that `image` reads and writes.

pub mod avl;
pub mod directory;
pub mod error;
pub mod heap;
pub mod image;
pub mod patch;
pub mod pe;
pub mod section;
pub mod section_manager;
pub mod utils;

pub use error::{Error, Result};
pub use image::ImageLayout;
