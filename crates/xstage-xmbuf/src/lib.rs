//! Memory-backed buffer targets.
//!
//! A [`BufferTarget`] looks like any other block target to the buffer cache,
//! but each block is a page of an [`xstage_xfile::Partition`] mapped straight
//! into the buffer. Reads are page faults and writes land in place, so the
//! provider never copies and never writes back. Staleness is the only state
//! that matters at finalize time: a stale page is punched out of the
//! partition, anything else is verified.

mod mapped;
mod target;

pub use mapped::MappedPage;
pub use target::{
    BufferTarget, DEFAULT_UNBOUNDED_LIMIT, XmbufConfig, XmbufProvider, create_partition,
};
