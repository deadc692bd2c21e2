//! A minimal block file system on a flat disk image.
//!
//! Files occupy one contiguous run of blocks tracked by a bit-per-block bitmap,
//! names live in fixed 64 entry directory tables with one level of
//! subdirectories under root.

#[macro_use]
extern crate log;

mod alloc;
mod dir;
mod fs;
mod sb;

pub use crate::alloc::State;
pub use crate::dir::{DirEntry, EntryKind, Status, ENTRIES_PER_DIR, ENTRY_SIZE, MAX_NAME_LEN};
pub use crate::fs::{FileSystem, FsError, FsStats, Result};
pub use crate::sb::{SuperBlock, SECTOR_SIZE};

pub use fileblock::{
    BlockNumber, BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, DEFAULT_BLOCK_SIZE,
};
