//! Block device substrate for file system development.
//!
//! Exposes the [`BlockStorage`] trait and a userspace emulator backed by a
//! regular file.

#[macro_use]
extern crate log;

mod blockio;
mod emulator;

pub use blockio::{BlockNumber, BlockStorage};
pub use emulator::{FileBlockEmulator, FileBlockEmulatorBuilder, DEFAULT_BLOCK_SIZE};
