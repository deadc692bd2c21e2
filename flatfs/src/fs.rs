use std::convert::TryFrom;

use fileblock::{BlockNumber, BlockStorage};
use thiserror::Error;

use crate::alloc::{Bitmap, State};
use crate::dir::{validate_name, DirEntry, DirTable, EntryKind};
use crate::sb::{SuperBlock, BOOT_BLOCK, SUPERBLOCK_INDEX};

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("directory table is full")]
    DirectoryFull,
    #[error("no contiguous run of {blocks} free blocks")]
    OutOfSpace { blocks: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("medium is not formatted: {0}")]
    Unformatted(String),
    #[error("block device fault")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Free space and capacity of a mounted file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub data_blocks: u64,
    pub free_blocks: u64,
}

/// A mounted file system. Owns the block device, the geometry read from the
/// superblock and the current directory. Files are stored as one contiguous
/// run of blocks each, there is a single level of subdirectories below root.
pub struct FileSystem<T: BlockStorage> {
    dev: T,
    super_block: SuperBlock,
    bitmap: Bitmap,
    /// Table of the directory all name lookups resolve in.
    cwd: DirTable,
}

impl<T: BlockStorage> FileSystem<T> {
    /// Initializes the file system onto owned block storage. The medium is
    /// resized to `sector_count` 512 byte sectors using the device block size.
    ///
    /// # Layout
    /// ==================================================================
    /// | Boot | SuperBlock | Bitmap | Root directory | Data Region ... |
    /// ==================================================================
    pub fn format(mut dev: T, sector_count: u64) -> Result<Self> {
        let super_block = SuperBlock::for_sectors(sector_count, dev.block_size())?;
        dev.set_block_count(super_block.total_blocks)?;

        // Reusable buffer for writing blocks.
        let zeroes = vec![0; dev.block_size()];
        for blocknr in BOOT_BLOCK..super_block.data_start {
            dev.write_block(blocknr, &zeroes)?;
        }
        dev.write_block(SUPERBLOCK_INDEX, &super_block.serialize())?;
        dev.sync_disk()?;

        let bitmap = Bitmap::new(&super_block);
        bitmap.mark_range(&mut dev, BOOT_BLOCK, super_block.data_start, State::Used)?;

        info!(
            "formatted {} blocks of {} bytes, bitmap at {}, root at {}, data from {}",
            super_block.total_blocks,
            super_block.block_size,
            super_block.bitmap_start,
            super_block.root_start,
            super_block.data_start
        );
        Ok(Self::with_super_block(dev, super_block))
    }

    /// Loads the superblock of a formatted medium. The current directory starts
    /// at root.
    pub fn mount(mut dev: T) -> Result<Self> {
        let super_block = Self::read_super_block(&mut dev)?;
        info!(
            "mounted {} blocks of {} bytes, data from {}",
            super_block.total_blocks, super_block.block_size, super_block.data_start
        );
        Ok(Self::with_super_block(dev, super_block))
    }

    /// Reports whether the medium carries a valid superblock.
    pub fn probe(dev: &mut T) -> bool {
        Self::read_super_block(dev).is_ok()
    }

    fn read_super_block(dev: &mut T) -> Result<SuperBlock> {
        if dev.block_count() <= SUPERBLOCK_INDEX {
            return Err(FsError::Unformatted("medium too small".to_string()));
        }
        let mut block_buf = vec![0; dev.block_size()];
        dev.read_block(SUPERBLOCK_INDEX, &mut block_buf)?;

        let super_block = SuperBlock::parse(&block_buf)?;
        super_block.check_device(dev.block_size(), dev.block_count())?;
        Ok(super_block)
    }

    fn with_super_block(dev: T, super_block: SuperBlock) -> Self {
        Self {
            dev,
            bitmap: Bitmap::new(&super_block),
            cwd: DirTable::new(&super_block, super_block.root_start),
            super_block,
        }
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    /// Block holding the table of the current directory.
    pub fn current_directory(&self) -> BlockNumber {
        self.cwd.block()
    }

    pub fn at_root(&self) -> bool {
        self.cwd.block() == self.super_block.root_start
    }

    /// Returns ownership of the block device to the caller.
    pub fn into_device(self) -> T {
        self.dev
    }

    /// Creates an entry of `size` bytes in the current directory, reserving its
    /// blocks. Directories are always one block and start out empty, they can
    /// only be created in root.
    pub fn create(&mut self, name: &str, size: u32, kind: EntryKind) -> Result<()> {
        validate_name(name)?;
        let size = match kind {
            EntryKind::File => size,
            EntryKind::Directory if self.at_root() => self.super_block.block_size,
            EntryKind::Directory => {
                return Err(FsError::PermissionDenied(format!(
                    "cannot create directory {} outside of root",
                    name
                )));
            }
        };
        let blocks_needed = self.super_block.blocks_for(size as u64);

        // Both checks run before anything is written.
        let slot = self.cwd.reserve_slot(&mut self.dev, name)?;
        let start_block = if blocks_needed > 0 {
            self.bitmap
                .find_first_fit(&mut self.dev, blocks_needed, self.super_block.data_start)?
        } else {
            0
        };

        if blocks_needed > 0 {
            self.bitmap
                .mark_range(&mut self.dev, start_block, blocks_needed, State::Used)?;
        }
        if kind == EntryKind::Directory {
            DirTable::new(&self.super_block, start_block).clear(&mut self.dev)?;
        }

        let entry = DirEntry::new(name, kind, block_u32(start_block)?, size);
        self.cwd.store(&mut self.dev, slot, &entry)?;
        debug!(
            "created {:?} {} of {} bytes at block {} in slot {}",
            kind, name, size, start_block, slot
        );
        Ok(())
    }

    /// Soft deletes an entry of the current directory. Its blocks are released
    /// in the bitmap but their contents are left in place.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let (slot, entry) = self.lookup(name)?;

        if entry.is_dir() {
            let table = DirTable::new(&self.super_block, entry.start_block as BlockNumber);
            if !table.used_entries(&mut self.dev)?.is_empty() {
                return Err(FsError::DirectoryNotEmpty(name.to_string()));
            }
        }

        let blocks = self.super_block.blocks_for(entry.size as u64);
        if blocks > 0 {
            self.bitmap.mark_range(
                &mut self.dev,
                entry.start_block as BlockNumber,
                blocks,
                State::Free,
            )?;
        }
        self.cwd.tombstone(&mut self.dev, slot)?;
        debug!("removed {} releasing {} blocks", name, blocks);
        Ok(())
    }

    /// Reads exactly `length` bytes at `offset`. Reading past the recorded size
    /// is an error rather than a short read.
    pub fn read(&mut self, name: &str, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0; length as usize];
        self.read_into(name, offset, &mut buf)?;
        Ok(buf)
    }

    /// Fills `buf` from the file starting at `offset`.
    pub fn read_into(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<()> {
        let (_, entry) = self.lookup_file(name)?;
        let end = offset as u64 + buf.len() as u64;
        if end > entry.size as u64 {
            return Err(FsError::InvalidArgument(format!(
                "read of {}..{} past end of {} ({} bytes)",
                offset, end, name, entry.size
            )));
        }

        let mut done = 0;
        for (disk_offset, len) in self.segments(&entry, offset as u64, buf.len()) {
            self.dev.read_at(disk_offset, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Writes `data` at `offset`, growing the file when the write ends past its
    /// current size. Growth first tries to claim the blocks right after the
    /// file and otherwise moves the whole file to a new run large enough for
    /// the new size. Space is reserved before any payload byte is written.
    pub fn write(&mut self, name: &str, offset: u32, data: &[u8]) -> Result<()> {
        let (slot, mut entry) = self.lookup_file(name)?;
        let before = entry.clone();

        let end = offset as u64 + data.len() as u64;
        let new_size = std::cmp::max(entry.size as u64, end);
        let new_size = u32::try_from(new_size).map_err(|_| {
            FsError::InvalidArgument(format!("write would grow {} past {} bytes", name, u32::MAX))
        })?;

        let old_size = entry.size;
        let current_blocks = self.super_block.blocks_for(old_size as u64);
        let needed_blocks = self.super_block.blocks_for(new_size as u64);

        let mut vacated = None;
        if needed_blocks > current_blocks {
            let extra = needed_blocks - current_blocks;
            if current_blocks > 0 && self.adjacent_free(&entry, current_blocks, extra)? {
                self.extend(&entry, current_blocks, extra)?;
            } else {
                vacated = self.relocate(&mut entry, current_blocks, needed_blocks)?;
            }
        }
        entry.size = new_size;
        if entry != before {
            self.cwd.store(&mut self.dev, slot, &entry)?;
        }
        // The old range is only released once the entry points at the copy.
        if let Some((old_start, count)) = vacated {
            self.bitmap
                .mark_range(&mut self.dev, old_start, count, State::Free)?;
        }

        // Bytes between the old end and the write are zeroed so stale blocks
        // never leak into the file.
        if offset > old_size {
            let gap = vec![0; (offset - old_size) as usize];
            self.write_segments(&entry, old_size as u64, &gap)?;
        }
        self.write_segments(&entry, offset as u64, data)?;
        self.dev.sync_disk()?;
        Ok(())
    }

    /// Switches the current directory. ".", ".." and "/" all lead back to root
    /// since there is only one level below it.
    pub fn change_directory(&mut self, name: &str) -> Result<()> {
        if name == "." || name == ".." || name == "/" {
            self.cwd = DirTable::new(&self.super_block, self.super_block.root_start);
            info!("changed directory to root");
            return Ok(());
        }

        let entry = match self.cwd.find(&mut self.dev, name)? {
            Some((_, entry)) if entry.is_dir() => entry,
            _ => return Err(FsError::NotFound(name.to_string())),
        };
        if !self.at_root() {
            // Nested directories cannot be created, an entry like this only
            // shows up on media written by other tools.
            warn!("entering directory {} below a subdirectory", name);
        }
        self.cwd = DirTable::new(&self.super_block, entry.start_block as BlockNumber);
        info!("changed directory to {} at block {}", name, entry.start_block);
        Ok(())
    }

    /// Used entries of the current directory in slot order.
    pub fn list(&mut self) -> Result<Vec<DirEntry>> {
        self.cwd.used_entries(&mut self.dev)
    }

    /// The entry for `name` in the current directory.
    pub fn stat(&mut self, name: &str) -> Result<DirEntry> {
        Ok(self.lookup(name)?.1)
    }

    pub fn block_state(&mut self, blocknr: BlockNumber) -> Result<State> {
        self.bitmap.get(&mut self.dev, blocknr)
    }

    pub fn free_blocks(&mut self) -> Result<u64> {
        self.bitmap.count_free(&mut self.dev)
    }

    pub fn stats(&mut self) -> Result<FsStats> {
        Ok(FsStats {
            block_size: self.super_block.block_size,
            total_blocks: self.super_block.total_blocks,
            data_blocks: self.super_block.data_blocks(),
            free_blocks: self.free_blocks()?,
        })
    }

    fn lookup(&mut self, name: &str) -> Result<(usize, DirEntry)> {
        self.cwd
            .find(&mut self.dev, name)?
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    fn lookup_file(&mut self, name: &str) -> Result<(usize, DirEntry)> {
        let (slot, entry) = self.lookup(name)?;
        if entry.is_dir() {
            return Err(FsError::InvalidArgument(format!("{} is a directory", name)));
        }
        Ok((slot, entry))
    }

    /// Whether the `extra` blocks right after the file are on the medium and
    /// free. Stops at the first block that is not.
    fn adjacent_free(&mut self, entry: &DirEntry, current: u64, extra: u64) -> Result<bool> {
        let first = entry.start_block as BlockNumber + current;
        for blocknr in first..first + extra {
            if blocknr >= self.super_block.total_blocks {
                return Ok(false);
            }
            if !self.bitmap.is_free(&mut self.dev, blocknr)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn extend(&mut self, entry: &DirEntry, current: u64, extra: u64) -> Result<()> {
        let first = entry.start_block as BlockNumber + current;
        debug!("extending {} in place by {} blocks at {}", entry.name, extra, first);
        self.bitmap.mark_range(&mut self.dev, first, extra, State::Used)
    }

    /// Moves the file to the first run of `needed` free blocks, copying its
    /// current blocks over. Returns the old range, still marked used, for the
    /// caller to release after the entry is updated.
    fn relocate(
        &mut self,
        entry: &mut DirEntry,
        current: u64,
        needed: u64,
    ) -> Result<Option<(BlockNumber, u64)>> {
        let new_start = self
            .bitmap
            .find_first_fit(&mut self.dev, needed, self.super_block.data_start)?;
        let old_start = entry.start_block as BlockNumber;
        debug!(
            "relocating {} from {} ({} blocks) to {} ({} blocks)",
            entry.name, old_start, current, new_start, needed
        );

        self.bitmap
            .mark_range(&mut self.dev, new_start, needed, State::Used)?;

        // Single block scratch buffer.
        let mut block_buf = vec![0; self.super_block.block_size as usize];
        for i in 0..current {
            self.dev.read_block(old_start + i, &mut block_buf)?;
            self.dev.write_block(new_start + i, &block_buf)?;
        }
        self.dev.sync_disk()?;

        entry.start_block = block_u32(new_start)?;
        if current > 0 {
            Ok(Some((old_start, current)))
        } else {
            Ok(None)
        }
    }

    fn write_segments(&mut self, entry: &DirEntry, offset: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        for (disk_offset, len) in self.segments(entry, offset, data.len()) {
            self.dev.write_at(disk_offset, &data[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    fn segments(&self, entry: &DirEntry, offset: u64, len: usize) -> Segments {
        Segments {
            start_block: entry.start_block as BlockNumber,
            block_size: self.super_block.block_size as u64,
            position: offset,
            remaining: len,
        }
    }
}

/// Splits a byte range of a file into per-block pieces, yielding the absolute
/// disk offset and length of each. Logical block `n` of a file is physical
/// block `start_block + n`.
struct Segments {
    start_block: BlockNumber,
    block_size: u64,
    position: u64,
    remaining: usize,
}

impl Iterator for Segments {
    type Item = (u64, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let block = self.start_block + self.position / self.block_size;
        let in_block = self.position % self.block_size;
        let len = std::cmp::min((self.block_size - in_block) as usize, self.remaining);

        self.position += len as u64;
        self.remaining -= len;
        Some((block * self.block_size + in_block, len))
    }
}

fn block_u32(blocknr: BlockNumber) -> Result<u32> {
    u32::try_from(blocknr)
        .map_err(|_| FsError::InvalidArgument(format!("block {} not addressable", blocknr)))
}
