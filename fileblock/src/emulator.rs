use crate::blockio::BlockStorage;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The size of each block in bytes.
    block_size: usize,
    /// The total number of blocks available in the file store.
    block_count: u64,
}

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for file system development and testing.
impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn capacity(&self) -> u64 {
        self.block_count * self.block_size as u64
    }

    fn check_span(&self, offset: u64, len: usize) -> std::io::Result<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.capacity() => Ok(()),
            _ => Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "access exceeds medium upper bound",
            )),
        }
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, block_size: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        FileBlockEmulatorBuilder::from(file)
            .with_block_size(block_size)
            .clear_medium(false)
            .build()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn set_block_count(&mut self, blocks: u64) -> std::io::Result<()> {
        self.fd.set_len(blocks * self.block_size as u64)?;
        self.block_count = blocks;
        debug!("medium resized to {} blocks of {} bytes", blocks, self.block_size);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_span(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        self.check_span(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_size: usize,
    block_count: Option<u64>,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            block_size: DEFAULT_BLOCK_SIZE,
            // Without an explicit count the size of the file rounded down to
            // the nearest block is used.
            block_count: None,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the size in bytes of a single block.
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: u64) -> Self {
        self.block_count = Some(blocks);
        self
    }

    /// Whether the medium is zeroed when the emulator is built. Defaults to true,
    /// pass false to reopen an already initialized disk.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_size == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block size must be non-zero",
            ));
        }

        let block_count = match self.block_count {
            Some(count) => count,
            None if self.clear => 0,
            None => self.fd.metadata()?.len() / self.block_size as u64,
        };

        if self.clear {
            self.zero_blocks(block_count)?;
        }

        Ok(FileBlockEmulator {
            fd: self.fd,
            block_size: self.block_size,
            block_count,
        })
    }

    fn zero_blocks(&mut self, block_count: u64) -> std::io::Result<()> {
        self.fd.set_len(0)?;
        self.fd.seek(SeekFrom::Start(0))?;
        let zeroes = vec![0x00; self.block_size];
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive writes.
        for _ in 0..block_count {
            bfd.write_all(&zeroes)?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockio::BlockStorage;

    fn emulator(blocks: u64) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = emulator(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk_emu = emulator(4);

        // Allocate a block with a non-zero character.
        let block = vec![0x55; 4096];
        disk_emu.write_block(2, &block).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_block = vec![0x00; 4096];
        // Read a different block.
        disk_emu.read_block(3, read_block.as_mut_slice()).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);

        // Read the block with data.
        let mut filled_block = vec![0x00; 4096];
        disk_emu.read_block(2, filled_block.as_mut_slice()).unwrap();
        assert_eq!(filled_block, vec![0x55; 4096]);
    }

    #[test]
    fn read_block_beyond_range_returns_error() {
        let mut disk_emu = emulator(1);

        let block = vec![0x55; 4096];
        assert!(disk_emu.write_block(1, &block).is_err());
        let mut buf = vec![0; 4096];
        assert!(disk_emu.read_block(1, &mut buf).is_err());
    }

    #[test]
    fn writing_to_block_with_buffer_lt_block_size_succeeds() {
        let mut disk_emu = emulator(1);

        // Fill half the block with meaningful data.
        let block = vec![0x55; 2048];
        disk_emu.write_block(0, &block).expect("failed to write block");

        let mut read_block = vec![0x00; 4096];
        disk_emu.read_block(0, &mut read_block).unwrap();
        assert_eq!(&read_block[..2048], &block[..]);
        assert_eq!(&read_block[2048..], &[0; 2048][..]);
    }

    #[test]
    fn byte_access_spans_block_boundaries() {
        let mut disk_emu = emulator(2);

        disk_emu.write_at(4094, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0; 4];
        disk_emu.read_at(4094, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(disk_emu.write_at(2 * 4096 - 1, &[9, 9]).is_err());
    }

    #[test]
    fn custom_block_size_and_resize() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_size(8192)
            .build()
            .unwrap();
        assert_eq!(disk_emu.block_count(), 0);

        disk_emu.set_block_count(3).unwrap();
        assert_eq!(disk_emu.block_count(), 3);
        assert_eq!(disk_emu.block_size(), 8192);
        let mut buf = vec![0xff; 8192];
        disk_emu.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 8192]);
    }

    #[test]
    fn reopened_disk_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .build()
            .unwrap();
        disk_emu.write_block(1, &[0xAB; 4096]).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut reopened = FileBlockEmulator::open_disk(disk.path(), DEFAULT_BLOCK_SIZE).unwrap();
        assert_eq!(reopened.block_count(), 2);
        let mut buf = vec![0; 4096];
        reopened.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0xAB; 4096]);
    }
}
