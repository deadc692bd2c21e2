use std::io::ErrorKind;
use std::path::Path;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = u64;

/// Tried to map as closely as possible to the prescribed interface found here:
/// http://web.mit.edu/6.033/1997/handouts/html/04sfs.html.
///
/// Besides whole blocks the storage also allows byte addressed access, file
/// systems with sub-block records (bitmap bytes, directory entries) update
/// them in place without rewriting the containing block.
pub trait BlockStorage {
    /// Opens a disk at the specified path. This method does not validate the
    /// storage blocks, it is up for clients to ensure disks are appropriately initialized.
    fn open_disk<P: AsRef<Path>>(path: P, block_size: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;

    /// The size of one block in bytes.
    fn block_size(&self) -> usize;

    /// The total number of blocks addressable on the medium.
    fn block_count(&self) -> u64;

    /// Grows or shrinks the medium to exactly `blocks` blocks. New space reads
    /// back as zeroes.
    fn set_block_count(&mut self, blocks: u64) -> std::io::Result<()>;

    /// Reads `buf.len()` bytes starting at the absolute byte offset.
    ///
    /// # Errors
    ///
    /// Attempting to read past the last block will return an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;

    /// Writes all of `buf` starting at the absolute byte offset.
    ///
    /// # Errors
    ///
    /// Attempting to write past the last block will return an error.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()>;

    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;

    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range, or into a buffer smaller than
    /// a block, will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        let block_size = self.block_size();
        if buf.len() < block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.check_block(blocknr)?;
        self.read_at(blocknr * block_size as u64, &mut buf[..block_size])
    }

    /// Writes provided buffer into the specified block number. Buffers longer
    /// than a block are truncated to the block size.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        let block_size = self.block_size();
        self.check_block(blocknr)?;
        let max = std::cmp::min(block_size, buf.len());
        self.write_at(blocknr * block_size as u64, &buf[..max])
    }

    /// Returns an error if the block number is outside the medium.
    fn check_block(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        Ok(())
    }
}
