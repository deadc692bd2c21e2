use std::convert::TryFrom;

use fileblock::BlockNumber;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::dir::DIR_TABLE_BYTES;
use crate::fs::{FsError, Result};

/// Format sizes are expressed in sectors of this many bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Known locations.
pub const BOOT_BLOCK: BlockNumber = 0;
pub const SUPERBLOCK_INDEX: BlockNumber = 1;
pub const BITMAP_START: BlockNumber = 2;

/// On-disk image of the superblock. Field offsets are fixed by declaration order
/// and every field is little endian.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
struct RawSuperBlock {
    block_size: U32<LittleEndian>,
    total_blocks: U64<LittleEndian>,
    bitmap_start: U64<LittleEndian>,
    root_start: U64<LittleEndian>,
    data_start: U64<LittleEndian>,
}

const RAW_SUPERBLOCK_SIZE: usize = 36;
const _: () = assert!(std::mem::size_of::<RawSuperBlock>() == RAW_SUPERBLOCK_SIZE);

/// The second block of the file system describing the region geometry. It is
/// written once at format time and read back at mount.
///
/// # Layout
/// ===========================================================================
/// | Boot (1) | SuperBlock (1) | Bitmap (N) | Root directory (1) | Data ... |
/// ===========================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// Size of every block in bytes.
    pub block_size: u32,
    /// Number of blocks on the medium, system regions included.
    pub total_blocks: u64,
    /// First block of the allocation bitmap.
    pub bitmap_start: BlockNumber,
    /// The single block holding the root directory table.
    pub root_start: BlockNumber,
    /// First block available for file data.
    pub data_start: BlockNumber,
}

impl SuperBlock {
    /// Computes the geometry for a medium of `sector_count` 512 byte sectors
    /// split into blocks of `block_size` bytes.
    pub fn for_sectors(sector_count: u64, block_size: usize) -> Result<Self> {
        if block_size < DIR_TABLE_BYTES || block_size as u64 % SECTOR_SIZE != 0 {
            return Err(FsError::InvalidArgument(format!(
                "block size {} must be a multiple of {} and hold a {} byte directory table",
                block_size, SECTOR_SIZE, DIR_TABLE_BYTES
            )));
        }
        let block_size = u32::try_from(block_size)
            .map_err(|_| FsError::InvalidArgument(format!("block size {} too large", block_size)))?;

        let total_bytes = sector_count
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| FsError::InvalidArgument(format!("{} sectors overflow", sector_count)))?;
        let total_blocks = total_bytes / block_size as u64;

        let bitmap_bytes = div_ceil(total_blocks, 8);
        let bitmap_blocks = std::cmp::max(1, div_ceil(bitmap_bytes, block_size as u64));
        let root_start = BITMAP_START + bitmap_blocks;
        let data_start = root_start + 1;

        if total_blocks <= data_start {
            return Err(FsError::InvalidArgument(format!(
                "{} sectors give {} blocks, at least {} are needed",
                sector_count,
                total_blocks,
                data_start + 1
            )));
        }
        // Entries address blocks with 32 bits.
        if total_blocks > u32::MAX as u64 {
            return Err(FsError::InvalidArgument(format!(
                "{} blocks exceed the addressable range",
                total_blocks
            )));
        }

        Ok(Self {
            block_size,
            total_blocks,
            bitmap_start: BITMAP_START,
            root_start,
            data_start,
        })
    }

    pub fn bitmap_blocks(&self) -> u64 {
        self.root_start - self.bitmap_start
    }

    pub fn data_blocks(&self) -> u64 {
        self.total_blocks - self.data_start
    }

    /// Number of blocks needed to hold `bytes`, zero for an empty file.
    pub fn blocks_for(&self, bytes: u64) -> u64 {
        div_ceil(bytes, self.block_size as u64)
    }

    /// Absolute byte offset of the start of a block.
    pub fn offset_of(&self, blocknr: BlockNumber) -> u64 {
        blocknr * self.block_size as u64
    }

    /// Reads the superblock from the start of a buffer and checks the regions
    /// are ordered and in range.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let raw = RawSuperBlock::read_from_prefix(buf)
            .ok_or_else(|| FsError::Unformatted("superblock truncated".to_string()))?;

        let sb = Self {
            block_size: raw.block_size.get(),
            total_blocks: raw.total_blocks.get(),
            bitmap_start: raw.bitmap_start.get(),
            root_start: raw.root_start.get(),
            data_start: raw.data_start.get(),
        };
        sb.check_regions()?;
        Ok(sb)
    }

    /// Serializes the SuperBlock into a full block buffer for writing to disk.
    /// The rest of the block after the fields is zero padded.
    pub fn serialize(&self) -> Vec<u8> {
        let raw = RawSuperBlock {
            block_size: U32::new(self.block_size),
            total_blocks: U64::new(self.total_blocks),
            bitmap_start: U64::new(self.bitmap_start),
            root_start: U64::new(self.root_start),
            data_start: U64::new(self.data_start),
        };
        let mut encoded = vec![0; self.block_size as usize];
        encoded[..RAW_SUPERBLOCK_SIZE].copy_from_slice(raw.as_bytes());
        encoded
    }

    /// Checks the superblock describes the device it was read from.
    pub fn check_device(&self, block_size: usize, block_count: u64) -> Result<()> {
        if self.block_size as usize != block_size {
            return Err(FsError::Unformatted(format!(
                "superblock block size {} does not match device block size {}",
                self.block_size, block_size
            )));
        }
        if self.total_blocks > block_count {
            return Err(FsError::Unformatted(format!(
                "superblock claims {} blocks, device holds {}",
                self.total_blocks, block_count
            )));
        }
        Ok(())
    }

    fn check_regions(&self) -> Result<()> {
        let ordered = self.block_size as usize >= DIR_TABLE_BYTES
            && self.bitmap_start == BITMAP_START
            && self.root_start > self.bitmap_start
            && self.data_start == self.root_start + 1
            && self.data_start < self.total_blocks;
        if !ordered {
            return Err(FsError::Unformatted(format!("invalid region layout {:?}", self)));
        }
        let bitmap_bits = self.bitmap_blocks() * self.block_size as u64 * 8;
        if bitmap_bits < self.total_blocks {
            return Err(FsError::Unformatted(format!(
                "bitmap of {} blocks cannot track {} blocks",
                self.bitmap_blocks(),
                self.total_blocks
            )));
        }
        Ok(())
    }
}

pub(crate) fn div_ceil(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_for_two_thousand_sectors() {
        let sb = SuperBlock::for_sectors(2000, 4096).unwrap();

        assert_eq!(sb.total_blocks, 250);
        assert_eq!(sb.bitmap_blocks(), 1);
        assert_eq!(sb.bitmap_start, 2);
        assert_eq!(sb.root_start, 3);
        assert_eq!(sb.data_start, 4);
    }

    #[test]
    fn large_media_need_more_bitmap_blocks() {
        // 40000 blocks need 5000 bitmap bytes, two 4K blocks.
        let sb = SuperBlock::for_sectors(40_000 * 8, 4096).unwrap();

        assert_eq!(sb.total_blocks, 40_000);
        assert_eq!(sb.bitmap_blocks(), 2);
        assert_eq!(sb.root_start, 4);
        assert_eq!(sb.data_start, 5);
    }

    #[test]
    fn too_few_sectors_are_rejected() {
        // 32 sectors are exactly 4 blocks, leaving nothing for data.
        match SuperBlock::for_sectors(32, 4096) {
            Err(FsError::InvalidArgument(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(SuperBlock::for_sectors(40, 4096).is_ok());
    }

    #[test]
    fn block_size_must_hold_a_directory_table() {
        assert!(SuperBlock::for_sectors(2000, 1024).is_err());
        assert!(SuperBlock::for_sectors(2000, 4100).is_err());
        assert_eq!(SuperBlock::for_sectors(2000, 8192).unwrap().total_blocks, 125);
    }

    #[test]
    fn fields_have_fixed_little_endian_offsets() {
        let sb = SuperBlock::for_sectors(2000, 4096).unwrap();
        let encoded = sb.serialize();

        assert_eq!(encoded.len(), 4096);
        assert_eq!(&encoded[0..4], &4096_u32.to_le_bytes());
        assert_eq!(&encoded[4..12], &250_u64.to_le_bytes());
        assert_eq!(&encoded[12..20], &2_u64.to_le_bytes());
        assert_eq!(&encoded[20..28], &3_u64.to_le_bytes());
        assert_eq!(&encoded[28..36], &4_u64.to_le_bytes());
        assert!(encoded[36..].iter().all(|&b| b == 0));
        assert_eq!(SuperBlock::parse(&encoded).unwrap(), sb);
    }

    #[test]
    fn zeroed_buffer_is_unformatted() {
        let zero_buffer_with_right_size = vec![0; 4096];
        match SuperBlock::parse(&zero_buffer_with_right_size) {
            Err(FsError::Unformatted(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn short_buffer_is_unformatted() {
        assert!(SuperBlock::parse(&[0; 12]).is_err());
    }

    #[test]
    fn device_mismatch_is_reported() {
        let sb = SuperBlock::for_sectors(2000, 4096).unwrap();

        assert!(sb.check_device(4096, 250).is_ok());
        assert!(sb.check_device(8192, 250).is_err());
        assert!(sb.check_device(4096, 249).is_err());
    }
}
