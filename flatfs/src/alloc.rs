use fileblock::{BlockNumber, BlockStorage};

use crate::fs::{FsError, Result};
use crate::sb::{div_ceil, SuperBlock};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// The on-disk allocation map. One bit per block of the medium, bit `n` lives in
/// byte `n / 8` of the bitmap region at position `n % 8`, a set bit marks the
/// block as used.
///
/// The bitmap is never cached, every query reads the medium and every update is
/// written back before returning.
pub struct Bitmap {
    /// Absolute byte offset of the first bitmap byte.
    base: u64,
    /// Number of blocks tracked, bits past this index are padding.
    total_blocks: u64,
}

impl Bitmap {
    pub fn new(sb: &SuperBlock) -> Self {
        Self {
            base: sb.offset_of(sb.bitmap_start),
            total_blocks: sb.total_blocks,
        }
    }

    fn check_range(&self, start: BlockNumber, count: u64) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.total_blocks => Ok(()),
            _ => Err(FsError::InvalidArgument(format!(
                "blocks {}+{} outside of medium with {} blocks",
                start, count, self.total_blocks
            ))),
        }
    }

    pub fn get<T: BlockStorage>(&self, dev: &mut T, blocknr: BlockNumber) -> Result<State> {
        self.check_range(blocknr, 1)?;
        let mut byte = [0_u8; 1];
        dev.read_at(self.base + blocknr / 8, &mut byte)?;

        let mask = 0b01_u8 << (blocknr % 8);
        if byte[0] & mask == 0 {
            Ok(State::Free)
        } else {
            Ok(State::Used)
        }
    }

    pub fn is_free<T: BlockStorage>(&self, dev: &mut T, blocknr: BlockNumber) -> Result<bool> {
        Ok(self.get(dev, blocknr)? == State::Free)
    }

    /// Sets `count` consecutive bits starting at `start`. Each bit is a separate
    /// read-modify-write of its byte, the range is flushed before returning.
    pub fn mark_range<T: BlockStorage>(
        &self,
        dev: &mut T,
        start: BlockNumber,
        count: u64,
        state: State,
    ) -> Result<()> {
        self.check_range(start, count)?;
        trace!("marking blocks {}..{} {:?}", start, start + count, state);

        for blocknr in start..start + count {
            let offset = self.base + blocknr / 8;
            let mask = 0b01_u8 << (blocknr % 8);

            let mut byte = [0_u8; 1];
            dev.read_at(offset, &mut byte)?;
            match state {
                State::Used => byte[0] |= mask,
                State::Free => byte[0] &= !mask,
            }
            dev.write_at(offset, &byte)?;
        }
        dev.sync_disk()?;
        Ok(())
    }

    /// First-fit search for `count` contiguous free blocks, scanning upwards from
    /// `from`. Fragmented free space never satisfies a request, only a single run
    /// of at least `count` free blocks does.
    pub fn find_first_fit<T: BlockStorage>(
        &self,
        dev: &mut T,
        count: u64,
        from: BlockNumber,
    ) -> Result<BlockNumber> {
        if count == 0 {
            return Ok(from);
        }
        let map = self.load(dev)?;

        let mut run = 0;
        for blocknr in from..self.total_blocks {
            if bit_is_set(&map, blocknr) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let start = blocknr + 1 - count;
                debug!("first fit for {} blocks at {}", count, start);
                return Ok(start);
            }
        }
        Err(FsError::OutOfSpace { blocks: count })
    }

    /// Counts the free blocks of the whole medium.
    pub fn count_free<T: BlockStorage>(&self, dev: &mut T) -> Result<u64> {
        let map = self.load(dev)?;
        Ok((0..self.total_blocks)
            .filter(|&blocknr| !bit_is_set(&map, blocknr))
            .count() as u64)
    }

    /// Reads the meaningful bytes of the bitmap region in one pass.
    fn load<T: BlockStorage>(&self, dev: &mut T) -> Result<Vec<u8>> {
        let mut map = vec![0; div_ceil(self.total_blocks, 8) as usize];
        dev.read_at(self.base, &mut map)?;
        Ok(map)
    }
}

fn bit_is_set(map: &[u8], blocknr: BlockNumber) -> bool {
    map[(blocknr / 8) as usize] & (0b01_u8 << (blocknr % 8)) != 0
}
