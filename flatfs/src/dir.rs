use fileblock::{BlockNumber, BlockStorage};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::fs::{FsError, Result};
use crate::sb::SuperBlock;

pub const ENTRIES_PER_DIR: usize = 64;
pub const ENTRY_SIZE: usize = 64;
pub const DIR_TABLE_BYTES: usize = ENTRIES_PER_DIR * ENTRY_SIZE;
/// Longest name in bytes, the name field keeps one byte for the terminator.
pub const MAX_NAME_LEN: usize = 49;
const NAME_FIELD_LEN: usize = MAX_NAME_LEN + 1;

const STATUS_FREE: u8 = 0x00;
const STATUS_USED: u8 = 0x01;
const STATUS_DELETED: u8 = 0xE5;

const TYPE_FILE: u8 = 0;
const TYPE_DIRECTORY: u8 = 1;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
/// This structure __must be exactly 64 bytes.__
struct RawEntry {
  status: u8,
  kind: u8,
  start_block: U32<LittleEndian>,
  size_bytes: U32<LittleEndian>,
  name: [u8; NAME_FIELD_LEN],
  reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<RawEntry>() == ENTRY_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  /// Never used since the table was initialized.
  Free,
  Used,
  /// Soft deleted, the slot may be reused.
  Deleted,
  /// A status byte this implementation does not know, the slot is left alone.
  Unknown(u8),
}

impl From<u8> for Status {
  fn from(byte: u8) -> Self {
    match byte {
      STATUS_FREE => Status::Free,
      STATUS_USED => Status::Used,
      STATUS_DELETED => Status::Deleted,
      other => Status::Unknown(other),
    }
  }
}

impl From<Status> for u8 {
  fn from(status: Status) -> Self {
    match status {
      Status::Free => STATUS_FREE,
      Status::Used => STATUS_USED,
      Status::Deleted => STATUS_DELETED,
      Status::Unknown(byte) => byte,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
  File,
  /// The entry's block holds a nested table in the same format as the root.
  Directory,
}

/// One slot of a directory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
  pub status: Status,
  pub kind: EntryKind,
  /// First block of the contiguous range, 0 for empty files.
  pub start_block: u32,
  pub size: u32,
  pub name: String,
}

impl DirEntry {
  pub fn new(name: &str, kind: EntryKind, start_block: u32, size: u32) -> Self {
    Self {
      status: Status::Used,
      kind,
      start_block,
      size,
      name: name.to_string(),
    }
  }

  pub fn is_used(&self) -> bool {
    self.status == Status::Used
  }

  pub fn is_dir(&self) -> bool {
    self.kind == EntryKind::Directory
  }

  fn parse(buf: &[u8]) -> Self {
    // Callers always pass an ENTRY_SIZE chunk.
    let raw = RawEntry::read_from_prefix(buf).unwrap_or_else(RawEntry::new_zeroed);
    let name_len = raw.name.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
    Self {
      status: Status::from(raw.status),
      kind: match raw.kind {
        TYPE_DIRECTORY => EntryKind::Directory,
        _ => EntryKind::File,
      },
      start_block: raw.start_block.get(),
      size: raw.size_bytes.get(),
      name: String::from_utf8_lossy(&raw.name[..name_len]).into_owned(),
    }
  }

  fn serialize(&self) -> [u8; ENTRY_SIZE] {
    let mut raw = RawEntry::new_zeroed();
    raw.status = self.status.into();
    raw.kind = match self.kind {
      EntryKind::File => TYPE_FILE,
      EntryKind::Directory => TYPE_DIRECTORY,
    };
    raw.start_block.set(self.start_block);
    raw.size_bytes.set(self.size);
    let name = self.name.as_bytes();
    let len = std::cmp::min(name.len(), MAX_NAME_LEN);
    raw.name[..len].copy_from_slice(&name[..len]);

    let mut encoded = [0; ENTRY_SIZE];
    encoded.copy_from_slice(raw.as_bytes());
    encoded
  }
}

/// Rejects names that cannot be stored in an entry or that collide with the
/// navigation names.
pub fn validate_name(name: &str) -> Result<()> {
  if name.is_empty() || name.len() > MAX_NAME_LEN {
    return Err(FsError::InvalidArgument(format!(
      "name must be 1 to {} bytes long, got {}",
      MAX_NAME_LEN,
      name.len()
    )));
  }
  if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
    return Err(FsError::InvalidArgument(format!("invalid name {:?}", name)));
  }
  Ok(())
}

/// A fixed table of 64 entries filling the start of one block. The root
/// directory and every subdirectory share this format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirTable {
  block: BlockNumber,
  /// Absolute byte offset of slot 0.
  base: u64,
  block_size: usize,
}

impl DirTable {
  pub fn new(sb: &SuperBlock, block: BlockNumber) -> Self {
    Self {
      block,
      base: sb.offset_of(block),
      block_size: sb.block_size as usize,
    }
  }

  pub fn block(&self) -> BlockNumber {
    self.block
  }

  fn slot_offset(&self, slot: usize) -> u64 {
    debug_assert!(slot < ENTRIES_PER_DIR);
    self.base + (slot * ENTRY_SIZE) as u64
  }

  /// Reads all 64 slots in order.
  pub fn load<T: BlockStorage>(&self, dev: &mut T) -> Result<Vec<DirEntry>> {
    let mut table = vec![0; DIR_TABLE_BYTES];
    dev.read_at(self.base, &mut table)?;
    Ok(table.chunks(ENTRY_SIZE).map(DirEntry::parse).collect())
  }

  /// Linear scan for a used entry with exactly this name.
  pub fn find<T: BlockStorage>(&self, dev: &mut T, name: &str) -> Result<Option<(usize, DirEntry)>> {
    Ok(
      self
        .load(dev)?
        .into_iter()
        .enumerate()
        .find(|(_, entry)| entry.is_used() && entry.name == name),
    )
  }

  /// First slot that was never used or holds a deleted entry.
  pub fn find_free_slot<T: BlockStorage>(&self, dev: &mut T) -> Result<Option<usize>> {
    Ok(
      self
        .load(dev)?
        .iter()
        .position(|entry| matches!(entry.status, Status::Free | Status::Deleted)),
    )
  }

  /// Picks the slot a new entry named `name` would go into. Every slot is
  /// checked for a name collision, not just the ones before the free slot.
  pub fn reserve_slot<T: BlockStorage>(&self, dev: &mut T, name: &str) -> Result<usize> {
    if self.find(dev, name)?.is_some() {
      return Err(FsError::AlreadyExists(name.to_string()));
    }
    self.find_free_slot(dev)?.ok_or(FsError::DirectoryFull)
  }

  /// Writes one entry and flushes it.
  pub fn store<T: BlockStorage>(&self, dev: &mut T, slot: usize, entry: &DirEntry) -> Result<()> {
    dev.write_at(self.slot_offset(slot), &entry.serialize())?;
    dev.sync_disk()?;
    Ok(())
  }

  /// Marks the slot deleted. Only the status byte changes, the rest of the
  /// record stays on disk as it was.
  pub fn tombstone<T: BlockStorage>(&self, dev: &mut T, slot: usize) -> Result<()> {
    dev.write_at(self.slot_offset(slot), &[STATUS_DELETED])?;
    dev.sync_disk()?;
    Ok(())
  }

  /// Zeroes the whole block, leaving 64 free slots.
  pub fn clear<T: BlockStorage>(&self, dev: &mut T) -> Result<()> {
    dev.write_at(self.base, &vec![0; self.block_size])?;
    dev.sync_disk()?;
    Ok(())
  }

  /// Used entries in slot order.
  pub fn used_entries<T: BlockStorage>(&self, dev: &mut T) -> Result<Vec<DirEntry>> {
    Ok(self.load(dev)?.into_iter().filter(DirEntry::is_used).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use fileblock::{FileBlockEmulator, FileBlockEmulatorBuilder};

  fn setup() -> (FileBlockEmulator, DirTable) {
    let sb = SuperBlock::for_sectors(2000, 4096).unwrap();
    let dev = FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
      .with_block_count(sb.total_blocks)
      .build()
      .unwrap();
    let table = DirTable::new(&sb, sb.root_start);
    (dev, table)
  }

  #[test]
  fn entry_fields_have_fixed_offsets() {
    let entry = DirEntry::new("a.txt", EntryKind::Directory, 0x0102_0304, 5000);
    let encoded = entry.serialize();

    assert_eq!(encoded[0], STATUS_USED);
    assert_eq!(encoded[1], TYPE_DIRECTORY);
    assert_eq!(&encoded[2..6], &0x0102_0304_u32.to_le_bytes());
    assert_eq!(&encoded[6..10], &5000_u32.to_le_bytes());
    assert_eq!(&encoded[10..15], b"a.txt");
    assert!(encoded[15..].iter().all(|&b| b == 0));
    assert_eq!(DirEntry::parse(&encoded), entry);
  }

  #[test]
  fn longest_name_keeps_terminator() {
    let name = "n".repeat(MAX_NAME_LEN);
    let encoded = DirEntry::new(&name, EntryKind::File, 4, 1).serialize();

    assert_eq!(encoded[10 + MAX_NAME_LEN], 0);
    assert_eq!(DirEntry::parse(&encoded).name, name);
  }

  #[test]
  fn names_are_validated() {
    assert!(validate_name("notes.txt").is_ok());
    assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
    assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    assert!(validate_name("").is_err());
    assert!(validate_name(".").is_err());
    assert!(validate_name("..").is_err());
    assert!(validate_name("a/b").is_err());
  }

  #[test]
  fn zeroed_table_has_64_free_slots() {
    let (mut dev, table) = setup();

    let entries = table.load(&mut dev).unwrap();
    assert_eq!(entries.len(), ENTRIES_PER_DIR);
    assert!(entries.iter().all(|e| e.status == Status::Free));
    assert_eq!(table.find_free_slot(&mut dev).unwrap(), Some(0));
  }

  #[test]
  fn find_matches_only_used_entries() {
    let (mut dev, table) = setup();
    table.store(&mut dev, 0, &DirEntry::new("gone", EntryKind::File, 4, 10)).unwrap();
    table.tombstone(&mut dev, 0).unwrap();
    table.store(&mut dev, 1, &DirEntry::new("here", EntryKind::File, 5, 10)).unwrap();

    assert!(table.find(&mut dev, "gone").unwrap().is_none());
    let (slot, entry) = table.find(&mut dev, "here").unwrap().unwrap();
    assert_eq!(slot, 1);
    assert_eq!(entry.start_block, 5);
  }

  #[test]
  fn tombstone_keeps_record_bytes() {
    let (mut dev, table) = setup();
    table.store(&mut dev, 3, &DirEntry::new("old", EntryKind::File, 9, 77)).unwrap();
    table.tombstone(&mut dev, 3).unwrap();

    let entry = &table.load(&mut dev).unwrap()[3];
    assert_eq!(entry.status, Status::Deleted);
    assert_eq!(entry.name, "old");
    assert_eq!(entry.start_block, 9);
    assert_eq!(entry.size, 77);
  }

  #[test]
  fn deleted_slot_is_reused_before_later_free_slots() {
    let (mut dev, table) = setup();
    for (slot, name) in ["a", "b", "c"].iter().enumerate() {
      table.store(&mut dev, slot, &DirEntry::new(name, EntryKind::File, 0, 0)).unwrap();
    }
    table.tombstone(&mut dev, 1).unwrap();

    assert_eq!(table.find_free_slot(&mut dev).unwrap(), Some(1));
    assert_eq!(table.reserve_slot(&mut dev, "d").unwrap(), 1);
  }

  #[test]
  fn reserve_slot_sees_collisions_past_the_free_slot() {
    let (mut dev, table) = setup();
    table.store(&mut dev, 5, &DirEntry::new("late", EntryKind::File, 0, 0)).unwrap();

    match table.reserve_slot(&mut dev, "late") {
      Err(FsError::AlreadyExists(name)) => assert_eq!(name, "late"),
      other => panic!("unexpected result {:?}", other),
    }
  }

  #[test]
  fn full_table_has_no_slot() {
    let (mut dev, table) = setup();
    for slot in 0..ENTRIES_PER_DIR {
      let name = format!("f{}", slot);
      table.store(&mut dev, slot, &DirEntry::new(&name, EntryKind::File, 0, 0)).unwrap();
    }

    assert_eq!(table.find_free_slot(&mut dev).unwrap(), None);
    match table.reserve_slot(&mut dev, "one-more") {
      Err(FsError::DirectoryFull) => (),
      other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(table.used_entries(&mut dev).unwrap().len(), ENTRIES_PER_DIR);
  }

  #[test]
  fn unknown_status_is_neither_found_nor_reused() {
    let (mut dev, table) = setup();
    let mut odd = DirEntry::new("odd", EntryKind::File, 0, 0);
    odd.status = Status::Unknown(0x7F);
    table.store(&mut dev, 0, &odd).unwrap();

    assert!(table.find(&mut dev, "odd").unwrap().is_none());
    assert_eq!(table.find_free_slot(&mut dev).unwrap(), Some(1));
  }
}
