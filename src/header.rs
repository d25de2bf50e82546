//! The 64 KiB control header: a fixed region at the front of the file,
//! mapped independently of the arena's chunk table and `msync`'d directly at
//! the two fixed points the commit protocol calls for.
//!
//! Layout, all fields little-endian `u64`: magic (0), selector (8, low byte
//! only), then two `Meta` records of 24 bytes each at 16 and 40.

use crate::memory::HEADER_SIZE;
use crate::utils::errors::{DbError, DbResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;

const MAGIC: u64 = 0x7661_756C_7463_6F72;
const MAGIC_OFF: u64 = 0;
const SELECTOR_OFF: u64 = 8;
const META0_OFF: u64 = 16;
const META_SIZE: u64 = 24;
const META1_OFF: u64 = META0_OFF + META_SIZE;

/// One half of the double-buffered commit record: where the current
/// `Versions` block lives, and where the next writer may resume allocating.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    pub versions_ref: u64,
    pub logical_file_size: u64,
    pub in_file_allocation_point: u64,
}

pub struct Header {
    map: MmapMut,
}

impl Header {
    /// Lay down a fresh header over a brand-new, already `set_len`'d file.
    /// `meta[0]` starts empty; the first `Db::commit` fills it in.
    ///
    /// # Errors
    /// Returns `DbError::Io` if the header can't be mapped.
    pub fn create(file: &File, first_alloc_point: u64) -> DbResult<Self> {
        file.set_len(HEADER_SIZE)?;
        let map = unsafe { MmapOptions::new().len(HEADER_SIZE as usize).map_mut(file)? };
        let mut header = Header { map };
        header.write_u64(MAGIC_OFF, MAGIC);
        header.write_u8(SELECTOR_OFF, 0);
        header.write_meta(META0_OFF, Meta { versions_ref: 0, logical_file_size: HEADER_SIZE, in_file_allocation_point: first_alloc_point });
        header.write_meta(META1_OFF, Meta::default());
        header.sync()?;
        Ok(header)
    }

    /// Map the header of an existing file.
    ///
    /// # Errors
    /// Returns `DbError::Io` if the header can't be mapped, or
    /// `DbError::CorruptHeader` if the magic doesn't match.
    pub fn open(file: &File) -> DbResult<Self> {
        let map = unsafe { MmapOptions::new().len(HEADER_SIZE as usize).map_mut(file)? };
        let header = Header { map };
        if header.read_u64(MAGIC_OFF) != MAGIC {
            log::error!("header magic mismatch: not a database file or header is corrupt");
            return Err(DbError::CorruptHeader("bad magic".into()));
        }
        Ok(header)
    }

    fn read_u64(&self, off: u64) -> u64 {
        u64::from_le_bytes(self.map[off as usize..off as usize + 8].try_into().unwrap())
    }
    fn write_u64(&mut self, off: u64, v: u64) {
        self.map[off as usize..off as usize + 8].copy_from_slice(&v.to_le_bytes());
    }
    fn write_u8(&mut self, off: u64, v: u8) {
        self.map[off as usize] = v;
    }

    fn meta_off(selector: u8) -> u64 {
        if selector == 0 { META0_OFF } else { META1_OFF }
    }

    fn read_meta(&self, off: u64) -> Meta {
        Meta {
            versions_ref: self.read_u64(off),
            logical_file_size: self.read_u64(off + 8),
            in_file_allocation_point: self.read_u64(off + 16),
        }
    }
    fn write_meta(&mut self, off: u64, meta: Meta) {
        self.write_u64(off, meta.versions_ref);
        self.write_u64(off + 8, meta.logical_file_size);
        self.write_u64(off + 16, meta.in_file_allocation_point);
    }

    #[must_use]
    pub fn selector(&self) -> u8 {
        self.map[SELECTOR_OFF as usize]
    }

    /// The currently active `Meta`: the one readers and the next writer see.
    #[must_use]
    pub fn active_meta(&self) -> Meta {
        self.read_meta(Self::meta_off(self.selector()))
    }

    /// Write `meta` into the slot the active selector does *not* point to.
    /// Does not flip the selector or sync -- callers must `sync` once with
    /// the new data in place and once after flipping, per the protocol.
    pub fn write_inactive_meta(&mut self, meta: Meta) {
        self.write_meta(Self::meta_off(1 ^ self.selector()), meta);
    }

    /// Flip the active selector to the slot last written by
    /// `write_inactive_meta`. Does not sync.
    pub fn flip_selector(&mut self) {
        let next = 1 ^ self.selector();
        self.write_u8(SELECTOR_OFF, next);
    }

    /// # Errors
    /// Returns `DbError::Io` if the `msync` fails.
    pub fn sync(&self) -> DbResult<()> {
        self.map.flush().map_err(|e| {
            log::error!("header msync failed: {e}");
            DbError::Io(e)
        })
    }
}
