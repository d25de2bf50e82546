//! The columnar payload: a cluster is a contiguous block of `num_fields`
//! packed-array words, one per schema column, each holding the column's
//! values for every row sharing a cuckoo leaf.
//!
//! Scalar columns (`u`/`i`/`f`/`d`/`t`/`r`) store the value itself, bit-width
//! chosen per §3.4. List and string columns store, per row, a *nested*
//! packed-array control word addressing that row's variable-length content
//! -- so their column array always uses the full 64-bit element width.

use crate::array;
use crate::cuckoo::PayloadMgr;
use crate::memory::Arena;
use crate::utils::errors::{DbError, DbResult};

/// Single-character column type tags, matching the on-disk schema string.
/// Uppercase denotes the list variant of the matching lowercase scalar.
pub const TYPE_U64: char = 'u';
pub const TYPE_I64: char = 'i';
pub const TYPE_F32: char = 'f';
pub const TYPE_F64: char = 'd';
pub const TYPE_TABLE_REF: char = 't';
pub const TYPE_ROW_REF: char = 'r';
pub const TYPE_STRING: char = 's';
pub const TYPE_LIST_U64: char = 'U';
pub const TYPE_LIST_I64: char = 'I';
pub const TYPE_LIST_F32: char = 'F';
pub const TYPE_LIST_F64: char = 'D';
pub const TYPE_LIST_TABLE_REF: char = 'T';
pub const TYPE_LIST_ROW_REF: char = 'R';

#[must_use]
pub fn is_known_type(c: char) -> bool {
    matches!(
        c,
        TYPE_U64
            | TYPE_I64
            | TYPE_F32
            | TYPE_F64
            | TYPE_TABLE_REF
            | TYPE_ROW_REF
            | TYPE_STRING
            | TYPE_LIST_U64
            | TYPE_LIST_I64
            | TYPE_LIST_F32
            | TYPE_LIST_F64
            | TYPE_LIST_TABLE_REF
            | TYPE_LIST_ROW_REF
    )
}

/// Smallest width (from the four numeric size classes) that represents an
/// unsigned magnitude without loss.
#[must_use]
fn min_bits_u64(v: u64) -> u32 {
    if v <= 0xFF {
        8
    } else if v <= 0xFFFF {
        16
    } else if v <= 0xFFFF_FFFF {
        32
    } else {
        64
    }
}

#[must_use]
fn min_bits_i64(v: i64) -> u32 {
    if (-128..=127).contains(&v) {
        8
    } else if (-32_768..=32_767).contains(&v) {
        16
    } else if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&v) {
        32
    } else {
        64
    }
}

/// The one switch this module needs: how wide does `raw` need to be to
/// round-trip through a column of type `type_char`. List/string columns
/// always store a nested control word, so they're always full width.
#[must_use]
pub(crate) fn required_bits(type_char: char, raw: u64) -> u32 {
    match type_char {
        TYPE_U64 | TYPE_TABLE_REF | TYPE_ROW_REF => min_bits_u64(raw),
        TYPE_I64 => min_bits_i64(raw as i64),
        TYPE_F32 => 32,
        TYPE_F64 | TYPE_STRING | TYPE_LIST_U64 | TYPE_LIST_I64 | TYPE_LIST_F32 | TYPE_LIST_F64
        | TYPE_LIST_TABLE_REF | TYPE_LIST_ROW_REF => 64,
        _ => 64,
    }
}

/// List and string columns store a nested control word per row rather than
/// the value itself, so committing them has to recurse one level deeper
/// than a plain scalar column.
#[must_use]
fn is_nested_type(c: char) -> bool {
    matches!(
        c,
        TYPE_STRING
            | TYPE_LIST_U64
            | TYPE_LIST_I64
            | TYPE_LIST_F32
            | TYPE_LIST_F64
            | TYPE_LIST_TABLE_REF
            | TYPE_LIST_ROW_REF
    )
}

fn column_word(mem: &Arena, payload_ref: u64, col: usize) -> u64 {
    unsafe { mem.read(payload_ref + col as u64 * 8) }
}
fn write_column_word(mem: &mut Arena, payload_ref: u64, col: usize, word: u64) {
    unsafe { mem.write(payload_ref + col as u64 * 8, word) };
}

/// Drives the per-column packed-array storage for one table, on behalf of
/// the cuckoo index, which only ever sees an opaque payload ref.
pub struct ClusterMgr<'a> {
    field_types: &'a [char],
    buffer: Vec<u64>,
}

impl<'a> ClusterMgr<'a> {
    #[must_use]
    pub fn new(field_types: &'a [char]) -> Self {
        ClusterMgr { field_types, buffer: vec![0u64; field_types.len()] }
    }

    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.field_types.len()
    }

    fn block_size(&self) -> u64 {
        self.field_types.len() as u64 * 8
    }

    /// Stage a raw value for column `col` to be written by the next
    /// `write_internalbuffer`/`swap_internalbuffer` call.
    pub fn stage(&mut self, col: usize, raw: u64) {
        self.buffer[col] = raw;
    }

    #[must_use]
    pub fn staged(&self, col: usize) -> u64 {
        self.buffer[col]
    }

    /// Read element `row` of column `col` directly out of `payload_ref`,
    /// without touching the internal buffer.
    #[must_use]
    pub fn read_cell(&self, mem: &Arena, payload_ref: u64, row: u64, col: usize) -> u64 {
        if payload_ref == 0 {
            return 0;
        }
        let word = column_word(mem, payload_ref, col);
        array::get(mem, word, row)
    }

    /// The bit width `read_cell`'s raw result was stored at, needed to
    /// sign-extend a signed column's value.
    #[must_use]
    pub fn cell_bits(&self, mem: &Arena, payload_ref: u64, col: usize) -> u32 {
        if payload_ref == 0 {
            return 8;
        }
        array::bits(column_word(mem, payload_ref, col))
    }

    /// Write `raw` into element `row` of column `col`, growing the column's
    /// backing storage as needed. `payload_ref` and its leaf must already be
    /// writable (i.e. COW'd by the caller).
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if growing the column fails.
    pub fn write_cell(&self, mem: &mut Arena, payload_ref: u64, row: u64, cap: u64, col: usize, raw: u64) -> DbResult<()> {
        let ty = self.field_types[col];
        let word = column_word(mem, payload_ref, col);
        let bits = required_bits(ty, raw);
        let new_word = array::set(mem, word, row, raw, bits, cap)?;
        write_column_word(mem, payload_ref, col, new_word);
        Ok(())
    }
}

/// Read the nested control word stored at (row, col) for a list/string
/// column, without going through the internal buffer.
#[must_use]
pub(crate) fn read_list_cell(mem: &Arena, payload_ref: u64, row: u64, col: usize) -> u64 {
    if payload_ref == 0 {
        return array::EMPTY;
    }
    let outer = column_word(mem, payload_ref, col);
    array::get(mem, outer, row)
}

/// Overwrite the nested control word at (row, col). Callers that replace a
/// row's nested array wholesale (rather than growing the existing one
/// through `array::set`) are responsible for freeing the old control
/// word's storage themselves first -- `array::set`/`array::list::set_size`
/// already free superseded storage when they reallocate in place, so doing
/// it again here would double-free.
///
/// # Errors
/// Returns `DbError::OutOfMemory` if growing the outer column array fails.
pub(crate) fn write_list_cell(mem: &mut Arena, payload_ref: u64, row: u64, cap: u64, col: usize, new_inner: u64) -> DbResult<()> {
    let outer = column_word(mem, payload_ref, col);
    let new_outer = array::set(mem, outer, row, new_inner, 64, cap)?;
    write_column_word(mem, payload_ref, col, new_outer);
    Ok(())
}

impl PayloadMgr for ClusterMgr<'_> {
    fn init_internalbuffer(&mut self) {
        self.buffer.iter_mut().for_each(|v| *v = 0);
    }

    fn cow(&mut self, mem: &mut Arena, payload_ref: u64, old_cap: u64, new_cap: u64) -> DbResult<u64> {
        if payload_ref != 0 && mem.is_writable(payload_ref) && old_cap == new_cap {
            return Ok(payload_ref);
        }
        let size = self.block_size();
        let new_ref = mem.alloc(size)?;
        for col in 0..self.field_types.len() {
            let v = if payload_ref == 0 { 0 } else { column_word(mem, payload_ref, col) };
            write_column_word(mem, new_ref, col, v);
        }
        if payload_ref != 0 {
            mem.free(payload_ref, size);
        }
        Ok(new_ref)
    }

    fn write_internalbuffer(&mut self, mem: &mut Arena, payload_ref: u64, row: u64, cap: u64) -> DbResult<()> {
        for col in 0..self.field_types.len() {
            let raw = self.buffer[col];
            self.write_cell(mem, payload_ref, row, cap, col, raw)?;
        }
        Ok(())
    }

    fn swap_internalbuffer(&mut self, mem: &mut Arena, payload_ref: u64, row: u64, cap: u64) -> DbResult<()> {
        for col in 0..self.field_types.len() {
            let old = self.read_cell(mem, payload_ref, row, col);
            self.write_cell(mem, payload_ref, row, cap, col, self.buffer[col])?;
            self.buffer[col] = old;
        }
        Ok(())
    }

    fn read_internalbuffer(&mut self, mem: &Arena, payload_ref: u64, row: u64) {
        for col in 0..self.field_types.len() {
            self.buffer[col] = self.read_cell(mem, payload_ref, row, col);
        }
    }

    fn free(&mut self, mem: &mut Arena, payload_ref: u64, _cap: u64) {
        if payload_ref == 0 {
            return;
        }
        for col in 0..self.field_types.len() {
            let word = column_word(mem, payload_ref, col);
            array::free(mem, word);
        }
        mem.free(payload_ref, self.block_size());
    }

    fn commit(&mut self, mem: &mut Arena, payload_ref: u64) -> DbResult<u64> {
        if payload_ref == 0 || !mem.is_writable(payload_ref) {
            return Ok(payload_ref);
        }
        // Nested arrays (list/string elements) must move to the file region
        // before the outer column array that addresses them does, since
        // once the outer array is frozen it can no longer be patched with
        // the post-commit inner refs.
        for (col, &ty) in self.field_types.iter().enumerate() {
            if !is_nested_type(ty) {
                continue;
            }
            let mut outer = column_word(mem, payload_ref, col);
            let cap = array::capacity(outer);
            for row in 0..cap {
                let inner = array::get(mem, outer, row);
                if inner == 0 {
                    continue;
                }
                let new_inner = array::commit(mem, inner)?;
                if new_inner != inner {
                    outer = array::set(mem, outer, row, new_inner, 64, cap)?;
                }
            }
            write_column_word(mem, payload_ref, col, outer);
        }

        let new_ref = mem.alloc_in_file(self.block_size())?;
        for col in 0..self.field_types.len() {
            let word = column_word(mem, payload_ref, col);
            let new_word = array::commit(mem, word)?;
            write_column_word(mem, new_ref, col, new_word);
        }
        mem.free(payload_ref, self.block_size());
        Ok(new_ref)
    }
}

/// Encode/decode helpers between a column's logical Rust type and the raw
/// bit pattern the cluster stores. Strings and lists are handled separately
/// in `table`/`snapshot` since they need nested array access, not a single
/// scalar conversion.
pub mod codec {
    use super::{DbError, DbResult};
    use crate::array::sign_extend;

    #[must_use]
    pub fn encode_u64(v: u64) -> u64 {
        v
    }
    #[must_use]
    pub fn decode_u64(raw: u64) -> u64 {
        raw
    }
    #[must_use]
    pub fn encode_i64(v: i64) -> u64 {
        v as u64
    }
    #[must_use]
    pub fn decode_i64(raw: u64, bits: u32) -> i64 {
        sign_extend(raw, bits)
    }
    #[must_use]
    pub fn encode_f32(v: f32) -> u64 {
        u64::from(v.to_bits())
    }
    #[must_use]
    pub fn decode_f32(raw: u64) -> f32 {
        f32::from_bits(raw as u32)
    }
    #[must_use]
    pub fn encode_f64(v: f64) -> u64 {
        v.to_bits()
    }
    #[must_use]
    pub fn decode_f64(raw: u64) -> f64 {
        f64::from_bits(raw)
    }

    /// Type-check a column's stored type character against an expected one.
    ///
    /// # Errors
    /// Returns `DbError::WrongFieldType` on mismatch.
    pub fn expect_type(col: u16, actual: char, expected: char) -> DbResult<()> {
        if actual == expected { Ok(()) } else { Err(DbError::WrongFieldType { field: col, actual, expected }) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> Arena {
        Arena::new(tempfile::tempfile().expect("tempfile"))
    }

    const TYPES: [char; 3] = [TYPE_U64, TYPE_I64, TYPE_F64];

    #[test]
    fn write_then_read_cell_round_trips_per_column_type() {
        let mut mem = test_arena();
        let mut mgr = ClusterMgr::new(&TYPES);
        let payload_ref = mgr.cow(&mut mem, 0, 0, 4).unwrap();
        mgr.write_cell(&mut mem, payload_ref, 0, 4, 0, 0xFFFF_FFFF).unwrap();
        mgr.write_cell(&mut mem, payload_ref, 0, 4, 1, codec::encode_i64(-7)).unwrap();
        mgr.write_cell(&mut mem, payload_ref, 0, 4, 2, codec::encode_f64(2.25)).unwrap();

        assert_eq!(mgr.read_cell(&mem, payload_ref, 0, 0), 0xFFFF_FFFF);
        let i_raw = mgr.read_cell(&mem, payload_ref, 0, 1);
        let i_bits = mgr.cell_bits(&mem, payload_ref, 1);
        assert_eq!(codec::decode_i64(i_raw, i_bits), -7);
        assert_eq!(codec::decode_f64(mgr.read_cell(&mem, payload_ref, 0, 2)), 2.25);
    }

    #[test]
    fn swap_internalbuffer_exchanges_row_and_buffer() {
        let mut mem = test_arena();
        let mut mgr = ClusterMgr::new(&TYPES);
        let payload_ref = mgr.cow(&mut mem, 0, 0, 2).unwrap();
        mgr.stage(0, 11);
        mgr.stage(1, codec::encode_i64(-1));
        mgr.stage(2, codec::encode_f64(1.0));
        mgr.write_internalbuffer(&mut mem, payload_ref, 0, 2).unwrap();

        mgr.stage(0, 99);
        mgr.stage(1, codec::encode_i64(-2));
        mgr.stage(2, codec::encode_f64(2.0));
        mgr.swap_internalbuffer(&mut mem, payload_ref, 0, 2).unwrap();

        // buffer now holds what used to be in the row
        assert_eq!(mgr.staged(0), 11);
        assert_eq!(mgr.read_cell(&mem, payload_ref, 0, 0), 99);
    }

    #[test]
    fn commit_moves_nested_list_storage_before_outer_column() {
        let mut mem = test_arena();
        let types = [TYPE_LIST_U64];
        let mut mgr = ClusterMgr::new(&types);
        let payload_ref = mgr.cow(&mut mem, 0, 0, 1).unwrap();

        let mut inner = array::EMPTY;
        for i in 0..10u64 {
            inner = array::set(&mut mem, inner, i, i * 2, 64, 10).unwrap();
        }
        write_list_cell(&mut mem, payload_ref, 0, 1, 0, inner).unwrap();

        let committed = mgr.commit(&mut mem, payload_ref).unwrap();
        assert!(!mem.is_writable(committed));
        let committed_inner = read_list_cell(&mem, committed, 0, 0);
        for i in 0..10u64 {
            assert_eq!(array::get(&mem, committed_inner, i), i * 2);
        }
    }

    #[test]
    fn free_releases_every_column_without_touching_frozen_memory() {
        let mut mem = test_arena();
        let mut mgr = ClusterMgr::new(&TYPES);
        let payload_ref = mgr.cow(&mut mem, 0, 0, 4).unwrap();
        mgr.write_cell(&mut mem, payload_ref, 0, 4, 0, 1).unwrap();
        mgr.free(&mut mem, payload_ref, 4);
        // no assertion beyond "doesn't panic": freeing re-adds the block to
        // the scratch free lists, verified indirectly elsewhere by reuse.
    }
}
