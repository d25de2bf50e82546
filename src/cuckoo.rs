//! The primary-key index: a cuckoo hash table whose leaves are addressed
//! through a `TreeTop`, one leaf per 256 hash buckets.

use crate::memory::Arena;
use crate::tree::{LeafCommitter, TreeTop};
use crate::utils::errors::{DbError, DbResult};

/// Bound on the eviction chain length before a single `insert` forces a
/// tree growth and retries.
pub const MAX_COLLISIONS: u32 = 20;

const COND_COUNT: u64 = 256;
const SZ_OFF: u64 = 0;
const CAP_OFF: u64 = 2;
const COND_OFF: u64 = 4;
const PAYLOAD_OFF: u64 = COND_OFF + COND_COUNT * 2;
const FOOTER_SIZE: u64 = PAYLOAD_OFF + 8;
const KEYS_OFF: u64 = FOOTER_SIZE;

fn leaf_size(capacity: u64) -> u64 {
    FOOTER_SIZE + capacity * 8
}

fn read_u16(mem: &Arena, leaf: u64, off: u64) -> u16 {
    unsafe { mem.read(leaf + off) }
}
fn write_u16(mem: &mut Arena, leaf: u64, off: u64, v: u16) {
    unsafe { mem.write(leaf + off, v) };
}
fn read_key(mem: &Arena, leaf: u64, row: u64) -> u64 {
    unsafe { mem.read(leaf + KEYS_OFF + row * 8) }
}
fn write_key(mem: &mut Arena, leaf: u64, row: u64, key: u64) {
    unsafe { mem.write(leaf + KEYS_OFF + row * 8, key) };
}
fn read_condenser(mem: &Arena, leaf: u64, slot: usize) -> (u8, u8) {
    let v: u16 = unsafe { mem.read(leaf + COND_OFF + (slot as u64) * 2) };
    ((v & 0xFF) as u8, (v >> 8) as u8)
}
fn write_condenser(mem: &mut Arena, leaf: u64, slot: usize, idx: u8, quick_key: u8) {
    let v = (idx as u16) | ((quick_key as u16) << 8);
    unsafe { mem.write(leaf + COND_OFF + (slot as u64) * 2, v) };
}
fn read_payload_ref(mem: &Arena, leaf: u64) -> u64 {
    unsafe { mem.read(leaf + PAYLOAD_OFF) }
}
fn write_payload_ref(mem: &mut Arena, leaf: u64, r: u64) {
    unsafe { mem.write(leaf + PAYLOAD_OFF, r) };
}

fn alloc_leaf(mem: &mut Arena, capacity: u64) -> DbResult<u64> {
    let r = mem.alloc(leaf_size(capacity))?;
    write_u16(mem, r, SZ_OFF, 0);
    write_u16(mem, r, CAP_OFF, capacity as u16);
    for slot in 0..COND_COUNT as usize {
        write_condenser(mem, r, slot, 0, 0);
    }
    write_payload_ref(mem, r, 0);
    for row in 0..capacity {
        write_key(mem, r, row, 0);
    }
    Ok(r)
}

fn copy_leaf(mem: &mut Arena, old: u64, new: u64, old_sz: u16) {
    write_u16(mem, new, SZ_OFF, old_sz);
    for slot in 0..COND_COUNT as usize {
        let (idx, q) = read_condenser(mem, old, slot);
        write_condenser(mem, new, slot, idx, q);
    }
    for row in 0..old_sz as u64 {
        let k = read_key(mem, old, row);
        write_key(mem, new, row, k);
    }
}

/// SplitMix64-style mix, seeded differently for the two hash functions so
/// `hash_a` and `hash_b` behave as independent hashes of the same key.
fn mix(mut x: u64, seed: u64) -> u64 {
    x ^= seed;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

#[must_use]
pub fn hash_a(key: u64) -> u64 {
    mix(key, 0x9E37_79B9_7F4A_7C15)
}

#[must_use]
pub fn hash_b(key: u64) -> u64 {
    mix(key, 0xC2B2_AE3D_27D4_EB4F)
}

/// The abstract payload contract the cuckoo index drives without knowing
/// anything about column types.
pub trait PayloadMgr {
    /// Zero out the manager's per-column scratch buffer before a fresh
    /// insert writes defaults into it.
    fn init_internalbuffer(&mut self);

    /// # Errors
    /// Returns `DbError::OutOfMemory` if growing the payload fails.
    fn cow(&mut self, mem: &mut Arena, payload_ref: u64, old_cap: u64, new_cap: u64) -> DbResult<u64>;

    /// # Errors
    /// Returns `DbError::OutOfMemory` if the row's columns need to grow.
    fn write_internalbuffer(&mut self, mem: &mut Arena, payload_ref: u64, row: u64, cap: u64) -> DbResult<()>;

    /// # Errors
    /// Returns `DbError::OutOfMemory` if the row's columns need to grow.
    fn swap_internalbuffer(&mut self, mem: &mut Arena, payload_ref: u64, row: u64, cap: u64) -> DbResult<()>;

    fn read_internalbuffer(&mut self, mem: &Arena, payload_ref: u64, row: u64);

    fn free(&mut self, mem: &mut Arena, payload_ref: u64, cap: u64);

    /// # Errors
    /// Returns `DbError::OutOfMemory` if a file-region allocation fails.
    fn commit(&mut self, mem: &mut Arena, payload_ref: u64) -> DbResult<u64>;
}

#[derive(Clone, Copy, Debug)]
pub struct CuckooIndex {
    pub primary_tree: TreeTop,
}

impl CuckooIndex {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        CuckooIndex { primary_tree: TreeTop::init(capacity.max(16)) }
    }

    /// Find the (leaf, row) storing `row_key`, or `None` on a miss.
    #[must_use]
    pub fn find(&self, mem: &Arena, row_key: u64) -> Option<(u64, u64)> {
        let canonical = row_key << 1;
        for tag in [0u64, 1u64] {
            let key = canonical | tag;
            let h = if tag == 1 { hash_b(key) } else { hash_a(key) };
            let leaf_idx = h >> 8;
            let leaf_ref = self.primary_tree.lookup(mem, leaf_idx);
            if leaf_ref == 0 {
                continue;
            }
            if let Some(row) = find_in_leaf(mem, leaf_ref, (h & 0xFF) as usize, key) {
                return Some((leaf_ref, row));
            }
        }
        None
    }

    /// Like `find`, but COWs the leaf (and its payload) into scratch on a
    /// hit so the caller can mutate the row in place.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if cloning the leaf or payload fails.
    pub fn find_and_cow_path(
        &mut self,
        mem: &mut Arena,
        payload: &mut impl PayloadMgr,
        row_key: u64,
    ) -> DbResult<Option<(u64, u64)>> {
        let canonical = row_key << 1;
        for tag in [0u64, 1u64] {
            let key = canonical | tag;
            let h = if tag == 1 { hash_b(key) } else { hash_a(key) };
            let leaf_idx = h >> 8;
            let leaf_ref = self.primary_tree.lookup(mem, leaf_idx);
            if leaf_ref == 0 {
                continue;
            }
            let Some(row) = find_in_leaf(mem, leaf_ref, (h & 0xFF) as usize, key) else { continue };
            if mem.is_writable(leaf_ref) {
                return Ok(Some((leaf_ref, row)));
            }
            let cap = read_u16(mem, leaf_ref, CAP_OFF) as u64;
            let sz = read_u16(mem, leaf_ref, SZ_OFF);
            let new_leaf = alloc_leaf(mem, cap)?;
            copy_leaf(mem, leaf_ref, new_leaf, sz);
            let old_payload_ref = read_payload_ref(mem, leaf_ref);
            let new_payload_ref = payload.cow(mem, old_payload_ref, cap, cap)?;
            write_payload_ref(mem, new_leaf, new_payload_ref);
            self.primary_tree.cow_path(mem, leaf_idx, new_leaf)?;
            return Ok(Some((new_leaf, row)));
        }
        Ok(None)
    }

    /// Insert `row_key`, using `payload`'s current internal buffer as the
    /// row's initial values.
    ///
    /// # Errors
    /// Returns `DbError::KeyInUse` if the key already exists, or
    /// `DbError::OutOfMemory` if growing a leaf, the tree, or the payload
    /// fails.
    pub fn insert(&mut self, mem: &mut Arena, payload: &mut impl PayloadMgr, row_key: u64) -> DbResult<()> {
        if self.find(mem, row_key).is_some() {
            return Err(DbError::KeyInUse(row_key));
        }
        let mut key = row_key << 1;
        let mut collisions = 1u32;
        loop {
            let h = if key & 1 == 1 { hash_b(key) } else { hash_a(key) };
            let leaf_idx = h >> 8;
            let window_start = (h & 0xFF) as usize;
            let leaf_ref = self.primary_tree.lookup(mem, leaf_idx);
            let sz = if leaf_ref == 0 { 0 } else { read_u16(mem, leaf_ref, SZ_OFF) };
            let cap = if leaf_ref == 0 { 0 } else { read_u16(mem, leaf_ref, CAP_OFF) };
            let leaf_ref = self.ensure_leaf_room(mem, payload, leaf_idx, leaf_ref, sz, cap)?;

            match insert_in_leaf(mem, leaf_ref, window_start, key, payload)? {
                None => {
                    self.primary_tree.count += 1;
                    break;
                }
                Some(victim_key) => {
                    key = victim_key ^ 1;
                    collisions += 1;
                    if collisions > MAX_COLLISIONS {
                        self.grow_tree(mem, payload)?;
                        collisions = 1;
                    }
                }
            }
        }
        if self.primary_tree.count + (self.primary_tree.count >> 1) > self.primary_tree.mask {
            self.grow_tree(mem, payload)?;
        }
        Ok(())
    }

    fn ensure_leaf_room(
        &mut self,
        mem: &mut Arena,
        payload: &mut impl PayloadMgr,
        leaf_idx: u64,
        leaf_ref: u64,
        sz: u16,
        cap: u16,
    ) -> DbResult<u64> {
        let frozen = leaf_ref == 0 || !mem.is_writable(leaf_ref);
        let needs_room = sz as u64 + 1 > cap as u64;
        if !frozen && !needs_room {
            return Ok(leaf_ref);
        }
        let needed = if needs_room { ((sz as u64 + 1 + 15) & !15).min(256) } else { cap as u64 };
        let new_leaf = alloc_leaf(mem, needed)?;
        let new_payload_ref = if leaf_ref == 0 {
            copy_leaf(mem, 0, new_leaf, 0);
            payload.cow(mem, 0, 0, needed)?
        } else {
            copy_leaf(mem, leaf_ref, new_leaf, sz);
            let old_payload_ref = read_payload_ref(mem, leaf_ref);
            let new_ref = payload.cow(mem, old_payload_ref, cap as u64, needed)?;
            mem.free(leaf_ref, leaf_size(cap as u64));
            new_ref
        };
        write_payload_ref(mem, new_leaf, new_payload_ref);
        self.primary_tree.cow_path(mem, leaf_idx, new_leaf)?;
        Ok(new_leaf)
    }

    /// Double (plus one) the tree's mask and rehash every existing row into
    /// a fresh table. Called when the eviction chain exceeds
    /// `MAX_COLLISIONS`, or when the load factor invariant would otherwise
    /// be violated after an insert.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if any allocation during rehash fails.
    pub fn grow_tree(&mut self, mem: &mut Arena, payload: &mut impl PayloadMgr) -> DbResult<()> {
        let old_tree = self.primary_tree;
        let new_mask = 1 + 2 * old_tree.mask;
        let mut rows = Vec::new();
        old_tree.for_each_leaf(mem, |mem, leaf_ref| {
            let sz = read_u16(mem, leaf_ref, SZ_OFF);
            let payload_ref = read_payload_ref(mem, leaf_ref);
            for row in 0..sz as u64 {
                let key = read_key(mem, leaf_ref, row);
                rows.push((key >> 1, leaf_ref, row, payload_ref));
            }
        });

        let mut new_index = CuckooIndex { primary_tree: TreeTop::init(new_mask + 1) };
        new_index.primary_tree.mask = new_mask;
        for (row_key, leaf_ref, row, payload_ref) in rows {
            payload.read_internalbuffer(mem, payload_ref, row);
            let _ = leaf_ref;
            new_index.insert(mem, payload, row_key)?;
        }

        old_tree.free(mem, |mem, leaf_ref| {
            let cap = read_u16(mem, leaf_ref, CAP_OFF) as u64;
            let payload_ref = read_payload_ref(mem, leaf_ref);
            payload.free(mem, payload_ref, cap);
            mem.free(leaf_ref, leaf_size(cap));
        });

        debug_assert!(
            new_index.primary_tree.count + (new_index.primary_tree.count >> 1) <= new_index.primary_tree.mask,
            "grow_tree must leave the load factor below the rehash threshold"
        );
        *self = new_index;
        Ok(())
    }

    /// Position the iterator at the first non-empty leaf at or after
    /// `start_index` (in units of leaf slots, i.e. already divided by 256).
    #[must_use]
    pub fn first_access(&self, mem: &Arena, start_index: u64) -> Option<CuckooCursor> {
        // Leaves are sparse; probing one index at a time is adequate here
        // because first_access is called once per partition, not per row.
        let mut idx = start_index;
        loop {
            if idx > self.primary_tree.mask {
                return None;
            }
            let leaf_ref = self.primary_tree.lookup(mem, idx);
            if leaf_ref != 0 {
                let sz = read_u16(mem, leaf_ref, SZ_OFF);
                if sz > 0 {
                    return Some(CuckooCursor { leaf_ref, tree_index: idx, row: 0, sz: sz as u64 });
                }
            }
            idx += 1;
        }
    }

    /// Advance within the current leaf only. Returns `false` once the leaf
    /// is exhausted; the caller is responsible for moving to
    /// `tree_index + 1` and calling `first_access` again from there.
    #[must_use]
    pub fn next_access(cursor: &mut CuckooCursor) -> bool {
        cursor.row += 1;
        cursor.row < cursor.sz
    }

    #[must_use]
    pub fn row_key_at(mem: &Arena, cursor: &CuckooCursor) -> u64 {
        read_key(mem, cursor.leaf_ref, cursor.row) >> 1
    }

    #[must_use]
    pub fn payload_ref_at(mem: &Arena, cursor: &CuckooCursor) -> u64 {
        read_payload_ref(mem, cursor.leaf_ref)
    }

    /// The payload ref and row capacity stored in `leaf_ref`'s footer, for
    /// callers (`snapshot::Object`) that already hold a leaf from `find`
    /// or `find_and_cow_path` and need to drive a `PayloadMgr` directly.
    #[must_use]
    pub fn leaf_payload_ref(mem: &Arena, leaf_ref: u64) -> u64 {
        read_payload_ref(mem, leaf_ref)
    }

    #[must_use]
    pub fn leaf_capacity(mem: &Arena, leaf_ref: u64) -> u64 {
        read_u16(mem, leaf_ref, CAP_OFF) as u64
    }
}

pub struct CuckooCursor {
    pub leaf_ref: u64,
    pub tree_index: u64,
    pub row: u64,
    pub sz: u64,
}

fn find_in_leaf(mem: &Arena, leaf_ref: u64, window_start: usize, key: u64) -> Option<u64> {
    let sz = read_u16(mem, leaf_ref, SZ_OFF) as u64;
    let quick = ((key >> 1) & 0xFF) as u8;
    for w in 0..4 {
        let slot = (window_start + w) & 0xFF;
        let (cidx, cquick) = read_condenser(mem, leaf_ref, slot);
        if cidx != 0 && cquick == quick {
            let row = (cidx - 1) as u64;
            if row < sz && read_key(mem, leaf_ref, row) == key {
                return Some(row);
            }
        }
    }
    None
}

/// Returns `Ok(None)` on a clean insert, `Ok(Some(victim_key))` if a forced
/// eviction happened and `victim_key` needs to be reinserted.
fn insert_in_leaf(
    mem: &mut Arena,
    leaf_ref: u64,
    window_start: usize,
    key: u64,
    payload: &mut impl PayloadMgr,
) -> DbResult<Option<u64>> {
    let sz = read_u16(mem, leaf_ref, SZ_OFF);
    let cap = read_u16(mem, leaf_ref, CAP_OFF) as u64;
    let quick = ((key >> 1) & 0xFF) as u8;

    let mut empty_slot = None;
    for w in 0..4 {
        let slot = (window_start + w) & 0xFF;
        let (cidx, _) = read_condenser(mem, leaf_ref, slot);
        if cidx == 0 {
            empty_slot = Some(slot);
            break;
        }
    }

    let payload_ref = read_payload_ref(mem, leaf_ref);
    if let Some(slot) = empty_slot {
        let row = sz as u64;
        write_key(mem, leaf_ref, row, key);
        write_condenser(mem, leaf_ref, slot, (row + 1) as u8, quick);
        write_u16(mem, leaf_ref, SZ_OFF, sz + 1);
        payload.write_internalbuffer(mem, payload_ref, row, cap)?;
        Ok(None)
    } else {
        let slot = window_start & 0xFF;
        let (cidx, _) = read_condenser(mem, leaf_ref, slot);
        debug_assert!(cidx != 0, "forced eviction slot must already be occupied");
        let victim_row = (cidx - 1) as u64;
        let victim_key = read_key(mem, leaf_ref, victim_row);
        write_key(mem, leaf_ref, victim_row, key);
        write_condenser(mem, leaf_ref, slot, cidx, quick);
        payload.swap_internalbuffer(mem, payload_ref, victim_row, cap)?;
        Ok(Some(victim_key))
    }
}

impl LeafCommitter for &mut dyn PayloadMgr {
    fn commit_leaf(&mut self, mem: &mut Arena, leaf_ref: u64) -> DbResult<u64> {
        let cap = read_u16(mem, leaf_ref, CAP_OFF) as u64;
        let sz = read_u16(mem, leaf_ref, SZ_OFF);
        let new_leaf = mem.alloc_in_file(leaf_size(cap))?;
        copy_leaf(mem, leaf_ref, new_leaf, sz);
        let old_payload_ref = read_payload_ref(mem, leaf_ref);
        let new_payload_ref = (**self).commit(mem, old_payload_ref)?;
        write_payload_ref(mem, new_leaf, new_payload_ref);
        mem.free(leaf_ref, leaf_size(cap));
        Ok(new_leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// An in-memory stand-in payload manager for exercising the cuckoo
    /// index in isolation: one `u64` value per row, no real columns.
    struct ScalarPayload {
        buffer: u64,
        rows: HashMap<(u64, u64), u64>,
    }

    impl ScalarPayload {
        fn new() -> Self {
            ScalarPayload { buffer: 0, rows: HashMap::new() }
        }
    }

    impl PayloadMgr for ScalarPayload {
        fn init_internalbuffer(&mut self) {
            self.buffer = 0;
        }
        fn cow(&mut self, _mem: &mut Arena, payload_ref: u64, _old_cap: u64, _new_cap: u64) -> DbResult<u64> {
            Ok(if payload_ref == 0 { 1 } else { payload_ref })
        }
        fn write_internalbuffer(&mut self, _mem: &mut Arena, payload_ref: u64, row: u64, _cap: u64) -> DbResult<()> {
            self.rows.insert((payload_ref, row), self.buffer);
            Ok(())
        }
        fn swap_internalbuffer(&mut self, _mem: &mut Arena, payload_ref: u64, row: u64, _cap: u64) -> DbResult<()> {
            let old = self.rows.insert((payload_ref, row), self.buffer).unwrap_or(0);
            self.buffer = old;
            Ok(())
        }
        fn read_internalbuffer(&mut self, _mem: &Arena, payload_ref: u64, row: u64) {
            self.buffer = *self.rows.get(&(payload_ref, row)).unwrap_or(&0);
        }
        fn free(&mut self, _mem: &mut Arena, _payload_ref: u64, _cap: u64) {}
        fn commit(&mut self, _mem: &mut Arena, payload_ref: u64) -> DbResult<u64> {
            Ok(payload_ref)
        }
    }

    fn test_arena() -> Arena {
        Arena::new(tempfile::tempfile().expect("tempfile"))
    }

    #[test]
    fn insert_then_find_round_trips() {
        let mut mem = test_arena();
        let mut idx = CuckooIndex::new(64);
        let mut payload = ScalarPayload::new();
        for k in 0..500u64 {
            payload.init_internalbuffer();
            payload.buffer = k * 7;
            idx.insert(&mut mem, &mut payload, k).unwrap();
        }
        for k in 0..500u64 {
            let (_leaf, row) = idx.find(&mem, k).expect("row should exist");
            let payload_ref = idx.find(&mem, k).map(|(l, _)| read_payload_ref(&mem, l)).unwrap();
            payload.read_internalbuffer(&mem, payload_ref, row);
            assert_eq!(payload.buffer, k * 7);
        }
        assert!(idx.find(&mem, 999_999).is_none());
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut mem = test_arena();
        let mut idx = CuckooIndex::new(16);
        let mut payload = ScalarPayload::new();
        idx.insert(&mut mem, &mut payload, 42).unwrap();
        let err = idx.insert(&mut mem, &mut payload, 42).unwrap_err();
        assert!(matches!(err, DbError::KeyInUse(42)));
    }

    #[test]
    fn load_factor_invariant_holds_after_many_inserts() {
        let mut mem = test_arena();
        let mut idx = CuckooIndex::new(16);
        let mut payload = ScalarPayload::new();
        for k in 0..5000u64 {
            idx.insert(&mut mem, &mut payload, k).unwrap();
            assert!(idx.primary_tree.count + (idx.primary_tree.count >> 1) <= idx.primary_tree.mask);
        }
    }
}
