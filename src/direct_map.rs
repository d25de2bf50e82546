//! The table directory: a small-fanout map from randomly assigned 64-bit
//! keys to arbitrary `u64`-sized entries (a `Ref<Table>`, in practice).
//!
//! Unlike the cuckoo index, a direct-map leaf probes exactly one condenser
//! slot (the key's low byte) and never evicts; callers retry with a new
//! random key on collision. This is adequate because the domain this
//! structure serves -- tables per snapshot -- never holds more than a
//! handful of entries.

use crate::memory::Arena;
use crate::tree::{LeafCommitter, TreeTop};
use crate::utils::errors::{DbError, DbResult};

const COND_COUNT: u64 = 256;
const NUM_OFF: u64 = 0;
const COND_OFF: u64 = 8;
const ENTRIES_OFF: u64 = COND_OFF + COND_COUNT;
const ENTRY_STRIDE: u64 = 16;

fn leaf_size(capacity: u64) -> u64 {
    ENTRIES_OFF + capacity * ENTRY_STRIDE
}

fn read_num_entries(mem: &Arena, leaf: u64) -> u64 {
    unsafe { mem.read::<u64>(leaf + NUM_OFF) }
}
fn write_num_entries(mem: &mut Arena, leaf: u64, n: u64) {
    unsafe { mem.write(leaf + NUM_OFF, n) };
}
fn read_condenser(mem: &Arena, leaf: u64, subhash: u8) -> u8 {
    unsafe { mem.read(leaf + COND_OFF + subhash as u64) }
}
fn write_condenser(mem: &mut Arena, leaf: u64, subhash: u8, v: u8) {
    unsafe { mem.write(leaf + COND_OFF + subhash as u64, v) };
}
fn entry_off(row: u64) -> u64 {
    ENTRIES_OFF + row * ENTRY_STRIDE
}
fn read_entry(mem: &Arena, leaf: u64, row: u64) -> (u64, u64) {
    let key: u64 = unsafe { mem.read(leaf + entry_off(row)) };
    let value: u64 = unsafe { mem.read(leaf + entry_off(row) + 8) };
    (key, value)
}
fn write_entry(mem: &mut Arena, leaf: u64, row: u64, key: u64, value: u64) {
    unsafe { mem.write(leaf + entry_off(row), key) };
    unsafe { mem.write(leaf + entry_off(row) + 8, value) };
}

fn alloc_leaf(mem: &mut Arena, capacity: u64) -> DbResult<u64> {
    let r = mem.alloc(leaf_size(capacity))?;
    write_num_entries(mem, r, 0);
    for sub in 0..=255u8 {
        write_condenser(mem, r, sub, 0);
    }
    Ok(r)
}

fn clone_leaf(mem: &mut Arena, old: u64, capacity: u64) -> DbResult<u64> {
    let n = if old == 0 { 0 } else { read_num_entries(mem, old) };
    let new = alloc_leaf(mem, capacity)?;
    if old != 0 {
        write_num_entries(mem, new, n);
        for sub in 0..=255u8 {
            write_condenser(mem, new, sub, read_condenser(mem, old, sub));
        }
        for row in 0..n {
            let (k, v) = read_entry(mem, old, row);
            write_entry(mem, new, row, k, v);
        }
    }
    Ok(new)
}

fn find_in_leaf(mem: &Arena, leaf: u64, key: u64) -> Option<u64> {
    let sub = (key & 0xFF) as u8;
    let c = read_condenser(mem, leaf, sub);
    if c == 0 {
        return None;
    }
    let row = (c - 1) as u64;
    if row < read_num_entries(mem, leaf) && read_entry(mem, leaf, row).0 == key {
        Some(row)
    } else {
        None
    }
}

fn leaf_idx_of(key: u64) -> u64 {
    key >> 8
}

/// A direct map over `u64` entries, keyed by randomly assigned 64-bit keys.
#[derive(Clone, Copy, Debug)]
pub struct DirectMap {
    pub tree: TreeTop,
}

impl DirectMap {
    #[must_use]
    pub fn init(capacity: u64) -> Self {
        DirectMap { tree: TreeTop::init(capacity.max(1)) }
    }

    /// Look up `key`'s stored entry.
    #[must_use]
    pub fn find(&self, mem: &Arena, key: u64) -> Option<u64> {
        let leaf_ref = self.tree.lookup(mem, leaf_idx_of(key));
        if leaf_ref == 0 {
            return None;
        }
        find_in_leaf(mem, leaf_ref, key).map(|row| read_entry(mem, leaf_ref, row).1)
    }

    /// # Errors
    /// Returns `DbError::NotFound` if `key` has no entry.
    pub fn get(&self, mem: &Arena, key: u64) -> DbResult<u64> {
        self.find(mem, key).ok_or(DbError::NotFound(key))
    }

    /// Insert a fresh entry under a freshly chosen random key, retrying on
    /// collision. Returns the assigned key.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if growing a leaf or the tree fails.
    pub fn insert(&mut self, mem: &mut Arena, value: u64) -> DbResult<u64> {
        loop {
            let key: u64 = rand::random();
            let leaf_idx = leaf_idx_of(key);
            let leaf_ref = self.tree.lookup(mem, leaf_idx);
            if leaf_ref != 0 && find_in_leaf(mem, leaf_ref, key).is_some() {
                continue;
            }
            let cap = if leaf_ref == 0 { 0 } else { read_num_entries(mem, leaf_ref) };
            let new_leaf = alloc_grown(mem, leaf_ref, cap)?;
            if leaf_ref != 0 {
                mem.free(leaf_ref, leaf_size(cap));
            }
            self.tree.cow_path(mem, leaf_idx, new_leaf)?;
            let row = read_num_entries(mem, new_leaf);
            write_entry(mem, new_leaf, row, key, value);
            write_num_entries(mem, new_leaf, row + 1);
            write_condenser(mem, new_leaf, (key & 0xFF) as u8, (row + 1) as u8);
            self.tree.count += 1;
            return Ok(key);
        }
    }

    /// Ensure `key`'s leaf is writable, without changing its contents.
    /// Subsequent `set` calls on this key may then mutate in place.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` if `key` has no entry, or
    /// `DbError::OutOfMemory` if cloning the leaf fails.
    pub fn cow_path(&mut self, mem: &mut Arena, key: u64) -> DbResult<()> {
        let leaf_idx = leaf_idx_of(key);
        let leaf_ref = self.tree.lookup(mem, leaf_idx);
        if leaf_ref == 0 || find_in_leaf(mem, leaf_ref, key).is_none() {
            return Err(DbError::NotFound(key));
        }
        if mem.is_writable(leaf_ref) {
            return Ok(());
        }
        let cap = read_num_entries(mem, leaf_ref);
        let new_leaf = clone_leaf(mem, leaf_ref, cap)?;
        mem.free(leaf_ref, leaf_size(cap));
        self.tree.cow_path(mem, leaf_idx, new_leaf)?;
        Ok(())
    }

    /// Overwrite the value stored for `key`. The caller must have already
    /// called `cow_path` for this key in the current transaction.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` if `key` has no entry.
    pub fn set(&mut self, mem: &mut Arena, key: u64, value: u64) -> DbResult<()> {
        let leaf_ref = self.tree.lookup(mem, leaf_idx_of(key));
        let Some(row) = (if leaf_ref == 0 { None } else { find_in_leaf(mem, leaf_ref, key) }) else {
            return Err(DbError::NotFound(key));
        };
        debug_assert!(mem.is_writable(leaf_ref), "set called without cow_path");
        let (k, _) = read_entry(mem, leaf_ref, row);
        write_entry(mem, leaf_ref, row, k, value);
        Ok(())
    }

    /// Visit every (key, value) entry across all leaves, in leaf order.
    pub fn for_each(&self, mem: &Arena, mut visit: impl FnMut(u64, u64)) {
        self.tree.for_each_leaf(mem, |mem, leaf| {
            let n = read_num_entries(mem, leaf);
            for row in 0..n {
                let (k, v) = read_entry(mem, leaf, row);
                visit(k, v);
            }
        });
    }

    /// Copy every writable leaf into the file region.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if a file-region allocation fails.
    pub fn copied_to_file(&mut self, mem: &mut Arena) -> DbResult<()> {
        let mut committer = DirectMapCommitter;
        self.tree.copied_to_file(mem, &mut committer)
    }
}

fn alloc_grown(mem: &mut Arena, old: u64, old_cap: u64) -> DbResult<u64> {
    clone_leaf(mem, old, old_cap + 1)
}

struct DirectMapCommitter;

impl LeafCommitter for DirectMapCommitter {
    fn commit_leaf(&mut self, mem: &mut Arena, leaf_ref: u64) -> DbResult<u64> {
        let n = read_num_entries(mem, leaf_ref);
        let new_leaf = mem.alloc_in_file(leaf_size(n))?;
        write_num_entries(mem, new_leaf, n);
        for sub in 0..=255u8 {
            write_condenser(mem, new_leaf, sub, read_condenser(mem, leaf_ref, sub));
        }
        for row in 0..n {
            let (k, v) = read_entry(mem, leaf_ref, row);
            write_entry(mem, new_leaf, row, k, v);
        }
        mem.free(leaf_ref, leaf_size(n));
        Ok(new_leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> Arena {
        Arena::new(tempfile::tempfile().expect("tempfile"))
    }

    #[test]
    fn insert_then_find_round_trips() {
        let mut mem = test_arena();
        let mut dm = DirectMap::init(16);
        let mut keys = Vec::new();
        for v in 0..20u64 {
            let k = dm.insert(&mut mem, v * 100).unwrap();
            keys.push((k, v * 100));
        }
        for (k, v) in keys {
            assert_eq!(dm.get(&mem, k).unwrap(), v);
        }
    }

    #[test]
    fn missing_key_is_not_found() {
        let mem = test_arena();
        let dm = DirectMap::init(16);
        assert!(matches!(dm.get(&mem, 0xDEAD_BEEF), Err(DbError::NotFound(_))));
    }

    #[test]
    fn cow_path_then_set_updates_value() {
        let mut mem = test_arena();
        let mut dm = DirectMap::init(16);
        let k = dm.insert(&mut mem, 1).unwrap();
        dm.cow_path(&mut mem, k).unwrap();
        dm.set(&mut mem, k, 42).unwrap();
        assert_eq!(dm.get(&mem, k).unwrap(), 42);
    }
}
