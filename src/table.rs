//! A table: a cuckoo-indexed set of rows over a fixed column schema.
//!
//! A table node is a small fixed-footer struct (the cuckoo index's tree
//! descriptor) followed by `num_fields` `FieldInfo` entries. Every operation
//! here takes the table's `Ref` as a raw `u64` and drives the arena
//! directly, the same way `cuckoo` and `tree` do -- tables are just another
//! kind of COW node rooted at the snapshot.

use crate::cluster::{ClusterMgr, is_known_type};
use crate::cuckoo::{CuckooCursor, CuckooIndex, PayloadMgr};
use crate::memory::Arena;
use crate::tree::TreeTop;
use crate::utils::errors::{DbError, DbResult};

const TREE_ROOT_OFF: u64 = 0;
const TREE_LEVELS_OFF: u64 = 8;
const TREE_MASK_OFF: u64 = 16;
const TREE_COUNT_OFF: u64 = 24;
const NUM_FIELDS_OFF: u64 = 32;
const FIELDS_OFF: u64 = 40;
const FIELD_STRIDE: u64 = 16;

#[must_use]
pub fn table_size(num_fields: u64) -> u64 {
    FIELDS_OFF + num_fields * FIELD_STRIDE
}

fn read_u64(mem: &Arena, r: u64, off: u64) -> u64 {
    unsafe { mem.read(r + off) }
}
fn write_u64(mem: &mut Arena, r: u64, off: u64, v: u64) {
    unsafe { mem.write(r + off, v) };
}

#[must_use]
pub fn num_fields(mem: &Arena, table_ref: u64) -> u64 {
    read_u64(mem, table_ref, NUM_FIELDS_OFF)
}

/// A column's runtime descriptor: the random-tagged key under which it was
/// registered (so stale `Field` handles from an earlier schema generation
/// can be detected) and its type character.
#[must_use]
pub fn field_info(mem: &Arena, table_ref: u64, col: u64) -> (u64, char) {
    let off = FIELDS_OFF + col * FIELD_STRIDE;
    let key = read_u64(mem, table_ref, off);
    let ty = read_u64(mem, table_ref, off + 8) as u8 as char;
    (key, ty)
}

#[must_use]
pub fn field_types(mem: &Arena, table_ref: u64) -> Vec<char> {
    let n = num_fields(mem, table_ref);
    (0..n).map(|c| field_info(mem, table_ref, c).1).collect()
}

fn read_cuckoo(mem: &Arena, table_ref: u64) -> CuckooIndex {
    let root = read_u64(mem, table_ref, TREE_ROOT_OFF);
    let levels = read_u64(mem, table_ref, TREE_LEVELS_OFF) as u32;
    let mask = read_u64(mem, table_ref, TREE_MASK_OFF);
    let count = read_u64(mem, table_ref, TREE_COUNT_OFF);
    CuckooIndex { primary_tree: TreeTop { root, levels, mask, count } }
}

fn write_cuckoo(mem: &mut Arena, table_ref: u64, idx: &CuckooIndex) {
    write_u64(mem, table_ref, TREE_ROOT_OFF, idx.primary_tree.root);
    write_u64(mem, table_ref, TREE_LEVELS_OFF, u64::from(idx.primary_tree.levels));
    write_u64(mem, table_ref, TREE_MASK_OFF, idx.primary_tree.mask);
    write_u64(mem, table_ref, TREE_COUNT_OFF, idx.primary_tree.count);
}

/// Allocate a fresh table with the given column schema. `type_info` is a
/// string of single-character type tags in column order (see
/// `cluster::TYPE_*`).
///
/// # Errors
/// Returns `DbError::Logic` if `type_info` names an unknown column type, or
/// `DbError::OutOfMemory` if allocation fails.
pub fn create(mem: &mut Arena, type_info: &str) -> DbResult<u64> {
    let cols: Vec<char> = type_info.chars().collect();
    for &c in &cols {
        if !is_known_type(c) {
            return Err(DbError::Logic(format!("unknown column type '{c}'")));
        }
    }
    let n = cols.len() as u64;
    let table_ref = mem.alloc(table_size(n))?;
    let cuckoo = CuckooIndex::new(16);
    write_cuckoo(mem, table_ref, &cuckoo);
    write_u64(mem, table_ref, NUM_FIELDS_OFF, n);
    for (i, &c) in cols.iter().enumerate() {
        let tag: u64 = rand::random::<u64>() << 16 | (i as u64 & 0xFFFF);
        let off = FIELDS_OFF + i as u64 * FIELD_STRIDE;
        write_u64(mem, table_ref, off, tag);
        write_u64(mem, table_ref, off + 8, u64::from(c as u8));
    }
    Ok(table_ref)
}

/// Clone a frozen table into scratch, verbatim. A no-op if already
/// writable.
///
/// # Errors
/// Returns `DbError::OutOfMemory` if the allocation fails.
pub fn cow(mem: &mut Arena, table_ref: u64) -> DbResult<u64> {
    if mem.is_writable(table_ref) {
        return Ok(table_ref);
    }
    let n = num_fields(mem, table_ref);
    let size = table_size(n);
    let new_ref = mem.alloc(size)?;
    for i in 0..size / 8 {
        let v = read_u64(mem, table_ref, i * 8);
        write_u64(mem, new_ref, i * 8, v);
    }
    mem.free(table_ref, size);
    Ok(new_ref)
}

/// Copy a writable table -- its schema and every reachable cuckoo leaf and
/// cluster -- into the file region.
///
/// # Errors
/// Returns `DbError::OutOfMemory` if any allocation fails.
pub fn commit(mem: &mut Arena, table_ref: u64) -> DbResult<u64> {
    if !mem.is_writable(table_ref) {
        return Ok(table_ref);
    }
    let n = num_fields(mem, table_ref);
    let size = table_size(n);
    let new_ref = mem.alloc_in_file(size)?;
    for i in 0..size / 8 {
        let v = read_u64(mem, table_ref, i * 8);
        write_u64(mem, new_ref, i * 8, v);
    }
    mem.free(table_ref, size);

    let types = field_types(mem, new_ref);
    let mut cuckoo = read_cuckoo(mem, new_ref);
    let mut pm = ClusterMgr::new(&types);
    let mut dyn_pm: &mut dyn PayloadMgr = &mut pm;
    cuckoo.primary_tree.copied_to_file(mem, &mut dyn_pm)?;
    write_cuckoo(mem, new_ref, &cuckoo);
    Ok(new_ref)
}

/// Insert a zero-valued row under `row_key`. `table_ref` must already be
/// writable (the caller COWs it first).
///
/// # Errors
/// Returns `DbError::KeyInUse` if the row already exists, or
/// `DbError::OutOfMemory` on allocation failure.
pub fn insert(mem: &mut Arena, table_ref: u64, row_key: u64) -> DbResult<()> {
    let types = field_types(mem, table_ref);
    let mut cuckoo = read_cuckoo(mem, table_ref);
    let mut pm = ClusterMgr::new(&types);
    pm.init_internalbuffer();
    let res = cuckoo.insert(mem, &mut pm, row_key);
    write_cuckoo(mem, table_ref, &cuckoo);
    res
}

#[must_use]
pub fn find(mem: &Arena, table_ref: u64, row_key: u64) -> bool {
    read_cuckoo(mem, table_ref).find(mem, row_key).is_some()
}

/// Locate `row_key`'s (leaf, row) for a read, without mutating anything.
///
/// # Errors
/// Returns `DbError::NotFound` if the row doesn't exist.
pub fn get_cluster(mem: &Arena, table_ref: u64, row_key: u64) -> DbResult<(u64, u64)> {
    read_cuckoo(mem, table_ref).find(mem, row_key).ok_or(DbError::NotFound(row_key))
}

/// Locate `row_key`'s (leaf, row) for a write, COWing the leaf and its
/// payload along the way if necessary. `table_ref` must already be
/// writable.
///
/// # Errors
/// Returns `DbError::NotFound` if the row doesn't exist, or
/// `DbError::OutOfMemory` if cloning fails.
pub fn change_cluster(mem: &mut Arena, table_ref: u64, row_key: u64) -> DbResult<(u64, u64)> {
    let types = field_types(mem, table_ref);
    let mut cuckoo = read_cuckoo(mem, table_ref);
    let mut pm = ClusterMgr::new(&types);
    let res = cuckoo.find_and_cow_path(mem, &mut pm, row_key)?;
    write_cuckoo(mem, table_ref, &cuckoo);
    res.ok_or(DbError::NotFound(row_key))
}

/// Validate that column `col` exists and has type `expected`, returning its
/// random-tagged key for stale-handle detection.
///
/// # Errors
/// Returns `DbError::UndefinedField` if `col` is out of range, or
/// `DbError::WrongFieldType` on a type mismatch.
pub fn check_field(mem: &Arena, table_ref: u64, col: u16, expected: char) -> DbResult<u64> {
    let n = num_fields(mem, table_ref);
    if u64::from(col) >= n {
        return Err(DbError::UndefinedField(col));
    }
    let (key, actual) = field_info(mem, table_ref, u64::from(col));
    if actual != expected {
        return Err(DbError::WrongFieldType { field: col, actual, expected });
    }
    Ok(key)
}

#[must_use]
pub fn first_access(mem: &Arena, table_ref: u64, start_index: u64) -> Option<CuckooCursor> {
    read_cuckoo(mem, table_ref).first_access(mem, start_index)
}

#[must_use]
pub fn universe_size(mem: &Arena, table_ref: u64) -> u64 {
    read_cuckoo(mem, table_ref).primary_tree.mask + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> Arena {
        Arena::new(tempfile::tempfile().expect("tempfile"))
    }

    #[test]
    fn create_then_insert_then_find() {
        let mut mem = test_arena();
        let t = create(&mut mem, "uifdtruuuuUTs").unwrap();
        assert_eq!(num_fields(&mem, t), 13);
        for k in 0..200u64 {
            insert(&mut mem, t, k << 1).unwrap();
        }
        for k in 0..200u64 {
            assert!(find(&mem, t, k << 1));
            assert!(!find(&mem, t, (k << 1) | 1));
        }
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut mem = test_arena();
        let t = create(&mut mem, "u").unwrap();
        insert(&mut mem, t, 7).unwrap();
        assert!(matches!(insert(&mut mem, t, 7), Err(DbError::KeyInUse(7))));
    }

    #[test]
    fn check_field_rejects_bad_col_and_type() {
        let mem_table = {
            let mut mem = test_arena();
            let t = create(&mut mem, "ui").unwrap();
            (mem, t)
        };
        let (mem, t) = mem_table;
        assert!(check_field(&mem, t, 0, 'u').is_ok());
        assert!(matches!(check_field(&mem, t, 0, 'i'), Err(DbError::WrongFieldType { .. })));
        assert!(matches!(check_field(&mem, t, 5, 'u'), Err(DbError::UndefinedField(5))));
    }

    #[test]
    fn unknown_column_type_rejected() {
        let mut mem = test_arena();
        assert!(create(&mut mem, "uz").is_err());
    }
}
