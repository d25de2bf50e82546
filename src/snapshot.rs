//! Snapshots, tables, rows and fields, layered over `table`/`cuckoo`/
//! `direct_map`: the surface a caller actually programs against.
//!
//! A snapshot is a table directory (`DirectMap`) rooted at a single arena
//! node. `SnapshotRead` is a frozen view usable from any number of readers;
//! `SnapshotWrite` is the one mutable transaction a `Db` ever hands out at a
//! time, and is the only place in the crate that COWs a table directory
//! entry or a table itself.

use crate::array;
use crate::cluster::{self, ClusterMgr};
use crate::cuckoo::CuckooIndex;
use crate::direct_map::DirectMap;
use crate::memory::Arena;
use crate::table;
use crate::tree::TreeTop;
use crate::types::{Field, List, RowKey, TableKey};
use crate::utils::errors::{DbError, DbResult};
use std::marker::PhantomData;

const SNAPSHOT_SIZE: u64 = 32;

fn read_u64(mem: &Arena, r: u64, off: u64) -> u64 {
    unsafe { mem.read(r + off) }
}
fn write_u64(mem: &mut Arena, r: u64, off: u64, v: u64) {
    unsafe { mem.write(r + off, v) };
}

fn read_tables(mem: &Arena, snap_ref: u64) -> DirectMap {
    let root = read_u64(mem, snap_ref, 0);
    let levels = read_u64(mem, snap_ref, 8) as u32;
    let mask = read_u64(mem, snap_ref, 16);
    let count = read_u64(mem, snap_ref, 24);
    DirectMap { tree: TreeTop { root, levels, mask, count } }
}

fn write_tables(mem: &mut Arena, snap_ref: u64, dm: &DirectMap) {
    write_u64(mem, snap_ref, 0, dm.tree.root);
    write_u64(mem, snap_ref, 8, u64::from(dm.tree.levels));
    write_u64(mem, snap_ref, 16, dm.tree.mask);
    write_u64(mem, snap_ref, 24, dm.tree.count);
}

/// Allocate a fresh, empty snapshot node.
///
/// # Errors
/// Returns `DbError::OutOfMemory` if the allocation fails.
pub fn init(mem: &mut Arena) -> DbResult<u64> {
    let r = mem.alloc(SNAPSHOT_SIZE)?;
    write_tables(mem, r, &DirectMap::init(16));
    Ok(r)
}

fn cow_node(mem: &mut Arena, snap_ref: u64) -> DbResult<u64> {
    if mem.is_writable(snap_ref) {
        return Ok(snap_ref);
    }
    let new_ref = mem.alloc(SNAPSHOT_SIZE)?;
    for i in 0..SNAPSHOT_SIZE / 8 {
        let v = read_u64(mem, snap_ref, i * 8);
        write_u64(mem, new_ref, i * 8, v);
    }
    mem.free(snap_ref, SNAPSHOT_SIZE);
    Ok(new_ref)
}

/// Commit every table reachable from `snap_ref`, then the directory itself,
/// into the file region. Returns the new, frozen snapshot ref.
///
/// # Errors
/// Returns `DbError::OutOfMemory` if any allocation along the way fails.
pub fn commit(mem: &mut Arena, snap_ref: u64) -> DbResult<u64> {
    if !mem.is_writable(snap_ref) {
        return Ok(snap_ref);
    }
    let mut tables = read_tables(mem, snap_ref);
    let mut updates = Vec::new();
    tables.for_each(mem, |key, table_ref| {
        if mem.is_writable(table_ref) {
            updates.push((key, table_ref));
        }
    });
    for (key, table_ref) in updates {
        let new_ref = table::commit(mem, table_ref)?;
        tables.cow_path(mem, key)?;
        tables.set(mem, key, new_ref)?;
    }

    let new_snap_ref = mem.alloc_in_file(SNAPSHOT_SIZE)?;
    write_tables(mem, new_snap_ref, &tables);
    mem.free(snap_ref, SNAPSHOT_SIZE);
    let mut tables = read_tables(mem, new_snap_ref);
    tables.copied_to_file(mem)?;
    write_tables(mem, new_snap_ref, &tables);
    Ok(new_snap_ref)
}

/// Map a scalar Rust type onto a single-character column type tag and the
/// raw-`u64` encoding the cluster stores it as.
pub trait ScalarCodec: Copy {
    const TYPE_CHAR: char;
    fn encode(self) -> u64;
    fn decode(raw: u64, bits: u32) -> Self;
}

impl ScalarCodec for u64 {
    const TYPE_CHAR: char = cluster::TYPE_U64;
    fn encode(self) -> u64 {
        cluster::codec::encode_u64(self)
    }
    fn decode(raw: u64, _bits: u32) -> Self {
        cluster::codec::decode_u64(raw)
    }
}

impl ScalarCodec for i64 {
    const TYPE_CHAR: char = cluster::TYPE_I64;
    fn encode(self) -> u64 {
        cluster::codec::encode_i64(self)
    }
    fn decode(raw: u64, bits: u32) -> Self {
        cluster::codec::decode_i64(raw, bits)
    }
}

impl ScalarCodec for f32 {
    const TYPE_CHAR: char = cluster::TYPE_F32;
    fn encode(self) -> u64 {
        cluster::codec::encode_f32(self)
    }
    fn decode(raw: u64, _bits: u32) -> Self {
        cluster::codec::decode_f32(raw)
    }
}

impl ScalarCodec for f64 {
    const TYPE_CHAR: char = cluster::TYPE_F64;
    fn encode(self) -> u64 {
        cluster::codec::encode_f64(self)
    }
    fn decode(raw: u64, _bits: u32) -> Self {
        cluster::codec::decode_f64(raw)
    }
}

impl ScalarCodec for TableKey {
    const TYPE_CHAR: char = cluster::TYPE_TABLE_REF;
    fn encode(self) -> u64 {
        self.raw()
    }
    fn decode(raw: u64, _bits: u32) -> Self {
        TableKey(raw)
    }
}

impl ScalarCodec for RowKey {
    const TYPE_CHAR: char = cluster::TYPE_ROW_REF;
    fn encode(self) -> u64 {
        self.0
    }
    fn decode(raw: u64, _bits: u32) -> Self {
        RowKey(raw)
    }
}

fn list_char(scalar: char) -> char {
    match scalar {
        cluster::TYPE_U64 => cluster::TYPE_LIST_U64,
        cluster::TYPE_I64 => cluster::TYPE_LIST_I64,
        cluster::TYPE_F32 => cluster::TYPE_LIST_F32,
        cluster::TYPE_F64 => cluster::TYPE_LIST_F64,
        cluster::TYPE_TABLE_REF => cluster::TYPE_LIST_TABLE_REF,
        cluster::TYPE_ROW_REF => cluster::TYPE_LIST_ROW_REF,
        other => other,
    }
}

fn resolve_field<T: ScalarCodec>(mem: &Arena, table_ref: u64, table: TableKey, col: u16) -> DbResult<Field<T>> {
    let tag = table::check_field(mem, table_ref, col, T::TYPE_CHAR)?;
    Ok(Field::new(table, col, tag))
}

fn resolve_string_field(mem: &Arena, table_ref: u64, table: TableKey, col: u16) -> DbResult<Field<String>> {
    let tag = table::check_field(mem, table_ref, col, cluster::TYPE_STRING)?;
    Ok(Field::new(table, col, tag))
}

fn resolve_list_field<T: ScalarCodec>(mem: &Arena, table_ref: u64, table: TableKey, col: u16) -> DbResult<Field<List<T>>> {
    let tag = table::check_field(mem, table_ref, col, list_char(T::TYPE_CHAR))?;
    Ok(Field::new(table, col, tag))
}

/// A row handle: a located (leaf, row) pair plus the schema needed to
/// decode it. Obtained from `SnapshotRead`/`SnapshotWrite` and never
/// constructed directly.
pub struct Object {
    table: TableKey,
    table_ref: u64,
    row_key: u64,
    leaf_ref: u64,
    row: u64,
    field_types: Vec<char>,
    writable: bool,
}

impl Object {
    #[must_use]
    pub const fn row_key(&self) -> RowKey {
        RowKey(self.row_key)
    }

    #[must_use]
    pub const fn table(&self) -> TableKey {
        self.table
    }

    fn validate<T>(&self, mem: &Arena, field: &Field<T>, expected: char) -> DbResult<()> {
        if field.table != self.table {
            return Err(DbError::Logic("field belongs to a different table".into()));
        }
        let tag = table::check_field(mem, self.table_ref, field.column(), expected)?;
        if tag != field.tag {
            return Err(DbError::StaleField);
        }
        Ok(())
    }

    /// # Errors
    /// Returns `DbError::WrongFieldType`/`UndefinedField`/`StaleField` if
    /// `field` doesn't match this object's table schema.
    pub fn get<T: ScalarCodec>(&self, mem: &Arena, field: &Field<T>) -> DbResult<T> {
        self.validate(mem, field, T::TYPE_CHAR)?;
        let payload_ref = CuckooIndex::leaf_payload_ref(mem, self.leaf_ref);
        let mgr = ClusterMgr::new(&self.field_types);
        let col = field.column() as usize;
        let raw = mgr.read_cell(mem, payload_ref, self.row, col);
        let bits = mgr.cell_bits(mem, payload_ref, col);
        Ok(T::decode(raw, bits))
    }

    /// # Errors
    /// Returns `DbError::WrongFieldType`/`UndefinedField`/`StaleField` on a
    /// schema mismatch, or `DbError::OutOfMemory` if the column must grow.
    pub fn set<T: ScalarCodec>(&mut self, mem: &mut Arena, field: &Field<T>, value: T) -> DbResult<()> {
        debug_assert!(self.writable, "set called on a read-only object");
        self.validate(mem, field, T::TYPE_CHAR)?;
        let payload_ref = CuckooIndex::leaf_payload_ref(mem, self.leaf_ref);
        let cap = CuckooIndex::leaf_capacity(mem, self.leaf_ref);
        let mgr = ClusterMgr::new(&self.field_types);
        mgr.write_cell(mem, payload_ref, self.row, cap, field.column() as usize, value.encode())
    }

    /// # Errors
    /// Returns `DbError::WrongFieldType`/`UndefinedField`/`StaleField` if
    /// `field` doesn't name a string column on this object's table.
    pub fn get_string(&self, mem: &Arena, field: &Field<String>) -> DbResult<String> {
        self.validate(mem, field, cluster::TYPE_STRING)?;
        let payload_ref = CuckooIndex::leaf_payload_ref(mem, self.leaf_ref);
        let inner = cluster::read_list_cell(mem, payload_ref, self.row, field.column() as usize);
        let len = array::capacity(inner);
        let bytes: Vec<u8> = (0..len).map(|i| array::get(mem, inner, i) as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// # Errors
    /// Returns a schema-mismatch error, or `DbError::OutOfMemory` if
    /// growing the string's backing storage fails.
    pub fn set_string(&mut self, mem: &mut Arena, field: &Field<String>, s: &str) -> DbResult<()> {
        debug_assert!(self.writable, "set_string called on a read-only object");
        self.validate(mem, field, cluster::TYPE_STRING)?;
        let payload_ref = CuckooIndex::leaf_payload_ref(mem, self.leaf_ref);
        let cap = CuckooIndex::leaf_capacity(mem, self.leaf_ref);
        let col = field.column() as usize;
        array::free(mem, cluster::read_list_cell(mem, payload_ref, self.row, col));
        let mut inner = array::EMPTY;
        for (i, &b) in s.as_bytes().iter().enumerate() {
            inner = array::set(mem, inner, i as u64, u64::from(b), 8, s.len() as u64)?;
        }
        cluster::write_list_cell(mem, payload_ref, self.row, cap, col, inner)
    }

    /// # Errors
    /// Returns a schema-mismatch error if `field` isn't a list of `T` on
    /// this object's table.
    pub fn get_list<T: ScalarCodec>(&self, mem: &Arena, field: &Field<List<T>>) -> DbResult<ListAccessor<T>> {
        self.validate(mem, field, list_char(T::TYPE_CHAR))?;
        let payload_ref = CuckooIndex::leaf_payload_ref(mem, self.leaf_ref);
        let cap = CuckooIndex::leaf_capacity(mem, self.leaf_ref);
        Ok(ListAccessor {
            payload_ref,
            row: self.row,
            col: field.column() as usize,
            leaf_cap: cap,
            elem_type: T::TYPE_CHAR,
            writable: self.writable,
            _marker: PhantomData,
        })
    }
}

/// A lazy view onto one row's list-valued column. Reads and writes go
/// straight through to the nested packed array; nothing is buffered.
pub struct ListAccessor<T> {
    payload_ref: u64,
    row: u64,
    col: usize,
    leaf_cap: u64,
    elem_type: char,
    writable: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ScalarCodec> ListAccessor<T> {
    #[must_use]
    pub fn size(&self, mem: &Arena) -> u64 {
        array::list::size(cluster::read_list_cell(mem, self.payload_ref, self.row, self.col))
    }

    /// # Errors
    /// Returns `DbError::Logic` if `n` is smaller than the current size, or
    /// `DbError::OutOfMemory` if growth fails.
    pub fn set_size(&mut self, mem: &mut Arena, n: u64) -> DbResult<()> {
        debug_assert!(self.writable, "set_size called on a read-only list");
        let old = cluster::read_list_cell(mem, self.payload_ref, self.row, self.col);
        let bits = cluster::required_bits(self.elem_type, 0);
        let new = array::list::set_size(mem, old, n, bits)?;
        cluster::write_list_cell(mem, self.payload_ref, self.row, self.leaf_cap, self.col, new)
    }

    #[must_use]
    pub fn get(&self, mem: &Arena, idx: u64) -> T {
        let inner = cluster::read_list_cell(mem, self.payload_ref, self.row, self.col);
        let raw = array::get(mem, inner, idx);
        T::decode(raw, array::bits(inner))
    }

    /// # Errors
    /// Returns `DbError::OutOfMemory` if growing the element's storage
    /// fails.
    pub fn set(&mut self, mem: &mut Arena, idx: u64, value: T) -> DbResult<()> {
        debug_assert!(self.writable, "set called on a read-only list");
        let old = cluster::read_list_cell(mem, self.payload_ref, self.row, self.col);
        let raw = value.encode();
        let bits = cluster::required_bits(self.elem_type, raw);
        let size_hint = array::list::size(old).max(idx + 1);
        let new = array::set(mem, old, idx, raw, bits, size_hint)?;
        cluster::write_list_cell(mem, self.payload_ref, self.row, self.leaf_cap, self.col, new)
    }
}

/// A frozen, read-only view of a committed database state. Any number of
/// these may exist concurrently; none of them ever touches a writable ref.
pub struct SnapshotRead {
    tables: DirectMap,
}

impl SnapshotRead {
    pub(crate) fn open(mem: &Arena, snap_ref: u64) -> Self {
        SnapshotRead { tables: read_tables(mem, snap_ref) }
    }

    /// # Errors
    /// Returns `DbError::NoSuchTable` if `key` doesn't resolve.
    pub fn open_table(&self, mem: &Arena, key: TableKey) -> DbResult<TableScan> {
        let table_ref = self.tables.find(mem, key.0).ok_or(DbError::NoSuchTable(key.0))?;
        Ok(TableScan { table: key, table_ref, field_types: table::field_types(mem, table_ref) })
    }

    /// # Errors
    /// Returns `DbError::NoSuchTable` or a schema-mismatch error.
    pub fn get(&self, mem: &Arena, key: TableKey, row_key: RowKey) -> DbResult<Object> {
        let table_ref = self.tables.find(mem, key.0).ok_or(DbError::NoSuchTable(key.0))?;
        let (leaf_ref, row) = table::get_cluster(mem, table_ref, row_key.0)?;
        let field_types = table::field_types(mem, table_ref);
        Ok(Object { table: key, table_ref, row_key: row_key.0, leaf_ref, row, field_types, writable: false })
    }

    /// Resolve a typed handle for column `col` of `table`.
    ///
    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::UndefinedField`, or
    /// `DbError::WrongFieldType` if `col` doesn't hold a `T`.
    pub fn field<T: ScalarCodec>(&self, mem: &Arena, table: TableKey, col: u16) -> DbResult<Field<T>> {
        let table_ref = self.tables.find(mem, table.0).ok_or(DbError::NoSuchTable(table.0))?;
        resolve_field(mem, table_ref, table, col)
    }

    /// Resolve a string-column handle.
    ///
    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::UndefinedField`, or
    /// `DbError::WrongFieldType`.
    pub fn string_field(&self, mem: &Arena, table: TableKey, col: u16) -> DbResult<Field<String>> {
        let table_ref = self.tables.find(mem, table.0).ok_or(DbError::NoSuchTable(table.0))?;
        resolve_string_field(mem, table_ref, table, col)
    }

    /// Resolve a list-column handle.
    ///
    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::UndefinedField`, or
    /// `DbError::WrongFieldType`.
    pub fn list_field<T: ScalarCodec>(&self, mem: &Arena, table: TableKey, col: u16) -> DbResult<Field<List<T>>> {
        let table_ref = self.tables.find(mem, table.0).ok_or(DbError::NoSuchTable(table.0))?;
        resolve_list_field(mem, table_ref, table, col)
    }
}

/// A bound table, ready for partitioned scans.
pub struct TableScan {
    table: TableKey,
    table_ref: u64,
    field_types: Vec<char>,
}

impl TableScan {
    #[must_use]
    pub fn universe_size(&self, mem: &Arena) -> u64 {
        table::universe_size(mem, self.table_ref)
    }

    /// Visit every row whose primary hash bucket falls in partition `part`
    /// of `partitions` total, in ascending bucket order. `partitions` must
    /// be nonzero and `part` less than it.
    pub fn for_each_partition(&self, mem: &Arena, part: u64, partitions: u64, mut f: impl FnMut(Object)) {
        debug_assert!(partitions > 0 && part < partitions);
        let limit = self.universe_size(mem);
        let partition_size = (limit / partitions) & !0xFFu64;
        let start_index = (part * partition_size) >> 8;
        let end_index = if part + 1 == partitions { limit >> 8 } else { ((part + 1) * partition_size) >> 8 };
        let mut tree_index = start_index;
        while tree_index < end_index {
            let Some(mut cursor) = table::first_access(mem, self.table_ref, tree_index) else { break };
            if cursor.tree_index >= end_index {
                break;
            }
            loop {
                let row_key = CuckooIndex::row_key_at(mem, &cursor);
                let obj = Object {
                    table: self.table,
                    table_ref: self.table_ref,
                    row_key,
                    leaf_ref: cursor.leaf_ref,
                    row: cursor.row,
                    field_types: self.field_types.clone(),
                    writable: false,
                };
                f(obj);
                if !CuckooIndex::next_access(&mut cursor) {
                    break;
                }
            }
            tree_index = cursor.tree_index + 1;
        }
    }
}

/// The single mutable transaction a `Db` hands out at a time. Every write
/// path (table creation, row insert/update) goes through here; `mem` is
/// borrowed exclusively for the transaction's lifetime, which is what makes
/// "only one writer" a compile-time fact rather than a runtime lock.
pub struct SnapshotWrite {
    snap_ref: u64,
    tables: DirectMap,
}

impl SnapshotWrite {
    pub(crate) fn open(mem: &Arena, snap_ref: u64) -> Self {
        SnapshotWrite { snap_ref, tables: read_tables(mem, snap_ref) }
    }

    pub(crate) fn snap_ref(&self) -> u64 {
        self.snap_ref
    }

    fn ensure_directory_writable(&mut self, mem: &mut Arena) -> DbResult<()> {
        if !mem.is_writable(self.snap_ref) {
            self.snap_ref = cow_node(mem, self.snap_ref)?;
            self.tables = read_tables(mem, self.snap_ref);
        }
        Ok(())
    }

    /// # Errors
    /// Returns `DbError::Logic` on an unknown column type, or
    /// `DbError::OutOfMemory` on allocation failure.
    pub fn create_table(&mut self, mem: &mut Arena, type_info: &str) -> DbResult<TableKey> {
        self.ensure_directory_writable(mem)?;
        let table_ref = table::create(mem, type_info)?;
        let key = self.tables.insert(mem, table_ref)?;
        write_tables(mem, self.snap_ref, &self.tables);
        Ok(TableKey(key))
    }

    fn ensure_table_writable(&mut self, mem: &mut Arena, key: TableKey, table_ref: u64) -> DbResult<u64> {
        if mem.is_writable(table_ref) {
            return Ok(table_ref);
        }
        let new_ref = table::cow(mem, table_ref)?;
        self.ensure_directory_writable(mem)?;
        self.tables.cow_path(mem, key.0)?;
        self.tables.set(mem, key.0, new_ref)?;
        write_tables(mem, self.snap_ref, &self.tables);
        Ok(new_ref)
    }

    /// Insert a zero-valued row under `row_key` and return it for writing.
    ///
    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::KeyInUse`, or
    /// `DbError::OutOfMemory`.
    pub fn insert(&mut self, mem: &mut Arena, key: TableKey, row_key: RowKey) -> DbResult<Object> {
        let old_ref = self.tables.get(mem, key.0).map_err(|_| DbError::NoSuchTable(key.0))?;
        let table_ref = self.ensure_table_writable(mem, key, old_ref)?;
        table::insert(mem, table_ref, row_key.0)?;
        let (leaf_ref, row) = table::get_cluster(mem, table_ref, row_key.0)?;
        let field_types = table::field_types(mem, table_ref);
        Ok(Object { table: key, table_ref, row_key: row_key.0, leaf_ref, row, field_types, writable: true })
    }

    /// # Errors
    /// Returns `DbError::NoSuchTable` or `DbError::NotFound`.
    pub fn get(&self, mem: &Arena, key: TableKey, row_key: RowKey) -> DbResult<Object> {
        let table_ref = self.tables.get(mem, key.0).map_err(|_| DbError::NoSuchTable(key.0))?;
        let (leaf_ref, row) = table::get_cluster(mem, table_ref, row_key.0)?;
        let field_types = table::field_types(mem, table_ref);
        Ok(Object { table: key, table_ref, row_key: row_key.0, leaf_ref, row, field_types, writable: false })
    }

    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::NotFound`, or
    /// `DbError::OutOfMemory` if COWing the row's leaf fails.
    pub fn get_mut(&mut self, mem: &mut Arena, key: TableKey, row_key: RowKey) -> DbResult<Object> {
        let old_ref = self.tables.get(mem, key.0).map_err(|_| DbError::NoSuchTable(key.0))?;
        let table_ref = self.ensure_table_writable(mem, key, old_ref)?;
        let (leaf_ref, row) = table::change_cluster(mem, table_ref, row_key.0)?;
        let field_types = table::field_types(mem, table_ref);
        Ok(Object { table: key, table_ref, row_key: row_key.0, leaf_ref, row, field_types, writable: true })
    }

    /// Resolve a typed handle for column `col` of `table`.
    ///
    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::UndefinedField`, or
    /// `DbError::WrongFieldType` if `col` doesn't hold a `T`.
    pub fn field<T: ScalarCodec>(&self, mem: &Arena, table: TableKey, col: u16) -> DbResult<Field<T>> {
        let table_ref = self.tables.get(mem, table.0).map_err(|_| DbError::NoSuchTable(table.0))?;
        resolve_field(mem, table_ref, table, col)
    }

    /// Resolve a string-column handle.
    ///
    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::UndefinedField`, or
    /// `DbError::WrongFieldType`.
    pub fn string_field(&self, mem: &Arena, table: TableKey, col: u16) -> DbResult<Field<String>> {
        let table_ref = self.tables.get(mem, table.0).map_err(|_| DbError::NoSuchTable(table.0))?;
        resolve_string_field(mem, table_ref, table, col)
    }

    /// Resolve a list-column handle.
    ///
    /// # Errors
    /// Returns `DbError::NoSuchTable`, `DbError::UndefinedField`, or
    /// `DbError::WrongFieldType`.
    pub fn list_field<T: ScalarCodec>(&self, mem: &Arena, table: TableKey, col: u16) -> DbResult<Field<List<T>>> {
        let table_ref = self.tables.get(mem, table.0).map_err(|_| DbError::NoSuchTable(table.0))?;
        resolve_list_field(mem, table_ref, table, col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> Arena {
        Arena::new(tempfile::tempfile().expect("tempfile"))
    }

    #[test]
    fn create_table_insert_and_read_scalar_fields() {
        let mut mem = test_arena();
        let snap_ref = init(&mut mem).unwrap();
        let mut w = SnapshotWrite::open(&mem, snap_ref);
        let t = w.create_table(&mut mem, "uid").unwrap();

        let u_field = w.field::<u64>(&mem, t, 0).unwrap();
        let i_field = w.field::<i64>(&mem, t, 1).unwrap();
        let d_field = w.field::<f64>(&mem, t, 2).unwrap();

        let mut obj = w.insert(&mut mem, t, RowKey(7)).unwrap();
        obj.set(&mut mem, &u_field, 42u64).unwrap();
        obj.set(&mut mem, &i_field, -9i64).unwrap();
        obj.set(&mut mem, &d_field, 3.5f64).unwrap();

        let read = w.get(&mem, t, RowKey(7)).unwrap();
        assert_eq!(read.get(&mem, &u_field).unwrap(), 42u64);
        assert_eq!(read.get(&mem, &i_field).unwrap(), -9i64);
        assert_eq!(read.get(&mem, &d_field).unwrap(), 3.5f64);
    }

    #[test]
    fn string_round_trips_in_place() {
        let mut mem = test_arena();
        let snap_ref = init(&mut mem).unwrap();
        let mut w = SnapshotWrite::open(&mem, snap_ref);
        let t = w.create_table(&mut mem, "s").unwrap();
        let field = w.string_field(&mem, t, 0).unwrap();

        let mut obj = w.insert(&mut mem, t, RowKey(1)).unwrap();
        obj.set_string(&mut mem, &field, "hello world").unwrap();
        let read = w.get(&mem, t, RowKey(1)).unwrap();
        assert_eq!(read.get_string(&mem, &field).unwrap(), "hello world");

        let mut obj = w.get_mut(&mut mem, t, RowKey(1)).unwrap();
        obj.set_string(&mut mem, &field, "overwritten").unwrap();
        let read = w.get(&mem, t, RowKey(1)).unwrap();
        assert_eq!(read.get_string(&mem, &field).unwrap(), "overwritten");
    }

    #[test]
    fn list_round_trips_and_grows() {
        let mut mem = test_arena();
        let snap_ref = init(&mut mem).unwrap();
        let mut w = SnapshotWrite::open(&mem, snap_ref);
        let t = w.create_table(&mut mem, "U").unwrap();
        let field = w.list_field::<u64>(&mem, t, 0).unwrap();

        let mut obj = w.insert(&mut mem, t, RowKey(1)).unwrap();
        {
            let mut list = obj.get_list(&mem, &field).unwrap();
            list.set_size(&mut mem, 5).unwrap();
            for i in 0..5u64 {
                list.set(&mut mem, i, i * i).unwrap();
            }
        }
        let read = w.get(&mem, t, RowKey(1)).unwrap();
        let list = read.get_list(&mem, &field).unwrap();
        assert_eq!(list.size(&mem), 5);
        for i in 0..5u64 {
            assert_eq!(list.get(&mem, i), i * i);
        }
    }

    #[test]
    fn stale_field_after_schema_replacement_is_rejected() {
        let mut mem = test_arena();
        let snap_ref = init(&mut mem).unwrap();
        let mut w = SnapshotWrite::open(&mem, snap_ref);
        let t1 = w.create_table(&mut mem, "u").unwrap();
        let stale_field = w.field::<u64>(&mem, t1, 0).unwrap();

        // Simulate a schema generation change by building a field with a
        // tag that doesn't match the live column's.
        let forged = Field::<u64>::new(t1, 0, stale_field.tag.wrapping_add(1));
        let obj = w.insert(&mut mem, t1, RowKey(1)).unwrap();
        assert!(matches!(obj.get(&mem, &forged), Err(DbError::StaleField)));
    }
}
