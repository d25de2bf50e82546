//! The top-level handle: owns the file, the header, and the arena, and
//! drives the double-`msync` commit protocol that makes a transaction
//! crash-safe.
//!
//! Only one `&mut Db` can exist at a time in a process (ordinary Rust
//! ownership), which is what makes "single writer" a compile-time property
//! rather than a runtime lock here -- there is no separate writer mutex.

use crate::config::Config;
use crate::header::{Header, Meta};
use crate::memory::{Arena, CHUNK_SIZE};
use crate::snapshot::{self, SnapshotRead, SnapshotWrite};
use crate::utils::errors::{DbError, DbResult};
use crate::utils::{fsutil, logger};
use std::path::Path;

const VERSIONS_SIZE: u64 = 24; // first_version, last_version, versions[0]

/// Best-effort logging setup: a configured log directory wins, otherwise log
/// next to the database file. Never fails `Db::create`/`open` over a logging
/// problem.
fn init_logging(path: &Path) {
    let cfg = Config::load(None);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("vaultcore");
    let dir = cfg.log_dir.unwrap_or_else(|| path.parent().map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf));
    let _ = logger::init_for_db_in(&dir, stem);
}

fn read_versions(mem: &Arena, versions_ref: u64) -> (u64, u64, u64) {
    let first: u64 = unsafe { mem.read(versions_ref) };
    let last: u64 = unsafe { mem.read(versions_ref + 8) };
    let snap_ref: u64 = unsafe { mem.read(versions_ref + 16) };
    (first, last, snap_ref)
}

fn write_versions(mem: &mut Arena, versions_ref: u64, first: u64, last: u64, snap_ref: u64) {
    unsafe { mem.write(versions_ref, first) };
    unsafe { mem.write(versions_ref + 8, last) };
    unsafe { mem.write(versions_ref + 16, snap_ref) };
}

/// A handle onto a single database file. Creating and opening are
/// deliberately separate operations (mirroring `O_EXCL` vs. plain `O_RDWR`)
/// so a caller can't silently overwrite an existing database by calling the
/// wrong one.
pub struct Db {
    header: Header,
    mem: Arena,
}

impl Db {
    /// Create a brand-new, empty database at `path`. Fails if a file already
    /// exists there.
    ///
    /// # Errors
    /// Returns `DbError::DatabaseAlreadyExists` if `path` exists, or
    /// `DbError::Io` if the file can't be created or mapped.
    pub fn create(path: &Path) -> DbResult<Self> {
        if path.exists() {
            return Err(DbError::DatabaseAlreadyExists);
        }
        init_logging(path);
        let file = fsutil::create_secure(path)?;
        let header = Header::create(&file, CHUNK_SIZE)?;
        let mut mem = Arena::new(file);
        mem.prepare_mapping(header.active_meta().logical_file_size)?;
        log::info!("created database at {}", path.display());
        Ok(Db { header, mem })
    }

    /// Open an existing database at `path`.
    ///
    /// # Errors
    /// Returns `DbError::DatabaseNotFound` if `path` doesn't exist,
    /// `DbError::CorruptHeader` if the header's magic doesn't match, or
    /// `DbError::Io` for other I/O failures.
    pub fn open(path: &Path) -> DbResult<Self> {
        if !path.exists() {
            return Err(DbError::DatabaseNotFound);
        }
        init_logging(path);
        let file = fsutil::open_rw_no_trunc(path)?;
        let header = Header::open(&file)?;
        let mut mem = Arena::new(file);
        mem.prepare_mapping(header.active_meta().logical_file_size)?;
        Ok(Db { header, mem })
    }

    /// Open the most recently committed snapshot for reading.
    ///
    /// # Errors
    /// Returns `DbError::NoSnapshot` if nothing has been committed yet.
    pub fn open_snapshot(&mut self) -> DbResult<SnapshotRead> {
        let meta = self.header.active_meta();
        if meta.versions_ref == 0 {
            return Err(DbError::NoSnapshot);
        }
        self.mem.prepare_mapping(meta.logical_file_size)?;
        let (_, _, snap_ref) = read_versions(&self.mem, meta.versions_ref);
        Ok(SnapshotRead::open(&self.mem, snap_ref))
    }

    /// Start a new write transaction built on top of the newest committed
    /// snapshot (or an empty one, if nothing has been committed yet).
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if allocating the initial snapshot node
    /// fails.
    pub fn create_changes(&mut self) -> DbResult<SnapshotWrite> {
        let meta = self.header.active_meta();
        self.mem.prepare_mapping(meta.logical_file_size)?;
        let snap_ref = if meta.versions_ref == 0 {
            snapshot::init(&mut self.mem)?
        } else {
            let (_, _, old_snap_ref) = read_versions(&self.mem, meta.versions_ref);
            old_snap_ref
        };
        Ok(SnapshotWrite::open(&self.mem, snap_ref))
    }

    /// Discard a read snapshot, releasing any scratch it may have COW'd
    /// while being read through (a read-only handle never COWs, but this
    /// keeps the reset point symmetric with `abort`).
    pub fn release(&mut self, snapshot: SnapshotRead) {
        drop(snapshot);
        self.mem.release_scratch();
    }

    /// Discard an in-progress write transaction without committing it.
    /// Every scratch allocation made since `create_changes` is freed at
    /// once, since none of it is reachable except through `changes`.
    pub fn abort(&mut self, changes: SnapshotWrite) {
        drop(changes);
        self.mem.release_scratch();
    }

    /// Commit a write transaction: flush every touched chunk to the file,
    /// then flip the active header slot in two separate `msync`s so a crash
    /// between them still leaves one fully consistent `Meta` in place.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if a file-region allocation fails, or
    /// `DbError::Io` if flushing the file or the header fails.
    pub fn commit(&mut self, changes: SnapshotWrite) -> DbResult<()> {
        let meta = self.header.active_meta();
        self.mem.open_for_write(meta.in_file_allocation_point);

        let new_snap_ref = snapshot::commit(&mut self.mem, changes.snap_ref())?;

        let (first_version, last_version) = if meta.versions_ref == 0 {
            (1, 1)
        } else {
            let (first, last, _) = read_versions(&self.mem, meta.versions_ref);
            (first, last + 1)
        };
        let new_versions_ref = self.mem.alloc_in_file(VERSIONS_SIZE)?;
        write_versions(&mut self.mem, new_versions_ref, first_version, last_version, new_snap_ref);
        if meta.versions_ref != 0 {
            self.mem.free(meta.versions_ref, VERSIONS_SIZE);
        }

        let (logical_file_size, in_file_allocation_point) = self.mem.finish_writing()?;
        self.header.write_inactive_meta(Meta {
            versions_ref: new_versions_ref,
            logical_file_size,
            in_file_allocation_point,
        });
        self.header.sync()?;
        self.header.flip_selector();
        self.header.sync()?;

        self.mem.release_scratch();
        log::debug!("committed version {last_version}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowKey;
    use tempfile::tempdir;

    #[test]
    fn create_rejects_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let _db = Db::create(&path).unwrap();
        assert!(matches!(Db::create(&path), Err(DbError::DatabaseAlreadyExists)));
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        assert!(matches!(Db::open(&path), Err(DbError::DatabaseNotFound)));
    }

    #[test]
    fn fresh_database_has_no_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.db");
        let mut db = Db::create(&path).unwrap();
        assert!(matches!(db.open_snapshot(), Err(DbError::NoSnapshot)));
    }

    #[test]
    fn abort_discards_uncommitted_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        let mut db = Db::create(&path).unwrap();
        let mut changes = db.create_changes().unwrap();
        let _table = changes.create_table(&mut db.mem, "u").unwrap();
        db.abort(changes);
        assert!(matches!(db.open_snapshot(), Err(DbError::NoSnapshot)));
    }

    // Exercises the full create/insert/commit/reopen/read cycle through the
    // public `Db` surface rather than poking at internals directly.
    #[test]
    fn full_cycle_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.db");

        let table_key;
        {
            let mut db = Db::create(&path).unwrap();
            let mut changes = db.create_changes().unwrap();
            table_key = changes.create_table(&mut db.mem, "u").unwrap();
            let field = changes.field::<u64>(&db.mem, table_key, 0).unwrap();
            let mut row = changes.insert(&mut db.mem, table_key, RowKey(42)).unwrap();
            row.set(&mut db.mem, &field, 123u64).unwrap();
            db.commit(changes).unwrap();
        }
        {
            let mut db = Db::open(&path).unwrap();
            let snap = db.open_snapshot().unwrap();
            let field = snap.field::<u64>(&db.mem, table_key, 0).unwrap();
            let obj = snap.get(&db.mem, table_key, RowKey(42)).unwrap();
            assert_eq!(obj.get(&db.mem, &field).unwrap(), 123u64);
        }
    }

    #[test]
    fn second_transaction_sees_first_transactions_committed_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.db");
        let mut db = Db::create(&path).unwrap();

        let mut changes = db.create_changes().unwrap();
        let table_key = changes.create_table(&mut db.mem, "i").unwrap();
        let field = changes.field::<i64>(&db.mem, table_key, 0).unwrap();
        let mut row = changes.insert(&mut db.mem, table_key, RowKey(1)).unwrap();
        row.set(&mut db.mem, &field, -5i64).unwrap();
        db.commit(changes).unwrap();

        let mut changes = db.create_changes().unwrap();
        let field = changes.field::<i64>(&db.mem, table_key, 0).unwrap();
        let obj = changes.get(&db.mem, table_key, RowKey(1)).unwrap();
        assert_eq!(obj.get(&db.mem, &field).unwrap(), -5i64);
        db.abort(changes);
    }
}
