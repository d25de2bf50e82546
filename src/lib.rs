//! An embedded, single-writer/multi-reader storage core: arena-backed
//! allocation, copy-on-write node graphs, a cuckoo-hashed primary index per
//! table, and a double-`msync` commit protocol for crash safety.
//!
//! The public surface is small and deliberately layered: [`Db`] owns a file
//! and drives commits; [`SnapshotRead`]/[`SnapshotWrite`] scope a
//! transaction's view of the table directory; [`Object`] is a located row.
//! Everything underneath (the arena, the tree index, the cuckoo index, the
//! columnar cluster storage) is reachable for callers building their own
//! layout on top, but the facade above is what most callers need.

pub mod array;
pub mod cluster;
pub mod config;
pub mod cuckoo;
pub mod db;
pub mod direct_map;
pub mod header;
pub mod memory;
pub mod snapshot;
pub mod table;
pub mod tree;
pub mod types;
pub mod utils;

pub use config::Config;
pub use db::Db;
pub use memory::Arena;
pub use snapshot::{ListAccessor, Object, ScalarCodec, SnapshotRead, SnapshotWrite, TableScan};
pub use types::{Field, List, RowKey, TableKey};
pub use utils::errors::{DbError, DbResult};
