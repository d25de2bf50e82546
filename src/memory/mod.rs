//! The arena: ref-to-pointer translation, size-binned free lists, and the
//! two bump allocators (scratch and in-file) that back every other module.
//!
//! Every other component receives `&Arena` or `&mut Arena` explicitly rather
//! than reaching for a global; this is what makes the single-writer borrow
//! discipline enforceable at the type level (`Db::create_changes` hands out
//! the only `&mut Arena` in the process).

mod bins;

use crate::utils::errors::{DbError, DbResult};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::File;
use std::sync::LazyLock;

pub const CHUNK_SHIFT: u32 = 20;
pub const CHUNK_SIZE: u64 = 1 << CHUNK_SHIFT;
pub const CHUNK_MASK: u64 = CHUNK_SIZE - 1;
pub const HEADER_SIZE: u64 = 64 * 1024;

static ZERO_CHUNK: LazyLock<Vec<u8>> = LazyLock::new(|| vec![0u8; CHUNK_SIZE as usize]);

/// One page-table slot. Chunk 0 is always `Null`; slots are pushed in order
/// as the arena grows, so `chunk_table[i]` backs refs in
/// `[i * CHUNK_SIZE, (i + 1) * CHUNK_SIZE)`.
enum Chunk {
    Null,
    ReadOnlyFile(Mmap),
    WritableFile(MmapMut),
    Scratch(MmapMut),
}

impl Chunk {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Chunk::Null => ZERO_CHUNK.as_ptr(),
            Chunk::ReadOnlyFile(m) => m.as_ptr(),
            Chunk::WritableFile(m) | Chunk::Scratch(m) => m.as_ptr(),
        }
    }

    fn as_mut_ptr(&mut self) -> Option<*mut u8> {
        match self {
            Chunk::Null | Chunk::ReadOnlyFile(_) => None,
            Chunk::WritableFile(m) | Chunk::Scratch(m) => Some(m.as_mut_ptr()),
        }
    }
}

/// The arena: translates `Ref`s into raw pointers and owns every mapped
/// chunk of the address space.
pub struct Arena {
    file: File,
    chunk_table: Vec<Chunk>,
    /// Number of chunks backed by the file (chunk 0, the null chunk, is
    /// not counted). `file_chunk_count + 1` is the first scratch chunk index.
    file_chunk_count: usize,
    free_lists: Vec<u64>,
    scratch_ref_start: u64,
    allocation_ref: u64,
    pending_write_chunks: Vec<usize>,
    file_alloc_ref: u64,
}

impl Arena {
    /// Open the arena over a freshly created, already `ftruncate`'d-to-header
    /// file. No file chunks are mapped yet; `prepare_mapping` installs them
    /// once a snapshot names a logical file size.
    pub fn new(file: File) -> Self {
        let mut table = Vec::with_capacity(4);
        table.push(Chunk::Null);
        let scratch_ref_start = CHUNK_SIZE;
        Arena {
            file,
            chunk_table: table,
            file_chunk_count: 0,
            free_lists: vec![0u64; bins::BIN_COUNT],
            scratch_ref_start,
            allocation_ref: scratch_ref_start,
            pending_write_chunks: Vec::new(),
            file_alloc_ref: 0,
        }
    }

    #[must_use]
    pub const fn scratch_ref_start(&self) -> u64 {
        self.scratch_ref_start
    }

    #[must_use]
    pub const fn is_writable(&self, r: u64) -> bool {
        r >= self.scratch_ref_start
    }

    /// Ref-to-pointer translation. Never faults: a null or out-of-range
    /// chunk index reads through the shared zero page.
    #[must_use]
    pub fn translate(&self, r: u64) -> *const u8 {
        let idx = (r >> CHUNK_SHIFT) as usize;
        let off = (r & CHUNK_MASK) as usize;
        match self.chunk_table.get(idx) {
            Some(chunk) => unsafe { chunk.as_ptr().add(off) },
            None => unsafe { ZERO_CHUNK.as_ptr().add(off) },
        }
    }

    /// Mutable translation. Returns `None` for null or read-only (frozen)
    /// refs; callers must COW before writing to those.
    pub fn translate_mut(&mut self, r: u64) -> Option<*mut u8> {
        if r == 0 {
            return None;
        }
        let idx = (r >> CHUNK_SHIFT) as usize;
        let off = (r & CHUNK_MASK) as usize;
        let chunk = self.chunk_table.get_mut(idx)?;
        chunk.as_mut_ptr().map(|p| unsafe { p.add(off) })
    }

    /// Read a `T` out of the arena at `r` (by value copy, little-endian
    /// layout assumed throughout).
    ///
    /// # Safety
    /// Caller asserts `r` actually addresses a live, properly aligned `T`.
    pub unsafe fn read<T: Copy>(&self, r: u64) -> T {
        let ptr = self.translate(r).cast::<T>();
        unsafe { ptr.read_unaligned() }
    }

    /// Write a `T` into the arena at `r`. `r` must be a writable (scratch or
    /// in-flight-write-file) ref; use `is_writable` to check first.
    ///
    /// # Safety
    /// Caller asserts `r` actually addresses a live, writable `T`-sized slot.
    pub unsafe fn write<T: Copy>(&mut self, r: u64, value: T) {
        let Some(ptr) = self.translate_mut(r) else {
            debug_assert!(false, "write to frozen or null ref {r:#x}");
            return;
        };
        unsafe { ptr.cast::<T>().write_unaligned(value) };
    }

    /// Allocate `size` scratch bytes. Returns the ref of the new block.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if mapping a fresh scratch chunk fails.
    pub fn alloc(&mut self, size: u64) -> DbResult<u64> {
        let bin = bins::size_to_bin(size);
        if let Some(r) = self.pop_free(bin) {
            return Ok(r);
        }
        let block_size = bins::bin_to_size(bin);
        self.bump_scratch(block_size)
    }

    /// Free a previously allocated block. A no-op if `r` is frozen (points
    /// into the read-only file region) -- this is what makes COW safe.
    pub fn free(&mut self, r: u64, size: u64) {
        if r == 0 || !self.is_writable(r) {
            return;
        }
        let bin = bins::size_to_bin(size);
        let head = self.free_lists[bin];
        unsafe { self.write::<u64>(r, head) };
        self.free_lists[bin] = r;
    }

    fn pop_free(&mut self, bin: usize) -> Option<u64> {
        let head = self.free_lists[bin];
        if head == 0 {
            return None;
        }
        let next: u64 = unsafe { self.read(head) };
        self.free_lists[bin] = next;
        Some(head)
    }

    fn bump_scratch(&mut self, size: u64) -> DbResult<u64> {
        let chunk_idx = (self.allocation_ref >> CHUNK_SHIFT) as usize;
        if chunk_idx >= self.chunk_table.len() {
            self.grow_scratch_chunk(chunk_idx)?;
        }
        let end = self.allocation_ref + size;
        if (end - 1) >> CHUNK_SHIFT != chunk_idx as u64 {
            // Block would straddle a chunk boundary: waste the remainder of
            // this chunk and start the allocation at the next chunk.
            self.allocation_ref = (chunk_idx as u64 + 1) << CHUNK_SHIFT;
            return self.bump_scratch(size);
        }
        let r = self.allocation_ref;
        self.allocation_ref = end;
        Ok(r)
    }

    fn grow_scratch_chunk(&mut self, idx: usize) -> DbResult<()> {
        while self.chunk_table.len() <= idx {
            let map = MmapOptions::new()
                .len(CHUNK_SIZE as usize)
                .map_anon()
                .map_err(|e| DbError::OutOfMemory(e.to_string()))?;
            self.chunk_table.push(Chunk::Scratch(map));
        }
        Ok(())
    }

    /// File-side bump allocator used only during commit. `size` is rounded
    /// up to the bin granularity so committed nodes keep the same free-list
    /// accounting shape as scratch ones (they're never freed, but the sizing
    /// has to agree with what `commit` copies).
    pub fn alloc_in_file(&mut self, size: u64) -> DbResult<u64> {
        let bin = bins::size_to_bin(size);
        let block_size = bins::bin_to_size(bin);
        let chunk_idx = (self.file_alloc_ref >> CHUNK_SHIFT) as usize;
        self.ensure_writable_file_chunk(chunk_idx)?;
        let end = self.file_alloc_ref + block_size;
        if (end - 1) >> CHUNK_SHIFT != chunk_idx as u64 {
            self.file_alloc_ref = (chunk_idx as u64 + 1) << CHUNK_SHIFT;
            return self.alloc_in_file(size);
        }
        let r = self.file_alloc_ref;
        self.file_alloc_ref = end;
        Ok(r)
    }

    /// Make sure `chunk_idx` (a file chunk index, never 0) is mapped
    /// `MAP_SHARED` for writing and tracked for the pending msync at commit
    /// end. Growing the file with `set_len` when the chunk is new; remapping
    /// in place when the chunk already holds committed data from an earlier
    /// transaction (the in-file allocator may resume mid-chunk).
    fn ensure_writable_file_chunk(&mut self, chunk_idx: usize) -> DbResult<()> {
        debug_assert!(chunk_idx >= 1, "chunk 0 is the null chunk, never file-backed");
        if chunk_idx > self.file_chunk_count {
            self.file.set_len(HEADER_SIZE + chunk_idx as u64 * CHUNK_SIZE)?;
            self.file_chunk_count = chunk_idx;
        }
        if matches!(self.chunk_table.get(chunk_idx), Some(Chunk::WritableFile(_))) {
            if !self.pending_write_chunks.contains(&chunk_idx) {
                self.pending_write_chunks.push(chunk_idx);
            }
            return Ok(());
        }
        let offset = HEADER_SIZE + (chunk_idx as u64 - 1) * CHUNK_SIZE;
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(CHUNK_SIZE as usize)
                .map_mut(&self.file)
                .map_err(|e| DbError::OutOfMemory(e.to_string()))?
        };
        while self.chunk_table.len() <= chunk_idx {
            self.chunk_table.push(Chunk::Null);
        }
        self.chunk_table[chunk_idx] = Chunk::WritableFile(map);
        self.pending_write_chunks.push(chunk_idx);
        Ok(())
    }

    /// Bracket the write side of a commit: seed the file-side bump pointer
    /// at the allocation point recorded in the last committed `Meta`.
    pub fn open_for_write(&mut self, start_ref: u64) {
        self.file_alloc_ref = start_ref;
    }

    /// Flush and unmap every chunk touched during this commit, turning them
    /// into ordinary read-only file chunks for subsequent readers in this
    /// same process. Returns the new logical file size and allocation point
    /// to store in the freshly selected `Meta`.
    ///
    /// # Errors
    /// Returns `DbError::Io` if `msync`ing any pending chunk fails.
    pub fn finish_writing(&mut self) -> DbResult<(u64, u64)> {
        for idx in self.pending_write_chunks.drain(..) {
            if let Chunk::WritableFile(map) = &self.chunk_table[idx] {
                map.flush()?;
            }
            if let Chunk::WritableFile(map) = std::mem::replace(&mut self.chunk_table[idx], Chunk::Null) {
                let ro = map.make_read_only().map_err(|e| DbError::Io(std::io::Error::other(e.to_string())))?;
                self.chunk_table[idx] = Chunk::ReadOnlyFile(ro);
            }
        }
        let new_file_size = HEADER_SIZE + self.file_chunk_count as u64 * CHUNK_SIZE;
        Ok((new_file_size, self.file_alloc_ref))
    }

    /// Reset the arena to view a snapshot whose logical file size is
    /// `new_file_size`: drop scratch chunks, (re)map every file chunk
    /// up to that size read-only, and reset the scratch bump pointer.
    ///
    /// # Errors
    /// Returns `DbError::Io` if mapping a file chunk fails.
    pub fn prepare_mapping(&mut self, new_file_size: u64) -> DbResult<()> {
        let wanted_chunks = new_file_size.saturating_sub(HEADER_SIZE).div_ceil(CHUNK_SIZE) as usize;
        self.chunk_table.truncate(1); // keep only the null chunk
        for i in 0..wanted_chunks {
            let offset = HEADER_SIZE + i as u64 * CHUNK_SIZE;
            let map = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(CHUNK_SIZE as usize)
                    .map(&self.file)
                    .map_err(|e| DbError::Io(std::io::Error::other(e.to_string())))?
            };
            self.chunk_table.push(Chunk::ReadOnlyFile(map));
        }
        self.file_chunk_count = wanted_chunks;
        self.scratch_ref_start = (wanted_chunks as u64 + 1) << CHUNK_SHIFT;
        self.allocation_ref = self.scratch_ref_start;
        self.free_lists.iter_mut().for_each(|h| *h = 0);
        Ok(())
    }

    /// Discard all scratch allocations made since the last `prepare_mapping`
    /// or `release`. Called on `abort` and after a successful `commit`.
    pub fn release_scratch(&mut self) {
        self.chunk_table.truncate((self.file_chunk_count + 1).max(1));
        self.allocation_ref = self.scratch_ref_start;
        self.free_lists.iter_mut().for_each(|h| *h = 0);
    }
}
