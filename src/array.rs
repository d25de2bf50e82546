//! The packed array codec: a typed sequence of up to 255 elements stored in
//! the smallest adequate bit width, encoded as a single 64-bit control word.
//!
//! Layout of the control word, high to low: 3-bit element-size class (`esz`),
//! 8-bit capacity, 53 bits of data. Data is either the packed elements
//! themselves (when they fit) or a ref right-shifted by 3 (refs are always
//! 8-byte aligned, so the low 3 bits are free). External storage is a run of
//! 64-bit quads; because every supported width divides 64 evenly, a single
//! element never straddles a quad boundary.

use crate::memory::Arena;
use crate::utils::errors::DbResult;

const ESZ_SHIFT: u32 = 61;
const CAP_SHIFT: u32 = 53;
const DATA_MASK: u64 = (1u64 << 53) - 1;
const ESZ_BITS: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

/// The all-zero word: an empty, uninitialized array. Writing a null value
/// into it is a no-op so default-valued columns never allocate.
pub const EMPTY: u64 = 0;

#[must_use]
pub const fn esz_for_bits(bits: u32) -> u8 {
    match bits {
        0 | 1 => 0,
        2 => 1,
        3 | 4 => 2,
        5..=8 => 3,
        9..=16 => 4,
        17..=32 => 5,
        _ => 6,
    }
}

#[must_use]
pub const fn bits_for_esz(esz: u8) -> u32 {
    ESZ_BITS[(esz & 0x7) as usize]
}

fn pack(esz: u8, cap: u8, data: u64) -> u64 {
    ((esz as u64) << ESZ_SHIFT) | ((cap as u64) << CAP_SHIFT) | (data & DATA_MASK)
}

fn unpack(word: u64) -> (u8, u8, u64) {
    let esz = ((word >> ESZ_SHIFT) & 0x7) as u8;
    let cap = ((word >> CAP_SHIFT) & 0xFF) as u8;
    let data = word & DATA_MASK;
    (esz, cap, data)
}

#[must_use]
fn is_inline(esz: u8, cap: u8) -> bool {
    (cap as u64) * (bits_for_esz(esz) as u64) <= 53
}

fn mask_for(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

fn quad_count(cap: u8, bits: u32) -> u64 {
    ((cap as u64) * (bits as u64)).div_ceil(64).max(1)
}

fn extract(word: u64, slot: u64, bits: u32) -> u64 {
    (word >> (slot * bits as u64)) & mask_for(bits)
}

/// Capacity in elements (for a `List`, this doubles as the logical size).
#[must_use]
pub fn capacity(word: u64) -> u64 {
    unpack(word).1 as u64
}

/// The element bit width currently backing `word`. Needed by callers that
/// must sign-extend a raw read (`get` itself returns the unextended bits).
#[must_use]
pub fn bits(word: u64) -> u32 {
    bits_for_esz(unpack(word).0)
}

/// Read the raw bit pattern of element `idx`. Out-of-range reads return 0,
/// matching the zero-default semantics of an array that was never widened
/// to cover that index.
#[must_use]
pub fn get(mem: &Arena, word: u64, idx: u64) -> u64 {
    let (esz, cap, data) = unpack(word);
    if idx >= cap as u64 {
        return 0;
    }
    let bits = bits_for_esz(esz);
    if is_inline(esz, cap) {
        extract(data, idx, bits)
    } else {
        let r = data << 3;
        let elems_per_quad = 64 / bits;
        let quad_idx = idx / elems_per_quad as u64;
        let slot = idx % elems_per_quad as u64;
        let quad: u64 = unsafe { mem.read(r + quad_idx * 8) };
        extract(quad, slot, bits)
    }
}

/// Sign-extend a raw bit pattern read at `bits` width into an `i64`.
#[must_use]
pub fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits >= 64 {
        raw as i64
    } else {
        let shift = 64 - bits;
        ((raw << shift) as i64) >> shift
    }
}

fn write_in_place(mem: &mut Arena, word: u64, idx: u64, raw: u64, bits: u32) -> u64 {
    let (esz, cap, data) = unpack(word);
    if is_inline(esz, cap) {
        let shift = idx * bits as u64;
        let mask = mask_for(bits);
        let new_data = (data & !(mask << shift)) | ((raw & mask) << shift);
        pack(esz, cap, new_data)
    } else {
        let r = data << 3;
        let elems_per_quad = 64 / bits;
        let quad_idx = idx / elems_per_quad as u64;
        let slot = idx % elems_per_quad as u64;
        let mut quad: u64 = unsafe { mem.read(r + quad_idx * 8) };
        let shift = slot * bits as u64;
        let mask = mask_for(bits);
        quad = (quad & !(mask << shift)) | ((raw & mask) << shift);
        unsafe { mem.write(r + quad_idx * 8, quad) };
        word
    }
}

fn free_storage(mem: &mut Arena, word: u64) {
    let (esz, cap, data) = unpack(word);
    if !is_inline(esz, cap) && data != 0 {
        let bits = bits_for_esz(esz);
        mem.free(data << 3, quad_count(cap, bits) * 8);
    }
}

/// Release an array's external storage, if any. A no-op for inlined arrays
/// or arrays already frozen in the file region (freeing those is itself a
/// no-op at the arena level, but this keeps call sites from having to know
/// the difference).
pub fn free(mem: &mut Arena, word: u64) {
    free_storage(mem, word);
}

fn ensure_storage(mem: &mut Arena, esz: u8, cap: u8) -> DbResult<u64> {
    if is_inline(esz, cap) {
        return Ok(0);
    }
    let bits = bits_for_esz(esz);
    let size = quad_count(cap, bits) * 8;
    let r = mem.alloc(size)?;
    for i in 0..size / 8 {
        unsafe { mem.write::<u64>(r + i * 8, 0) };
    }
    Ok(r >> 3)
}

/// Write `raw` (already masked to the caller's logical type) at `idx`.
/// `min_bits` is the smallest element width that can represent the value
/// being written (fixed at 32/64 for floats and doubles, the natural size
/// class of the magnitude for integers). `cap_hint` lets a caller request a
/// larger capacity up front (e.g. `List::set_size`) instead of growing one
/// element at a time.
///
/// # Errors
/// Returns `DbError::OutOfMemory` if growing the backing storage fails.
pub fn set(mem: &mut Arena, word: u64, idx: u64, raw: u64, min_bits: u32, cap_hint: u64) -> DbResult<u64> {
    if word == EMPTY && raw == 0 {
        return Ok(EMPTY);
    }
    let (esz, cap, _) = unpack(word);
    let bits = bits_for_esz(esz);
    let need_wider = min_bits > bits;
    let need_bigger = idx >= cap as u64;
    if !need_wider && !need_bigger {
        return Ok(write_in_place(mem, word, idx, raw, bits));
    }

    let new_esz = esz_for_bits(min_bits.max(bits));
    let new_cap = ((idx + 1).max(cap as u64).max(cap_hint)).min(255) as u8;
    let new_data = ensure_storage(mem, new_esz, new_cap)?;
    let mut new_word = pack(new_esz, new_cap, new_data);

    for i in 0..cap as u64 {
        let v = get(mem, word, i);
        new_word = write_in_place(mem, new_word, i, v, bits_for_esz(new_esz));
    }
    free_storage(mem, word);
    new_word = write_in_place(mem, new_word, idx, raw, bits_for_esz(new_esz));
    Ok(new_word)
}

/// Copy a scratch-backed array's external storage into the file region.
/// Inlined and already-frozen arrays are returned unchanged.
///
/// # Errors
/// Returns `DbError::OutOfMemory` if the file-side allocation fails.
pub fn commit(mem: &mut Arena, word: u64) -> DbResult<u64> {
    let (esz, cap, data) = unpack(word);
    if is_inline(esz, cap) || data == 0 {
        return Ok(word);
    }
    let r = data << 3;
    if !mem.is_writable(r) {
        return Ok(word);
    }
    let bits = bits_for_esz(esz);
    let size = quad_count(cap, bits) * 8;
    let new_ref = mem.alloc_in_file(size)?;
    for i in 0..size / 8 {
        let v: u64 = unsafe { mem.read(r + i * 8) };
        unsafe { mem.write(new_ref + i * 8, v) };
    }
    mem.free(r, size);
    Ok(pack(esz, cap, new_ref >> 3))
}

/// List-specific accessors: a `List<T>` reuses the array word, treating
/// capacity as the logical element count.
pub mod list {
    use super::{DbResult, set};
    use crate::memory::Arena;
    use crate::utils::errors::DbError;

    #[must_use]
    pub fn size(word: u64) -> u64 {
        super::capacity(word)
    }

    /// Grow the list's logical size to `n`, zero-filling any new slots.
    /// Shrinking is unsupported: the source engine never implements list
    /// truncation, and no consistent semantics for it are specified.
    ///
    /// # Errors
    /// Returns `DbError::Logic` if `n` is smaller than the current size, or
    /// `DbError::OutOfMemory` if growth fails.
    pub fn set_size(mem: &mut Arena, word: u64, n: u64, min_bits: u32) -> DbResult<u64> {
        let current = size(word);
        if n < current {
            return Err(DbError::Logic("list truncation is not supported".into()));
        }
        if n == current {
            return Ok(word);
        }
        // Touch the last new slot with a zero write and the requested
        // capacity hint; `array::set`'s early-out for all-zero writes means
        // this only allocates once, for the full new size.
        set(mem, word, n - 1, 0, min_bits, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> Arena {
        Arena::new(tempfile::tempfile().expect("tempfile"))
    }

    #[test]
    fn inline_roundtrip() {
        let mut mem = test_arena();
        let mut word = EMPTY;
        for i in 0..4u64 {
            word = set(&mut mem, word, i, i * 3, 8, 0).unwrap();
        }
        for i in 0..4u64 {
            assert_eq!(get(&mem, word, i), i * 3);
        }
        assert_eq!(capacity(word), 4);
    }

    #[test]
    fn widening_preserves_values() {
        let mut mem = test_arena();
        let mut word = EMPTY;
        word = set(&mut mem, word, 0, 5, 8, 0).unwrap();
        // force a widen to 64-bit elements with a large value
        word = set(&mut mem, word, 1, u32::MAX as u64 + 10, 64, 0).unwrap();
        assert_eq!(get(&mem, word, 0), 5);
        assert_eq!(get(&mem, word, 1), u32::MAX as u64 + 10);
    }

    #[test]
    fn external_storage_beyond_inline_capacity() {
        let mut mem = test_arena();
        let mut word = EMPTY;
        for i in 0..40u64 {
            word = set(&mut mem, word, i, i, 16, 0).unwrap();
        }
        for i in 0..40u64 {
            assert_eq!(get(&mem, word, i), i);
        }
    }

    #[test]
    fn null_write_to_empty_array_is_noop() {
        let mut mem = test_arena();
        let word = set(&mut mem, EMPTY, 5, 0, 8, 0).unwrap();
        assert_eq!(word, EMPTY);
    }

    #[test]
    fn sign_extension_round_trips_negative_values() {
        let raw = (-42i32 as u32) as u64 & mask_for(32);
        let v = sign_extend(raw, 32) as i32;
        assert_eq!(v, -42);
    }

    #[test]
    fn list_size_grows_and_rejects_shrink() {
        let mut mem = test_arena();
        let mut word = EMPTY;
        word = list::set_size(&mut mem, word, 10, 64).unwrap();
        assert_eq!(list::size(word), 10);
        assert!(list::set_size(&mut mem, word, 3, 64).is_err());
    }

    proptest::proptest! {
        #[test]
        fn set_then_get_round_trips_for_any_masked_value(
            values in proptest::collection::vec(0u64..=0xFFFF_FFFF, 1..30),
        ) {
            let mut mem = test_arena();
            let mut word = EMPTY;
            for (i, &v) in values.iter().enumerate() {
                word = set(&mut mem, word, i as u64, v, 32, 0).unwrap();
            }
            for (i, &v) in values.iter().enumerate() {
                proptest::prop_assert_eq!(get(&mem, word, i as u64), v);
            }
        }
    }
}
