//! TreeTop: the paged, sparse multi-level index that maps a hash-derived
//! index to a leaf ref. Every level fans out 256 ways (one byte of the
//! index); descent always starts from the highest unconsumed byte, so
//! iteration in index order is just a left-to-right walk.

use crate::memory::Arena;
use crate::utils::errors::DbResult;

const FANOUT: usize = 256;
const INNER_NODE_SIZE: u64 = FANOUT as u64 * 8;

#[derive(Clone, Copy)]
#[repr(C)]
struct InnerNode {
    children: [u64; FANOUT],
}

impl InnerNode {
    const ZERO: InnerNode = InnerNode { children: [0u64; FANOUT] };
}

/// The tree's root descriptor. `levels` is how many 256-way inner-node
/// layers sit between the root and the leaves; `mask` and `count` are
/// load-factor bookkeeping the caller (cuckoo, direct map) is responsible
/// for maintaining.
#[derive(Clone, Copy, Debug)]
pub struct TreeTop {
    pub root: u64,
    pub levels: u32,
    pub mask: u64,
    pub count: u64,
}

impl TreeTop {
    /// Size the tree to address at least `capacity` leaves.
    #[must_use]
    pub fn init(capacity: u64) -> Self {
        let mask = capacity.max(1).next_power_of_two() - 1;
        let bits_needed = 64 - mask.leading_zeros();
        let levels = bits_needed.div_ceil(8).max(1);
        TreeTop { root: 0, levels, mask, count: 0 }
    }

    fn child_index(index: u64, level: u32, levels: u32) -> usize {
        let shift = 8 * (levels - 1 - level);
        ((index >> shift) & 0xFF) as usize
    }

    /// Translate `index` to a leaf ref. A null child at any level
    /// short-circuits to 0 without touching memory further down.
    #[must_use]
    pub fn lookup(&self, mem: &Arena, index: u64) -> u64 {
        let mut node_ref = self.root;
        for level in 0..self.levels {
            if node_ref == 0 {
                return 0;
            }
            let idx = Self::child_index(index, level, self.levels);
            let node: InnerNode = unsafe { mem.read(node_ref) };
            node_ref = node.children[idx];
        }
        node_ref
    }

    /// Walk from the root to the leaf slot for `index`, copying every
    /// read-only node encountered along the way into scratch, and splice
    /// `leaf_ref` into the final slot.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if cloning an inner node fails.
    pub fn cow_path(&mut self, mem: &mut Arena, index: u64, leaf_ref: u64) -> DbResult<()> {
        if self.levels == 0 {
            self.root = leaf_ref;
            return Ok(());
        }
        if !mem.is_writable(self.root) {
            self.root = Self::clone_or_new_node(mem, self.root)?;
        }
        let mut node_ref = self.root;
        for level in 0..self.levels {
            let idx = Self::child_index(index, level, self.levels);
            let mut node: InnerNode = unsafe { mem.read(node_ref) };
            if level + 1 == self.levels {
                node.children[idx] = leaf_ref;
                unsafe { mem.write(node_ref, node) };
                return Ok(());
            }
            let child_ref = node.children[idx];
            let new_child = if mem.is_writable(child_ref) && child_ref != 0 {
                child_ref
            } else {
                let cloned = Self::clone_or_new_node(mem, child_ref)?;
                node.children[idx] = cloned;
                unsafe { mem.write(node_ref, node) };
                cloned
            };
            node_ref = new_child;
        }
        Ok(())
    }

    fn clone_or_new_node(mem: &mut Arena, old_ref: u64) -> DbResult<u64> {
        let new_ref = mem.alloc(INNER_NODE_SIZE)?;
        let node = if old_ref == 0 { InnerNode::ZERO } else { unsafe { mem.read(old_ref) } };
        unsafe { mem.write(new_ref, node) };
        mem.free(old_ref, INNER_NODE_SIZE);
        Ok(new_ref)
    }

    /// Recursively release every writable node; frozen (file-region) nodes
    /// are left untouched since freeing them is already a no-op.
    pub fn free(&self, mem: &mut Arena, mut free_leaf: impl FnMut(&mut Arena, u64)) {
        Self::free_node(mem, self.root, self.levels, &mut free_leaf);
    }

    fn free_node(mem: &mut Arena, node_ref: u64, remaining_levels: u32, free_leaf: &mut impl FnMut(&mut Arena, u64)) {
        if node_ref == 0 || !mem.is_writable(node_ref) {
            return;
        }
        if remaining_levels == 0 {
            free_leaf(mem, node_ref);
            return;
        }
        let node: InnerNode = unsafe { mem.read(node_ref) };
        for &child in &node.children {
            Self::free_node(mem, child, remaining_levels - 1, free_leaf);
        }
        mem.free(node_ref, INNER_NODE_SIZE);
    }

    /// Visit every non-null leaf in index order, depth-first. Used by
    /// rehash (`grow_tree`) to drain an old tree leaf by leaf.
    pub fn for_each_leaf(&self, mem: &Arena, mut visit: impl FnMut(&Arena, u64)) {
        Self::visit_node(mem, self.root, self.levels, &mut visit);
    }

    fn visit_node(mem: &Arena, node_ref: u64, remaining_levels: u32, visit: &mut impl FnMut(&Arena, u64)) {
        if node_ref == 0 {
            return;
        }
        if remaining_levels == 0 {
            visit(mem, node_ref);
            return;
        }
        let node: InnerNode = unsafe { mem.read(node_ref) };
        for &child in &node.children {
            Self::visit_node(mem, child, remaining_levels - 1, visit);
        }
    }

    /// Copy every writable node into the file region, calling `committer`
    /// at each leaf so payload data can be committed alongside the index.
    ///
    /// # Errors
    /// Returns `DbError::OutOfMemory` if a file-region allocation fails.
    pub fn copied_to_file(&mut self, mem: &mut Arena, committer: &mut impl LeafCommitter) -> DbResult<()> {
        self.root = Self::copy_node_to_file(mem, self.root, self.levels, committer)?;
        Ok(())
    }

    fn copy_node_to_file(
        mem: &mut Arena,
        node_ref: u64,
        remaining_levels: u32,
        committer: &mut impl LeafCommitter,
    ) -> DbResult<u64> {
        if node_ref == 0 {
            return Ok(0);
        }
        if remaining_levels == 0 {
            return committer.commit_leaf(mem, node_ref);
        }
        if !mem.is_writable(node_ref) {
            return Ok(node_ref);
        }
        let mut node: InnerNode = unsafe { mem.read(node_ref) };
        for child in &mut node.children {
            *child = Self::copy_node_to_file(mem, *child, remaining_levels - 1, committer)?;
        }
        let new_ref = mem.alloc_in_file(INNER_NODE_SIZE)?;
        unsafe { mem.write(new_ref, node) };
        mem.free(node_ref, INNER_NODE_SIZE);
        Ok(new_ref)
    }
}

/// Callback invoked by `copied_to_file` at each leaf, letting the owner
/// (cuckoo index, direct map) commit its own leaf representation and any
/// payload it owns.
pub trait LeafCommitter {
    /// # Errors
    /// Returns `DbError::OutOfMemory` if committing the leaf's storage fails.
    fn commit_leaf(&mut self, mem: &mut Arena, leaf_ref: u64) -> DbResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> Arena {
        Arena::new(tempfile::tempfile().expect("tempfile"))
    }

    #[test]
    fn lookup_on_empty_tree_is_null() {
        let mem = test_arena();
        let tree = TreeTop::init(1000);
        assert_eq!(tree.lookup(&mem, 42), 0);
    }

    #[test]
    fn cow_path_then_lookup_round_trips() {
        let mut mem = test_arena();
        let mut tree = TreeTop::init(1000);
        tree.cow_path(&mut mem, 0x1234, 0xDEAD_BEEF_u64 << 3 | 8).unwrap();
        assert_eq!(tree.lookup(&mem, 0x1234), 0xDEAD_BEEF_u64 << 3 | 8);
        assert_eq!(tree.lookup(&mem, 0x1235), 0);
    }

    #[test]
    fn levels_scale_with_capacity() {
        assert_eq!(TreeTop::init(1).levels, 1);
        assert_eq!(TreeTop::init(256).levels, 1);
        assert_eq!(TreeTop::init(257).levels, 2);
        assert_eq!(TreeTop::init(65536).levels, 2);
    }
}
