//! Hazard tracking and batched pipeline barriers.
//!
//! The [`BarrierTracker`] answers "does this range have a pending read
//! or write" for buffer ranges and image subresource ranges. Ranges live
//! in packed red-black trees, two implicit hash tables of 32 roots each
//! (one half per access type). Tracked ranges within one tree are kept
//! disjoint: inserting an overlapping range merges the nodes involved.
//!
//! The [`BarrierBatch`] accumulates the barriers derived from detected
//! hazards and records them with as few dependency commands as possible.

use ash::vk;

use crate::{device::DeviceShared, Access};

/// Hint describing the operation behind a tracked access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AccessOp {
    #[default]
    None = 0,
    /// The range is written without reading previous contents.
    Discard,
}

/// A tracked resource range.
///
/// `resource` is a 48-bit identifier derived from the backing
/// allocation. For buffers the range is in bytes; for images it encodes
/// the first and last subresource index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AddressRange {
    pub resource: u64,
    pub access_op: AccessOp,
    pub range_start: u64,
    /// Inclusive range end.
    pub range_end: u64,
}

impl AddressRange {
    pub fn contains(&self, other: &AddressRange) -> bool {
        self.resource == other.resource
            && self.range_start <= other.range_start
            && self.range_end >= other.range_end
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.resource == other.resource
            && self.range_end >= other.range_start
            && self.range_start <= other.range_end
    }

    fn lt(&self, other: &AddressRange) -> bool {
        (self.resource, self.range_start) < (other.resource, other.range_start)
    }
}

const NODE_INDEX_MASK: u64 = (1 << 21) - 1;

/// Packed tree node: parent/left/right indices and the color share one
/// 64-bit header, assuming no more than 2^21 nodes.
///
/// - bit 0: set if the node is red
/// - bits 1..22: left child index
/// - bits 22..43: right child index
/// - bits 43..64: parent index
#[derive(Clone, Copy, Debug, Default)]
struct TreeNode {
    header: u64,
    range: AddressRange,
}

impl TreeNode {
    fn is_red(&self) -> bool {
        self.header & 1 != 0
    }

    fn set_red(&mut self, red: bool) {
        self.header = (self.header & !1) | red as u64;
    }

    fn parent(&self) -> u32 {
        ((self.header >> 43) & NODE_INDEX_MASK) as u32
    }

    fn set_parent(&mut self, node: u32) {
        self.header &= !(NODE_INDEX_MASK << 43);
        self.header |= (node as u64) << 43;
    }

    fn child(&self, index: u32) -> u32 {
        let shift = if index != 0 { 22 } else { 1 };
        ((self.header >> shift) & NODE_INDEX_MASK) as u32
    }

    fn set_child(&mut self, index: u32, node: u32) {
        let shift = if index != 0 { 22 } else { 1 };
        self.header &= !(NODE_INDEX_MASK << shift);
        self.header |= (node as u64) << shift;
    }
}

const HASH_TABLE_SIZE: u32 = 32;

/// Nodes 1..=64 are bucket sentinels; their left-child field holds the
/// root of the bucket's tree, so the tree algorithms never special-case
/// the root. Node 0 is the null node.
const RESERVED_NODES: u32 = 2 * HASH_TABLE_SIZE + 1;

/// Two-part hazard tracker for read-pending and write-pending ranges.
pub struct BarrierTracker {
    root_mask_valid: u64,
    root_mask_subtree: u64,

    nodes: Vec<TreeNode>,
    free: Vec<u32>,
}

impl BarrierTracker {
    pub fn new() -> Self {
        Self {
            root_mask_valid: 0,
            root_mask_subtree: 0,
            nodes: vec![TreeNode::default(); RESERVED_NODES as usize],
            free: Vec::new(),
        }
    }

    fn compute_root_index(range: &AddressRange, access: Access) -> u32 {
        let mut hash = range.resource.wrapping_mul(93887);
        hash ^= hash >> 16;

        // The upper half of the implicit hash table holds written
        // ranges; add 1 because node 0 is the null node.
        1 + (hash % HASH_TABLE_SIZE as u64) as u32
            + if access == Access::Write {
                HASH_TABLE_SIZE
            } else {
                0
            }
    }

    /// Checks whether any inserted range of the given access type
    /// overlaps `range`.
    pub fn find_range(&self, range: &AddressRange, access: Access) -> bool {
        let root_index = Self::compute_root_index(range, access);
        let root_bit = 1u64 << (root_index - 1);

        if self.root_mask_valid & root_bit == 0 {
            return false;
        }

        // Buckets holding a single range are answered without walking.
        if self.root_mask_subtree & root_bit == 0 {
            let root = self.nodes[root_index as usize].child(0);
            return root != 0 && self.nodes[root as usize].range.overlaps(range);
        }

        self.find_node(range, root_index) != 0
    }

    /// Inserts a range for the given access type, merging any existing
    /// overlapping ranges into one node.
    pub fn insert_range(&mut self, range: &AddressRange, access: Access) {
        let root_index = Self::compute_root_index(range, access);
        let root_bit = 1u64 << (root_index - 1);

        if self.root_mask_valid & root_bit == 0 {
            // First range in this bucket since the last clear; any node
            // storage left over from before was discarded by clear().
            let node = self.allocate_node();
            self.nodes[node as usize] = TreeNode {
                header: 0,
                range: *range,
            };
            self.nodes[node as usize].set_parent(root_index);
            self.nodes[root_index as usize].set_child(0, node);

            self.root_mask_valid |= root_bit;
            return;
        }

        // Absorb all overlapping nodes into the incoming range, then
        // insert the union, keeping tracked ranges disjoint.
        let mut merged = *range;

        loop {
            let node = self.find_node(&merged, root_index);

            if node == 0 {
                break;
            }

            let found = self.nodes[node as usize].range;

            if found.contains(&merged) {
                return;
            }

            merged.range_start = merged.range_start.min(found.range_start);
            merged.range_end = merged.range_end.max(found.range_end);
            merged.access_op = AccessOp::None;

            self.remove_node(node, root_index);
        }

        self.insert_node(merged, root_index);
        self.root_mask_valid |= root_bit;

        if self.tree_size_above_one(root_index) {
            self.root_mask_subtree |= root_bit;
        }
    }

    /// Invalidates all entries in constant time by clearing the root
    /// masks; node storage is kept for reuse.
    pub fn clear(&mut self) {
        self.root_mask_valid = 0;
        self.root_mask_subtree = 0;

        self.nodes.truncate(RESERVED_NODES as usize);
        self.free.clear();

        for sentinel in self.nodes.iter_mut() {
            *sentinel = TreeNode::default();
        }
    }

    pub fn empty(&self) -> bool {
        self.root_mask_valid == 0
    }

    fn tree_size_above_one(&self, root_index: u32) -> bool {
        let root = self.nodes[root_index as usize].child(0);
        root != 0
            && (self.nodes[root as usize].child(0) != 0 || self.nodes[root as usize].child(1) != 0)
    }

    fn allocate_node(&mut self) -> u32 {
        if let Some(node) = self.free.pop() {
            return node;
        }

        let node = self.nodes.len() as u32;
        assert!(
            (node as u64) <= NODE_INDEX_MASK,
            "barrier tracker node count exceeds packed header limit"
        );
        self.nodes.push(TreeNode::default());
        node
    }

    fn free_node(&mut self, node: u32) {
        self.free.push(node);
    }

    /// Finds a node overlapping `range`, or 0. Relies on tracked ranges
    /// being pairwise disjoint within a tree.
    fn find_node(&self, range: &AddressRange, root_index: u32) -> u32 {
        let mut node = self.nodes[root_index as usize].child(0);

        while node != 0 {
            let node_range = &self.nodes[node as usize].range;

            if node_range.overlaps(range) {
                return node;
            }

            node = self.nodes[node as usize].child(node_range.lt(range) as u32);
        }

        0
    }

    fn insert_node(&mut self, range: AddressRange, root_index: u32) {
        let node = self.allocate_node();
        self.nodes[node as usize] = TreeNode {
            header: 0,
            range,
        };

        let mut parent = root_index;
        let mut side = 0;
        let mut current = self.nodes[root_index as usize].child(0);

        while current != 0 {
            parent = current;
            side = self.nodes[current as usize].range.lt(&range) as u32;
            current = self.nodes[current as usize].child(side);
        }

        if parent == root_index {
            side = 0;
        }

        self.nodes[parent as usize].set_child(side, node);
        self.nodes[node as usize].set_parent(parent);
        self.nodes[node as usize].set_red(parent != root_index);

        if parent != root_index {
            self.rebalance_post_insert(node, root_index);
        }
    }

    fn is_sentinel(node: u32) -> bool {
        node < RESERVED_NODES
    }

    fn rebalance_post_insert(&mut self, mut node: u32, root_index: u32) {
        loop {
            let parent = self.nodes[node as usize].parent();

            if Self::is_sentinel(parent) || !self.nodes[parent as usize].is_red() {
                break;
            }

            let grandparent = self.nodes[parent as usize].parent();
            debug_assert!(!Self::is_sentinel(grandparent));

            let parent_side = (self.nodes[grandparent as usize].child(1) == parent) as u32;
            let uncle = self.nodes[grandparent as usize].child(1 - parent_side);

            if uncle != 0 && self.nodes[uncle as usize].is_red() {
                self.nodes[parent as usize].set_red(false);
                self.nodes[uncle as usize].set_red(false);
                self.nodes[grandparent as usize].set_red(true);
                node = grandparent;
                continue;
            }

            if self.nodes[parent as usize].child(1 - parent_side) == node {
                // Inner grandchild: rotate it to the outside first.
                self.rotate(parent, parent_side);
                node = parent;
            }

            let parent = self.nodes[node as usize].parent();
            let grandparent = self.nodes[parent as usize].parent();

            self.nodes[parent as usize].set_red(false);
            self.nodes[grandparent as usize].set_red(true);
            self.rotate(grandparent, 1 - parent_side);
            break;
        }

        // The bucket root is always black.
        let root = self.nodes[root_index as usize].child(0);
        self.nodes[root as usize].set_red(false);
    }

    /// Rotates `node` down towards `side`, lifting its opposite child.
    fn rotate(&mut self, node: u32, side: u32) {
        let pivot = self.nodes[node as usize].child(1 - side);
        debug_assert_ne!(pivot, 0);

        let inner = self.nodes[pivot as usize].child(side);
        let parent = self.nodes[node as usize].parent();

        self.nodes[node as usize].set_child(1 - side, inner);

        if inner != 0 {
            self.nodes[inner as usize].set_parent(node);
        }

        self.replace_child(parent, node, pivot);
        self.nodes[pivot as usize].set_parent(parent);
        self.nodes[pivot as usize].set_child(side, node);
        self.nodes[node as usize].set_parent(pivot);
    }

    fn replace_child(&mut self, parent: u32, old: u32, new: u32) {
        if Self::is_sentinel(parent) {
            self.nodes[parent as usize].set_child(0, new);
        } else if self.nodes[parent as usize].child(0) == old {
            self.nodes[parent as usize].set_child(0, new);
        } else {
            self.nodes[parent as usize].set_child(1, new);
        }
    }

    fn remove_node(&mut self, node: u32, root_index: u32) {
        // Reduce the two-child case to at most one child by moving the
        // successor's range into the node.
        let target = if self.nodes[node as usize].child(0) != 0
            && self.nodes[node as usize].child(1) != 0
        {
            let mut successor = self.nodes[node as usize].child(1);

            while self.nodes[successor as usize].child(0) != 0 {
                successor = self.nodes[successor as usize].child(0);
            }

            self.nodes[node as usize].range = self.nodes[successor as usize].range;
            successor
        } else {
            node
        };

        let child = match self.nodes[target as usize].child(0) {
            0 => self.nodes[target as usize].child(1),
            c => c,
        };

        let parent = self.nodes[target as usize].parent();
        let removed_red = self.nodes[target as usize].is_red();

        self.replace_child(parent, target, child);

        if child != 0 {
            self.nodes[child as usize].set_parent(parent);
        }

        if !removed_red {
            if child != 0 && self.nodes[child as usize].is_red() {
                self.nodes[child as usize].set_red(false);
            } else {
                self.fix_double_black(child, parent, root_index);
            }
        }

        self.free_node(target);

        if self.nodes[root_index as usize].child(0) == 0 {
            let root_bit = 1u64 << (root_index - 1);
            self.root_mask_valid &= !root_bit;
            self.root_mask_subtree &= !root_bit;
        }
    }

    /// Standard red-black deletion fix-up for a short subtree rooted at
    /// `parent` with the deficient child `node` (may be null).
    fn fix_double_black(&mut self, mut node: u32, mut parent: u32, root_index: u32) {
        while !Self::is_sentinel(parent)
            && (node == 0 || !self.nodes[node as usize].is_red())
        {
            // Identify which side of the parent the deficient subtree
            // is on. A null node sits in whichever child slot is empty.
            let side = if node == 0 {
                (self.nodes[parent as usize].child(0) != 0) as u32
            } else {
                (self.nodes[parent as usize].child(1) == node) as u32
            };

            let mut sibling = self.nodes[parent as usize].child(1 - side);

            if sibling == 0 {
                node = parent;
                parent = self.nodes[parent as usize].parent();
                continue;
            }

            if self.nodes[sibling as usize].is_red() {
                self.nodes[sibling as usize].set_red(false);
                self.nodes[parent as usize].set_red(true);
                self.rotate(parent, side);
                sibling = self.nodes[parent as usize].child(1 - side);

                if sibling == 0 {
                    node = parent;
                    parent = self.nodes[parent as usize].parent();
                    continue;
                }
            }

            let near = self.nodes[sibling as usize].child(side);
            let far = self.nodes[sibling as usize].child(1 - side);

            let near_red = near != 0 && self.nodes[near as usize].is_red();
            let far_red = far != 0 && self.nodes[far as usize].is_red();

            if !near_red && !far_red {
                self.nodes[sibling as usize].set_red(true);

                if self.nodes[parent as usize].is_red() {
                    self.nodes[parent as usize].set_red(false);
                    break;
                }

                node = parent;
                parent = self.nodes[parent as usize].parent();
                continue;
            }

            if !far_red {
                // Near nephew is red: rotate it up to become the sibling.
                self.nodes[near as usize].set_red(false);
                self.nodes[sibling as usize].set_red(true);
                self.rotate(sibling, 1 - side);
                sibling = self.nodes[parent as usize].child(1 - side);
            }

            let far = self.nodes[sibling as usize].child(1 - side);
            let parent_red = self.nodes[parent as usize].is_red();

            self.nodes[sibling as usize].set_red(parent_red);
            self.nodes[parent as usize].set_red(false);

            if far != 0 {
                self.nodes[far as usize].set_red(false);
            }

            self.rotate(parent, side);
            break;
        }

        if node != 0 {
            self.nodes[node as usize].set_red(false);
        }

        let root = self.nodes[root_index as usize].child(0);

        if root != 0 {
            self.nodes[root as usize].set_red(false);
        }
    }
}

/// Maximum number of barriers per dependency command; some drivers
/// crash on very large barrier arrays.
const MAX_BARRIERS_PER_CALL: usize = 512;

const HOST_ACCESS_MASK: vk::AccessFlags2 =
    vk::AccessFlags2::from_raw(vk::AccessFlags2::HOST_READ.as_raw() | vk::AccessFlags2::HOST_WRITE.as_raw());

/// Accumulates memory, buffer and image barriers and records them into
/// a command buffer in one step.
pub struct BarrierBatch {
    memory_barrier: vk::MemoryBarrier2,

    host_src_stages: vk::PipelineStageFlags2,
    host_dst_access: vk::AccessFlags2,

    buffer_barriers: Vec<vk::BufferMemoryBarrier2>,
    image_barriers: Vec<vk::ImageMemoryBarrier2>,
}

unsafe impl Send for BarrierBatch {}
unsafe impl Sync for BarrierBatch {}

impl BarrierBatch {
    pub fn new() -> Self {
        Self {
            memory_barrier: vk::MemoryBarrier2::default(),
            host_src_stages: vk::PipelineStageFlags2::empty(),
            host_dst_access: vk::AccessFlags2::empty(),
            buffer_barriers: Vec::new(),
            image_barriers: Vec::new(),
        }
    }

    /// Adds a memory barrier. Host read access is deferred and only
    /// flushed by [`Self::finalize`] at the end of a command list.
    pub fn add_memory_barrier(&mut self, barrier: vk::MemoryBarrier2) {
        self.memory_barrier.src_stage_mask |= barrier.src_stage_mask;
        self.memory_barrier.src_access_mask |= barrier.src_access_mask;
        self.memory_barrier.dst_stage_mask |= barrier.dst_stage_mask;
        self.memory_barrier.dst_access_mask |= barrier.dst_access_mask & !HOST_ACCESS_MASK;

        if barrier.dst_access_mask.intersects(HOST_ACCESS_MASK) {
            self.host_src_stages |= barrier.src_stage_mask;
            self.host_dst_access |= barrier.dst_access_mask & HOST_ACCESS_MASK;
        }
    }

    /// Adds a buffer barrier, used for queue family ownership transfers.
    pub fn add_buffer_barrier(&mut self, barrier: vk::BufferMemoryBarrier2) {
        self.buffer_barriers.push(barrier);
    }

    /// Adds an image barrier. Turns into a plain memory barrier when no
    /// layout transition or ownership transfer happens.
    pub fn add_image_barrier(&mut self, barrier: vk::ImageMemoryBarrier2) {
        if barrier.old_layout == barrier.new_layout
            && barrier.src_queue_family_index == barrier.dst_queue_family_index
        {
            self.add_memory_barrier(
                vk::MemoryBarrier2::builder()
                    .src_stage_mask(barrier.src_stage_mask)
                    .src_access_mask(barrier.src_access_mask)
                    .dst_stage_mask(barrier.dst_stage_mask)
                    .dst_access_mask(barrier.dst_access_mask)
                    .build(),
            );
        } else {
            self.image_barriers.push(barrier);
        }
    }

    pub fn has_layout_transitions(&self) -> bool {
        !self.image_barriers.is_empty()
    }

    pub fn has_pending_stages(&self, stages: vk::PipelineStageFlags2) -> bool {
        if self.memory_barrier.src_stage_mask.intersects(stages) {
            return true;
        }

        self.image_barriers
            .iter()
            .any(|b| b.src_stage_mask.intersects(stages))
    }

    fn total_barrier_count(&self) -> usize {
        let stages = self.memory_barrier.src_stage_mask | self.memory_barrier.dst_stage_mask;
        let memory = if stages.is_empty() { 0 } else { 1 };
        memory + self.buffer_barriers.len() + self.image_barriers.len()
    }

    /// Records all batched barriers and resets the batch.
    pub fn flush(&mut self, device: &DeviceShared, cmd: vk::CommandBuffer) {
        let total = self.total_barrier_count();

        if total == 0 {
            return;
        }

        let has_memory_barrier =
            !(self.memory_barrier.src_stage_mask | self.memory_barrier.dst_stage_mask).is_empty();

        unsafe {
            if total <= MAX_BARRIERS_PER_CALL {
                let memory_barriers = [self.memory_barrier];

                let mut info = vk::DependencyInfo::builder()
                    .buffer_memory_barriers(&self.buffer_barriers)
                    .image_memory_barriers(&self.image_barriers);

                if has_memory_barrier {
                    info = info.memory_barriers(&memory_barriers);
                }

                device.raw.cmd_pipeline_barrier2(cmd, &info);
            } else {
                // Split into pages; drivers have been seen crashing on
                // oversized dependency structures.
                if has_memory_barrier {
                    let memory_barriers = [self.memory_barrier];
                    let info = vk::DependencyInfo::builder().memory_barriers(&memory_barriers);
                    device.raw.cmd_pipeline_barrier2(cmd, &info);
                }

                for chunk in self.buffer_barriers.chunks(MAX_BARRIERS_PER_CALL) {
                    let info = vk::DependencyInfo::builder().buffer_memory_barriers(chunk);
                    device.raw.cmd_pipeline_barrier2(cmd, &info);
                }

                for chunk in self.image_barriers.chunks(MAX_BARRIERS_PER_CALL) {
                    let info = vk::DependencyInfo::builder().image_memory_barriers(chunk);
                    device.raw.cmd_pipeline_barrier2(cmd, &info);
                }
            }
        }

        self.reset();
    }

    /// Flushes batched barriers, appending the synthetic host barrier
    /// if any recorded access targets host memory.
    pub fn finalize(&mut self, device: &DeviceShared, cmd: vk::CommandBuffer) {
        if !self.host_src_stages.is_empty() {
            self.memory_barrier.src_stage_mask |= self.host_src_stages;
            self.memory_barrier.src_access_mask |= vk::AccessFlags2::MEMORY_WRITE;
            self.memory_barrier.dst_stage_mask |= vk::PipelineStageFlags2::HOST;
            self.memory_barrier.dst_access_mask |= self.host_dst_access;

            self.host_src_stages = vk::PipelineStageFlags2::empty();
            self.host_dst_access = vk::AccessFlags2::empty();
        }

        self.flush(device, cmd);
    }

    fn reset(&mut self) {
        self.memory_barrier = vk::MemoryBarrier2::default();
        self.buffer_barriers.clear();
        self.image_barriers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(resource: u64, start: u64, end: u64) -> AddressRange {
        AddressRange {
            resource,
            access_op: AccessOp::None,
            range_start: start,
            range_end: end,
        }
    }

    #[test]
    fn write_does_not_answer_read_queries() {
        let mut tracker = BarrierTracker::new();
        tracker.insert_range(&range(0x1, 0, 99), Access::Write);

        assert!(!tracker.find_range(&range(0x1, 50, 60), Access::Read));
        assert!(tracker.find_range(&range(0x1, 50, 60), Access::Write));

        tracker.insert_range(&range(0x1, 200, 299), Access::Write);

        // Inclusive range 99..=200 touches both tracked ranges.
        assert!(tracker.find_range(&range(0x1, 99, 200), Access::Write));
        assert!(!tracker.find_range(&range(0x1, 100, 199), Access::Write));
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut tracker = BarrierTracker::new();

        for i in 0..100u64 {
            tracker.insert_range(&range(i, 0, 4095), Access::Read);
            tracker.insert_range(&range(i, 0, 4095), Access::Write);
        }

        assert!(!tracker.empty());
        tracker.clear();
        assert!(tracker.empty());

        for i in 0..100u64 {
            assert!(!tracker.find_range(&range(i, 0, 4095), Access::Read));
            assert!(!tracker.find_range(&range(i, 0, 4095), Access::Write));
        }
    }

    #[test]
    fn non_overlapping_inserts_are_found() {
        let mut tracker = BarrierTracker::new();

        // Many ranges per resource to force deep trees, plus many
        // resources to exercise hash collisions.
        for resource in 0..16u64 {
            for i in 0..64u64 {
                tracker.insert_range(&range(resource, i * 100, i * 100 + 50), Access::Read);
            }
        }

        for resource in 0..16u64 {
            for i in 0..64u64 {
                assert!(
                    tracker.find_range(&range(resource, i * 100 + 10, i * 100 + 20), Access::Read),
                    "missing range {i} of resource {resource}"
                );
                assert!(
                    !tracker.find_range(&range(resource, i * 100 + 51, i * 100 + 99), Access::Read),
                    "phantom range {i} of resource {resource}"
                );
            }
        }
    }

    #[test]
    fn overlapping_inserts_merge() {
        let mut tracker = BarrierTracker::new();

        tracker.insert_range(&range(7, 0, 99), Access::Write);
        tracker.insert_range(&range(7, 200, 299), Access::Write);
        tracker.insert_range(&range(7, 50, 250), Access::Write);

        assert!(tracker.find_range(&range(7, 0, 0), Access::Write));
        assert!(tracker.find_range(&range(7, 150, 150), Access::Write));
        assert!(tracker.find_range(&range(7, 299, 299), Access::Write));
        assert!(!tracker.find_range(&range(7, 300, 400), Access::Write));
    }

    #[test]
    fn random_insert_lookup_consistency() {
        // Deterministic xorshift so failures reproduce.
        let mut state = 0x12345678u64;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut tracker = BarrierTracker::new();
        let mut inserted: Vec<AddressRange> = Vec::new();

        for _ in 0..500 {
            let resource = rand() % 4;
            let start = rand() % 10_000;
            let len = rand() % 64;
            let r = range(resource, start, start + len);

            tracker.insert_range(&r, Access::Read);
            inserted.push(r);
        }

        for r in &inserted {
            assert!(tracker.find_range(r, Access::Read));
        }

        // Points not covered by any inserted range must not be found.
        for _ in 0..500 {
            let resource = rand() % 4;
            let point = rand() % 20_000;
            let r = range(resource, point, point);

            let expected = inserted.iter().any(|i| i.overlaps(&r));
            assert_eq!(tracker.find_range(&r, Access::Read), expected);
        }
    }

    #[test]
    fn image_barrier_without_transition_becomes_memory_barrier() {
        let mut batch = BarrierBatch::new();

        batch.add_image_barrier(
            vk::ImageMemoryBarrier2::builder()
                .src_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
                .old_layout(vk::ImageLayout::GENERAL)
                .new_layout(vk::ImageLayout::GENERAL)
                .build(),
        );

        assert!(!batch.has_layout_transitions());
        assert!(batch.has_pending_stages(vk::PipelineStageFlags2::FRAGMENT_SHADER));
        assert_eq!(batch.total_barrier_count(), 1);

        batch.add_image_barrier(
            vk::ImageMemoryBarrier2::builder()
                .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build(),
        );

        assert!(batch.has_layout_transitions());
        assert_eq!(batch.total_barrier_count(), 2);
    }

    #[test]
    fn host_access_is_deferred() {
        let mut batch = BarrierBatch::new();

        batch.add_memory_barrier(
            vk::MemoryBarrier2::builder()
                .src_stage_mask(vk::PipelineStageFlags2::COPY)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::HOST)
                .dst_access_mask(vk::AccessFlags2::HOST_READ)
                .build(),
        );

        // The host access must not appear in the regular barrier.
        assert!(!batch
            .memory_barrier
            .dst_access_mask
            .intersects(vk::AccessFlags2::HOST_READ));
        assert_eq!(batch.host_dst_access, vk::AccessFlags2::HOST_READ);
        assert_eq!(batch.host_src_stages, vk::PipelineStageFlags2::COPY);
    }
}
