//! Shadow page tables for one bound guest region.
//!
//! A [`ShadowSpace`] mirrors the guest's mapping over a 512 GiB region with
//! three fixed levels of 512-entry tables (512 GiB → 1 GiB → 2 MiB → 4 KiB).
//! Nodes live in an arena and are referenced by index, so walks, frees and
//! deactivation run iteratively over the three levels.
//!
//! Invalidation is lazy: instead of freeing a subtree, its entries are flipped
//! to `Deactivated`, which keeps the node association but makes the entry
//! absent for lookups. The next allocating walk reactivates only the entries
//! on its own path and pushes the `Deactivated` marker one level down, so
//! every leaf is re-validated by its own subsequent fault rather than trusted
//! in bulk.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Entries per table node (9-bit index per level).
pub const TABLE_ENTRIES: usize = 512;

/// Bytes covered by one top-level entry.
pub const LEVEL1_SPAN: u64 = 1 << 30;

/// Bytes covered by the whole shadow space.
pub const SPACE_SPAN: u64 = 1 << 39;

pub type NodeId = u32;

/// Interior (table-pointing) entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEntry {
    Empty,
    Present(NodeId),
    Deactivated(NodeId),
}

/// Installed leaf mapping: a pool page index plus writability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafMapping {
    pub page: u32,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafEntry {
    Empty,
    Present(LeafMapping),
    Deactivated(LeafMapping),
}

/// Handle to one leaf entry, valid until the containing subtree is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSlot {
    node: NodeId,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpaceError {
    #[error("no shadow mapping built for this offset")]
    NotMapped,
    #[error("shadow table arena exhausted")]
    OutOfMemory,
}

enum Node {
    Table(Box<[TableEntry; TABLE_ENTRIES]>),
    Leaves(Box<[LeafEntry; TABLE_ENTRIES]>),
}

/// Three-level shadow table over a 512 GiB region.
pub struct ShadowSpace {
    root: Box<[TableEntry; TABLE_ENTRIES]>,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    node_limit: usize,
}

#[inline]
fn indices(offset: u64) -> (usize, usize, usize) {
    debug_assert!(offset < SPACE_SPAN);
    (
        ((offset >> 30) & 0x1FF) as usize,
        ((offset >> 21) & 0x1FF) as usize,
        ((offset >> 12) & 0x1FF) as usize,
    )
}

impl ShadowSpace {
    pub fn new() -> Self {
        Self::with_node_limit(usize::MAX)
    }

    /// Cap the arena at `limit` nodes; walks that would allocate past the cap
    /// fail with [`SpaceError::OutOfMemory`].
    pub fn with_node_limit(limit: usize) -> Self {
        Self {
            root: Box::new([TableEntry::Empty; TABLE_ENTRIES]),
            nodes: Vec::new(),
            free: Vec::new(),
            node_limit: limit,
        }
    }

    /// Number of live arena nodes (excludes the root table).
    pub fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Walk to the leaf entry for `offset` without building or reactivating
    /// anything. A missing or deactivated interior entry fails the walk.
    pub fn lookup_leaf(&self, offset: u64) -> Result<LeafSlot, SpaceError> {
        let (i1, i2, i3) = indices(offset);

        let TableEntry::Present(mid) = self.root[i1] else {
            return Err(SpaceError::NotMapped);
        };
        let TableEntry::Present(leaves) = self.table(mid)[i2] else {
            return Err(SpaceError::NotMapped);
        };
        Ok(LeafSlot {
            node: leaves,
            index: i3,
        })
    }

    /// Walk to the leaf entry for `offset`, allocating missing interior nodes
    /// as zeroed tables and reactivating deactivated entries on the path.
    pub fn ensure_leaf(&mut self, offset: u64) -> Result<LeafSlot, SpaceError> {
        let (i1, i2, i3) = indices(offset);

        let mid = match self.root[i1] {
            TableEntry::Present(id) => id,
            TableEntry::Deactivated(id) => {
                self.root[i1] = TableEntry::Present(id);
                self.deactivate_children(id);
                id
            }
            TableEntry::Empty => {
                let id = self.alloc_table()?;
                self.root[i1] = TableEntry::Present(id);
                id
            }
        };

        let leaves = match self.table(mid)[i2] {
            TableEntry::Present(id) => id,
            TableEntry::Deactivated(id) => {
                self.table_mut(mid)[i2] = TableEntry::Present(id);
                self.deactivate_children(id);
                id
            }
            TableEntry::Empty => {
                let id = self.alloc_leaves()?;
                self.table_mut(mid)[i2] = TableEntry::Present(id);
                id
            }
        };

        Ok(LeafSlot {
            node: leaves,
            index: i3,
        })
    }

    pub fn leaf(&self, slot: LeafSlot) -> LeafEntry {
        self.leaves(slot.node)[slot.index]
    }

    pub fn set_leaf(&mut self, slot: LeafSlot, entry: LeafEntry) {
        self.leaves_mut(slot.node)[slot.index] = entry;
    }

    /// Lazily invalidate `[start, end)`: every present top-level entry in the
    /// range is marked `Deactivated` and its direct children are flipped to
    /// `Deactivated` as well. Nothing is freed; deeper levels are pushed down
    /// lazily by the next reactivating walk.
    ///
    /// `start` and `end` are [`LEVEL1_SPAN`]-aligned by contract.
    pub fn deactivate_range(&mut self, start: u64, end: u64) {
        debug_assert_eq!(start % LEVEL1_SPAN, 0);
        debug_assert_eq!(end % LEVEL1_SPAN, 0);

        for i1 in (start / LEVEL1_SPAN) as usize..(end / LEVEL1_SPAN) as usize {
            if let TableEntry::Present(id) = self.root[i1] {
                self.deactivate_children(id);
                self.root[i1] = TableEntry::Deactivated(id);
            }
        }
    }

    /// Reclaim every node under `[start, end)` and clear the covering
    /// top-level entries to `Empty`.
    pub fn free_range(&mut self, start: u64, end: u64) {
        debug_assert_eq!(start % LEVEL1_SPAN, 0);
        debug_assert_eq!(end % LEVEL1_SPAN, 0);

        for i1 in (start / LEVEL1_SPAN) as usize..(end / LEVEL1_SPAN) as usize {
            let (TableEntry::Present(mid) | TableEntry::Deactivated(mid)) = self.root[i1] else {
                continue;
            };
            for i2 in 0..TABLE_ENTRIES {
                if let TableEntry::Present(leaves) | TableEntry::Deactivated(leaves) =
                    self.table(mid)[i2]
                {
                    self.free_node(leaves);
                }
            }
            self.free_node(mid);
            self.root[i1] = TableEntry::Empty;
        }
    }

    fn deactivate_children(&mut self, id: NodeId) {
        match self.node_mut(id) {
            Node::Table(entries) => {
                for entry in entries.iter_mut() {
                    if let TableEntry::Present(child) = *entry {
                        *entry = TableEntry::Deactivated(child);
                    }
                }
            }
            Node::Leaves(entries) => {
                for entry in entries.iter_mut() {
                    if let LeafEntry::Present(mapping) = *entry {
                        *entry = LeafEntry::Deactivated(mapping);
                    }
                }
            }
        }
    }

    fn alloc_table(&mut self) -> Result<NodeId, SpaceError> {
        self.alloc_node(Node::Table(Box::new([TableEntry::Empty; TABLE_ENTRIES])))
    }

    fn alloc_leaves(&mut self) -> Result<NodeId, SpaceError> {
        self.alloc_node(Node::Leaves(Box::new([LeafEntry::Empty; TABLE_ENTRIES])))
    }

    fn alloc_node(&mut self, node: Node) -> Result<NodeId, SpaceError> {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = Some(node);
            return Ok(id);
        }
        if self.nodes.len() >= self.node_limit {
            return Err(SpaceError::OutOfMemory);
        }
        self.nodes
            .try_reserve(1)
            .map_err(|_| SpaceError::OutOfMemory)?;
        let id = self.nodes.len() as NodeId;
        self.nodes.push(Some(node));
        Ok(id)
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes[id as usize] = None;
        self.free.push(id);
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id as usize].as_ref().expect("live arena node")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id as usize].as_mut().expect("live arena node")
    }

    fn table(&self, id: NodeId) -> &[TableEntry; TABLE_ENTRIES] {
        match self.node(id) {
            Node::Table(entries) => entries,
            Node::Leaves(_) => unreachable!("interior node is a table"),
        }
    }

    fn table_mut(&mut self, id: NodeId) -> &mut [TableEntry; TABLE_ENTRIES] {
        match self.node_mut(id) {
            Node::Table(entries) => entries,
            Node::Leaves(_) => unreachable!("interior node is a table"),
        }
    }

    fn leaves(&self, id: NodeId) -> &[LeafEntry; TABLE_ENTRIES] {
        match self.node(id) {
            Node::Leaves(entries) => entries,
            Node::Table(_) => unreachable!("leaf node holds leaf entries"),
        }
    }

    fn leaves_mut(&mut self, id: NodeId) -> &mut [LeafEntry; TABLE_ENTRIES] {
        match self.node_mut(id) {
            Node::Leaves(entries) => entries,
            Node::Table(_) => unreachable!("leaf node holds leaf entries"),
        }
    }
}

impl Default for ShadowSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ShadowSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShadowSpace")
            .field("live_nodes", &self.live_nodes())
            .finish_non_exhaustive()
    }
}
