//! The search layer: a multi-reader-safe skip list mapping anchor keys to
//! remote data-node pointers.
//!
//! Readers never take locks. Bottom-level links are published with release
//! stores and traversed with acquire loads, and a node is fully initialised
//! before it becomes reachable. Structural writers are serialised by the
//! data layer's winner election (one winner per data node links each new
//! anchor) plus the single calibration thread that patches upper levels, so
//! upper-level races lose nothing: a record is findable through level 0 the
//! moment its winner publishes it.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::concurrency::ConcurrencyContext;
use crate::data::NodeType;
use crate::memory::RemotePointer;

pub const MAX_LEVEL: usize = 16;

/// One search-layer node. The head sentinel carries an empty anchor.
pub struct SkipNode {
    anchor: Box<[u8]>,
    data_node: AtomicU64,
    node_type: AtomicU32,
    /// Winner-election slot of the data node this anchor names.
    pub ctx: AtomicPtr<ConcurrencyContext>,
    /// Bumped by the winner after every successful data-node rewrite.
    pub version: AtomicU64,
    backward: AtomicPtr<SkipNode>,
    forwards: Box<[AtomicPtr<SkipNode>]>,
}

impl SkipNode {
    fn alloc(level: usize, anchor: &[u8], r: RemotePointer, t: NodeType) -> *mut SkipNode {
        let forwards = (0..level)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(SkipNode {
            anchor: anchor.to_vec().into_boxed_slice(),
            data_node: AtomicU64::new(r.raw()),
            node_type: AtomicU32::new(t as u32),
            ctx: AtomicPtr::new(std::ptr::null_mut()),
            version: AtomicU64::new(0),
            backward: AtomicPtr::new(std::ptr::null_mut()),
            forwards,
        }))
    }

    pub fn anchor(&self) -> &[u8] {
        &self.anchor
    }

    pub fn is_head(&self) -> bool {
        self.anchor.is_empty()
    }

    pub fn level(&self) -> usize {
        self.forwards.len()
    }

    pub fn data_node(&self) -> RemotePointer {
        RemotePointer::from_raw(self.data_node.load(Ordering::Acquire))
    }

    pub fn set_data_node(&self, r: RemotePointer) {
        self.data_node.store(r.raw(), Ordering::Release);
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_wire(self.node_type.load(Ordering::Acquire))
    }

    pub fn set_node_type(&self, t: NodeType) {
        self.node_type.store(t as u32, Ordering::Release);
    }

    pub fn forward(&self, level: usize) -> Option<&SkipNode> {
        let p = self.forwards[level].load(Ordering::Acquire);
        // nodes are only reclaimed when the whole list drops, so a
        // published pointer stays valid for any live reader
        unsafe { p.as_ref() }
    }

    fn forward_ptr(&self, level: usize) -> *mut SkipNode {
        self.forwards[level].load(Ordering::Acquire)
    }

    pub fn backward(&self) -> Option<&SkipNode> {
        unsafe { self.backward.load(Ordering::Acquire).as_ref() }
    }

    /// Link `node` after `self` at the bottom level. Called by the winner
    /// that produced the new anchor, under its data-node election.
    pub fn link_after(&self, node: *mut SkipNode) {
        unsafe {
            let new = &*node;
            let succ = self.forward_ptr(0);
            new.forwards[0].store(succ, Ordering::Relaxed);
            new.backward
                .store(self as *const SkipNode as *mut SkipNode, Ordering::Relaxed);
            // publish: everything above must be visible before this store
            self.forwards[0].store(node, Ordering::Release);
            if let Some(succ) = succ.as_ref() {
                succ.backward.store(node, Ordering::Release);
            }
        }
    }
}

/// The per-compute-node ordered index.
pub struct SkipList {
    head: *mut SkipNode,
    level: AtomicUsize,
    graveyard: Mutex<Vec<*mut SkipNode>>,
}

// Nodes are reachable from multiple threads by design; all shared fields
// are atomics and node memory outlives every reader.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub fn new() -> SkipList {
        SkipList {
            head: SkipNode::alloc(MAX_LEVEL, b"", RemotePointer::NULL, NodeType::Head),
            level: AtomicUsize::new(1),
            graveyard: Mutex::new(Vec::new()),
        }
    }

    pub fn head(&self) -> &SkipNode {
        unsafe { &*self.head }
    }

    /// Geometric level draw with p = 0.25, capped at [`MAX_LEVEL`].
    pub fn random_level() -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.gen::<f64>() < 0.25 {
            level += 1;
        }
        level
    }

    /// Allocate an unlinked node for `anchor` at a random level. The
    /// caller links level 0 itself and queues the rest for calibration.
    pub fn make_new_node(
        anchor: &[u8],
        r: RemotePointer,
        t: NodeType,
    ) -> (*mut SkipNode, usize) {
        let level = Self::random_level();
        (SkipNode::alloc(level, anchor, r, t), level)
    }

    /// Classical full insertion; used on the quick-put flush where no
    /// concurrent structural writer exists yet.
    pub fn insert(&self, anchor: &[u8], r: RemotePointer, t: NodeType) {
        let mut update = [std::ptr::null_mut::<SkipNode>(); MAX_LEVEL];
        let mut walker = self.head();
        let current = self.level.load(Ordering::Acquire);

        for i in (0..current).rev() {
            while let Some(next) = walker.forward(i) {
                if next.anchor() < anchor {
                    walker = next;
                } else {
                    break;
                }
            }
            update[i] = walker as *const SkipNode as *mut SkipNode;
        }

        let (node, level) = Self::make_new_node(anchor, r, t);
        if level > current {
            for u in update.iter_mut().take(level).skip(current) {
                *u = self.head;
            }
            self.level.store(level, Ordering::Release);
        }

        unsafe {
            let new = &*node;
            new.backward.store(update[0], Ordering::Relaxed);
            for (i, u) in update.iter().enumerate().take(level) {
                let pred = &**u;
                new.forwards[i].store(pred.forward_ptr(i), Ordering::Relaxed);
                pred.forwards[i].store(node, Ordering::Release);
            }
            if let Some(succ) = new.forward(0) {
                succ.backward.store(node, Ordering::Release);
            }
        }
    }

    /// Patch a bottom-linked node into levels `1..level`. Runs on the
    /// dedicated calibration thread.
    pub fn calibrate(&self, node: *mut SkipNode, level: usize) {
        let anchor = unsafe { (*node).anchor() };
        let current = self.level.load(Ordering::Acquire);
        if level > current {
            self.level.store(level, Ordering::Release);
        }

        for i in 1..level {
            let mut pred = self.head();
            for j in (i..current.max(level)).rev() {
                while let Some(next) = pred.forward(j) {
                    if next.anchor() < anchor {
                        pred = next;
                    } else {
                        break;
                    }
                }
                if j == i {
                    break;
                }
            }
            unsafe {
                (*node).forwards[i].store(pred.forward_ptr(i), Ordering::Relaxed);
            }
            pred.forwards[i].store(node, Ordering::Release);
        }
    }

    /// Descend to the node responsible for `key`: the exact anchor match,
    /// otherwise the last node whose anchor is <= key, otherwise the head
    /// sentinel (nothing covers this range yet).
    pub fn fuzzy_search(&self, key: &[u8]) -> &SkipNode {
        let mut walker = self.head();
        for i in (0..self.level.load(Ordering::Acquire)).rev() {
            while let Some(next) = walker.forward(i) {
                if next.anchor() < key {
                    walker = next;
                } else {
                    break;
                }
            }
        }
        if let Some(next) = walker.forward(0) {
            if next.anchor() == key {
                return next;
            }
        }
        walker
    }

    fn search_node(&self, anchor: &[u8]) -> Option<&SkipNode> {
        let found = self.fuzzy_search(anchor);
        (found.anchor() == anchor).then_some(found)
    }

    /// Point-update of an anchor's mapping after a morph or split swapped
    /// the remote memory beneath it.
    pub fn update(&self, anchor: &[u8], r: RemotePointer, t: NodeType) -> bool {
        match self.search_node(anchor) {
            Some(node) => {
                node.set_data_node(r);
                node.set_node_type(t);
                true
            }
            None => false,
        }
    }

    /// Exact-match lookup of an anchor's mapping.
    pub fn search(&self, anchor: &[u8]) -> Option<(RemotePointer, NodeType)> {
        self.search_node(anchor)
            .map(|n| (n.data_node(), n.node_type()))
    }

    /// Unlink an anchor at every level. Admin/test path only; the node's
    /// memory is parked until the list drops so readers never dangle.
    pub fn remove(&self, anchor: &[u8]) -> bool {
        let mut update = [std::ptr::null_mut::<SkipNode>(); MAX_LEVEL];
        let mut walker = self.head();
        let current = self.level.load(Ordering::Acquire);

        for i in (0..current).rev() {
            while let Some(next) = walker.forward(i) {
                if next.anchor() < anchor {
                    walker = next;
                } else {
                    break;
                }
            }
            update[i] = walker as *const SkipNode as *mut SkipNode;
        }

        let Some(victim) = walker.forward(0) else {
            return false;
        };
        if victim.anchor() != anchor {
            return false;
        }
        let victim_ptr = victim as *const SkipNode as *mut SkipNode;

        unsafe {
            for (i, u) in update.iter().enumerate().take(current) {
                let pred = &**u;
                if pred.forward_ptr(i) == victim_ptr {
                    pred.forwards[i].store(victim.forward_ptr(i), Ordering::Release);
                }
            }
            if let Some(succ) = victim.forward(0) {
                succ.backward
                    .store(victim.backward.load(Ordering::Acquire), Ordering::Release);
            }
        }

        let mut level = self.level.load(Ordering::Acquire);
        while level > 1 && self.head().forward(level - 1).is_none() {
            level -= 1;
        }
        self.level.store(level, Ordering::Release);

        self.graveyard.lock().push(victim_ptr);
        true
    }
}

impl Default for SkipList {
    fn default() -> Self {
        SkipList::new()
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        unsafe {
            let mut walker = self.head;
            while !walker.is_null() {
                let next = (*walker).forward_ptr(0);
                drop(Box::from_raw(walker));
                walker = next;
            }
            for node in self.graveyard.lock().drain(..) {
                drop(Box::from_raw(node));
            }
        }
    }
}
