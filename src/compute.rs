//! The compute-node coordinator: put/get/update/scan dispatch, the
//! quick-put bootstrap, morphing and splitting of data nodes, and the
//! asynchronous calibration of the search layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use log::{debug, info};
use parking_lot::Mutex;

use crate::cluster::{ComputeConfig, NodeInfo};
use crate::concurrency::{ConcurrencyContext, OpType};
use crate::data::{BufferNode, NodeType, Record, BUFFER_CAPACITY, MAX_RECORD_SIZE, RLINK_OFFSET};
use crate::memory::allocator::ComputeNodeAllocator;
use crate::memory::remote::{AllocationRpc, MemoryNodeHandle, RemoteMemory, TcpRpc, ThreadEndpoints};
use crate::memory::RemotePointer;
use crate::memory_node::{DirectRpc, MemoryNodeAllocator};
use crate::search::{SkipList, SkipNode};
use crate::transport::{LoopbackTransport, MemoryPool, TcpTransport, Transport};
use crate::{AllocError, KeyBuf, StoreError, ValueBuf};

/// Calibration work for the background thread: a bottom-linked node and
/// the level it was drawn at.
struct CalibrateContext {
    node: SkipNodePtr,
    level: usize,
}

struct SkipNodePtr(*mut SkipNode);

// Calibration contexts move between the winner that produced the node and
// the calibration thread; the node itself is shared the usual skip-list way.
unsafe impl Send for SkipNodePtr {}
unsafe impl Sync for SkipNodePtr {}

/// The two local type-10 nodes used before any remote data node exists.
struct LocalNodes {
    nodes: [Record; 2],
    anchors: [Option<KeyBuf>; 2],
}

impl LocalNodes {
    fn new() -> LocalNodes {
        LocalNodes {
            nodes: [Record::new(NodeType::Type10), Record::new(NodeType::Type10)],
            anchors: [None, None],
        }
    }

    /// Route a key to the local node covering it.
    fn route(&self, key: &KeyBuf) -> usize {
        match &self.anchors[1] {
            Some(a1) if key >= a1 => 1,
            _ => 0,
        }
    }

    /// Pick (and re-anchor) the target node for a quick-put insert.
    fn pick(&mut self, key: &KeyBuf) -> usize {
        let Some(a0) = self.anchors[0] else {
            self.anchors[0] = Some(*key);
            return 0;
        };
        if key < &a0 {
            // don't migrate; make the empty second node the larger one
            if self.anchors[1].is_none() {
                self.nodes.swap(0, 1);
                self.anchors.swap(0, 1);
            }
            self.anchors[0] = Some(*key);
            0
        } else if key == &a0 {
            0
        } else if self.anchors[1].is_none() {
            self.anchors[1] = Some(*key);
            1
        } else if key >= self.anchors[1].as_ref().unwrap() {
            1
        } else {
            0
        }
    }
}

/// One compute node. Shared across client threads; every thread registers
/// itself first and then drives operations through its [`Client`] handle.
pub struct ComputeNode {
    slist: Arc<SkipList>,
    remote: RemoteMemory,
    allocator: ComputeNodeAllocator,
    update_queue: Arc<SegQueue<CalibrateContext>>,
    calibrator_run: Arc<AtomicBool>,
    calibrator: Mutex<Option<JoinHandle<()>>>,
    remote_put: AtomicBool,
    local: Mutex<LocalNodes>,
    contexts: Mutex<Vec<Arc<ConcurrencyContext>>>,
}

impl ComputeNode {
    /// Assemble a compute node over an already-connected remote memory
    /// manager and start the calibration thread.
    pub fn bootstrap(remote: RemoteMemory) -> Arc<ComputeNode> {
        let slist = Arc::new(SkipList::new());
        let update_queue = Arc::new(SegQueue::new());
        let run = Arc::new(AtomicBool::new(true));

        let thread_slist = slist.clone();
        let thread_queue: Arc<SegQueue<CalibrateContext>> = update_queue.clone();
        let thread_run = run.clone();
        let calibrator = std::thread::spawn(move || {
            loop {
                match thread_queue.pop() {
                    Some(cal) => thread_slist.calibrate(cal.node.0, cal.level),
                    None if !thread_run.load(Ordering::Acquire) => break,
                    None => std::thread::yield_now(),
                }
            }
        });

        Arc::new(ComputeNode {
            slist,
            remote,
            allocator: ComputeNodeAllocator::new(),
            update_queue,
            calibrator_run: run,
            calibrator: Mutex::new(Some(calibrator)),
            remote_put: AtomicBool::new(false),
            local: Mutex::new(LocalNodes::new()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// Stand up an entire single-process cluster: `nodes` memory pools of
    /// `mem_cap` bytes each, wired up over the loopback transport.
    pub fn loopback(nodes: usize, mem_cap: usize) -> Arc<ComputeNode> {
        let mut pools = Vec::new();
        let mut allocators = Vec::new();
        let mut handles = Vec::new();
        for id in 0..nodes as u8 {
            let alloc = Arc::new(MemoryNodeAllocator::new(id, mem_cap));
            handles.push(MemoryNodeHandle {
                node_id: id,
                base_addr: alloc.base_addr(),
                rpc_id: id as i32,
                info: None,
            });
            pools.push(MemoryPool::new(id, mem_cap));
            allocators.push(alloc);
        }
        let transport = LoopbackTransport::new(pools);
        let rpc = DirectRpc::new(allocators);
        Self::bootstrap(RemoteMemory::new(handles, transport, Box::new(rpc)))
    }

    /// Connect to a configured cluster: bootstrap handshake with every
    /// memory node, then the RPC session and the data channel.
    pub fn connect(
        config: &ComputeConfig,
        memory_nodes: Vec<NodeInfo>,
    ) -> Result<Arc<ComputeNode>, StoreError> {
        info!(
            "compute node {} starting: rdma {} port {} gid {}",
            config.self_info.tcp_addr,
            config.rdma.device,
            config.rdma.port,
            config.rdma.gid_idx
        );
        let peers = memory_nodes
            .iter()
            .map(|n| (n.node_id, n.data_addr))
            .collect();
        let transport: Arc<dyn Transport> = TcpTransport::new(peers);
        let rpc: Box<dyn AllocationRpc> = Box::new(TcpRpc::connect(&memory_nodes)?);
        let remote = RemoteMemory::connect(memory_nodes, transport, rpc)?;
        Ok(Self::bootstrap(remote))
    }

    /// Register the calling thread: per-thread endpoints to every memory
    /// node plus an election context. Threads call this once, before any
    /// operation.
    pub fn register_thread(self: &Arc<Self>) -> Result<Client, StoreError> {
        let ep = self.remote.setup_thread()?;
        let cctx = ConcurrencyContext::new();
        self.contexts.lock().push(cctx.clone());
        Ok(Client {
            node: self.clone(),
            ep,
            group: None,
            cctx,
        })
    }

    pub fn search_layer(&self) -> &SkipList {
        &self.slist
    }

    pub fn remote_memory(&self) -> &RemoteMemory {
        &self.remote
    }

    /// How many client threads have registered so far.
    pub fn registered_threads(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Bottom-link the right half of a split and queue its upper levels
    /// for calibration.
    fn publish_right(&self, pred: &SkipNode, anchor: &KeyBuf, t: NodeType, r: RemotePointer) {
        let (node, level) = SkipList::make_new_node(anchor, r, t);
        pred.link_after(node);
        self.update_queue.push(CalibrateContext {
            node: SkipNodePtr(node),
            level,
        });
    }

    /// Wait until the calibration queue is empty. Test/admin helper.
    pub fn quiesce_calibration(&self) {
        while !self.update_queue.is_empty() {
            std::thread::yield_now();
        }
    }
}

impl Drop for ComputeNode {
    fn drop(&mut self) {
        self.calibrator_run.store(false, Ordering::Release);
        if let Some(handle) = self.calibrator.lock().take() {
            let _ = handle.join();
        }
    }
}

/// What one winner attempt produced.
enum WinAttempt {
    /// We own the node; the fetched, CRC-checked image is ours to mutate.
    Won(Record),
    /// Our op was handed over and completed by the winner.
    Lost { succeed: bool, retry: bool },
    /// Wrong-type winner, depth exhausted, or torn fetch: back to dispatch.
    Retry,
}

/// A per-thread handle onto a [`ComputeNode`]. Owns the thread's
/// endpoints, its page group, and its election context.
pub struct Client {
    node: Arc<ComputeNode>,
    ep: ThreadEndpoints,
    group: Option<crate::memory::allocator::PageGroup>,
    cctx: Arc<ConcurrencyContext>,
}

impl Client {
    /// Allocate remote memory, leasing a fresh segment over RPC when the
    /// current one runs dry.
    pub fn allocate(&mut self, size: usize) -> Result<RemotePointer, StoreError> {
        match self.node.allocator.allocate(&mut self.group, size) {
            Ok(p) => Ok(p),
            Err(AllocError::SegmentExhausted) => {
                let seg = match self.node.remote.offer_remote_segment() {
                    Ok(seg) => seg,
                    Err(StoreError::Transport(crate::TransportError::NoRemoteMemory)) => {
                        return Err(AllocError::OutOfMemory.into());
                    }
                    Err(e) => return Err(e),
                };
                self.node.allocator.apply_for_memory(seg);
                Ok(self.node.allocator.allocate(&mut self.group, size)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a freed chunk; purely local bookkeeping.
    pub fn free(&mut self, p: RemotePointer) {
        self.node.allocator.free(&mut self.group, p);
    }

    /// Fetch and adopt the record behind `p`. Admin/test helper.
    pub fn fetch_record(&mut self, p: RemotePointer) -> Result<Record, StoreError> {
        self.node.remote.fetch_record(&mut self.ep, p, MAX_RECORD_SIZE)
    }

    /// Insert `key`. Returns true once the pair is durable in a data node
    /// (an already-present key also reports true).
    pub fn put(&mut self, key: &KeyBuf, value: &ValueBuf) -> Result<bool, StoreError> {
        let node = self.node.clone();
        if !node.remote_put.load(Ordering::Acquire) && self.quick_put(&node, key, value)? {
            return Ok(true);
        }

        loop {
            let Some(snode) = target_node(&node, key) else {
                std::thread::yield_now();
                continue;
            };
            match self.try_win(&node, snode, OpType::Insert, key, value)? {
                WinAttempt::Won(rec) => return self.winner_put(&node, snode, rec, key, value),
                WinAttempt::Lost { succeed, retry } => {
                    if !retry {
                        return Ok(succeed);
                    }
                }
                WinAttempt::Retry => {}
            }
            std::hint::spin_loop();
        }
    }

    /// Look a key up. Readers never take the election; torn images are
    /// rejected by CRC and concurrent rewrites by the version check, both
    /// retried from search.
    pub fn get(&mut self, key: &KeyBuf) -> Result<Option<ValueBuf>, StoreError> {
        let node = self.node.clone();
        if !node.remote_put.load(Ordering::Acquire) {
            let local = node.local.lock();
            if !node.remote_put.load(Ordering::Acquire) {
                return Ok(local.nodes[local.route(key)].find(key));
            }
        }

        loop {
            let Some(snode) = target_node(&node, key) else {
                return Ok(None);
            };
            let version = snode.version.load(Ordering::Acquire);
            let rec = node
                .remote
                .fetch_record(&mut self.ep, snode.data_node(), MAX_RECORD_SIZE)?;
            if !rec.verify() {
                debug!("crc mismatch reading {:?}, retrying", snode.data_node());
                continue;
            }
            let value = rec.find(key);
            if version != snode.version.load(Ordering::Acquire) {
                continue;
            }
            return Ok(value);
        }
    }

    /// Overwrite an existing key's value in place. False if absent.
    pub fn update(&mut self, key: &KeyBuf, value: &ValueBuf) -> Result<bool, StoreError> {
        let node = self.node.clone();
        if !node.remote_put.load(Ordering::Acquire) {
            let mut local = node.local.lock();
            if !node.remote_put.load(Ordering::Acquire) {
                let idx = local.route(key);
                return Ok(local.nodes[idx].update(key, value));
            }
        }

        loop {
            let Some(snode) = target_node(&node, key) else {
                return Ok(false);
            };
            match self.try_win(&node, snode, OpType::Update, key, value)? {
                WinAttempt::Won(mut rec) => {
                    let ok = rec.update(key, value);
                    while let Some(req) = self.pop_request(snode) {
                        req.complete(rec.update(&req.key, &req.value), false);
                    }
                    rec.seal();
                    node.remote
                        .write_to(&mut self.ep, snode.data_node(), rec.as_bytes())?;
                    finish_winner(snode, &self.cctx);
                    return Ok(ok);
                }
                WinAttempt::Lost { succeed, retry } => {
                    if !retry {
                        return Ok(succeed);
                    }
                }
                WinAttempt::Retry => {}
            }
            std::hint::spin_loop();
        }
    }

    /// Gather up to `count` values with keys >= `key`, walking data nodes
    /// in anchor order with a two-node prefetch. A scan racing a split may
    /// report duplicates; callers tolerate them.
    pub fn scan(&mut self, key: &KeyBuf, count: usize) -> Result<Vec<ValueBuf>, StoreError> {
        let node = self.node.clone();
        let mut out = Vec::with_capacity(count);

        if !node.remote_put.load(Ordering::Acquire) {
            let local = node.local.lock();
            if !node.remote_put.load(Ordering::Acquire) {
                local.nodes[0].scan(key, count, &mut out);
                local.nodes[1].scan(key, count, &mut out);
                return Ok(out);
            }
        }

        let start = node.slist.fuzzy_search(key);
        let mut cursor = if start.is_head() {
            start.forward(0)
        } else {
            Some(start)
        };

        while let Some(first) = cursor {
            if out.len() >= count {
                break;
            }
            let second = first.forward(0);
            node.remote.fetch_two_async(
                &mut self.ep,
                (first.data_node(), MAX_RECORD_SIZE),
                second.map(|s| (s.data_node(), MAX_RECORD_SIZE)),
            )?;
            let (a, b) = node.remote.poll_fetch_two_async(&mut self.ep);
            if let Some(rec) = a {
                rec.scan(key, count, &mut out);
            }
            // a split may have linked a fresh anchor behind `first` while
            // we were reading; restart from it rather than skip its keys
            let fresh = first.forward(0);
            let unchanged = match (fresh, second) {
                (Some(f), Some(s)) => std::ptr::eq(f, s),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                cursor = fresh;
                continue;
            }
            if let Some(rec) = b {
                if out.len() < count {
                    rec.scan(key, count, &mut out);
                }
            }
            cursor = second.and_then(|s| s.forward(0));
        }
        Ok(out)
    }

    /// Serve puts locally while fewer than two data nodes exist. On
    /// overflow both local nodes flush to remote (the full one sized up to
    /// take the overflowing key), their anchors enter the search layer,
    /// and the store switches to remote puts for good.
    fn quick_put(
        &mut self,
        node: &Arc<ComputeNode>,
        key: &KeyBuf,
        value: &ValueBuf,
    ) -> Result<bool, StoreError> {
        let mut local = node.local.lock();
        if node.remote_put.load(Ordering::Acquire) {
            return Ok(false);
        }

        let target = local.pick(key);
        if local.nodes[target].store(key, value) {
            return Ok(true);
        }

        // overflow: flush both nodes, the full one morphed up to type 12
        let smaller = self.allocate(NodeType::Type10.wire_size())?;
        let larger = self.allocate(NodeType::Type12.wire_size())?;

        let mut flushed = local.nodes[target].clone();
        flushed.set_node_type(NodeType::Type12);
        flushed.store(key, value);

        let keep = 1 - target;
        if target == 0 {
            flushed.set_llink(RemotePointer::NULL);
            flushed.set_rlink(smaller);
            local.nodes[keep].set_llink(larger);
            local.nodes[keep].set_rlink(RemotePointer::NULL);
        } else {
            flushed.set_llink(smaller);
            flushed.set_rlink(RemotePointer::NULL);
            local.nodes[keep].set_llink(RemotePointer::NULL);
            local.nodes[keep].set_rlink(larger);
        }
        flushed.seal();
        local.nodes[keep].seal();

        node.remote
            .write_to(&mut self.ep, larger, flushed.as_bytes())?;
        node.remote
            .write_to(&mut self.ep, smaller, local.nodes[keep].as_bytes())?;

        // only update the search layer once both nodes are remote
        let anchors = [
            local.anchors[0].expect("quick-put overflow implies both anchors"),
            local.anchors[1].expect("quick-put overflow implies both anchors"),
        ];
        if target == 0 {
            node.slist.insert(&anchors[0], larger, NodeType::Type12);
            node.slist.insert(&anchors[1], smaller, NodeType::Type10);
        } else {
            node.slist.insert(&anchors[0], smaller, NodeType::Type10);
            node.slist.insert(&anchors[1], larger, NodeType::Type12);
        }

        info!("quick-put overflow: switching to remote puts");
        node.remote_put.store(true, Ordering::Release);
        Ok(true)
    }

    /// Pop the next handed-over request that actually targets `snode`.
    /// Requests tagged for another data node came from stale losers and
    /// are finished with a retry verdict.
    fn pop_request(&self, snode: &SkipNode) -> Option<Arc<crate::concurrency::Request>> {
        let tag = election_tag(snode);
        while let Some(req) = self.cctx.requests.pop() {
            if req.target == tag {
                return Some(req);
            }
            req.complete(false, true);
        }
        None
    }

    /// Elect a winner on `snode` or hand the op over to the one that won.
    fn try_win(
        &mut self,
        node: &Arc<ComputeNode>,
        snode: &SkipNode,
        op: OpType,
        key: &KeyBuf,
        value: &ValueBuf,
    ) -> Result<WinAttempt, StoreError> {
        // finish anything left over from a round we abandoned
        self.cctx.drain_pending();
        self.cctx.set_op(op);

        let me = Arc::as_ptr(&self.cctx) as *mut ConcurrencyContext;
        match snode.ctx.compare_exchange(
            std::ptr::null_mut(),
            me,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let rec = node
                    .remote
                    .fetch_record(&mut self.ep, snode.data_node(), MAX_RECORD_SIZE)?;
                self.cctx.close_window();
                if !rec.verify() {
                    debug!("winner fetched a torn image from {:?}", snode.data_node());
                    self.cctx.drain_pending();
                    snode.ctx.store(std::ptr::null_mut(), Ordering::Release);
                    self.cctx.open_window();
                    return Ok(WinAttempt::Retry);
                }
                Ok(WinAttempt::Won(rec))
            }
            Err(observed) => {
                // the winner's context outlives every election it appears in
                let winner = unsafe { &*observed };
                if winner.op() != op {
                    return Ok(WinAttempt::Retry);
                }
                let (succeed, retry) = winner.hand_over(key, value, election_tag(snode));
                Ok(WinAttempt::Lost { succeed, retry })
            }
        }
    }

    /// Winner's insert body: batch pending work into the fetched record,
    /// then write back in place, morph, or split.
    fn winner_put(
        &mut self,
        node: &Arc<ComputeNode>,
        snode: &SkipNode,
        mut rec: Record,
        key: &KeyBuf,
        value: &ValueBuf,
    ) -> Result<bool, StoreError> {
        let declared = rec.node_type();

        // phase one: serve what fits at the declared shape
        let own_done = rec.store(key, value);
        if own_done {
            while let Some(req) = self.pop_request(snode) {
                if rec.store(&req.key, &req.value) {
                    req.complete(true, false);
                } else {
                    self.cctx.requests.push(req);
                    break;
                }
            }
            if self.cctx.requests.is_empty() {
                rec.seal();
                node.remote
                    .write_to(&mut self.ep, snode.data_node(), rec.as_bytes())?;
                finish_winner(snode, &self.cctx);
                return Ok(true);
            }
        }

        // phase two: the node overflows its shape
        let pendings = self.cctx.requests.len();
        let total = rec.next() + usize::from(!own_done) + pendings;
        let outcome = match declared {
            NodeType::Type10 => self.morph_overflow(node, snode, &mut rec, key, value, own_done),
            NodeType::Type12 => {
                if pendings <= 4 && total <= 16 {
                    self.eager_morph(node, snode, &mut rec, key, value, own_done)
                } else {
                    self.split(node, snode, &rec, key, value, own_done, 9,
                               NodeType::Type10, NodeType::Type10)
                }
            }
            NodeType::Type14 => {
                if pendings <= 2 && total <= 16 {
                    self.eager_morph(node, snode, &mut rec, key, value, own_done)
                } else {
                    self.split(node, snode, &rec, key, value, own_done, 8,
                               NodeType::Type10, NodeType::Type12)
                }
            }
            NodeType::Type16 => {
                if pendings <= 2 {
                    self.split(node, snode, &rec, key, value, own_done, 9,
                               NodeType::Type10, NodeType::Type10)
                } else if pendings <= 4 {
                    self.split(node, snode, &rec, key, value, own_done, 9,
                               NodeType::Type10, NodeType::Type12)
                } else {
                    self.split(node, snode, &rec, key, value, own_done, 10,
                               NodeType::Type12, NodeType::Type12)
                }
            }
            _ => {
                // unreadable shape: let everyone retry from search
                self.cctx.drain_pending();
                Ok(false)
            }
        };

        finish_winner(snode, &self.cctx);
        outcome
    }

    /// Type-10 overflow: the pending set always fits within 16 slots, so
    /// absorb everything into the buffer's full frame and rewrite the
    /// shape - no data movement, just a bigger slot.
    fn morph_overflow(
        &mut self,
        node: &Arc<ComputeNode>,
        snode: &SkipNode,
        rec: &mut Record,
        key: &KeyBuf,
        value: &ValueBuf,
        own_done: bool,
    ) -> Result<bool, StoreError> {
        if !own_done {
            rec.store_with_capacity(16, key, value);
        }
        while let Some(req) = self.pop_request(snode) {
            req.complete(rec.store_with_capacity(16, &req.key, &req.value), false);
        }
        let t = NodeType::for_count(rec.next());
        rec.set_node_type(t);
        self.relocate(node, snode, rec, t)
    }

    /// Morph straight to type 16: everything pending fits the largest
    /// shape.
    fn eager_morph(
        &mut self,
        node: &Arc<ComputeNode>,
        snode: &SkipNode,
        rec: &mut Record,
        key: &KeyBuf,
        value: &ValueBuf,
        own_done: bool,
    ) -> Result<bool, StoreError> {
        rec.set_node_type(NodeType::Type16);
        if !own_done {
            rec.store(key, value);
        }
        while let Some(req) = self.pop_request(snode) {
            req.complete(rec.store(&req.key, &req.value), false);
        }
        self.relocate(node, snode, rec, NodeType::Type16)
    }

    /// Write a morphed record to a fresh slot of its new size, repoint the
    /// predecessor record's rlink, and swap the search-layer mapping. The
    /// old slot becomes garbage for the deferred reclamation pass.
    fn relocate(
        &mut self,
        node: &Arc<ComputeNode>,
        snode: &SkipNode,
        rec: &mut Record,
        t: NodeType,
    ) -> Result<bool, StoreError> {
        let dst = self.allocate(t.wire_size())?;
        rec.seal();
        node.remote.write_to(&mut self.ep, dst, rec.as_bytes())?;
        if let Some(pred) = snode.backward().filter(|p| !p.is_head()) {
            let patch = pred.data_node().offset(RLINK_OFFSET as u64);
            node.remote
                .write_to(&mut self.ep, patch, &dst.raw().to_le_bytes())?;
        }
        snode.set_data_node(dst);
        snode.set_node_type(t);
        Ok(true)
    }

    /// Split the overflowing node into `(left, right)`. All pending pairs
    /// land in a scratch buffer first; the right anchor is always taken
    /// from that fully-populated scratch. Both halves and the
    /// predecessor's patched rlink go out in one batched post when they
    /// share a memory node.
    #[allow(clippy::too_many_arguments)]
    fn split(
        &mut self,
        node: &Arc<ComputeNode>,
        snode: &SkipNode,
        rec: &Record,
        key: &KeyBuf,
        value: &ValueBuf,
        own_done: bool,
        left_count: usize,
        left_type: NodeType,
        right_type: NodeType,
    ) -> Result<bool, StoreError> {
        let mut tmp = BufferNode::from_record(rec);
        if !own_done {
            tmp.store(key, value);
        }
        while let Some(req) = self.pop_request(snode) {
            req.complete(tmp.store(&req.key, &req.value), false);
        }

        let mut reorder = [0usize; BUFFER_CAPACITY];
        let mut picked = [false; BUFFER_CAPACITY];
        tmp.construct_reorder_map(left_count, &mut reorder, &mut picked);
        let right_anchor = *tmp.key_at(reorder[left_count]);
        // the right node keeps its own anchor pair
        picked[reorder[left_count]] = false;

        let mut left = Record::new(left_type);
        let mut right = Record::new(right_type);
        tmp.distribute(&picked, &mut left, &mut right);

        let l = self.allocate(left_type.wire_size())?;
        let r = self.allocate(right_type.wire_size())?;
        right.set_rlink(rec.rlink());
        right.set_llink(l);
        left.set_llink(rec.llink());
        left.set_rlink(r);
        left.seal();
        right.seal();

        // patch the predecessor record's rlink to the relocated left half
        let pred_patch = snode
            .backward()
            .filter(|p| !p.is_head())
            .map(|p| p.data_node().offset(RLINK_OFFSET as u64));
        let l_raw = l.raw().to_le_bytes();

        if l.node_id() == r.node_id() {
            let mut writes = vec![(l, left.as_bytes()), (r, right.as_bytes())];
            let mut spill = None;
            match pred_patch {
                Some(p) if p.node_id() == l.node_id() => writes.push((p, &l_raw)),
                other => spill = other,
            }
            node.remote.write_batch(&mut self.ep, l.node_id(), &writes)?;
            if let Some(p) = spill {
                node.remote.write_to(&mut self.ep, p, &l_raw)?;
            }
        } else {
            node.remote.write_to(&mut self.ep, l, left.as_bytes())?;
            node.remote.write_to(&mut self.ep, r, right.as_bytes())?;
            if let Some(p) = pred_patch {
                node.remote.write_to(&mut self.ep, p, &l_raw)?;
            }
        }

        // readers between these two steps see the right anchor alongside
        // the still-complete old record: duplicates, never losses
        node.publish_right(snode, &right_anchor, right_type, r);
        snode.set_data_node(l);
        snode.set_node_type(left_type);
        Ok(true)
    }
}

/// Resolve the data node responsible for `key`. A head result means no
/// anchor covers the key yet; the leftmost data node absorbs such keys.
fn target_node<'a>(node: &'a ComputeNode, key: &KeyBuf) -> Option<&'a SkipNode> {
    let found = node.slist.fuzzy_search(key);
    if found.is_head() {
        found.forward(0)
    } else {
        Some(found)
    }
}

/// Identity of an election round's data node, carried on handed-over
/// requests.
fn election_tag(snode: &SkipNode) -> usize {
    snode as *const SkipNode as usize
}

/// Leave a winner round: bump the version for readers, then release the
/// election before reopening the window, so no late request can queue
/// behind a winner that is gone.
fn finish_winner(snode: &SkipNode, cctx: &ConcurrencyContext) {
    snode.version.fetch_add(1, Ordering::Release);
    snode.ctx.store(std::ptr::null_mut(), Ordering::Release);
    cctx.open_window();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::decimal_key;
    use crate::{PAGE_SIZE, SEGMENT_SIZE};

    fn store() -> Arc<ComputeNode> {
        ComputeNode::loopback(1, SEGMENT_SIZE + PAGE_SIZE)
    }

    #[test]
    fn quick_put_serves_reads_locally() {
        let node = store();
        let mut client = node.register_thread().unwrap();
        assert_eq!(node.registered_threads(), 1);
        for i in 0..5u64 {
            assert!(client.put(&decimal_key(i), &decimal_key(i * 7)).unwrap());
        }
        assert!(!node.remote_put.load(Ordering::Relaxed));
        for i in 0..5u64 {
            assert_eq!(client.get(&decimal_key(i)).unwrap(), Some(decimal_key(i * 7)));
        }
        assert_eq!(client.get(&decimal_key(9)).unwrap(), None);
        assert!(client.update(&decimal_key(3), &decimal_key(333)).unwrap());
        assert_eq!(client.get(&decimal_key(3)).unwrap(), Some(decimal_key(333)));
    }

    #[test]
    fn transition_to_remote_after_overflow() {
        let node = store();
        let mut client = node.register_thread().unwrap();
        // keys 1..=11: the 11th overflows the local node and flushes
        for i in 1..=11u64 {
            assert!(client.put(&decimal_key(i), &decimal_key(i)).unwrap());
        }
        assert!(node.remote_put.load(Ordering::Relaxed));
        for i in 1..=11u64 {
            assert_eq!(client.get(&decimal_key(i)).unwrap(), Some(decimal_key(i)));
        }
    }

    #[test]
    fn remote_puts_and_updates() {
        let node = store();
        let mut client = node.register_thread().unwrap();
        for i in 0..200u64 {
            assert!(client.put(&decimal_key(i), &decimal_key(i)).unwrap());
        }
        for i in 0..200u64 {
            assert_eq!(client.get(&decimal_key(i)).unwrap(), Some(decimal_key(i)));
        }
        for i in 0..200u64 {
            assert!(client.update(&decimal_key(i), &decimal_key(i + 1000)).unwrap());
        }
        for i in 0..200u64 {
            assert_eq!(
                client.get(&decimal_key(i)).unwrap(),
                Some(decimal_key(i + 1000))
            );
        }
        assert!(!client.update(&decimal_key(9999), &decimal_key(0)).unwrap());
    }

    #[test]
    fn smallest_key_after_transition_is_absorbed() {
        let node = store();
        let mut client = node.register_thread().unwrap();
        for i in 10..=21u64 {
            assert!(client.put(&decimal_key(i), &decimal_key(i)).unwrap());
        }
        assert!(node.remote_put.load(Ordering::Relaxed));
        // smaller than every anchor: lands in the leftmost data node
        assert!(client.put(&decimal_key(1), &decimal_key(1)).unwrap());
        assert_eq!(client.get(&decimal_key(1)).unwrap(), Some(decimal_key(1)));
    }

    #[test]
    fn scan_returns_ordered_range_contents() {
        let node = store();
        let mut client = node.register_thread().unwrap();
        for i in 0..300u64 {
            client.put(&decimal_key(i), &decimal_key(i)).unwrap();
        }
        node.quiesce_calibration();
        let got = client.scan(&decimal_key(100), 50).unwrap();
        assert_eq!(got.len(), 50);
        for v in &got {
            let n: u64 = std::str::from_utf8(v).unwrap().parse().unwrap();
            assert!(n >= 100);
        }
    }

    #[test]
    fn rlink_chain_follows_splits() {
        let node = store();
        let mut client = node.register_thread().unwrap();
        for i in 0..300u64 {
            client.put(&decimal_key(i), &decimal_key(i)).unwrap();
        }
        node.quiesce_calibration();

        // walk rlinks from the leftmost record and count every key
        let mut seen = 0usize;
        let mut cursor = node.search_layer().head().forward(0).unwrap().data_node();
        while !cursor.is_null() {
            let rec = client.fetch_record(cursor).unwrap();
            assert!(rec.verify());
            seen += rec.next();
            cursor = rec.rlink();
        }
        assert_eq!(seen, 300);
    }
}
