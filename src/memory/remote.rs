//! The remote memory manager: per-thread endpoints to every memory node,
//! segment acquisition over the allocation RPC, and the typed fetch/write
//! helpers the data layer is built on.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use parking_lot::Mutex;

use crate::cluster::{NodeInfo, RPC_REMOTE_ALLOCATION, RPC_REMOTE_DEALLOCATION};
use crate::data::Record;
use crate::memory::RemotePointer;
use crate::transport::{Endpoint, Transport, WriteRequest};
use crate::{StoreError, TransportError, MAX_NODES};

/// Registered scratch size per (thread, node) channel.
pub const SCRATCH_SIZE: usize = 4096;

/// Half of the scratch, used by the two-record scan prefetch.
const SCRATCH_HALF: usize = SCRATCH_SIZE / 2;

/// Segment allocation requests, answered by a memory node. The production
/// RPC runtime is an external collaborator; implementations here are the
/// TCP client below and the direct in-process hookup in `memory_node`.
pub trait AllocationRpc: Send + Sync {
    /// Ask `node` for a segment. A null pointer means the node is out.
    fn allocate_segment(&self, node: u8) -> Result<RemotePointer, TransportError>;
    fn deallocate_segment(&self, node: u8, seg: RemotePointer)
        -> Result<bool, TransportError>;
}

/// What the manager knows about one memory node after bootstrap.
pub struct MemoryNodeHandle {
    pub node_id: u8,
    pub base_addr: RemotePointer,
    pub rpc_id: i32,
    pub info: Option<NodeInfo>,
}

/// One thread's channels: an endpoint plus a registered scratch buffer per
/// memory node. Obtained from [`RemoteMemory::setup_thread`] and owned by
/// the calling thread for its lifetime.
pub struct ThreadEndpoints {
    chans: Vec<Chan>,
    pending: [Option<PendingFetch>; 2],
}

struct Chan {
    ep: Box<dyn Endpoint>,
    scratch: Box<[u8]>,
}

#[derive(Clone, Copy)]
struct PendingFetch {
    chan: usize,
    offset: usize,
    size: usize,
}

/// Compute-side view of the cluster's remote memory.
pub struct RemoteMemory {
    nodes: Vec<MemoryNodeHandle>,
    index: [usize; MAX_NODES],
    transport: Arc<dyn Transport>,
    rpc: Box<dyn AllocationRpc>,
    current: AtomicUsize,
}

impl RemoteMemory {
    /// Assemble from already-known node handles (loopback clusters, tests).
    pub fn new(
        nodes: Vec<MemoryNodeHandle>,
        transport: Arc<dyn Transport>,
        rpc: Box<dyn AllocationRpc>,
    ) -> RemoteMemory {
        let mut index = [usize::MAX; MAX_NODES];
        for (i, n) in nodes.iter().enumerate() {
            index[n.node_id as usize] = i;
        }
        RemoteMemory {
            nodes,
            index,
            transport,
            rpc,
            current: AtomicUsize::new(0),
        }
    }

    /// Bootstrap against a configured node list: connect each node's TCP
    /// socket and receive its base remote address (8 bytes LE) and RPC
    /// endpoint id (4 bytes LE signed), in config order.
    pub fn connect(
        infos: Vec<NodeInfo>,
        transport: Arc<dyn Transport>,
        rpc: Box<dyn AllocationRpc>,
    ) -> Result<RemoteMemory, StoreError> {
        let mut nodes = Vec::with_capacity(infos.len());
        for info in infos {
            let mut socket = TcpStream::connect(info.tcp_addr)
                .map_err(TransportError::from)?;
            let base = socket
                .read_u64::<LittleEndian>()
                .map_err(TransportError::from)?;
            let rpc_id = socket
                .read_i32::<LittleEndian>()
                .map_err(TransportError::from)?;
            info!(
                "connected to memory node {} at {}: base {:?}, rpc id {}",
                info.node_id,
                info.tcp_addr,
                RemotePointer::from_raw(base),
                rpc_id
            );
            nodes.push(MemoryNodeHandle {
                node_id: info.node_id,
                base_addr: RemotePointer::from_raw(base),
                rpc_id,
                info: Some(info),
            });
            // the bootstrap socket stays open on the far side for admin
            // use; we are done with it
            drop(socket);
        }
        Ok(RemoteMemory::new(nodes, transport, rpc))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn base_addr(&self, node_id: u8) -> Option<RemotePointer> {
        let i = self.index[node_id as usize];
        self.nodes.get(i).map(|n| n.base_addr)
    }

    fn chan_of(&self, p: RemotePointer) -> Result<usize, StoreError> {
        let i = self.index[p.node_id() as usize];
        if i == usize::MAX {
            return Err(StoreError::DanglingPointer(p));
        }
        Ok(i)
    }

    /// Open one endpoint (with scratch) per memory node for the calling
    /// thread.
    pub fn setup_thread(&self) -> Result<ThreadEndpoints, StoreError> {
        let mut chans = Vec::with_capacity(self.nodes.len());
        for n in &self.nodes {
            chans.push(Chan {
                ep: self.transport.open_endpoint(n.node_id)?,
                scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
            });
        }
        Ok(ThreadEndpoints {
            chans,
            pending: [None, None],
        })
    }

    /// Read `size` bytes at `p` into the thread's scratch and return a view
    /// of them. The scratch is reused by the next fetch on this thread, so
    /// callers consume or copy before fetching again.
    pub fn fetch<'a>(
        &self,
        ep: &'a mut ThreadEndpoints,
        p: RemotePointer,
        size: usize,
    ) -> Result<&'a [u8], StoreError> {
        debug_assert!(size <= SCRATCH_SIZE);
        let chan = &mut ep.chans[self.chan_of(p)?];
        chan.ep.post_read(p.address(), &mut chan.scratch[..size])?;
        Ok(&chan.scratch[..size])
    }

    /// Fetch a record image and adopt it into a local [`Record`].
    pub fn fetch_record(
        &self,
        ep: &mut ThreadEndpoints,
        p: RemotePointer,
        size: usize,
    ) -> Result<Record, StoreError> {
        Ok(Record::from_wire(self.fetch(ep, p, size)?))
    }

    /// Write `data` to `p`, polling the completion before returning.
    pub fn write_to(
        &self,
        ep: &mut ThreadEndpoints,
        p: RemotePointer,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let chan = &mut ep.chans[self.chan_of(p)?];
        chan.ep.post_write(p.address(), data)?;
        Ok(())
    }

    /// Write several buffers to one memory node as a single batched post.
    pub fn write_batch(
        &self,
        ep: &mut ThreadEndpoints,
        node_id: u8,
        writes: &[(RemotePointer, &[u8])],
    ) -> Result<(), StoreError> {
        let i = self.index[node_id as usize];
        if i == usize::MAX {
            return Err(StoreError::Transport(TransportError::UnknownNode(node_id)));
        }
        let reqs: Vec<WriteRequest> = writes
            .iter()
            .map(|(p, data)| WriteRequest {
                addr: p.address(),
                data,
            })
            .collect();
        ep.chans[i].ep.post_write_batch(&reqs)?;
        Ok(())
    }

    /// Post reads for up to two records, landing in the two halves of the
    /// per-node scratch. Retrieved by [`poll_fetch_two_async`].
    ///
    /// [`poll_fetch_two_async`]: RemoteMemory::poll_fetch_two_async
    pub fn fetch_two_async(
        &self,
        ep: &mut ThreadEndpoints,
        first: (RemotePointer, usize),
        second: Option<(RemotePointer, usize)>,
    ) -> Result<(), StoreError> {
        debug_assert!(first.1 <= SCRATCH_HALF);
        let chan = self.chan_of(first.0)?;
        {
            let c = &mut ep.chans[chan];
            c.ep.post_read(first.0.address(), &mut c.scratch[..first.1])?;
        }
        ep.pending[0] = Some(PendingFetch {
            chan,
            offset: 0,
            size: first.1,
        });

        ep.pending[1] = None;
        if let Some((p, size)) = second {
            debug_assert!(size <= SCRATCH_HALF);
            let chan = self.chan_of(p)?;
            {
                let c = &mut ep.chans[chan];
                c.ep
                    .post_read(p.address(), &mut c.scratch[SCRATCH_HALF..SCRATCH_HALF + size])?;
            }
            ep.pending[1] = Some(PendingFetch {
                chan,
                offset: SCRATCH_HALF,
                size,
            });
        }
        Ok(())
    }

    /// Poll the completions of the last `fetch_two_async` and adopt both
    /// images.
    pub fn poll_fetch_two_async(
        &self,
        ep: &mut ThreadEndpoints,
    ) -> (Option<Record>, Option<Record>) {
        let mut out = [None, None];
        for (slot, pending) in ep.pending.iter_mut().enumerate() {
            if let Some(p) = pending.take() {
                let scratch = &ep.chans[p.chan].scratch[p.offset..p.offset + p.size];
                out[slot] = Some(Record::from_wire(scratch));
            }
        }
        let [a, b] = out;
        (a, b)
    }

    /// Lease a fresh segment, round-robining over the memory nodes and
    /// falling through to the next node when one is exhausted.
    pub fn offer_remote_segment(&self) -> Result<RemotePointer, StoreError> {
        for _ in 0..self.nodes.len() {
            let i = self.current.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
            let node = &self.nodes[i];
            let seg = self.rpc.allocate_segment(node.node_id)?;
            if !seg.is_null() {
                return Ok(seg);
            }
            warn!("memory node {} is out of segments", node.node_id);
        }
        Err(StoreError::Transport(TransportError::NoRemoteMemory))
    }

    /// Give a segment back to its owner.
    pub fn recycle_remote_segment(&self, seg: RemotePointer) -> Result<bool, StoreError> {
        Ok(self.rpc.deallocate_segment(seg.node_id(), seg)?)
    }
}

/// Allocation RPC client over plain TCP, one connection per memory node.
/// Segment requests are rare, so a mutex per stream is fine.
pub struct TcpRpc {
    streams: Vec<(u8, Mutex<TcpStream>)>,
}

impl TcpRpc {
    pub fn connect(infos: &[NodeInfo]) -> Result<TcpRpc, TransportError> {
        let mut streams = Vec::with_capacity(infos.len());
        for info in infos {
            let stream = TcpStream::connect(info.rpc_addr)?;
            stream.set_nodelay(true)?;
            streams.push((info.node_id, Mutex::new(stream)));
        }
        Ok(TcpRpc { streams })
    }

    fn stream(&self, node: u8) -> Result<&Mutex<TcpStream>, TransportError> {
        self.streams
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, s)| s)
            .ok_or(TransportError::UnknownNode(node))
    }
}

impl AllocationRpc for TcpRpc {
    fn allocate_segment(&self, node: u8) -> Result<RemotePointer, TransportError> {
        let mut stream = self.stream(node)?.lock();
        stream.write_u8(RPC_REMOTE_ALLOCATION)?;
        let raw = stream.read_u64::<LittleEndian>()?;
        Ok(RemotePointer::from_raw(raw))
    }

    fn deallocate_segment(
        &self,
        node: u8,
        seg: RemotePointer,
    ) -> Result<bool, TransportError> {
        let mut stream = self.stream(node)?.lock();
        stream.write_u8(RPC_REMOTE_DEALLOCATION)?;
        stream.write_u64::<LittleEndian>(seg.raw())?;
        let mut ok = [0u8; 1];
        stream.read_exact(&mut ok)?;
        Ok(ok[0] != 0)
    }
}
