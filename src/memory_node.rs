//! The memory node: a registered byte pool, a bitmap allocator granting
//! whole segments, and the three service loops a compute node talks to
//! (bootstrap TCP, allocation RPC, one-sided data channel).

use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::cluster::{MemoryConfig, RPC_REMOTE_ALLOCATION, RPC_REMOTE_DEALLOCATION};
use crate::memory::remote::AllocationRpc;
use crate::memory::{Bitmap, RemotePointer};
use crate::transport::{serve_data_connection, MemoryPool};
use crate::{StoreError, TransportError, PAGE_SIZE, SEGMENT_SIZE};

/// Grants segments out of a memory node's pool. The first page of the pool
/// holds node metadata and is never granted; segments are carved from
/// there on, one bitmap slot each.
pub struct MemoryNodeAllocator {
    node_id: u8,
    num_segments: usize,
    bitmap: Mutex<Bitmap>,
}

impl MemoryNodeAllocator {
    pub fn new(node_id: u8, mem_cap: usize) -> MemoryNodeAllocator {
        let num_segments = mem_cap.saturating_sub(PAGE_SIZE) / SEGMENT_SIZE;
        MemoryNodeAllocator {
            node_id,
            num_segments,
            bitmap: Mutex::new(Bitmap::new(num_segments)),
        }
    }

    /// The first usable address of the pool, as sent during bootstrap.
    pub fn base_addr(&self) -> RemotePointer {
        RemotePointer::encode(self.node_id, PAGE_SIZE as u64)
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Grant one segment, or the null pointer when the pool is exhausted.
    pub fn allocate(&self) -> RemotePointer {
        match self.bitmap.lock().get_empty() {
            Some(slot) => RemotePointer::encode(
                self.node_id,
                (PAGE_SIZE + slot * SEGMENT_SIZE) as u64,
            ),
            None => RemotePointer::NULL,
        }
    }

    /// Take a granted segment back. The segment's pages are not scrubbed;
    /// a later lease sees stale bytes until its owner writes them.
    pub fn deallocate(&self, seg: RemotePointer) -> bool {
        if seg.node_id() != self.node_id || seg.address() < PAGE_SIZE as u64 {
            return false;
        }
        let slot = (seg.address() as usize - PAGE_SIZE) / SEGMENT_SIZE;
        let mut bitmap = self.bitmap.lock();
        if !bitmap.is_set(slot) {
            return false;
        }
        bitmap.unset(slot);
        true
    }
}

/// In-process allocation RPC for loopback clusters: requests go straight
/// to the per-node allocators, bypassing any wire.
pub struct DirectRpc {
    allocators: Vec<Arc<MemoryNodeAllocator>>,
}

impl DirectRpc {
    pub fn new(allocators: Vec<Arc<MemoryNodeAllocator>>) -> DirectRpc {
        DirectRpc { allocators }
    }

    fn allocator(&self, node: u8) -> Result<&Arc<MemoryNodeAllocator>, TransportError> {
        self.allocators
            .iter()
            .find(|a| a.node_id == node)
            .ok_or(TransportError::UnknownNode(node))
    }
}

impl AllocationRpc for DirectRpc {
    fn allocate_segment(&self, node: u8) -> Result<RemotePointer, TransportError> {
        Ok(self.allocator(node)?.allocate())
    }

    fn deallocate_segment(
        &self,
        node: u8,
        seg: RemotePointer,
    ) -> Result<bool, TransportError> {
        Ok(self.allocator(node)?.deallocate(seg))
    }
}

/// One running memory node.
pub struct MemoryNode {
    config: MemoryConfig,
    pool: Arc<MemoryPool>,
    allocator: Arc<MemoryNodeAllocator>,
}

impl MemoryNode {
    pub fn new(config: MemoryConfig) -> MemoryNode {
        let node_id = config.self_info.node_id;
        let pool = MemoryPool::new(node_id, config.mem_cap);
        let allocator = Arc::new(MemoryNodeAllocator::new(node_id, config.mem_cap));
        info!(
            "memory node {} initialised: {} bytes, {} segments, rdma {} port {} gid {}",
            node_id,
            config.mem_cap,
            allocator.num_segments(),
            config.rdma.device,
            config.rdma.port,
            config.rdma.gid_idx
        );
        MemoryNode {
            config,
            pool,
            allocator,
        }
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn allocator(&self) -> &Arc<MemoryNodeAllocator> {
        &self.allocator
    }

    /// Serve the bootstrap handshake: every accepted compute node receives
    /// the pool's base remote address (8 bytes LE) and the RPC endpoint id
    /// (4 bytes LE signed). The socket stays open for future admin use.
    pub fn spawn_bootstrap(&self) -> Result<(JoinHandle<()>, SocketAddrV4), StoreError> {
        let listener = TcpListener::bind(self.config.self_info.tcp_addr)
            .map_err(TransportError::from)?;
        let addr = local_v4(&listener)?;
        let base = self.allocator.base_addr();
        let rpc_id = self.config.self_info.node_id as i32;
        let handle = std::thread::spawn(move || {
            let mut admin_sockets = Vec::new();
            for stream in listener.incoming() {
                match stream.and_then(|mut s| {
                    s.write_u64::<LittleEndian>(base.raw())?;
                    s.write_i32::<LittleEndian>(rpc_id)?;
                    Ok(s)
                }) {
                    Ok(s) => {
                        info!("bootstrapped compute node at {:?}", s.peer_addr().ok());
                        admin_sockets.push(s);
                    }
                    Err(e) => warn!("bootstrap handshake failed: {e}"),
                }
            }
        });
        Ok((handle, addr))
    }

    /// Serve the allocation RPC.
    pub fn spawn_rpc(&self) -> Result<(JoinHandle<()>, SocketAddrV4), StoreError> {
        let listener = TcpListener::bind(self.config.self_info.rpc_addr)
            .map_err(TransportError::from)?;
        let addr = local_v4(&listener)?;
        let allocator = self.allocator.clone();
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    if let Err(e) = serve_rpc_connection(stream, &allocator) {
                        warn!("rpc connection ended: {e}");
                    }
                });
            }
        });
        Ok((handle, addr))
    }

    /// Serve the one-sided data channel over TCP.
    pub fn spawn_data(&self) -> Result<(JoinHandle<()>, SocketAddrV4), StoreError> {
        let listener = TcpListener::bind(self.config.self_info.data_addr)
            .map_err(TransportError::from)?;
        let addr = local_v4(&listener)?;
        let pool = self.pool.clone();
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let pool = pool.clone();
                std::thread::spawn(move || {
                    if let Err(e) = serve_data_connection(stream, &pool) {
                        warn!("data connection ended: {e}");
                    }
                });
            }
        });
        Ok((handle, addr))
    }

    /// Launch all three service loops and park forever. The CLI entry
    /// point for `--type memory`.
    pub fn serve(&self) -> Result<(), StoreError> {
        let (bootstrap, tcp) = self.spawn_bootstrap()?;
        let (_rpc, rpc) = self.spawn_rpc()?;
        let (_data, data) = self.spawn_data()?;
        info!("memory node serving: bootstrap {tcp}, rpc {rpc}, data {data}");
        bootstrap
            .join()
            .map_err(|_| TransportError::BadResponse("bootstrap thread panicked"))?;
        Ok(())
    }
}

fn local_v4(listener: &TcpListener) -> Result<SocketAddrV4, StoreError> {
    match listener.local_addr().map_err(TransportError::from)? {
        std::net::SocketAddr::V4(a) => Ok(a),
        std::net::SocketAddr::V6(_) => Err(StoreError::Transport(
            TransportError::BadResponse("expected an ipv4 listener"),
        )),
    }
}

/// Serve one RPC connection until the peer hangs up.
fn serve_rpc_connection(
    mut stream: TcpStream,
    allocator: &MemoryNodeAllocator,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    loop {
        let op = match stream.read_u8() {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match op {
            RPC_REMOTE_ALLOCATION => {
                let seg = allocator.allocate();
                if seg.is_null() {
                    warn!("segment request denied: node {} exhausted", allocator.node_id);
                }
                stream.write_u64::<LittleEndian>(seg.raw())?;
            }
            RPC_REMOTE_DEALLOCATION => {
                let raw = stream.read_u64::<LittleEndian>()?;
                let ok = allocator.deallocate(RemotePointer::from_raw(raw));
                stream.write_u8(ok as u8)?;
            }
            other => {
                error!("unknown rpc op {other}");
                return Err(TransportError::BadResponse("unknown rpc op"));
            }
        }
    }
}
