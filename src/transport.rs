//! The one-sided data channel between compute and memory nodes.
//!
//! The production deployment drives an RDMA NIC; that driver is an external
//! collaborator, so everything above it talks to the [`Transport`] /
//! [`Endpoint`] seam instead. Two implementations ship here: a loopback
//! transport over in-process [`MemoryPool`]s (tests, single-process demos)
//! and a plain TCP transport with the same one-sided semantics.
//!
//! An endpoint is exclusive to one (thread, memory node) pair, mirroring a
//! queue pair: posts are strongly ordered within the endpoint and no
//! cross-endpoint ordering exists.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use parking_lot::RwLock;

use crate::{TransportError, PAGE_SIZE};

/// One pending write of a batched post.
pub struct WriteRequest<'a> {
    pub addr: u64,
    pub data: &'a [u8],
}

/// A per-(thread, node) channel. Every post polls its completion before
/// returning, so posts on one endpoint are strongly ordered.
pub trait Endpoint: Send {
    fn post_read(&mut self, addr: u64, into: &mut [u8]) -> Result<(), TransportError>;
    fn post_write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Post several writes as one request; they complete together.
    fn post_write_batch(&mut self, writes: &[WriteRequest<'_>]) -> Result<(), TransportError> {
        for w in writes {
            self.post_write(w.addr, w.data)?;
        }
        Ok(())
    }
}

/// Connection factory; one endpoint per calling thread per memory node.
pub trait Transport: Send + Sync {
    fn open_endpoint(&self, node: u8) -> Result<Box<dyn Endpoint>, TransportError>;
}

struct PagePtr(*mut u8);

// Pages are plain byte arrays only ever accessed through raw copies; the
// pool hands out no references.
unsafe impl Send for PagePtr {}
unsafe impl Sync for PagePtr {}

/// A memory node's registered byte pool.
///
/// Pages materialise lazily on first write; reads of untouched pages see
/// zeroes. Concurrent readers and writers of the same record are allowed
/// by the protocol - a torn read surfaces as a CRC mismatch upstream, just
/// as it would on the wire.
pub struct MemoryPool {
    node_id: u8,
    cap: u64,
    pages: RwLock<HashMap<u64, PagePtr>>,
}

impl MemoryPool {
    pub fn new(node_id: u8, cap: usize) -> Arc<MemoryPool> {
        Arc::new(MemoryPool {
            node_id,
            cap: cap as u64,
            pages: RwLock::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn capacity(&self) -> usize {
        self.cap as usize
    }

    fn check(&self, addr: u64, len: usize) -> Result<(), TransportError> {
        if addr + len as u64 > self.cap {
            return Err(TransportError::OutOfRange { addr, len });
        }
        Ok(())
    }

    pub fn read(&self, addr: u64, into: &mut [u8]) -> Result<(), TransportError> {
        self.check(addr, into.len())?;
        let mut cursor = addr;
        let mut filled = 0usize;
        let pages = self.pages.read();
        while filled < into.len() {
            let page = cursor & !(PAGE_SIZE as u64 - 1);
            let off = (cursor - page) as usize;
            let take = (PAGE_SIZE - off).min(into.len() - filled);
            match pages.get(&page) {
                Some(p) => unsafe {
                    std::ptr::copy_nonoverlapping(
                        p.0.add(off),
                        into[filled..].as_mut_ptr(),
                        take,
                    );
                },
                None => into[filled..filled + take].fill(0),
            }
            cursor += take as u64;
            filled += take;
        }
        Ok(())
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        self.check(addr, data.len())?;
        let mut cursor = addr;
        let mut written = 0usize;
        while written < data.len() {
            let page = cursor & !(PAGE_SIZE as u64 - 1);
            let off = (cursor - page) as usize;
            let take = (PAGE_SIZE - off).min(data.len() - written);
            let ptr = self.page_ptr(page);
            unsafe {
                std::ptr::copy_nonoverlapping(data[written..].as_ptr(), ptr.add(off), take);
            }
            cursor += take as u64;
            written += take;
        }
        Ok(())
    }

    fn page_ptr(&self, page: u64) -> *mut u8 {
        if let Some(p) = self.pages.read().get(&page) {
            return p.0;
        }
        let mut pages = self.pages.write();
        pages
            .entry(page)
            .or_insert_with(|| {
                let boxed: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
                PagePtr(Box::into_raw(boxed) as *mut u8)
            })
            .0
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let mut pages = self.pages.write();
        for (_, p) in pages.drain() {
            unsafe {
                drop(Box::from_raw(p.0 as *mut [u8; PAGE_SIZE]));
            }
        }
    }
}

/// In-process transport: endpoints talk straight to the registered pools.
pub struct LoopbackTransport {
    pools: HashMap<u8, Arc<MemoryPool>>,
}

impl LoopbackTransport {
    pub fn new(pools: Vec<Arc<MemoryPool>>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            pools: pools.into_iter().map(|p| (p.node_id(), p)).collect(),
        })
    }

    pub fn pool(&self, node: u8) -> Option<&Arc<MemoryPool>> {
        self.pools.get(&node)
    }
}

impl Transport for LoopbackTransport {
    fn open_endpoint(&self, node: u8) -> Result<Box<dyn Endpoint>, TransportError> {
        let pool = self
            .pools
            .get(&node)
            .ok_or(TransportError::UnknownNode(node))?
            .clone();
        Ok(Box::new(LoopbackEndpoint { pool }))
    }
}

struct LoopbackEndpoint {
    pool: Arc<MemoryPool>,
}

impl Endpoint for LoopbackEndpoint {
    fn post_read(&mut self, addr: u64, into: &mut [u8]) -> Result<(), TransportError> {
        self.pool.read(addr, into)
    }

    fn post_write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        self.pool.write(addr, data)
    }
}

const DATA_OP_READ: u8 = 0;
const DATA_OP_WRITE: u8 = 1;
const DATA_OP_WRITE_BATCH: u8 = 2;

/// TCP stand-in for the one-sided data channel. Each endpoint owns its own
/// connection, keeping the per-(thread, node) exclusivity of a queue pair.
pub struct TcpTransport {
    peers: HashMap<u8, SocketAddrV4>,
}

impl TcpTransport {
    pub fn new(peers: HashMap<u8, SocketAddrV4>) -> Arc<TcpTransport> {
        Arc::new(TcpTransport { peers })
    }
}

impl Transport for TcpTransport {
    fn open_endpoint(&self, node: u8) -> Result<Box<dyn Endpoint>, TransportError> {
        let addr = self
            .peers
            .get(&node)
            .ok_or(TransportError::UnknownNode(node))?;
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!("data channel to node {node} open at {addr}");
        Ok(Box::new(TcpEndpoint { stream }))
    }
}

struct TcpEndpoint {
    stream: TcpStream,
}

impl Endpoint for TcpEndpoint {
    fn post_read(&mut self, addr: u64, into: &mut [u8]) -> Result<(), TransportError> {
        self.stream.write_u8(DATA_OP_READ)?;
        self.stream.write_u64::<LittleEndian>(addr)?;
        self.stream.write_u32::<LittleEndian>(into.len() as u32)?;
        self.stream.read_exact(into)?;
        Ok(())
    }

    fn post_write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_u8(DATA_OP_WRITE)?;
        self.stream.write_u64::<LittleEndian>(addr)?;
        self.stream.write_u32::<LittleEndian>(data.len() as u32)?;
        self.stream.write_all(data)?;
        match self.stream.read_u8()? {
            0 => Err(TransportError::BadResponse("remote write rejected")),
            _ => Ok(()),
        }
    }

    fn post_write_batch(&mut self, writes: &[WriteRequest<'_>]) -> Result<(), TransportError> {
        self.stream.write_u8(DATA_OP_WRITE_BATCH)?;
        self.stream.write_u16::<LittleEndian>(writes.len() as u16)?;
        for w in writes {
            self.stream.write_u64::<LittleEndian>(w.addr)?;
            self.stream.write_u32::<LittleEndian>(w.data.len() as u32)?;
            self.stream.write_all(w.data)?;
        }
        match self.stream.read_u8()? {
            0 => Err(TransportError::BadResponse("remote batch write rejected")),
            _ => Ok(()),
        }
    }
}

/// Serve one accepted data-channel connection against a pool. Runs until
/// the peer hangs up.
pub fn serve_data_connection(
    mut stream: TcpStream,
    pool: &MemoryPool,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let mut buf = vec![0u8; PAGE_SIZE];
    loop {
        let op = match stream.read_u8() {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match op {
            DATA_OP_READ => {
                let addr = stream.read_u64::<LittleEndian>()?;
                let len = stream.read_u32::<LittleEndian>()? as usize;
                if buf.len() < len {
                    buf.resize(len, 0);
                }
                pool.read(addr, &mut buf[..len])?;
                stream.write_all(&buf[..len])?;
            }
            DATA_OP_WRITE => {
                let addr = stream.read_u64::<LittleEndian>()?;
                let len = stream.read_u32::<LittleEndian>()? as usize;
                if buf.len() < len {
                    buf.resize(len, 0);
                }
                stream.read_exact(&mut buf[..len])?;
                let ok = pool.write(addr, &buf[..len]).is_ok();
                stream.write_u8(ok as u8)?;
            }
            DATA_OP_WRITE_BATCH => {
                let count = stream.read_u16::<LittleEndian>()?;
                let mut ok = true;
                for _ in 0..count {
                    let addr = stream.read_u64::<LittleEndian>()?;
                    let len = stream.read_u32::<LittleEndian>()? as usize;
                    if buf.len() < len {
                        buf.resize(len, 0);
                    }
                    stream.read_exact(&mut buf[..len])?;
                    ok &= pool.write(addr, &buf[..len]).is_ok();
                }
                stream.write_u8(ok as u8)?;
            }
            _ => return Err(TransportError::BadResponse("unknown data-channel op")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_roundtrip() {
        let pool = MemoryPool::new(0, 1 << 20);
        pool.write(0x1000, b"hello remote").unwrap();
        let mut buf = [0u8; 12];
        pool.read(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello remote");
    }

    #[test]
    fn pool_reads_untouched_as_zero() {
        let pool = MemoryPool::new(0, 1 << 20);
        let mut buf = [0xaau8; 64];
        pool.read(0x8000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn pool_spans_pages() {
        let pool = MemoryPool::new(0, 1 << 20);
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let addr = (PAGE_SIZE - 100) as u64;
        pool.write(addr, &data).unwrap();
        let mut buf = vec![0u8; 200];
        pool.read(addr, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn pool_rejects_out_of_range() {
        let pool = MemoryPool::new(0, PAGE_SIZE);
        assert!(pool.write(PAGE_SIZE as u64 - 4, &[0u8; 8]).is_err());
        let mut buf = [0u8; 8];
        assert!(pool.read(PAGE_SIZE as u64, &mut buf).is_err());
    }

    #[test]
    fn loopback_endpoint() {
        let pool = MemoryPool::new(3, 1 << 20);
        let transport = LoopbackTransport::new(vec![pool]);
        assert!(transport.open_endpoint(7).is_err());
        let mut ep = transport.open_endpoint(3).unwrap();
        ep.post_write(64, b"abc").unwrap();
        let mut buf = [0u8; 3];
        ep.post_read(64, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn tcp_endpoint_roundtrip() {
        use std::net::{Ipv4Addr, TcpListener};

        let pool = MemoryPool::new(0, 1 << 20);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let server_pool = pool.clone();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_data_connection(stream, &server_pool).unwrap();
        });

        let peers = HashMap::from([(
            0u8,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, addr.port()),
        )]);
        let transport = TcpTransport::new(peers);
        let mut ep = transport.open_endpoint(0).unwrap();
        ep.post_write(0x2000, b"over the wire").unwrap();
        ep.post_write_batch(&[
            WriteRequest { addr: 0x3000, data: b"one" },
            WriteRequest { addr: 0x4000, data: b"two" },
        ])
        .unwrap();
        let mut buf = [0u8; 13];
        ep.post_read(0x2000, &mut buf).unwrap();
        assert_eq!(&buf, b"over the wire");
        let mut buf = [0u8; 3];
        ep.post_read(0x4000, &mut buf).unwrap();
        assert_eq!(&buf, b"two");
        drop(ep);
        server.join().unwrap();
    }
}
